/// Endpoint defaults for OpenAI-compatible hosted APIs.
pub struct ProviderPreset {
    pub default_base_url: &'static str,
    pub needs_api_key: bool,
    pub extra_headers: &'static [(&'static str, &'static str)],
}

const NO_HEADERS: &[(&str, &str)] = &[];

const fn preset(default_base_url: &'static str, needs_api_key: bool) -> ProviderPreset {
    ProviderPreset {
        default_base_url,
        needs_api_key,
        extra_headers: NO_HEADERS,
    }
}

/// Look up a preset by provider name.
pub fn get_preset(provider: &str) -> Option<ProviderPreset> {
    let found = match provider {
        "lmstudio" => preset("http://localhost:1234/v1/chat/completions", false),
        "vllm" => preset("http://localhost:8000/v1/chat/completions", false),
        "groq" => preset("https://api.groq.com/openai/v1/chat/completions", true),
        "openrouter" => ProviderPreset {
            extra_headers: &[("X-Title", "flowstudio")],
            ..preset("https://openrouter.ai/api/v1/chat/completions", true)
        },
        "together" => preset("https://api.together.xyz/v1/chat/completions", true),
        "mistral" => preset("https://api.mistral.ai/v1/chat/completions", true),
        "deepseek" => preset("https://api.deepseek.com/v1/chat/completions", true),
        _ => return None,
    };
    Some(found)
}

/// Every provider name `create_client` understands.
pub fn all_provider_names() -> &'static [&'static str] {
    &[
        "ollama",
        "openai",
        "lmstudio",
        "vllm",
        "groq",
        "openrouter",
        "together",
        "mistral",
        "deepseek",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_listed_provider_resolves() {
        for name in all_provider_names() {
            if matches!(*name, "ollama" | "openai") {
                continue;
            }
            assert!(get_preset(name).is_some(), "missing preset for {name}");
        }
        assert!(get_preset("unknown").is_none());
    }

    #[test]
    fn test_cloud_presets_need_keys() {
        assert!(get_preset("groq").unwrap().needs_api_key);
        assert!(!get_preset("lmstudio").unwrap().needs_api_key);
    }
}
