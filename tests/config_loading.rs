use std::io::Write;
use std::path::PathBuf;

use flowstudio_core::config::AppConfig;
use flowstudio_core::error::FlowError;
use flowstudio_test_utils::write_config;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_depth = 20
workspace = "/tmp/flowstudio-test"
graphs_dir = "flows"

[model]
provider = "openai"
model_id = "gpt-4o-mini"
base_url = "https://api.example.com/v1"
api_key = "sk-test-key"
max_tokens = 4096
temperature = 0.5
timeout_secs = 90

[model.retry]
max_retries = 5
initial_backoff_ms = 200

[[fallback_models]]
provider = "ollama"
model_id = "llama3.2"

[memory]
path = "conv.db"
max_messages = 4
max_message_chars = 200

[agent]
max_iterations = 6
max_duration_secs = 30
loop_threshold = 4

[http]
timeout_secs = 10
user_agent = "tests/1.0"

[retrieval]
path = "/data/kb.db"
top_k = 3
score_threshold = 0.25

[embedding]
provider = "ollama"
model = "nomic-embed-text"
dimensions = 768
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_depth, 20);
    assert_eq!(config.model.provider, "openai");
    assert_eq!(config.model.model_id, "gpt-4o-mini");
    assert_eq!(config.model.api_key, Some("sk-test-key".to_string()));
    assert_eq!(config.model.max_tokens, 4096);
    assert_eq!(config.model.timeout_secs, 90);

    let retry = config.model.retry.clone().expect("retry present");
    assert_eq!(retry.max_retries, 5);
    assert_eq!(retry.initial_backoff_ms, 200);
    assert_eq!(retry.max_backoff_ms, 30000);

    assert_eq!(config.fallback_models.len(), 1);
    assert_eq!(config.fallback_models[0].model_id, "llama3.2");

    assert_eq!(config.memory.max_messages, 4);
    assert_eq!(config.agent.max_iterations, 6);
    assert_eq!(config.agent.loop_threshold, 4);
    assert_eq!(config.agent.max_messages, 5);
    assert_eq!(config.http.user_agent, "tests/1.0");
    assert_eq!(config.retrieval.top_k, 3);

    let embedding = config.embedding.clone().expect("embedding present");
    assert_eq!(embedding.model, "nomic-embed-text");

    assert_eq!(config.memory_path(), PathBuf::from("/tmp/flowstudio-test/conv.db"));
    assert_eq!(config.knowledge_path(), PathBuf::from("/data/kb.db"));
    assert_eq!(config.graphs_dir(), PathBuf::from("/tmp/flowstudio-test/flows"));
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("FLOWSTUDIO_TEST_API_KEY", "expanded-key-value");

    let dir = tempfile::tempdir().expect("create temp dir");
    let path = write_config(
        dir.path(),
        r#"
[model]
model_id = "test-model"
api_key = "${FLOWSTUDIO_TEST_API_KEY}"
"#,
    );

    let config = AppConfig::load(&path).expect("load config");
    assert_eq!(config.model.api_key, Some("expanded-key-value".to_string()));

    std::env::remove_var("FLOWSTUDIO_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = write_config(dir.path(), "[model]\nmodel_id = \"llama3.2\"\n");

    let config = AppConfig::load(&path).expect("load config");

    assert_eq!(config.model.model_id, "llama3.2");
    assert_eq!(config.model.provider, "ollama");
    assert_eq!(config.engine.max_depth, 50);
    assert_eq!(config.agent.max_duration_secs, 120);
    assert_eq!(config.memory.max_message_chars, 1000);
    assert!(config.model.retry.is_none());
    assert!(config.fallback_models.is_empty());
    assert!(config.embedding.is_none());
}

#[test]
fn test_missing_file_is_config_not_found() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let err = AppConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, FlowError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_values_are_rejected() {
    let dir = tempfile::tempdir().expect("create temp dir");

    let path = write_config(dir.path(), "[agent]\nloop_threshold = 1\n");
    assert!(matches!(AppConfig::load(&path), Err(FlowError::Config(_))));

    let path = write_config(dir.path(), "[engine]\nmax_depth = \"deep\"\n");
    assert!(matches!(AppConfig::load(&path), Err(FlowError::Config(_))));
}
