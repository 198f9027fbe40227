//! Prompt assembly shared by the generate, agent and classify handlers.

use serde::Deserialize;
use tracing::{debug, warn};

use flowstudio_core::error::Result;
use flowstudio_core::graph::Node;
use flowstudio_core::trace::Diagnostic;
use flowstudio_core::traits::ConversationStore;
use flowstudio_core::types::{InferenceSettings, MemoryMessage, Role};

use super::resolved_config;
use crate::context::ExecutionContext;
use crate::text::truncate_chars;

/// `conversationHistory` block of a node's config.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryOptions {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub max_messages: Option<usize>,
    #[serde(default)]
    pub max_message_length: Option<usize>,
}

/// Effective history window after applying defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryWindow {
    pub max_messages: usize,
    pub max_message_chars: usize,
}

impl HistoryOptions {
    pub fn from_node(node: &Node) -> Result<Self> {
        Ok(node.config_as("conversationHistory")?.unwrap_or_default())
    }

    /// `None` when history is switched off.
    pub fn window(&self, default_messages: usize, default_chars: usize) -> Option<HistoryWindow> {
        if self.enabled == Some(false) {
            return None;
        }
        Some(HistoryWindow {
            max_messages: self.max_messages.unwrap_or(default_messages),
            max_message_chars: self.max_message_length.unwrap_or(default_chars),
        })
    }
}

/// Load the most recent user/assistant turns of the run's conversation.
///
/// The message recorded for the current run's input is skipped, since the
/// prompt already carries it. Failures are logged and yield no history.
pub async fn load_history(
    memory: &dyn ConversationStore,
    ctx: &ExecutionContext,
    window: HistoryWindow,
) -> Vec<MemoryMessage> {
    let Some(conversation_id) = ctx.conversation_id.as_deref() else {
        return Vec::new();
    };
    if window.max_messages == 0 {
        return Vec::new();
    }

    let messages = match memory.load(conversation_id).await {
        Ok(m) => m,
        Err(e) => {
            warn!(run_id = %ctx.run_id, conversation_id, error = %e, "Failed to load conversation history");
            return Vec::new();
        }
    };

    let eligible: Vec<MemoryMessage> = messages
        .into_iter()
        .filter(|m| matches!(m.role, Role::User | Role::Assistant))
        .filter(|m| Some(m.id.as_str()) != ctx.user_message_id.as_deref())
        .collect();

    let skip = eligible.len().saturating_sub(window.max_messages);
    let history: Vec<MemoryMessage> = eligible
        .into_iter()
        .skip(skip)
        .map(|mut m| {
            m.content = truncate_chars(&m.content, window.max_message_chars);
            m
        })
        .collect();

    debug!(
        run_id = %ctx.run_id,
        messages = history.len(),
        max_messages = window.max_messages,
        "Loaded conversation history"
    );
    history
}

/// Inference overrides from node config (`model`, `baseUrl`, `temperature`,
/// `numCtx`, `options`). String values are variable-resolved.
pub fn inference_settings(
    node: &Node,
    ctx: &ExecutionContext,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<InferenceSettings> {
    let mut text = |key: &str| {
        resolved_config(node, key, ctx).map(|r| {
            diagnostics.extend(r.diagnostics());
            r.text
        })
    };
    let model = text("model").filter(|s| !s.is_empty());
    let base_url = text("baseUrl").filter(|s| !s.is_empty());

    Ok(InferenceSettings {
        model,
        base_url,
        temperature: node.config_f64("temperature").map(|t| t as f32),
        max_tokens: node.config_u64("maxTokens").map(|n| n as u32),
        num_ctx: node.config_u64("numCtx").map(|n| n as u32),
        options: node.config_as("options")?.unwrap_or_default(),
        json_mode: false,
    })
}
