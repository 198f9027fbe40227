//! `{{nodeId.field}}` substitution against the execution trace.
//!
//! `field` is `input`, `output`, or any key the step recorded in `extra`
//! (entry steps expose `files` and `file_content` this way). Further dotted
//! segments walk into JSON values, so `{{http1.output.body.id}}` works.
//! Tokens that do not resolve are replaced by a visible marker and reported.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use tracing::warn;

use flowstudio_core::trace::{value_to_text, Diagnostic};

use crate::context::Trace;

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{\s*([^}]+?)\s*\}\}").expect("static regex"))
}

/// Text after substitution plus every reference that could not be resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub text: String,
    pub unresolved: Vec<String>,
}

impl Resolved {
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.unresolved
            .iter()
            .map(|r| Diagnostic::UnresolvedVariable { reference: r.clone() })
            .collect()
    }
}

/// Marker left in place of a reference that could not be resolved.
pub fn unresolved_marker(reference: &str) -> String {
    format!("{{{{Variable {reference} not found}}}}")
}

/// Substitute every token in `text` in a single pass.
pub fn resolve(text: &str, trace: &Trace) -> Resolved {
    if !text.contains("{{") {
        return Resolved {
            text: text.to_string(),
            unresolved: vec![],
        };
    }

    let mut unresolved = Vec::new();
    let out = token_pattern().replace_all(text, |caps: &Captures| {
        let reference = caps[1].trim();
        match lookup(reference, trace) {
            Some(value) => value_to_text(&value),
            None => {
                warn!(reference, "Unresolved variable");
                unresolved.push(reference.to_string());
                unresolved_marker(reference)
            }
        }
    });

    Resolved {
        text: out.into_owned(),
        unresolved,
    }
}

/// Resolve a bare `nodeId.field` reference to its JSON value.
pub fn lookup(reference: &str, trace: &Trace) -> Option<serde_json::Value> {
    let mut parts = reference.split('.').map(str::trim);
    let node_id = parts.next()?;
    let field = parts.next()?;
    let step = trace.get(node_id)?;
    let mut value = step.field(field)?.clone();

    for segment in parts {
        value = descend(value, segment)?;
    }
    Some(value)
}

fn descend(value: serde_json::Value, segment: &str) -> Option<serde_json::Value> {
    match value {
        serde_json::Value::Object(mut map) => map.remove(segment),
        serde_json::Value::Array(mut items) => {
            let idx: usize = segment.parse().ok()?;
            (idx < items.len()).then(|| items.swap_remove(idx))
        }
        // Outputs that are JSON text can be walked too
        serde_json::Value::String(s) => {
            let parsed: serde_json::Value = serde_json::from_str(&s).ok()?;
            if parsed.is_object() || parsed.is_array() {
                descend(parsed, segment)
            } else {
                None
            }
        }
        _ => None,
    }
}
