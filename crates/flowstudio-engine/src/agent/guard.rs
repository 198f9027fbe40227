use std::collections::VecDeque;

use tracing::warn;

/// Characters of serialized tool input compared between calls.
const FINGERPRINT_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ActionRecord {
    name: String,
    input_fingerprint: String,
}

/// Detects an agent calling the same tool with the same input over and over.
#[derive(Debug)]
pub struct LoopGuard {
    threshold: usize,
    recent: VecDeque<ActionRecord>,
}

impl LoopGuard {
    pub fn new(threshold: usize) -> Self {
        let threshold = threshold.max(2);
        Self {
            threshold,
            recent: VecDeque::with_capacity(threshold),
        }
    }

    /// Record a tool call. Returns `true` once the last `threshold` calls
    /// share the same tool name and input.
    pub fn record(&mut self, name: &str, input: &serde_json::Value) -> bool {
        let fingerprint = serde_json::to_string(input)
            .unwrap_or_default()
            .chars()
            .take(FINGERPRINT_CHARS)
            .collect();
        self.recent.push_back(ActionRecord {
            name: name.to_string(),
            input_fingerprint: fingerprint,
        });
        while self.recent.len() > self.threshold {
            self.recent.pop_front();
        }

        if self.recent.len() < self.threshold {
            return false;
        }
        let first = &self.recent[0];
        let looping = self.recent.iter().all(|r| r == first);
        if looping {
            warn!(tool = %name, consecutive = self.threshold, "Agent loop detected");
        }
        looping
    }
}
