use std::sync::Arc;

use flowstudio_core::config::AppConfig;
use flowstudio_test_utils::{MemoryFiles, MemoryStore, MockAgent, MockInference, MockRetrieval};

use crate::executors::Collaborators;

/// Collaborators backed by in-memory mocks; override fields per test.
pub(crate) fn collaborators() -> Collaborators {
    Collaborators::new(
        Arc::new(MockInference::echo()),
        Arc::new(MockAgent::reply("agent reply")),
        Arc::new(MockRetrieval::new(Vec::new())),
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryFiles::new()),
        Arc::new(AppConfig::default()),
    )
}
