use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use flowstudio_core::error::{FlowError, Result};
use flowstudio_core::types::RunId;

/// Cancellation tokens of in-flight runs, keyed by run id.
#[derive(Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<RunId, CancellationToken>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run and return a guard that deregisters it on drop.
    ///
    /// An id that is still in flight is rejected; the running one keeps its token.
    pub fn register(&self, run_id: RunId) -> Result<RunGuard<'_>> {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        let token = match runs.entry(run_id.clone()) {
            Entry::Occupied(_) => {
                warn!(run_id = %run_id, "Run id is already in progress");
                return Err(FlowError::RunInProgress(run_id.to_string()));
            }
            Entry::Vacant(slot) => slot.insert(CancellationToken::new()).clone(),
        };
        Ok(RunGuard {
            registry: self,
            run_id,
            token,
        })
    }

    /// Signal cancellation. Returns `false` for unknown or finished runs.
    pub fn cancel(&self, run_id: &RunId) -> bool {
        let token = self
            .runs
            .lock()
            .ok()
            .and_then(|runs| runs.get(run_id).cloned());
        match token {
            Some(token) => {
                info!(run_id = %run_id, "Cancelling run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active(&self) -> Vec<RunId> {
        self.runs
            .lock()
            .map(|runs| runs.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn remove(&self, run_id: &RunId) {
        if let Ok(mut runs) = self.runs.lock() {
            runs.remove(run_id);
        }
    }
}

/// Keeps a run registered for as long as it lives.
pub struct RunGuard<'a> {
    registry: &'a RunRegistry,
    run_id: RunId,
    token: CancellationToken,
}

impl RunGuard<'_> {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_registered_run() {
        let registry = RunRegistry::new();
        let run_id = RunId::new();
        let guard = registry.register(run_id.clone()).unwrap();
        let token = guard.token();

        assert!(!token.is_cancelled());
        assert!(registry.cancel(&run_id));
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_deregistered_on_drop() {
        let registry = RunRegistry::new();
        let run_id = RunId::new();
        {
            let _guard = registry.register(run_id.clone()).unwrap();
            assert_eq!(registry.active(), vec![run_id.clone()]);
        }
        assert!(registry.active().is_empty());
        assert!(!registry.cancel(&run_id));
    }

    #[test]
    fn test_duplicate_run_id_is_rejected() {
        let registry = RunRegistry::new();
        let run_id = RunId("run-1".into());
        let first = registry.register(run_id.clone()).unwrap();

        let err = registry.register(run_id.clone()).err().unwrap();
        assert!(matches!(err, FlowError::RunInProgress(ref id) if id == "run-1"));

        assert!(registry.cancel(&run_id));
        assert!(first.token().is_cancelled());
        drop(first);
        assert!(registry.register(run_id).is_ok());
    }

    #[test]
    fn test_unknown_run() {
        let registry = RunRegistry::new();
        assert!(!registry.cancel(&RunId("nope".into())));
    }
}
