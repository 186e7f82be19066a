//! Registry of live sessions for front ends that run several at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tracing::{debug, info};

use super::{SessionRuntime, SolveResult};
use crate::core::cancel::CancellationToken;
use crate::core::types::{DeltaKind, StepRecord};

/// Owned callbacks for a session running on its own thread.
pub struct SessionCallbacks {
    pub on_event: Box<dyn FnMut(&str) + Send>,
    pub on_step: Box<dyn FnMut(&StepRecord) + Send>,
    pub on_content_delta: Box<dyn FnMut(DeltaKind, &str) + Send>,
}

impl SessionCallbacks {
    pub fn silent() -> Self {
        Self {
            on_event: Box::new(|_: &str| {}),
            on_step: Box::new(|_: &StepRecord| {}),
            on_content_delta: Box::new(|_: DeltaKind, _: &str| {}),
        }
    }
}

/// Maps session ids to the tokens that stop them.
///
/// One lock guards the whole map. A session is registered when spawned and
/// removed when its thread finishes or it is stopped.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<String, CancellationToken>>,
}

impl SessionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, session_id: &str, token: CancellationToken) {
        self.lock().insert(session_id.to_string(), token);
    }

    /// Request a cooperative stop. Returns false when the session is not live.
    pub fn stop(&self, session_id: &str) -> bool {
        match self.lock().remove(session_id) {
            Some(token) => {
                info!(session_id, "stopping session");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    /// Ids of live sessions, sorted.
    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Run `runtime.solve(objective)` on a dedicated thread.
    pub fn spawn(
        self: &Arc<Self>,
        mut runtime: SessionRuntime,
        objective: String,
        callbacks: SessionCallbacks,
    ) -> Result<JoinHandle<Result<SolveResult>>> {
        let session_id = runtime.session_id().to_string();
        self.register(&session_id, runtime.cancellation_token());
        let manager = Arc::clone(self);
        let SessionCallbacks {
            mut on_event,
            mut on_step,
            mut on_content_delta,
        } = callbacks;
        let spawned = thread::Builder::new()
            .name(format!("session-{session_id}"))
            .spawn(move || {
                let result = runtime.solve(
                    &objective,
                    |message: &str| on_event(message),
                    |record: &StepRecord| on_step(record),
                    |kind: DeltaKind, text: &str| on_content_delta(kind, text),
                );
                manager.lock().remove(runtime.session_id());
                debug!(session_id = runtime.session_id(), "session thread finished");
                result
            });
        match spawned {
            Ok(handle) => Ok(handle),
            Err(err) => {
                self.lock().remove(&session_id);
                Err(err).with_context(|| format!("spawn thread for session {session_id}"))
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_cancels_and_unregisters() {
        let manager = SessionManager::new();
        let token = CancellationToken::new();
        manager.register("s1", token.clone());
        assert_eq!(manager.active(), vec!["s1".to_string()]);

        assert!(manager.stop("s1"));
        assert!(token.is_cancelled());
        assert!(!manager.is_active("s1"));
        assert!(!manager.stop("s1"));
    }
}
