//! Session lifecycle: identity, event log, resumption and the solve call.

pub mod manager;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::core::cancel::CancellationToken;
use crate::core::types::{DeltaKind, EventKind, SessionStatus, SolveStatus, StepRecord};
use crate::engine::step_loop::{LoopOutcome, LoopStatus};
use crate::engine::{Engine, SolveContext, SolveObserver};
use crate::events::push::{BatchingPusher, HttpEventSink};
use crate::events::{EventBus, EventSubscriber};
use crate::io::config::{AgentConfig, ConfigError};
use crate::io::session_store::{
    SessionState, SessionStore, new_session_id, now_rfc3339, validate_session_id,
};

/// Outcome of one `solve` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SolveResult {
    pub session_id: String,
    pub answer: String,
    pub status: SolveStatus,
    pub error: Option<String>,
}

/// Caller callbacks mirroring the event log.
struct Callbacks<'c> {
    on_event: &'c mut dyn FnMut(&str),
    on_step: &'c mut dyn FnMut(&StepRecord),
    on_content_delta: &'c mut dyn FnMut(DeltaKind, &str),
}

/// Owns one investigation: its engine, identity, log and snapshot.
pub struct SessionRuntime {
    engine: Engine,
    config: AgentConfig,
    store: SessionStore,
    state: SessionState,
    bus: EventBus,
    cancel: CancellationToken,
}

impl SessionRuntime {
    /// Open a session, minting an id when none is given.
    ///
    /// With `resume`, an existing log is continued where it left off. Without
    /// it, an existing log is an error rather than being overwritten.
    #[instrument(skip_all, fields(resume = resume))]
    pub fn bootstrap(
        engine: Engine,
        config: &AgentConfig,
        session_id: Option<&str>,
        resume: bool,
    ) -> Result<Self> {
        let store = SessionStore::new(config.session_root());
        let id = match session_id.map(str::trim) {
            Some(id) => {
                validate_session_id(id)?;
                id.to_string()
            }
            None => new_session_id(),
        };

        let cap = config.budget.max_persisted_observations;
        let state = if store.exists(&id) {
            if !resume {
                return Err(ConfigError::SessionExists(id).into());
            }
            let events = store.events(&id).context("read session log")?;
            let last_seq = events.iter().map(|e| e.seq).max().unwrap_or(0);
            let mut state = match store.load_state(&id)? {
                Some(state) if state.last_seq == last_seq => state,
                _ => SessionState::from_events(&id, &events, cap),
            };
            state.last_seq = last_seq;
            info!(session_id = %id, last_seq, steps = state.step_count, "resuming session");
            state
        } else {
            info!(session_id = %id, "starting session");
            SessionState::new(&id)
        };

        let mut bus = EventBus::new(store.open_log(&id)?, state.last_seq);
        if let Some(url) = config.event_push_url.as_deref().filter(|u| !u.trim().is_empty()) {
            let sink = HttpEventSink::new(url, config.network_timeout())?;
            bus.subscribe(Box::new(BatchingPusher::new(id.clone(), Box::new(sink))));
        }

        Ok(Self {
            engine,
            config: config.clone(),
            store,
            state,
            bus,
            cancel: CancellationToken::new(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.state.session_id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Token that stops this session before its next model turn.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn subscribe(&mut self, subscriber: Box<dyn EventSubscriber>) {
        self.bus.subscribe(subscriber);
    }

    /// Investigate `objective` to a terminal status.
    ///
    /// `on_event` receives trace lines, `on_step` step records and
    /// `on_content_delta` streamed model output, each after it is logged.
    /// Budget exhaustion and engine failures come back as a result status;
    /// only a failure to write the event log is returned as an error.
    #[instrument(skip_all, fields(session_id = %self.state.session_id))]
    pub fn solve(
        &mut self,
        objective: &str,
        mut on_event: impl FnMut(&str),
        mut on_step: impl FnMut(&StepRecord),
        mut on_content_delta: impl FnMut(DeltaKind, &str),
    ) -> Result<SolveResult> {
        let objective = objective.trim();
        if objective.is_empty() {
            bail!("objective must not be empty");
        }
        let resumed = self.state.last_seq > 0;
        self.state.objective = Some(objective.to_string());
        self.state.status = SessionStatus::Running;
        self.state.answer = None;
        self.state.error = None;

        let engine = &self.engine;
        let mut observer = SessionObserver {
            bus: &mut self.bus,
            state: &mut self.state,
            store: &self.store,
            config: &self.config,
            cancel: &self.cancel,
            callbacks: Callbacks {
                on_event: &mut on_event,
                on_step: &mut on_step,
                on_content_delta: &mut on_content_delta,
            },
            log_error: None,
        };
        observer.emit(
            EventKind::SessionStarted,
            json!({
                "objective": objective,
                "model": engine.model().name(),
                "resumed": resumed,
                "budget": engine.budget(),
            }),
        );
        if let Some(note) = engine.fallback_note() {
            observer.trace(0, &format!("no model credential configured: {note}"));
        }

        let outcome = {
            let cancel = observer.cancel;
            let mut ctx = SolveContext::new(&mut observer, cancel, engine.budget());
            engine.investigate(objective, &mut ctx)
        };
        let (status, error) = classify(&outcome, engine.fallback_note());
        info!(status = status.as_str(), steps = outcome.steps, "solve finished");

        observer.emit(
            EventKind::SessionFinished,
            json!({
                "status": status.session_status(),
                "solve_status": status,
                "answer": outcome.answer,
                "error": error,
            }),
        );
        let log_error = observer.log_error.take();
        drop(observer);

        self.state.status = status.session_status();
        self.state.answer = Some(outcome.answer.clone());
        self.state.error = error.clone();
        self.state.last_seq = self.bus.last_seq();
        self.state.updated_at = now_rfc3339();
        self.store.save_state(&self.state).context("save session state")?;
        self.bus.flush();

        if let Some(err) = log_error {
            return Err(err.context("write session event log"));
        }
        Ok(SolveResult {
            session_id: self.state.session_id.clone(),
            answer: outcome.answer,
            status,
            error,
        })
    }
}

/// Map the root outcome to a session status and error message.
fn classify(outcome: &LoopOutcome, fallback_note: Option<&str>) -> (SolveStatus, Option<String>) {
    match (&outcome.status, fallback_note) {
        (LoopStatus::Failed(message), _) => (SolveStatus::Failed, Some(message.clone())),
        (LoopStatus::Stopped, _) => (SolveStatus::Stopped, None),
        (_, Some(note)) => (
            SolveStatus::Failed,
            Some(ConfigError::MissingCredential(note.to_string()).to_string()),
        ),
        (LoopStatus::Finished, None) => (SolveStatus::Complete, None),
        (LoopStatus::BudgetExhausted, None) => (SolveStatus::BudgetExhausted, None),
    }
}

/// Writes engine output to the log first, then mirrors it to the caller.
struct SessionObserver<'r, 'c> {
    bus: &'r mut EventBus,
    state: &'r mut SessionState,
    store: &'r SessionStore,
    config: &'r AgentConfig,
    cancel: &'r CancellationToken,
    callbacks: Callbacks<'c>,
    log_error: Option<anyhow::Error>,
}

impl SessionObserver<'_, '_> {
    fn emit(&mut self, kind: EventKind, data: Value) {
        if self.log_error.is_some() {
            return;
        }
        if let Err(err) = self.bus.emit(kind, data) {
            warn!(err = %err, "event log write failed; stopping session");
            self.cancel.cancel();
            self.log_error = Some(err);
        }
    }
}

impl SolveObserver for SessionObserver<'_, '_> {
    fn trace(&mut self, depth: u32, message: &str) {
        let message = self.config.redact(message);
        self.emit(EventKind::Trace, json!({ "depth": depth, "message": message }));
        (self.callbacks.on_event)(&message);
    }

    fn step(&mut self, record: &StepRecord) {
        let data = serde_json::to_value(record).unwrap_or(Value::Null);
        self.emit(EventKind::Step, data);
        self.state
            .record_step(record, self.config.budget.max_persisted_observations);
        self.state.last_seq = self.bus.last_seq();
        self.state.updated_at = now_rfc3339();
        if let Err(err) = self.store.save_state(self.state) {
            warn!(err = %err, "could not save session state");
        }
        (self.callbacks.on_step)(record);
    }

    fn delta(&mut self, depth: u32, kind: DeltaKind, text: &str) {
        self.emit(
            EventKind::Delta,
            json!({ "depth": depth, "kind": kind, "text": text }),
        );
        (self.callbacks.on_content_delta)(kind, text);
    }
}
