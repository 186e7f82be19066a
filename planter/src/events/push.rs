//! Batched delivery of session events to an external endpoint.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::json;
use tracing::{debug, instrument, warn};

use super::EventSubscriber;
use crate::core::types::EventEnvelope;

/// Events buffered before a push is forced.
pub const PUSH_BATCH_SIZE: usize = 5;

/// Destination for batches of events.
pub trait EventSink: Send + Sync {
    fn push(&self, session_id: &str, events: &[EventEnvelope]) -> Result<()>;
}

/// POSTs `{session_id, events}` as JSON.
#[derive(Debug, Clone)]
pub struct HttpEventSink {
    http: reqwest::blocking::Client,
    url: String,
}

impl HttpEventSink {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("build event push client")?;
        Ok(Self {
            http,
            url: url.trim().to_string(),
        })
    }
}

impl EventSink for HttpEventSink {
    #[instrument(skip_all, fields(count = events.len()))]
    fn push(&self, session_id: &str, events: &[EventEnvelope]) -> Result<()> {
        self.http
            .post(&self.url)
            .json(&json!({ "session_id": session_id, "events": events }))
            .send()
            .with_context(|| format!("push events to {}", self.url))?
            .error_for_status()
            .with_context(|| format!("push events to {}", self.url))?;
        Ok(())
    }
}

/// Buffers events behind one lock and pushes them in order.
///
/// The buffer is flushed once it holds [`PUSH_BATCH_SIZE`] events, and
/// together with any ordering-barrier event so nothing batched can arrive
/// after it. Failed pushes are logged and dropped.
pub struct BatchingPusher {
    session_id: String,
    sink: Box<dyn EventSink>,
    batch_size: usize,
    buffer: Mutex<Vec<EventEnvelope>>,
}

impl BatchingPusher {
    pub fn new(session_id: impl Into<String>, sink: Box<dyn EventSink>) -> Self {
        Self {
            session_id: session_id.into(),
            sink,
            batch_size: PUSH_BATCH_SIZE,
            buffer: Mutex::new(Vec::new()),
        }
    }

    fn send(&self, batch: &mut Vec<EventEnvelope>) {
        if batch.is_empty() {
            return;
        }
        let events = std::mem::take(batch);
        match self.sink.push(&self.session_id, &events) {
            Ok(()) => debug!(count = events.len(), "pushed events"),
            Err(err) => {
                warn!(count = events.len(), err = %err, "dropping events after failed push");
            }
        }
    }
}

impl EventSubscriber for BatchingPusher {
    fn name(&self) -> &str {
        "event-push"
    }

    fn publish(&self, envelope: &EventEnvelope) -> Result<()> {
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|_| anyhow!("event push buffer lock poisoned"))?;
        buffer.push(envelope.clone());
        if envelope.kind.is_ordering_barrier() || buffer.len() >= self.batch_size {
            self.send(&mut buffer);
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|_| anyhow!("event push buffer lock poisoned"))?;
        self.send(&mut buffer);
        Ok(())
    }
}
