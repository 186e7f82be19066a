//! In-process event bus for one session.
//!
//! Every event is assigned the next sequence number and appended to the
//! session's `events.jsonl` before any subscriber sees it. Subscribers are
//! live mirrors; a failing subscriber is logged and never stops the session.

pub mod push;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::warn;

use crate::core::types::{EventEnvelope, EventKind};
use crate::io::session_store::{EventLog, now_rfc3339};

/// Adapter that drains the bus into some other destination.
pub trait EventSubscriber: Send + Sync {
    fn name(&self) -> &str;

    fn publish(&self, envelope: &EventEnvelope) -> Result<()>;

    /// Deliver anything still buffered.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

pub struct EventBus {
    log: EventLog,
    last_seq: u64,
    subscribers: Vec<Box<dyn EventSubscriber>>,
}

impl EventBus {
    /// Continue numbering after `last_seq`, the highest sequence already logged.
    pub fn new(log: EventLog, last_seq: u64) -> Self {
        Self {
            log,
            last_seq,
            subscribers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, subscriber: Box<dyn EventSubscriber>) {
        self.subscribers.push(subscriber);
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Log and fan out one event. Only a log write failure is an error.
    pub fn emit(&mut self, kind: EventKind, data: Value) -> Result<EventEnvelope> {
        let envelope = EventEnvelope {
            seq: self.last_seq + 1,
            kind,
            ts: now_rfc3339(),
            data,
        };
        self.log
            .append(&envelope)
            .with_context(|| format!("append event {}", envelope.seq))?;
        self.last_seq = envelope.seq;
        for subscriber in &self.subscribers {
            if let Err(err) = subscriber.publish(&envelope) {
                warn!(
                    subscriber = subscriber.name(),
                    seq = envelope.seq,
                    err = %err,
                    "event subscriber failed"
                );
            }
        }
        Ok(envelope)
    }

    pub fn flush(&self) {
        for subscriber in &self.subscribers {
            if let Err(err) = subscriber.flush() {
                warn!(subscriber = subscriber.name(), err = %err, "event subscriber flush failed");
            }
        }
    }
}
