//! Cooperative cancellation flag shared between a session and its front end.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Checked by the step loop before each model turn. Never interrupts a call
/// that is already in flight.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
