//! Ordered progress events for an embedding transport.
//!
//! The core emits an ordered sequence of `(message, is_final)` pairs and has
//! no knowledge of how they reach a caller. Every event is mirrored to
//! `tracing` so library consumers without a channel still get a log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::info;

/// One progress event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub message: String,
    /// Set on the last event of a run.
    pub is_final: bool,
}

/// Cloneable sink for progress events.
#[derive(Clone)]
pub struct ProgressLog {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
    /// Per-topic emit counters for message suppression.
    counters: Arc<Mutex<HashMap<String, u32>>>,
}

impl ProgressLog {
    /// A log wired to a channel; the receiver sees events in emission order.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(tx),
                counters: Arc::new(Mutex::new(HashMap::new())),
            },
            rx,
        )
    }

    /// A log that only mirrors to `tracing`.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            counters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Emit a progress message.
    pub fn emit(&self, message: impl Into<String>) {
        self.send(message.into(), false);
    }

    /// Emit the final message of a run.
    pub fn finish(&self, message: impl Into<String>) {
        self.send(message.into(), true);
    }

    /// Emit a message under a suppression topic: after `limit` messages the
    /// topic goes quiet, with a single notice.
    pub fn emit_limited(&self, topic: &str, limit: u32, message: impl Into<String>) {
        let count = {
            let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            let count = counters.entry(topic.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if count <= limit {
            self.send(message.into(), false);
        } else if count == limit + 1 {
            self.send(format!("suppressing further messages for '{topic}'"), false);
        }
    }

    fn send(&self, message: String, is_final: bool) {
        info!(is_final, "{message}");
        if let Some(tx) = &self.tx {
            // The receiver may have been dropped; progress is best-effort.
            let _ = tx.send(ProgressEvent { message, is_final });
        }
    }
}
