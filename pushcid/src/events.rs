//! Job event broadcast.
//!
//! Jobs announce phase changes and their final report as JSON lines on a
//! broadcast channel. Nothing is buffered for late subscribers, and a send
//! with no subscribers is dropped silently.

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_BUFFER: usize = 256;

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    event: &'a str,
    data: &'a T,
    timestamp: String,
}

pub const JOB_PHASE_CHANGED: &str = "job_phase_changed";
pub const JOB_FINISHED: &str = "job_finished";

/// Broadcast channel for job events (JSON lines).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<String>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl EventBus {
    /// The effective buffer is never smaller than `DEFAULT_BUFFER`.
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(DEFAULT_BUFFER));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    /// Emit `{"event", "data", "timestamp"}`.
    ///
    /// Returns false when the payload could not be serialized.
    pub fn emit<T: Serialize>(&self, event: &str, data: &T) -> bool {
        let payload = Envelope {
            event,
            data,
            timestamp: Utc::now().to_rfc3339(),
        };
        match serde_json::to_string(&payload) {
            Ok(serialized) => {
                let _ = self.sender.send(serialized);
                true
            }
            Err(err) => {
                warn!(event, error = %err, "failed to serialize event");
                false
            }
        }
    }
}
