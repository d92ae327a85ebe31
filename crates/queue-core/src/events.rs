//! In-process observer stream for queue lifecycle events.
//!
//! Backed by `tokio::sync::broadcast`: fan-out to every current listener,
//! and a slow listener that falls behind simply drops messages (the
//! channel returns `RecvError::Lagged`) rather than ever blocking the
//! emitting side — the "slow listeners must not block emission" guarantee
//! from the concurrency model.

use serde_json::Value;
use tokio::sync::broadcast;

use crate::model::FailureReason;

/// A lifecycle notification fanned out to every `Queue::on` subscriber.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Added { job_id: i64, job_type: String },
    Claimed { job_id: i64, worker_id: String },
    Completed { job_id: i64 },
    Failed { job_id: i64, reason: FailureReason, message: String },
    Waiting { job_id: i64 },
    TokenCompleted { token_id: uuid::Uuid, job_id: Option<i64> },
    Error { context: String, message: String, detail: Value },
}

/// Thread-safe fan-out broadcaster for [`QueueEvent`]s.
#[derive(Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<QueueEvent>,
}

impl EventEmitter {
    /// `capacity` bounds how many events a lagging subscriber may miss
    /// before being told it lagged; it does not bound emission rate.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    /// Emitting never blocks and never errors when there are zero
    /// listeners — a `SendError` there is expected, not exceptional.
    pub fn emit(&self, event: QueueEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_to_multiple_listeners() {
        let emitter = EventEmitter::new(16);
        let mut a = emitter.subscribe();
        let mut b = emitter.subscribe();

        emitter.emit(QueueEvent::Added {
            job_id: 1,
            job_type: "send_email".to_string(),
        });

        let got_a = a.recv().await.unwrap();
        let got_b = b.recv().await.unwrap();
        assert!(matches!(got_a, QueueEvent::Added { job_id: 1, .. }));
        assert!(matches!(got_b, QueueEvent::Added { job_id: 1, .. }));
    }

    #[test]
    fn emit_with_no_listeners_does_not_panic() {
        let emitter = EventEmitter::new(16);
        emitter.emit(QueueEvent::Completed { job_id: 1 });
    }
}
