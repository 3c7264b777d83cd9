//! Progress notifications for callers that want to observe a running request.
//!
//! Events are fire-and-forget: a dropped receiver never affects the pipeline.

use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    Planned { chunks: usize },
    Retrieved { corpus_id: String, passages: usize },
    ChunkCompleted { chunk_index: usize, total: usize },
    /// Emitted while a model call is still pending.
    Heartbeat { model_id: String, elapsed_secs: u64 },
    AttemptStarted { attempt: u32 },
    AttemptVerified { attempt: u32, failing: usize, unverifiable: usize },
}

/// Optional event channel shared by all components of one pipeline.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<PipelineEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Sink that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Create a connected sink/receiver pair.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
