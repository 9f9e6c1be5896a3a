//! Streaming progress events
//!
//! One bounded channel per streaming request sits between the pipeline task
//! and the SSE response. Events carry a per-request monotone sequence
//! number; exactly one terminal event (`completed` or `error`) is emitted
//! and nothing follows it. A full channel briefly blocks the pipeline
//! (backpressure); a dropped receiver reads as client disconnection.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Event kinds, in rough lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    Started,
    ReasoningStarted,
    ReasoningComplete,
    AgentsExecuting,
    AgentStarted,
    AgentComplete,
    ValidationStarted,
    ValidationComplete,
    Retry,
    Completed,
    Error,
}

impl StreamEventKind {
    /// SSE `event:` field name.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEventKind::Started => "started",
            StreamEventKind::ReasoningStarted => "reasoning_started",
            StreamEventKind::ReasoningComplete => "reasoning_complete",
            StreamEventKind::AgentsExecuting => "agents_executing",
            StreamEventKind::AgentStarted => "agent_started",
            StreamEventKind::AgentComplete => "agent_complete",
            StreamEventKind::ValidationStarted => "validation_started",
            StreamEventKind::ValidationComplete => "validation_complete",
            StreamEventKind::Retry => "retry",
            StreamEventKind::Completed => "completed",
            StreamEventKind::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEventKind::Completed | StreamEventKind::Error)
    }
}

/// One event on the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub request_id: String,
    pub seq: u64,
    pub event: StreamEventKind,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub data: serde_json::Value,
}

/// The pipeline's side of the event channel.
///
/// In non-streaming mode the sink discards everything; the pipeline code
/// stays identical either way.
pub struct EventSink {
    request_id: String,
    tx: Option<mpsc::Sender<StreamEvent>>,
    seq: AtomicU64,
    terminal_sent: AtomicBool,
    cancelled: AtomicBool,
}

impl EventSink {
    /// A streaming sink with the given channel capacity.
    pub fn streaming(request_id: String, buffer: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                request_id,
                tx: Some(tx),
                seq: AtomicU64::new(0),
                terminal_sent: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// A sink that drops every event.
    pub fn discard(request_id: String) -> Self {
        Self {
            request_id,
            tx: None,
            seq: AtomicU64::new(0),
            terminal_sent: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Emit one event. Returns `false` when the consumer is gone and the
    /// request should be cancelled. Events after the terminal one are
    /// silently dropped.
    pub async fn emit(&self, kind: StreamEventKind, data: serde_json::Value) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return false;
        }
        if self.terminal_sent.load(Ordering::Acquire) {
            return true;
        }
        if kind.is_terminal() {
            self.terminal_sent.store(true, Ordering::Release);
        }

        let Some(ref tx) = self.tx else {
            return true;
        };
        let event = StreamEvent {
            request_id: self.request_id.clone(),
            seq: self.seq.fetch_add(1, Ordering::AcqRel),
            event: kind,
            timestamp: chrono::Utc::now(),
            data,
        };
        if tx.send(event).await.is_err() {
            self.cancelled.store(true, Ordering::Release);
            return false;
        }
        true
    }

    /// Resolves when the consumer side has gone away. Pends forever for a
    /// discarding sink.
    pub async fn closed(&self) {
        match self.tx {
            Some(ref tx) => tx.closed().await,
            None => std::future::pending().await,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_sequence_is_monotone() {
        let (sink, mut rx) = EventSink::streaming("req-1".into(), 16);
        sink.emit(StreamEventKind::Started, json!({})).await;
        sink.emit(StreamEventKind::ReasoningStarted, json!({})).await;
        sink.emit(StreamEventKind::Completed, json!({})).await;
        drop(sink);

        let mut last = None;
        while let Some(event) = rx.recv().await {
            assert_eq!(event.request_id, "req-1");
            if let Some(prev) = last {
                assert!(event.seq > prev);
            }
            last = Some(event.seq);
        }
        assert_eq!(last, Some(2));
    }

    #[tokio::test]
    async fn test_no_events_after_terminal() {
        let (sink, mut rx) = EventSink::streaming("req-2".into(), 16);
        sink.emit(StreamEventKind::Error, json!({"kind": "Internal"})).await;
        assert!(sink.emit(StreamEventKind::Completed, json!({})).await);
        assert!(sink.emit(StreamEventKind::AgentStarted, json!({})).await);
        drop(sink);

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(event.event);
        }
        assert_eq!(kinds, vec![StreamEventKind::Error]);
    }

    #[tokio::test]
    async fn test_dropped_receiver_cancels() {
        let (sink, rx) = EventSink::streaming("req-3".into(), 1);
        drop(rx);
        assert!(!sink.emit(StreamEventKind::Started, json!({})).await);
        assert!(sink.is_cancelled());
        // Subsequent emits stay failed.
        assert!(!sink.emit(StreamEventKind::Completed, json!({})).await);
    }

    #[tokio::test]
    async fn test_discard_sink_accepts_everything() {
        let sink = EventSink::discard("req-4".into());
        assert!(sink.emit(StreamEventKind::Started, json!({})).await);
        assert!(sink.emit(StreamEventKind::Completed, json!({})).await);
        assert!(!sink.is_cancelled());
    }

    #[test]
    fn test_event_names() {
        assert_eq!(StreamEventKind::ReasoningComplete.name(), "reasoning_complete");
        assert!(StreamEventKind::Completed.is_terminal());
        assert!(StreamEventKind::Error.is_terminal());
        assert!(!StreamEventKind::Retry.is_terminal());
    }
}
