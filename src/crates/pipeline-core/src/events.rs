//! Lifecycle events for observability
//!
//! The scheduler, retry layer and batch coordinator report what they do as
//! [`PipelineEvent`]s pushed into an [`EventSink`]. Sinks are called inline
//! from scheduling code and must not block.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    GraphStarted,
    GraphCompleted,
    GraphFailed,
    GraphCancelled,
    UnitStarted,
    UnitCompleted,
    UnitFailed,
    UnitSkipped,
    UnitRetrying,
    BatchStarted,
    BatchItemCompleted,
    BatchItemFailed,
    BatchCompleted,
}

/// One lifecycle record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub event_type: EventType,
    /// Run the event belongs to. Nested runs have their own ids.
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl PipelineEvent {
    pub fn new(event_type: EventType, run_id: impl Into<String>) -> Self {
        Self {
            event_type,
            run_id: run_id.into(),
            unit_id: None,
            timestamp: Utc::now(),
            data: None,
        }
    }

    pub fn with_unit(mut self, unit_id: impl Into<String>) -> Self {
        self.unit_id = Some(unit_id.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Receiver of lifecycle events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: PipelineEvent) {}
}

/// Forwards events to `tracing` at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: PipelineEvent) {
        tracing::debug!(
            event = ?event.event_type,
            run_id = %event.run_id,
            unit = event.unit_id.as_deref().unwrap_or("-"),
            data = ?event.data,
            "pipeline event"
        );
    }
}

/// Sends events over an unbounded channel
///
/// Events emitted after the receiver is dropped are discarded.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<PipelineEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Same as [`ChannelSink::new`] with the receiver wrapped as a `Stream`
    pub fn with_stream() -> (Self, UnboundedReceiverStream<PipelineEvent>) {
        let (sink, rx) = Self::new();
        (sink, UnboundedReceiverStream::new(rx))
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().clone()
    }

    pub fn of_type(&self, event_type: EventType) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Events of `event_type` emitted for `unit_id`
    pub fn for_unit(&self, event_type: EventType, unit_id: &str) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type && e.unit_id.as_deref() == Some(unit_id))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: PipelineEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization_skips_empty_fields() {
        let event = PipelineEvent::new(EventType::GraphStarted, "run-1");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], "graph_started");
        assert!(value.get("unit_id").is_none());
        assert!(value.get("data").is_none());
    }

    #[test]
    fn test_memory_sink_filters() {
        let sink = MemorySink::new();
        sink.emit(PipelineEvent::new(EventType::UnitStarted, "r").with_unit("a"));
        sink.emit(PipelineEvent::new(EventType::UnitStarted, "r").with_unit("b"));
        sink.emit(
            PipelineEvent::new(EventType::UnitCompleted, "r")
                .with_unit("a")
                .with_data(json!({"outputs": 1})),
        );

        assert_eq!(sink.events().len(), 3);
        assert_eq!(sink.of_type(EventType::UnitStarted).len(), 2);
        assert_eq!(sink.for_unit(EventType::UnitCompleted, "a").len(), 1);

        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_channel_sink_delivers() {
        let (sink, mut rx) = ChannelSink::new();
        sink.emit(PipelineEvent::new(EventType::GraphCompleted, "run-9"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::GraphCompleted);
        assert_eq!(event.run_id, "run-9");
    }

    #[test]
    fn test_channel_sink_ignores_closed_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.emit(PipelineEvent::new(EventType::GraphStarted, "run"));
    }
}
