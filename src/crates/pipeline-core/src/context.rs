//! Per-run execution state
//!
//! An [`ExecutionContext`] is created for one top-level run and handed by
//! reference through the whole traversal. It owns the unit status map used
//! for join bookkeeping and reporting, the run's concurrency semaphore, the
//! cancellation token and the metric counters. Nested sub-pipeline and batch
//! runs get a [`child`](ExecutionContext::child) context with fresh state and
//! a child token, so cancelling a parent reaches every level below it while a
//! child can be cancelled on its own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{permit_count, RuntimeConfig};
use crate::error::{PipelineError, Result};
use crate::events::{EventSink, EventType, PipelineEvent, TracingSink};

/// Lifecycle of one unit within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Queued,
    Running,
    Done,
    Errored,
    Skipped,
    /// Dispatched or pending when the run was cancelled
    Cancelled,
}

impl UnitStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UnitStatus::Done | UnitStatus::Errored | UnitStatus::Skipped | UnitStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UnitStatus::Pending => "pending",
            UnitStatus::Queued => "queued",
            UnitStatus::Running => "running",
            UnitStatus::Done => "done",
            UnitStatus::Errored => "errored",
            UnitStatus::Skipped => "skipped",
            UnitStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the context knows about one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub status: UnitStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub output_count: usize,
    pub error: Option<String>,
    /// Position in which the unit reached a terminal state
    pub sequence: Option<u64>,
}

impl Default for UnitRecord {
    fn default() -> Self {
        Self {
            status: UnitStatus::Pending,
            started_at: None,
            finished_at: None,
            attempts: 0,
            output_count: 0,
            error: None,
            sequence: None,
        }
    }
}

#[derive(Debug, Default)]
struct RunMetrics {
    units_started: AtomicU64,
    units_completed: AtomicU64,
    units_failed: AtomicU64,
    units_skipped: AtomicU64,
    units_cancelled: AtomicU64,
    retries: AtomicU64,
    busy_ms: AtomicU64,
}

/// Counters accumulated during a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub units_started: u64,
    pub units_completed: u64,
    pub units_failed: u64,
    pub units_skipped: u64,
    pub units_cancelled: u64,
    pub retries: u64,
    /// Sum of unit execution times
    pub busy_ms: u64,
}

struct ContextInner {
    run_id: String,
    parent_run_id: Option<String>,
    depth: usize,
    config: RuntimeConfig,
    cancel_reason: Mutex<Option<String>>,
    permits: Arc<Semaphore>,
    /// Shared by every context of one run tree, keyed by graph and unit
    unit_permits: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
    records: Mutex<HashMap<String, UnitRecord>>,
    sequence: AtomicU64,
    metrics: RunMetrics,
    sink: Arc<dyn EventSink>,
    started_at: DateTime<Utc>,
}

/// Shared, explicitly scoped state of one run
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
    token: CancellationToken,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("run_id", &self.inner.run_id)
            .field("depth", &self.inner.depth)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

impl ExecutionContext {
    /// Top-level context that reports events to `tracing`
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_event_sink(config, Arc::new(TracingSink))
    }

    pub fn with_event_sink(config: RuntimeConfig, sink: Arc<dyn EventSink>) -> Self {
        Self::build(config, sink, None, 0, CancellationToken::new(), Arc::default())
    }

    fn build(
        config: RuntimeConfig,
        sink: Arc<dyn EventSink>,
        parent_run_id: Option<String>,
        depth: usize,
        token: CancellationToken,
        unit_permits: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(permit_count(config.max_concurrency)));
        Self {
            inner: Arc::new(ContextInner {
                run_id: Uuid::new_v4().to_string(),
                parent_run_id,
                depth,
                config,
                cancel_reason: Mutex::new(None),
                permits,
                unit_permits,
                records: Mutex::new(HashMap::new()),
                sequence: AtomicU64::new(0),
                metrics: RunMetrics::default(),
                sink,
                started_at: Utc::now(),
            }),
            token,
        }
    }

    /// Context for a nested run
    ///
    /// The child has its own status map, metrics and semaphore. Per-unit
    /// limits are shared with the parent, so a capped unit inside a batch
    /// sub-pipeline stays capped across all sub-items. Its token is a child of
    /// this one: cancelling the parent cancels the child, not the other way
    /// round.
    pub fn child(&self) -> Result<Self> {
        self.child_with_token(self.token.child_token())
    }

    pub(crate) fn child_with_token(&self, token: CancellationToken) -> Result<Self> {
        let depth = self.inner.depth + 1;
        let max = self.inner.config.max_nesting_depth;
        if depth > max {
            return Err(PipelineError::NestingTooDeep { depth, max });
        }
        Ok(Self::build(
            self.inner.config.clone(),
            Arc::clone(&self.inner.sink),
            Some(self.inner.run_id.clone()),
            depth,
            token,
            Arc::clone(&self.inner.unit_permits),
        ))
    }

    /// Same run state observed through a different cancellation token
    pub(crate) fn rebind(&self, token: CancellationToken) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            token,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn parent_run_id(&self) -> Option<&str> {
        self.inner.parent_run_id.as_deref()
    }

    /// Zero for a top-level run
    pub fn depth(&self) -> usize {
        self.inner.depth
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    /// Requests cancellation. The first reason given wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        {
            let mut current = self.inner.cancel_reason.lock();
            if current.is_none() {
                *current = Some(reason.into());
            }
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Why the run was cancelled, if it was
    ///
    /// Cancellation inherited from a parent context reports the parent's
    /// reason when this level never recorded one of its own.
    pub fn cancel_reason(&self) -> Option<String> {
        if !self.token.is_cancelled() {
            return None;
        }
        Some(
            self.inner
                .cancel_reason
                .lock()
                .clone()
                .unwrap_or_else(|| "cancelled by parent".to_string()),
        )
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn record(&self, unit_id: &str) -> Option<UnitRecord> {
        self.inner.records.lock().get(unit_id).cloned()
    }

    pub fn records(&self) -> HashMap<String, UnitRecord> {
        self.inner.records.lock().clone()
    }

    pub fn status(&self, unit_id: &str) -> Option<UnitStatus> {
        self.inner.records.lock().get(unit_id).map(|r| r.status)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let m = &self.inner.metrics;
        MetricsSnapshot {
            units_started: m.units_started.load(Ordering::Relaxed),
            units_completed: m.units_completed.load(Ordering::Relaxed),
            units_failed: m.units_failed.load(Ordering::Relaxed),
            units_skipped: m.units_skipped.load(Ordering::Relaxed),
            units_cancelled: m.units_cancelled.load(Ordering::Relaxed),
            retries: m.retries.load(Ordering::Relaxed),
            busy_ms: m.busy_ms.load(Ordering::Relaxed),
        }
    }

    pub fn emit(&self, event: PipelineEvent) {
        self.inner.sink.emit(event);
    }

    pub fn event_sink(&self) -> Arc<dyn EventSink> {
        Arc::clone(&self.inner.sink)
    }

    /// Event stamped with this run's id
    pub(crate) fn event(&self, event_type: EventType) -> PipelineEvent {
        PipelineEvent::new(event_type, self.inner.run_id.clone())
    }

    pub(crate) fn permits(&self) -> Arc<Semaphore> {
        Arc::clone(&self.inner.permits)
    }

    /// Semaphore for a unit with its own concurrency cap
    pub(crate) fn unit_permits(&self, graph: &str, unit_id: &str, limit: usize) -> Arc<Semaphore> {
        let mut permits = self.inner.unit_permits.lock();
        Arc::clone(
            permits
                .entry(format!("{graph}/{unit_id}"))
                .or_insert_with(|| Arc::new(Semaphore::new(permit_count(limit)))),
        )
    }

    pub(crate) fn update_record<F>(&self, unit_id: &str, update: F)
    where
        F: FnOnce(&mut UnitRecord),
    {
        let mut records = self.inner.records.lock();
        update(records.entry(unit_id.to_string()).or_default());
    }

    /// Moves a unit to a terminal state and stamps its completion order
    pub(crate) fn finish_record(&self, unit_id: &str, status: UnitStatus, error: Option<String>) {
        let seq = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        let m = &self.inner.metrics;
        match status {
            UnitStatus::Done => m.units_completed.fetch_add(1, Ordering::Relaxed),
            UnitStatus::Errored => m.units_failed.fetch_add(1, Ordering::Relaxed),
            UnitStatus::Skipped => m.units_skipped.fetch_add(1, Ordering::Relaxed),
            UnitStatus::Cancelled => m.units_cancelled.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
        self.update_record(unit_id, |record| {
            record.status = status;
            record.finished_at = Some(Utc::now());
            record.sequence = Some(seq);
            if error.is_some() {
                record.error = error;
            }
        });
    }

    pub(crate) fn note_started(&self) {
        self.inner.metrics.units_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_retry(&self) {
        self.inner.metrics.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_busy(&self, elapsed: Duration) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.inner.metrics.busy_ms.fetch_add(ms, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;

    #[test]
    fn test_cancel_keeps_first_reason() {
        let ctx = ExecutionContext::new(RuntimeConfig::default());
        assert!(ctx.cancel_reason().is_none());

        ctx.cancel("user request");
        ctx.cancel("deadline exceeded");
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.cancel_reason().as_deref(), Some("user request"));
    }

    #[test]
    fn test_child_inherits_cancellation_but_not_state() {
        let parent = ExecutionContext::new(RuntimeConfig::default());
        parent.update_record("a", |r| r.status = UnitStatus::Running);

        let child = parent.child().unwrap();
        assert_eq!(child.depth(), 1);
        assert_eq!(child.parent_run_id(), Some(parent.run_id()));
        assert_ne!(child.run_id(), parent.run_id());
        assert!(child.record("a").is_none());

        child.cancel("item timed out");
        assert!(!parent.is_cancelled());

        let sibling = parent.child().unwrap();
        parent.cancel("stop");
        assert!(sibling.is_cancelled());
        assert_eq!(sibling.cancel_reason().as_deref(), Some("cancelled by parent"));
    }

    #[test]
    fn test_nesting_limit() {
        let config = RuntimeConfig {
            max_nesting_depth: 2,
            ..RuntimeConfig::default()
        };
        let root = ExecutionContext::new(config);
        let one = root.child().unwrap();
        let two = one.child().unwrap();
        let err = two.child().unwrap_err();
        assert!(matches!(err, PipelineError::NestingTooDeep { depth: 3, max: 2 }));
    }

    #[test]
    fn test_finish_record_counts_and_orders() {
        let ctx = ExecutionContext::new(RuntimeConfig::default());
        ctx.finish_record("a", UnitStatus::Done, None);
        ctx.finish_record("b", UnitStatus::Skipped, None);
        ctx.finish_record("c", UnitStatus::Errored, Some("boom".into()));

        let metrics = ctx.metrics();
        assert_eq!(metrics.units_completed, 1);
        assert_eq!(metrics.units_skipped, 1);
        assert_eq!(metrics.units_failed, 1);

        let a = ctx.record("a").unwrap();
        let c = ctx.record("c").unwrap();
        assert!(a.sequence < c.sequence);
        assert_eq!(c.error.as_deref(), Some("boom"));
        assert!(UnitStatus::Errored.is_terminal());
        assert!(!UnitStatus::Queued.is_terminal());
    }

    #[test]
    fn test_events_carry_run_id() {
        let sink = Arc::new(MemorySink::new());
        let ctx = ExecutionContext::with_event_sink(RuntimeConfig::default(), sink.clone());
        ctx.emit(ctx.event(EventType::GraphStarted));
        assert_eq!(sink.events()[0].run_id, ctx.run_id());
    }

    #[test]
    fn test_rebind_shares_state() {
        let ctx = ExecutionContext::new(RuntimeConfig::default());
        let unit_ctx = ctx.rebind(ctx.cancellation_token().child_token());
        unit_ctx.update_record("x", |r| r.attempts = 2);
        assert_eq!(ctx.record("x").map(|r| r.attempts), Some(2));

        unit_ctx.cancellation_token().cancel();
        assert!(!ctx.is_cancelled());
    }
}
