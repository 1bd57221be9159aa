//! Graph scheduler
//!
//! [`execute`] walks a [`Graph`] for one input item and returns a
//! [`RunReport`]. The run is a single event loop that owns all scheduling
//! state; units run as tokio tasks in a `JoinSet` and only report back their
//! outputs, so no scheduling state is shared across tasks.
//!
//! # Readiness
//!
//! Every unit keeps one slot per inbound edge. An edge fills the slot of its
//! target once it has resolved:
//!
//! - sequential and parallel edges deliver the source's outputs when the
//!   source is `done`, and a skip marker otherwise
//! - conditional edges route each output item to the first branch whose
//!   predicate matches (or the default); targets receiving nothing are skipped
//! - `all` joins resolve once every source is terminal and deliver the
//!   concatenation of the sources' outputs in declaration order
//! - `first` joins resolve with the first source to complete and cancel the
//!   sources still pending
//!
//! A unit whose slots are all filled runs if the slots carry at least one
//! item, and is skipped otherwise. Each input item is one invocation.
//!
//! A join's timeout counts from the moment its first source is queued, so a
//! join whose sources all hang still times out.
//!
//! # Failure and cancellation
//!
//! A failing unit without `continue_on_error` fails the run: its error is
//! recorded and the context is cancelled. Cancellation (explicit, run
//! deadline or failure) stops dispatching; in-flight units get
//! `drain_grace` to finish before they are detached. Their results are never
//! used.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeConfig;
use crate::content::ContentItem;
use crate::context::{ExecutionContext, MetricsSnapshot, UnitStatus};
use crate::error::{PipelineError, Result};
use crate::events::{EventSink, EventType, TracingSink};
use crate::graph::{EdgeKind, Graph, WaitStrategy};
use crate::retry::{invoke_with_retry, RetryPolicy};
use crate::unit::UnitRef;

/// Terminal state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Per-unit line of a [`RunReport`]
#[derive(Debug, Clone, Serialize)]
pub struct UnitOutcome {
    pub unit_id: String,
    pub kind: String,
    pub status: UnitStatus,
    pub attempts: u32,
    pub output_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Order in which units reached a terminal state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

/// Why a run failed
#[derive(Debug, Serialize)]
pub struct RunFailure {
    /// Unit the failure originated from
    pub unit_id: Option<String>,
    pub message: String,
    /// The error followed by each underlying cause
    pub chain: Vec<String>,
    #[serde(skip)]
    pub error: PipelineError,
}

impl RunFailure {
    fn new(error: PipelineError, unit_id: Option<String>) -> Self {
        Self {
            unit_id: unit_id.or_else(|| error.unit_id().map(str::to_string)),
            message: error.to_string(),
            chain: error.cause_chain(),
            error,
        }
    }
}

/// Everything known about a finished run
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub graph: String,
    pub status: RunStatus,
    /// Outputs of the sink units in declaration order; empty unless completed
    pub outputs: Vec<ContentItem>,
    /// One entry per unit, in declaration order
    pub outcomes: Vec<UnitOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    pub metrics: MetricsSnapshot,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn outcome(&self, unit_id: &str) -> Option<&UnitOutcome> {
        self.outcomes.iter().find(|o| o.unit_id == unit_id)
    }

    pub fn status_of(&self, unit_id: &str) -> Option<UnitStatus> {
        self.outcome(unit_id).map(|o| o.status)
    }

    /// Outputs on success, the failure (or cancellation) otherwise
    pub fn into_result(self) -> Result<Vec<ContentItem>> {
        match self.status {
            RunStatus::Completed => Ok(self.outputs),
            RunStatus::Failed => Err(self
                .failure
                .map(|f| f.error)
                .unwrap_or_else(|| PipelineError::Execution("run failed without a recorded cause".into()))),
            RunStatus::Cancelled => Err(PipelineError::cancelled(
                self.cancel_reason.unwrap_or_else(|| "cancelled".to_string()),
            )),
        }
    }
}

/// Entry point for running graphs with one configuration and event sink
#[derive(Clone)]
pub struct Scheduler {
    config: RuntimeConfig,
    sink: Arc<dyn EventSink>,
}

impl Scheduler {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            sink: Arc::new(TracingSink),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Fresh top-level context; keep a clone to cancel the run from outside
    pub fn context(&self) -> ExecutionContext {
        ExecutionContext::with_event_sink(self.config.clone(), Arc::clone(&self.sink))
    }

    pub async fn run(&self, graph: &Graph, input: ContentItem) -> RunReport {
        execute(graph, input, &self.context()).await
    }

    pub async fn run_with_context(
        &self,
        graph: &Graph,
        input: ContentItem,
        ctx: &ExecutionContext,
    ) -> RunReport {
        execute(graph, input, ctx).await
    }

    /// Outputs as a stream, ending with the failure if the run did not complete
    pub fn stream(
        &self,
        graph: Graph,
        input: ContentItem,
    ) -> impl Stream<Item = Result<ContentItem>> + Send + 'static {
        self.stream_with_context(graph, input, self.context())
    }

    pub fn stream_with_context(
        &self,
        graph: Graph,
        input: ContentItem,
        ctx: ExecutionContext,
    ) -> impl Stream<Item = Result<ContentItem>> + Send + 'static {
        stream! {
            match execute(&graph, input, &ctx).await.into_result() {
                Ok(items) => {
                    for item in items {
                        yield Ok(item);
                    }
                }
                Err(err) => yield Err(err),
            }
        }
    }
}

/// Runs `graph` for one input item under `ctx`
///
/// A context belongs to one run: a failing unit cancels it.
#[tracing::instrument(skip_all, fields(graph = %graph.name(), run_id = %ctx.run_id(), depth = ctx.depth()))]
pub async fn execute(graph: &Graph, input: ContentItem, ctx: &ExecutionContext) -> RunReport {
    let started_at = Utc::now();
    ctx.emit(ctx.event(EventType::GraphStarted).with_data(json!({
        "graph": graph.name(),
        "depth": ctx.depth(),
        "parent_run_id": ctx.parent_run_id(),
    })));

    let mut run = RunState::new(graph, ctx);
    run.queue(graph.start_index(), vec![input]);
    run.drive().await;
    run.into_report(started_at)
}

enum Delivery {
    Items(Vec<ContentItem>),
    Skip(&'static str),
}

enum TaskOutcome {
    /// Cancelled while waiting for a permit
    NotStarted,
    Finished {
        result: Result<Vec<ContentItem>>,
        elapsed: Duration,
    },
}

struct UnitState {
    status: UnitStatus,
    slots: Vec<Option<Delivery>>,
    outputs: Vec<ContentItem>,
    token: Option<CancellationToken>,
}

#[derive(Default)]
struct JoinState {
    resolved: bool,
    waiting_since: Option<Instant>,
}

struct RunState<'a> {
    graph: &'a Graph,
    ctx: &'a ExecutionContext,
    units: Vec<UnitState>,
    joins: HashMap<usize, JoinState>,
    ready: VecDeque<(usize, Vec<ContentItem>)>,
    tasks: JoinSet<(usize, TaskOutcome)>,
    failure: Option<RunFailure>,
}

impl<'a> RunState<'a> {
    fn new(graph: &'a Graph, ctx: &'a ExecutionContext) -> Self {
        let units = (0..graph.units().len())
            .map(|i| UnitState {
                status: UnitStatus::Pending,
                slots: graph.inbound_of(i).iter().map(|_| None).collect(),
                outputs: Vec::new(),
                token: None,
            })
            .collect();
        let joins = graph
            .edges()
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e.kind, EdgeKind::Join { .. }))
            .map(|(i, _)| (i, JoinState::default()))
            .collect();
        for unit in graph.units() {
            ctx.update_record(&unit.id, |r| r.status = UnitStatus::Pending);
        }

        Self {
            graph,
            ctx,
            units,
            joins,
            ready: VecDeque::new(),
            tasks: JoinSet::new(),
            failure: None,
        }
    }

    fn unit_ref(&self, idx: usize) -> &'a UnitRef {
        let graph: &'a Graph = self.graph;
        &graph.units()[idx]
    }

    async fn drive(&mut self) {
        let ctx = self.ctx;
        let token = ctx.cancellation_token().clone();
        let run_deadline = if ctx.depth() == 0 {
            ctx.config().run_timeout().map(|t| Instant::now() + t)
        } else {
            None
        };
        let mut drain_deadline: Option<Instant> = None;

        loop {
            if drain_deadline.is_none() && ctx.is_cancelled() {
                drain_deadline = Some(Instant::now() + ctx.config().drain_grace());
                self.cancel_ready();
            }
            self.dispatch_ready();
            if self.tasks.is_empty() {
                break;
            }

            let join_deadline = self.next_join_deadline();
            let far = Instant::now() + Duration::from_secs(86_400 * 365);

            tokio::select! {
                biased;
                joined = self.tasks.join_next() => match joined {
                    Some(Ok((idx, outcome))) => self.on_finished(idx, outcome),
                    Some(Err(err)) => {
                        self.fail(PipelineError::Execution(format!("unit task aborted: {err}")), None);
                    }
                    None => break,
                },
                _ = token.cancelled(), if drain_deadline.is_none() => {}
                _ = tokio::time::sleep_until(run_deadline.unwrap_or(far)), if run_deadline.is_some() && drain_deadline.is_none() => {
                    tracing::warn!(graph = %self.graph.name(), "Run deadline exceeded, cancelling");
                    ctx.cancel("deadline exceeded");
                }
                _ = tokio::time::sleep_until(join_deadline.unwrap_or(far)), if join_deadline.is_some() && drain_deadline.is_none() => {
                    self.expire_joins();
                }
                _ = tokio::time::sleep_until(drain_deadline.unwrap_or(far)), if drain_deadline.is_some() => {
                    self.detach_in_flight();
                    break;
                }
            }
        }
    }

    fn queue(&mut self, idx: usize, items: Vec<ContentItem>) {
        self.units[idx].status = UnitStatus::Queued;
        self.ctx
            .update_record(&self.unit_ref(idx).id, |r| r.status = UnitStatus::Queued);
        self.ready.push_back((idx, items));

        // A join's clock starts once any of its sources has work
        let graph = self.graph;
        for &edge_idx in graph.outbound_of(idx) {
            if let EdgeKind::Join { .. } = graph.edges()[edge_idx].kind {
                self.joins
                    .entry(edge_idx)
                    .or_default()
                    .waiting_since
                    .get_or_insert_with(Instant::now);
            }
        }
    }

    fn dispatch_ready(&mut self) {
        if self.ctx.is_cancelled() {
            return;
        }
        while let Some((idx, items)) = self.ready.pop_front() {
            if self.units[idx].status != UnitStatus::Queued {
                continue;
            }
            let unit = self.unit_ref(idx).clone();
            let unit_token = self.ctx.cancellation_token().child_token();
            let unit_ctx = self.ctx.rebind(unit_token.clone());
            let policy = unit
                .policy
                .retry
                .clone()
                .unwrap_or_else(|| self.ctx.config().retry.to_policy());
            let unit_permits = unit
                .policy
                .max_concurrency
                .map(|limit| self.ctx.unit_permits(self.graph.name(), &unit.id, limit));

            tracing::debug!(unit = %unit.id, inputs = items.len(), "Dispatching unit");
            self.units[idx].status = UnitStatus::Running;
            self.units[idx].token = Some(unit_token);

            let permits = self.ctx.permits();
            self.tasks.spawn(async move {
                let outcome = run_unit(unit, items, unit_ctx, policy, permits, unit_permits).await;
                (idx, outcome)
            });
        }
    }

    fn cancel_ready(&mut self) {
        while let Some((idx, _)) = self.ready.pop_front() {
            if self.units[idx].status == UnitStatus::Queued {
                self.finish(idx, UnitStatus::Cancelled, None);
            }
        }
    }

    fn on_finished(&mut self, idx: usize, outcome: TaskOutcome) {
        let unit_id = self.unit_ref(idx).id.clone();

        if self.units[idx].status.is_terminal() {
            tracing::debug!(unit = %unit_id, "Discarding result of unit that was already resolved");
            return;
        }
        if self.ctx.is_cancelled() {
            if matches!(outcome, TaskOutcome::Finished { result: Ok(_), .. }) {
                tracing::warn!(unit = %unit_id, "Discarding output produced after cancellation");
            }
            self.finish(idx, UnitStatus::Cancelled, None);
            return;
        }

        match outcome {
            TaskOutcome::NotStarted => {
                self.finish(idx, UnitStatus::Cancelled, None);
            }
            TaskOutcome::Finished { result: Ok(outputs), elapsed } => {
                let count = outputs.len();
                self.units[idx].outputs = outputs;
                self.ctx.update_record(&unit_id, |r| r.output_count = count);
                self.ctx.emit(
                    self.ctx
                        .event(EventType::UnitCompleted)
                        .with_unit(&unit_id)
                        .with_data(json!({"outputs": count, "duration_ms": elapsed.as_millis() as u64})),
                );
                self.finish(idx, UnitStatus::Done, None);
                self.settle(idx);
            }
            TaskOutcome::Finished { result: Err(err), .. } => {
                if err.is_cancelled() {
                    self.finish(idx, UnitStatus::Cancelled, None);
                    return;
                }
                let continued = self.unit_ref(idx).policy.continue_on_error;
                self.ctx.emit(
                    self.ctx
                        .event(EventType::UnitFailed)
                        .with_unit(&unit_id)
                        .with_data(json!({"error": err.to_string(), "continued": continued})),
                );
                self.finish(idx, UnitStatus::Errored, Some(err.to_string()));
                if continued {
                    tracing::warn!(unit = %unit_id, error = %err, "Unit failed, continuing");
                    self.settle(idx);
                } else {
                    tracing::error!(unit = %unit_id, error = %err, "Unit failed, aborting run");
                    self.fail(err, Some(unit_id));
                }
            }
        }
    }

    fn fail(&mut self, error: PipelineError, unit_id: Option<String>) {
        let reason = match &unit_id {
            Some(id) => format!("unit '{id}' failed"),
            None => error.to_string(),
        };
        if self.failure.is_none() {
            self.failure = Some(RunFailure::new(error, unit_id));
        }
        self.ctx.cancel(reason);
    }

    fn finish(&mut self, idx: usize, status: UnitStatus, error: Option<String>) {
        self.units[idx].status = status;
        self.ctx.finish_record(&self.unit_ref(idx).id, status, error);
    }

    fn skip(&mut self, idx: usize, reason: &str) {
        let unit_id = &self.unit_ref(idx).id;
        tracing::debug!(unit = %unit_id, reason, "Skipping unit");
        self.ctx.emit(
            self.ctx
                .event(EventType::UnitSkipped)
                .with_unit(unit_id)
                .with_data(json!({"reason": reason})),
        );
        self.finish(idx, UnitStatus::Skipped, None);
    }

    /// Resolves the outbound edges of a unit that just became terminal,
    /// following skips downstream.
    fn settle(&mut self, idx: usize) {
        let graph = self.graph;
        let mut pending = vec![idx];
        while let Some(source) = pending.pop() {
            for &edge_idx in graph.outbound_of(source) {
                for (target, delivery) in self.resolve_edge(edge_idx, source, &mut pending) {
                    if self.deliver(target, edge_idx, delivery) {
                        pending.push(target);
                    }
                }
            }
        }
    }

    fn resolve_edge(
        &mut self,
        edge_idx: usize,
        source: usize,
        pending: &mut Vec<usize>,
    ) -> Vec<(usize, Delivery)> {
        let graph = self.graph;
        let edge = &graph.edges()[edge_idx];
        let done = self.units[source].status == UnitStatus::Done;
        let targets: Vec<usize> = edge.to.iter().filter_map(|id| graph.index_of(id)).collect();

        match &edge.kind {
            EdgeKind::Sequential | EdgeKind::Parallel => targets
                .into_iter()
                .map(|t| {
                    let delivery = if done {
                        Delivery::Items(self.units[source].outputs.clone())
                    } else {
                        Delivery::Skip("upstream did not complete")
                    };
                    (t, delivery)
                })
                .collect(),

            EdgeKind::Conditional { branches, default } => {
                let mut routed: HashMap<&str, Vec<ContentItem>> = HashMap::new();
                if done {
                    for item in &self.units[source].outputs {
                        let target = branches
                            .iter()
                            .find(|b| b.predicate.matches(item))
                            .map(|b| b.target.as_str())
                            .unwrap_or(default.as_str());
                        tracing::debug!(from = %edge.from[0], to = target, "Routing item");
                        routed.entry(target).or_default().push(item.clone());
                    }
                }
                edge.to
                    .iter()
                    .zip(targets)
                    .map(|(id, t)| match routed.remove(id.as_str()) {
                        Some(items) => (t, Delivery::Items(items)),
                        None => (t, Delivery::Skip("not selected by conditional route")),
                    })
                    .collect()
            }

            EdgeKind::Join { wait, .. } => {
                if self.joins.get(&edge_idx).map_or(true, |j| j.resolved) {
                    return Vec::new();
                }
                let sources: Vec<usize> = edge.from.iter().filter_map(|id| graph.index_of(id)).collect();
                let all_terminal = sources.iter().all(|&s| self.units[s].status.is_terminal());

                let delivery = match wait {
                    WaitStrategy::First if done => {
                        let target_id = &edge.to[0];
                        for &loser in sources.iter().filter(|&&s| s != source) {
                            if !self.units[loser].status.is_terminal() {
                                self.cancel_loser(loser, target_id);
                                pending.push(loser);
                            }
                        }
                        Some(Delivery::Items(self.units[source].outputs.clone()))
                    }
                    _ if all_terminal => Some(self.collect_join(&sources)),
                    _ => None,
                };

                let state = self.joins.entry(edge_idx).or_default();
                match delivery {
                    Some(delivery) => {
                        state.resolved = true;
                        targets.into_iter().map(|t| (t, delivery_clone(&delivery))).collect()
                    }
                    None => {
                        state.waiting_since.get_or_insert_with(Instant::now);
                        Vec::new()
                    }
                }
            }
        }
    }

    /// Concatenated outputs of finished join sources, in declaration order
    fn collect_join(&self, sources: &[usize]) -> Delivery {
        let contributed = sources
            .iter()
            .any(|&s| matches!(self.units[s].status, UnitStatus::Done | UnitStatus::Errored));
        if !contributed {
            return Delivery::Skip("every join source was skipped");
        }
        Delivery::Items(
            sources
                .iter()
                .filter(|&&s| self.units[s].status == UnitStatus::Done)
                .flat_map(|&s| self.units[s].outputs.iter().cloned())
                .collect(),
        )
    }

    fn cancel_loser(&mut self, loser: usize, target: &str) {
        let unit_id = self.unit_ref(loser).id.clone();
        tracing::debug!(unit = %unit_id, join = target, "Cancelling branch that lost a first join");
        if let Some(token) = &self.units[loser].token {
            token.cancel();
        }
        self.ctx.emit(
            self.ctx
                .event(EventType::UnitSkipped)
                .with_unit(&unit_id)
                .with_data(json!({"reason": "lost first join", "join": target})),
        );
        self.finish(loser, UnitStatus::Skipped, None);
    }

    /// Fills one inbound slot; returns true if the target was skipped
    fn deliver(&mut self, target: usize, edge_idx: usize, delivery: Delivery) -> bool {
        let Some(pos) = self.graph.inbound_of(target).iter().position(|&e| e == edge_idx) else {
            return false;
        };
        let state = &mut self.units[target];
        if state.status != UnitStatus::Pending || state.slots[pos].is_some() {
            return false;
        }
        state.slots[pos] = Some(delivery);
        if state.slots.iter().any(Option::is_none) {
            return false;
        }

        let mut items = Vec::new();
        let mut delivered = false;
        let mut reason = "upstream did not complete";
        for slot in state.slots.iter_mut() {
            match slot.take() {
                Some(Delivery::Items(mut batch)) => {
                    delivered = true;
                    items.append(&mut batch);
                }
                Some(Delivery::Skip(why)) => reason = why,
                None => {}
            }
        }

        if delivered && items.is_empty() {
            reason = "no input items";
        }
        if delivered && !items.is_empty() {
            self.queue(target, items);
            false
        } else {
            self.skip(target, reason);
            true
        }
    }

    fn next_join_deadline(&self) -> Option<Instant> {
        self.join_deadlines().map(|(_, deadline, _)| deadline).min()
    }

    fn join_deadlines(&self) -> impl Iterator<Item = (usize, Instant, Duration)> + '_ {
        let default_timeout = self.ctx.config().join_timeout();
        self.joins.iter().filter_map(move |(&edge_idx, state)| {
            if state.resolved {
                return None;
            }
            let since = state.waiting_since?;
            let timeout = match &self.graph.edges()[edge_idx].kind {
                EdgeKind::Join { timeout, .. } => timeout.or(default_timeout)?,
                _ => return None,
            };
            Some((edge_idx, since + timeout, timeout))
        })
    }

    fn expire_joins(&mut self) {
        let now = Instant::now();
        let expired = self
            .join_deadlines()
            .filter(|(_, deadline, _)| *deadline <= now)
            .min_by_key(|(edge_idx, _, _)| *edge_idx);
        let Some((edge_idx, _, timeout)) = expired else {
            return;
        };

        let edge = &self.graph.edges()[edge_idx];
        let pending: Vec<String> = edge
            .from
            .iter()
            .filter(|id| {
                self.graph
                    .index_of(id)
                    .map_or(false, |s| !self.units[s].status.is_terminal())
            })
            .cloned()
            .collect();
        let target = edge.to[0].clone();
        tracing::warn!(join = %target, ?pending, "Join timed out");
        if let Some(state) = self.joins.get_mut(&edge_idx) {
            state.resolved = true;
        }
        self.fail(
            PipelineError::JoinTimeout {
                target: target.clone(),
                pending,
                waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
            Some(target),
        );
    }

    fn detach_in_flight(&mut self) {
        let stuck: Vec<usize> = (0..self.units.len())
            .filter(|&i| self.units[i].status == UnitStatus::Running)
            .collect();
        for &idx in &stuck {
            tracing::warn!(unit = %self.unit_ref(idx).id, "Unit did not stop within drain grace, detaching");
            self.finish(idx, UnitStatus::Cancelled, None);
        }
        self.tasks.detach_all();
    }

    fn into_report(mut self, started_at: DateTime<Utc>) -> RunReport {
        let leftovers: Vec<usize> = (0..self.units.len())
            .filter(|&i| !self.units[i].status.is_terminal())
            .collect();
        for &idx in &leftovers {
            self.finish(idx, UnitStatus::Cancelled, None);
        }
        if !leftovers.is_empty() && self.failure.is_none() && !self.ctx.is_cancelled() {
            let ids: Vec<&str> = leftovers.iter().map(|&i| self.unit_ref(i).id.as_str()).collect();
            self.failure = Some(RunFailure::new(
                PipelineError::Execution(format!("units never became ready: [{}]", ids.join(", "))),
                None,
            ));
        }

        let ctx = self.ctx;
        let graph = self.graph;
        let (status, cancel_reason) = match (&self.failure, ctx.cancel_reason()) {
            (Some(_), _) => (RunStatus::Failed, None),
            (None, Some(reason)) => (RunStatus::Cancelled, Some(reason)),
            (None, None) => (RunStatus::Completed, None),
        };

        let outputs = if status == RunStatus::Completed {
            let finished_sinks: Vec<usize> = graph
                .sinks()
                .into_iter()
                .filter_map(|id| graph.index_of(id))
                .filter(|&i| self.units[i].status == UnitStatus::Done)
                .collect();
            finished_sinks
                .into_iter()
                .flat_map(|i| std::mem::take(&mut self.units[i].outputs))
                .collect()
        } else {
            Vec::new()
        };

        let outcomes = graph
            .units()
            .iter()
            .enumerate()
            .map(|(i, unit)| {
                let record = ctx.record(&unit.id).unwrap_or_default();
                UnitOutcome {
                    unit_id: unit.id.clone(),
                    kind: unit.kind().to_string(),
                    status: self.units[i].status,
                    attempts: record.attempts,
                    output_count: record.output_count,
                    error: record.error,
                    started_at: record.started_at,
                    finished_at: record.finished_at,
                    sequence: record.sequence,
                }
            })
            .collect();

        match status {
            RunStatus::Completed => {
                tracing::info!(graph = %graph.name(), outputs = outputs.len(), "Run completed");
                ctx.emit(ctx.event(EventType::GraphCompleted).with_data(json!({"outputs": outputs.len()})));
            }
            RunStatus::Failed => {
                if let Some(failure) = &self.failure {
                    tracing::info!(graph = %graph.name(), error = %failure.message, "Run failed");
                    ctx.emit(ctx.event(EventType::GraphFailed).with_data(json!({
                        "unit": failure.unit_id,
                        "error": failure.message,
                        "chain": failure.chain,
                    })));
                }
            }
            RunStatus::Cancelled => {
                tracing::info!(graph = %graph.name(), reason = ?cancel_reason, "Run cancelled");
                ctx.emit(ctx.event(EventType::GraphCancelled).with_data(json!({"reason": cancel_reason})));
            }
        }

        RunReport {
            run_id: ctx.run_id().to_string(),
            graph: graph.name().to_string(),
            status,
            outputs,
            outcomes,
            failure: self.failure,
            cancel_reason,
            metrics: ctx.metrics(),
            started_at,
            finished_at: Utc::now(),
        }
    }
}

fn delivery_clone(delivery: &Delivery) -> Delivery {
    match delivery {
        Delivery::Items(items) => Delivery::Items(items.clone()),
        Delivery::Skip(reason) => Delivery::Skip(reason),
    }
}

async fn run_unit(
    unit: UnitRef,
    items: Vec<ContentItem>,
    ctx: ExecutionContext,
    policy: RetryPolicy,
    permits: Arc<Semaphore>,
    unit_permits: Option<Arc<Semaphore>>,
) -> TaskOutcome {
    let token = ctx.cancellation_token().clone();

    let _permit = tokio::select! {
        biased;
        _ = token.cancelled() => return TaskOutcome::NotStarted,
        permit = permits.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return TaskOutcome::NotStarted,
        },
    };
    let _unit_permit = match unit_permits {
        Some(semaphore) => tokio::select! {
            biased;
            _ = token.cancelled() => return TaskOutcome::NotStarted,
            permit = semaphore.acquire_owned() => match permit {
                Ok(permit) => Some(permit),
                Err(_) => return TaskOutcome::NotStarted,
            },
        },
        None => None,
    };
    if token.is_cancelled() {
        return TaskOutcome::NotStarted;
    }

    ctx.note_started();
    ctx.update_record(&unit.id, |r| {
        if !r.status.is_terminal() {
            r.status = UnitStatus::Running;
            r.started_at = Some(Utc::now());
        }
    });
    ctx.emit(
        ctx.event(EventType::UnitStarted)
            .with_unit(&unit.id)
            .with_data(json!({"inputs": items.len(), "kind": unit.kind()})),
    );

    let started = Instant::now();
    let mut outputs = Vec::new();
    for item in &items {
        match invoke_with_retry(&unit, item, &ctx, &policy).await {
            Ok(mut produced) => outputs.append(&mut produced),
            Err(err) => {
                return TaskOutcome::Finished {
                    result: Err(err),
                    elapsed: started.elapsed(),
                }
            }
        }
    }
    TaskOutcome::Finished {
        result: Ok(outputs),
        elapsed: started.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UnitError;
    use crate::events::MemorySink;
    use crate::graph::{build_graph, Branch, Edge, Predicate};
    use crate::unit::FnUnit;
    use crate::units::Passthrough;
    use futures::StreamExt;

    fn tag(id: &'static str) -> UnitRef {
        UnitRef::new(
            id,
            FnUnit::new(id, move |item: ContentItem, _ctx| async move {
                let mut trail: Vec<serde_json::Value> = item
                    .get("trail")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();
                trail.push(json!(id));
                Ok(vec![item.with_field("trail", json!(trail))])
            }),
        )
    }

    fn failing(id: &'static str) -> UnitRef {
        UnitRef::new(
            id,
            FnUnit::new(id, |_item, _ctx| async move { Err(UnitError::permanent("broken")) }),
        )
    }

    fn input() -> ContentItem {
        ContentItem::from_value(json!({"doc": 1}))
    }

    #[tokio::test]
    async fn test_linear_run_completes() {
        let graph = build_graph(
            "linear",
            vec![tag("a"), tag("b"), tag("c")],
            vec![Edge::sequential("a", "b"), Edge::sequential("b", "c")],
            "a",
        )
        .unwrap();

        let report = Scheduler::new(RuntimeConfig::default()).run(&graph, input()).await;
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.outputs.len(), 1);
        assert_eq!(report.outputs[0].get("trail"), Some(&json!(["a", "b", "c"])));
        assert!(report.outcomes.iter().all(|o| o.status == UnitStatus::Done));
        assert_eq!(report.metrics.units_completed, 3);
    }

    #[tokio::test]
    async fn test_failure_stops_branch_and_reports_chain() {
        let graph = build_graph(
            "broken",
            vec![tag("a"), failing("b"), tag("c")],
            vec![Edge::sequential("a", "b"), Edge::sequential("b", "c")],
            "a",
        )
        .unwrap();

        let sink = Arc::new(MemorySink::new());
        let scheduler = Scheduler::new(RuntimeConfig::default()).with_event_sink(sink.clone());
        let report = scheduler.run(&graph, input()).await;

        assert_eq!(report.status, RunStatus::Failed);
        assert!(report.outputs.is_empty());
        let failure = report.failure.as_ref().unwrap();
        assert_eq!(failure.unit_id.as_deref(), Some("b"));
        assert_eq!(failure.chain.last().map(String::as_str), Some("broken"));
        assert_eq!(report.status_of("b"), Some(UnitStatus::Errored));
        assert_eq!(report.status_of("c"), Some(UnitStatus::Cancelled));
        assert!(sink.for_unit(EventType::UnitStarted, "c").is_empty());
        assert_eq!(sink.of_type(EventType::GraphFailed).len(), 1);
    }

    #[tokio::test]
    async fn test_continue_on_error_feeds_join_with_nothing() {
        let graph = build_graph(
            "tolerant",
            vec![
                tag("a"),
                tag("b"),
                failing("c").continue_on_error(true),
                tag("d"),
            ],
            vec![Edge::parallel("a", ["b", "c"]), Edge::join(["b", "c"], "d")],
            "a",
        )
        .unwrap();

        let report = Scheduler::new(RuntimeConfig::default()).run(&graph, input()).await;
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.status_of("c"), Some(UnitStatus::Errored));
        assert_eq!(report.outputs.len(), 1);
        assert_eq!(report.outputs[0].get("trail"), Some(&json!(["a", "b", "d"])));
    }

    #[tokio::test]
    async fn test_conditional_branches_reconverge() {
        let graph = build_graph(
            "route",
            vec![tag("r"), tag("x"), tag("y"), UnitRef::new("out", Passthrough)],
            vec![
                Edge::conditional(
                    "r",
                    vec![Branch::new(
                        Predicate::new("is_x", |i| i.get("kind") == Some(&json!("x"))),
                        "x",
                    )],
                    "y",
                ),
                Edge::sequential("x", "out"),
                Edge::sequential("y", "out"),
            ],
            "r",
        )
        .unwrap();

        let report = Scheduler::new(RuntimeConfig::default())
            .run(&graph, ContentItem::from_value(json!({"kind": "x"})))
            .await;
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.status_of("y"), Some(UnitStatus::Skipped));
        assert_eq!(report.outputs.len(), 1);
        assert_eq!(report.outputs[0].get("trail"), Some(&json!(["r", "x"])));
    }

    #[tokio::test]
    async fn test_multi_item_outputs_invoke_successor_per_item() {
        let split = UnitRef::new(
            "split",
            FnUnit::new("split", |item: ContentItem, _ctx| async move {
                Ok((0..3).map(|n| item.with_field("n", json!(n))).collect())
            }),
        );
        let graph = build_graph("fan", vec![split, tag("t")], vec![Edge::sequential("split", "t")], "split")
            .unwrap();

        let report = Scheduler::new(RuntimeConfig::default()).run(&graph, input()).await;
        let ns: Vec<_> = report.outputs.iter().map(|o| o.get("n").cloned()).collect();
        assert_eq!(ns, vec![Some(json!(0)), Some(json!(1)), Some(json!(2))]);
        assert_eq!(report.outcome("t").map(|o| o.attempts), Some(3));
    }

    #[tokio::test]
    async fn test_stream_yields_outputs_then_error() {
        let ok = build_graph("ok", vec![tag("a")], vec![], "a").unwrap();
        let scheduler = Scheduler::new(RuntimeConfig::default());
        let items: Vec<_> = scheduler.stream(ok, input()).collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_ok());

        let bad = build_graph("bad", vec![failing("a")], vec![], "a").unwrap();
        let items: Vec<_> = scheduler.stream(bad, input()).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(PipelineError::UnitFailure { .. })));
    }

    #[tokio::test]
    async fn test_precancelled_context_runs_nothing() {
        let graph = build_graph("g", vec![tag("a"), tag("b")], vec![Edge::sequential("a", "b")], "a").unwrap();
        let scheduler = Scheduler::new(RuntimeConfig::default());
        let ctx = scheduler.context();
        ctx.cancel("not today");

        let report = scheduler.run_with_context(&graph, input(), &ctx).await;
        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.cancel_reason.as_deref(), Some("not today"));
        assert_eq!(report.metrics.units_started, 0);
        assert!(report.into_result().unwrap_err().is_cancelled());
    }
}
