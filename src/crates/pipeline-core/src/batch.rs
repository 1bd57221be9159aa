//! Batch fan-out and nested pipelines
//!
//! [`run_batch`] splits a parent item into sub-items, runs each one through a
//! sub-graph, and reassembles the results in input order. Concurrency is
//! bounded by a semaphore owned by the batch itself: nested batches each get
//! their own, and limits are never pooled across levels.
//!
//! ```text
//! parent ──extract──▶ [s0, s1, s2, s3]
//!                       │   │   │   │     at most max_concurrent sub-runs
//!                       ▼   ▼   ▼   ▼
//!                      run run run run    each with a child context
//!                       │   │   │   │
//!            slots:   [ok, ok, err, ok]   indexed by input position
//! ```
//!
//! A sub-item that exceeds `item_timeout` is cancelled and recorded as a
//! failure without holding up the others. Without `continue_on_error` the
//! first failure cancels the sub-items still pending and fails the batch.
//!
//! [`BatchUnit`] and [`SubPipelineUnit`] expose batches and nested runs as
//! ordinary execution units, which is how sub-graphs nest inside each other.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::{check_limit, BatchDefaults};
use crate::content::ContentItem;
use crate::context::ExecutionContext;
use crate::error::{PipelineError, Result, UnitError};
use crate::events::EventType;
use crate::graph::Graph;
use crate::scheduler::execute;
use crate::unit::{ExecutionUnit, UnitContext, UnitResult};

/// Limits for one batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    pub max_concurrent: usize,
    pub item_timeout: Option<Duration>,
    pub continue_on_error: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::from(&BatchDefaults::default())
    }
}

impl From<&BatchDefaults> for BatchConfig {
    fn from(defaults: &BatchDefaults) -> Self {
        Self {
            max_concurrent: defaults.max_concurrent,
            item_timeout: defaults.item_timeout_ms.map(Duration::from_millis),
            continue_on_error: defaults.continue_on_error,
        }
    }
}

impl BatchConfig {
    pub fn with_max_concurrent(mut self, limit: usize) -> Self {
        self.max_concurrent = limit;
        self
    }

    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = Some(timeout);
        self
    }

    pub fn continue_on_error(mut self, enabled: bool) -> Self {
        self.continue_on_error = enabled;
        self
    }
}

/// Produces the ordered sub-items of a parent item
pub type ItemExtractor =
    Arc<dyn Fn(&ContentItem) -> std::result::Result<Vec<ContentItem>, UnitError> + Send + Sync>;

/// Extractor reading an array at `path` (dotted paths allowed)
///
/// Object elements become the sub-item's data; other values are stored under
/// `value`. Every sub-item records its position under `batch_index`.
pub fn extract_field(path: impl Into<String>) -> ItemExtractor {
    let path = path.into();
    Arc::new(move |parent: &ContentItem| -> std::result::Result<Vec<ContentItem>, UnitError> {
        let elements = parent
            .get_path(&path)
            .ok_or_else(|| UnitError::permanent(format!("batch field '{path}' is missing")))?
            .as_array()
            .ok_or_else(|| UnitError::permanent(format!("batch field '{path}' is not an array")))?;

        Ok(elements
            .iter()
            .enumerate()
            .map(|(index, element)| {
                let mut data = match element {
                    Value::Object(map) => map.clone(),
                    other => {
                        let mut map = Map::new();
                        map.insert("value".to_string(), other.clone());
                        map
                    }
                };
                data.insert("batch_index".to_string(), json!(index));
                ContentItem::with_id(format!("{}#{index}", parent.canonical_id()), data)
            })
            .collect())
    })
}

/// Outcome of one sub-item
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchSlot {
    Pending,
    Succeeded { outputs: Vec<ContentItem> },
    Failed { error: String },
}

impl BatchSlot {
    pub fn is_failed(&self) -> bool {
        matches!(self, BatchSlot::Failed { .. })
    }
}

/// Aggregated batch outcome, one slot per sub-item in input order
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub slots: Vec<BatchSlot>,
    pub succeeded: usize,
    pub failed: usize,
    pub total: usize,
}

impl BatchResult {
    /// Outputs of successful sub-items, in input order
    pub fn outputs(&self) -> Vec<ContentItem> {
        self.slots
            .iter()
            .filter_map(|slot| match slot {
                BatchSlot::Succeeded { outputs } => Some(outputs.iter().cloned()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn summary(&self) -> Value {
        json!({
            "succeeded": self.succeeded,
            "failed": self.failed,
            "total": self.total,
        })
    }

    /// Parent item extended with the per-slot results under `field` and the
    /// counts under `batch_summary`
    pub fn into_content(self, parent: &ContentItem, field: &str) -> ContentItem {
        let summary = self.summary();
        let results: Vec<Value> = self
            .slots
            .into_iter()
            .map(|slot| match slot {
                BatchSlot::Succeeded { outputs } => json!({
                    "status": "succeeded",
                    "outputs": outputs.iter().map(ContentItem::to_value).collect::<Vec<_>>(),
                }),
                BatchSlot::Failed { error } => json!({"status": "failed", "error": error}),
                BatchSlot::Pending => json!({"status": "pending"}),
            })
            .collect();
        parent.with_fields([
            (field.to_string(), Value::Array(results)),
            ("batch_summary".to_string(), summary),
        ])
    }
}

/// Runs every sub-item of `parent` through `graph`
#[tracing::instrument(skip_all, fields(graph = %graph.name(), parent = %parent.canonical_id()))]
pub async fn run_batch(
    parent: &ContentItem,
    graph: &Graph,
    extractor: &ItemExtractor,
    config: &BatchConfig,
    ctx: &ExecutionContext,
) -> Result<BatchResult> {
    check_limit("batch max_concurrent", config.max_concurrent)?;
    let items = extractor(parent)
        .map_err(|e| PipelineError::Execution(format!("batch item extraction failed: {e}")))?;
    let total = items.len();

    ctx.emit(ctx.event(EventType::BatchStarted).with_data(json!({
        "graph": graph.name(),
        "total": total,
        "max_concurrent": config.max_concurrent,
    })));

    let permits = Arc::new(Semaphore::new(config.max_concurrent));
    let batch_token = ctx.cancellation_token().child_token();
    let mut tasks = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        let item_ctx = ctx.child_with_token(batch_token.child_token())?;
        let graph = graph.clone();
        let permits = Arc::clone(&permits);
        let timeout = config.item_timeout;
        tasks.spawn(async move {
            let result = run_item(index, item, graph, item_ctx, permits, timeout).await;
            (index, result)
        });
    }

    let mut slots = vec![BatchSlot::Pending; total];
    let mut succeeded = 0;
    let mut failed = 0;
    let mut first_failure: Option<(usize, PipelineError)> = None;

    while let Some(joined) = tasks.join_next().await {
        let (index, result) = match joined {
            Ok(pair) => pair,
            Err(err) => {
                batch_token.cancel();
                return Err(PipelineError::Execution(format!("batch task aborted: {err}")));
            }
        };
        match result {
            Ok(outputs) => {
                ctx.emit(
                    ctx.event(EventType::BatchItemCompleted)
                        .with_data(json!({"index": index, "outputs": outputs.len()})),
                );
                slots[index] = BatchSlot::Succeeded { outputs };
                succeeded += 1;
            }
            Err(err) => {
                if first_failure.is_some() && err.is_cancelled() {
                    // sibling stopped by fail-fast
                    continue;
                }
                ctx.emit(
                    ctx.event(EventType::BatchItemFailed)
                        .with_data(json!({"index": index, "error": err.to_string()})),
                );
                slots[index] = BatchSlot::Failed {
                    error: err.to_string(),
                };
                failed += 1;
                if !config.continue_on_error && first_failure.is_none() && !ctx.is_cancelled() {
                    tracing::warn!(index, error = %err, "Batch item failed, cancelling remaining items");
                    batch_token.cancel();
                    first_failure = Some((index, err));
                }
            }
        }
    }

    if ctx.is_cancelled() {
        return Err(PipelineError::cancelled(
            ctx.cancel_reason().unwrap_or_else(|| "cancelled".to_string()),
        ));
    }

    ctx.emit(ctx.event(EventType::BatchCompleted).with_data(json!({
        "succeeded": succeeded,
        "failed": failed,
        "total": total,
        "aborted": first_failure.is_some(),
    })));

    if let Some((index, cause)) = first_failure {
        return Err(PipelineError::BatchItemFailure {
            index,
            cause: Box::new(cause),
        });
    }

    tracing::info!(succeeded, failed, total, "Batch completed");
    Ok(BatchResult {
        slots,
        succeeded,
        failed,
        total,
    })
}

async fn run_item(
    index: usize,
    item: ContentItem,
    graph: Graph,
    ctx: ExecutionContext,
    permits: Arc<Semaphore>,
    timeout: Option<Duration>,
) -> Result<Vec<ContentItem>> {
    let token = ctx.cancellation_token().clone();
    let permit = tokio::select! {
        biased;
        _ = token.cancelled() => return Err(PipelineError::cancelled("batch cancelled before item started")),
        permit = permits.acquire_owned() => permit
            .map_err(|_| PipelineError::Execution("batch semaphore closed".into()))?,
    };

    let run = execute(&graph, item, &ctx);
    tokio::pin!(run);

    let Some(limit) = timeout else {
        return run.await.into_result();
    };
    match tokio::time::timeout(limit, &mut run).await {
        Ok(report) => report.into_result(),
        Err(_) => {
            tracing::warn!(index, timeout_ms = limit.as_millis() as u64, "Batch item timed out");
            drop(permit);
            ctx.cancel("item timed out");
            let _ = run.await;
            Err(PipelineError::Timeout {
                operation: format!("batch item {index} in '{}'", graph.name()),
                duration_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            })
        }
    }
}

/// Sub-graph plus extraction rule, reusable across parent items
#[derive(Clone)]
pub struct BatchCoordinator {
    graph: Graph,
    extractor: ItemExtractor,
    config: BatchConfig,
}

impl BatchCoordinator {
    pub fn new(graph: Graph, extractor: ItemExtractor) -> Self {
        Self {
            graph,
            extractor,
            config: BatchConfig::default(),
        }
    }

    pub fn with_config(mut self, config: BatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub async fn run(&self, parent: &ContentItem, ctx: &ExecutionContext) -> Result<BatchResult> {
        run_batch(parent, &self.graph, &self.extractor, &self.config, ctx).await
    }
}

/// A batch as an execution unit
///
/// Emits one item: the parent with the aggregated slots under
/// `output_field` and the counts under `batch_summary`.
pub struct BatchUnit {
    coordinator: BatchCoordinator,
    output_field: String,
}

impl BatchUnit {
    pub fn new(coordinator: BatchCoordinator) -> Self {
        Self {
            coordinator,
            output_field: "results".to_string(),
        }
    }

    pub fn with_output_field(mut self, field: impl Into<String>) -> Self {
        self.output_field = field.into();
        self
    }
}

#[async_trait]
impl ExecutionUnit for BatchUnit {
    async fn invoke(&self, item: &ContentItem, ctx: &UnitContext) -> UnitResult {
        let result = self
            .coordinator
            .run(item, ctx.execution())
            .await
            .map_err(|err| UnitError::permanent("batch failed").with_source(err))?;
        Ok(vec![result.into_content(item, &self.output_field)])
    }

    fn kind(&self) -> &str {
        "batch"
    }
}

/// Runs a nested graph per item with a child context
pub struct SubPipelineUnit {
    graph: Graph,
}

impl SubPipelineUnit {
    pub fn new(graph: Graph) -> Self {
        Self { graph }
    }
}

#[async_trait]
impl ExecutionUnit for SubPipelineUnit {
    async fn invoke(&self, item: &ContentItem, ctx: &UnitContext) -> UnitResult {
        let child = ctx
            .execution()
            .child()
            .map_err(|err| UnitError::permanent("cannot start sub-pipeline").with_source(err))?;
        execute(&self.graph, item.clone(), &child)
            .await
            .into_result()
            .map_err(|err| {
                UnitError::permanent(format!("sub-pipeline '{}' failed", self.graph.name())).with_source(err)
            })
    }

    fn kind(&self) -> &str {
        "sub_pipeline"
    }
}
