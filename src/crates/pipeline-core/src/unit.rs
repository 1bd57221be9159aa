//! Execution unit contract
//!
//! An [`ExecutionUnit`] is one opaque processing step: it receives a single
//! [`ContentItem`] and produces zero or more new items, or fails with a
//! [`UnitError`]. The scheduler never looks inside a unit. It only knows the
//! [`UnitRef`] wrapping it: the unit id, the unit's settings (passed through
//! unexamined) and the [`UnitPolicy`] that governs retries and error handling.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::content::ContentItem;
use crate::context::ExecutionContext;
use crate::error::UnitError;
use crate::retry::RetryPolicy;

/// Opaque per-unit configuration bag
pub type Settings = Map<String, Value>;

/// Output of one unit invocation
pub type UnitResult = std::result::Result<Vec<ContentItem>, UnitError>;

/// Boxed future returned by closure-backed units
pub type UnitFuture = Pin<Box<dyn Future<Output = UnitResult> + Send>>;

/// One processing step
#[async_trait]
pub trait ExecutionUnit: Send + Sync {
    /// Processes one item
    ///
    /// Long-running units should watch [`UnitContext::cancellation`]. The
    /// scheduler discards the result of a cancelled unit either way.
    async fn invoke(&self, item: &ContentItem, ctx: &UnitContext) -> UnitResult;

    /// Short type name used in logs and `inspect` output
    fn kind(&self) -> &str {
        "unit"
    }
}

/// What a unit sees of the run while it is invoked
#[derive(Debug, Clone)]
pub struct UnitContext {
    unit_id: String,
    settings: Arc<Settings>,
    attempt: u32,
    execution: ExecutionContext,
}

impl UnitContext {
    pub(crate) fn new(
        unit_id: impl Into<String>,
        settings: Arc<Settings>,
        attempt: u32,
        execution: ExecutionContext,
    ) -> Self {
        Self {
            unit_id: unit_id.into(),
            settings,
            attempt,
            execution,
        }
    }

    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }

    /// 1 for the first attempt, 2 for the first retry, and so on
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Run context, bound to this unit's cancellation token
    pub fn execution(&self) -> &ExecutionContext {
        &self.execution
    }

    pub fn is_cancelled(&self) -> bool {
        self.execution.is_cancelled()
    }

    /// Fires when the run is cancelled or this unit lost a `first` join
    pub fn cancellation(&self) -> &CancellationToken {
        self.execution.cancellation_token()
    }
}

/// Unit backed by an async closure
pub struct FnUnit {
    name: String,
    func: Arc<dyn Fn(ContentItem, UnitContext) -> UnitFuture + Send + Sync>,
}

impl FnUnit {
    /// ```rust
    /// use pipeline_core::unit::FnUnit;
    ///
    /// let upper = FnUnit::new("upper", |item, _ctx| async move {
    ///     let text = item.get("text").and_then(|v| v.as_str()).unwrap_or_default();
    ///     Ok(vec![item.with_field("text", text.to_uppercase().into())])
    /// });
    /// ```
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(ContentItem, UnitContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = UnitResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(move |item, ctx| Box::pin(func(item, ctx)) as UnitFuture),
        }
    }
}

impl std::fmt::Debug for FnUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnUnit").field("name", &self.name).finish()
    }
}

#[async_trait]
impl ExecutionUnit for FnUnit {
    async fn invoke(&self, item: &ContentItem, ctx: &UnitContext) -> UnitResult {
        (self.func)(item.clone(), ctx.clone()).await
    }

    fn kind(&self) -> &str {
        &self.name
    }
}

/// How the scheduler treats one unit's failures and concurrency
#[derive(Debug, Clone, Default)]
pub struct UnitPolicy {
    /// Record failures as `ERRORED` and keep the run going
    pub continue_on_error: bool,
    /// Overrides the run's default retry policy
    pub retry: Option<RetryPolicy>,
    /// Caps concurrent invocations of this unit on top of the run-wide limit
    pub max_concurrency: Option<usize>,
}

/// A unit placed in a graph
#[derive(Clone)]
pub struct UnitRef {
    pub id: String,
    pub unit: Arc<dyn ExecutionUnit>,
    pub settings: Arc<Settings>,
    pub policy: UnitPolicy,
}

impl UnitRef {
    pub fn new(id: impl Into<String>, unit: impl ExecutionUnit + 'static) -> Self {
        Self::from_arc(id, Arc::new(unit))
    }

    pub fn from_arc(id: impl Into<String>, unit: Arc<dyn ExecutionUnit>) -> Self {
        Self {
            id: id.into(),
            unit,
            settings: Arc::new(Settings::new()),
            policy: UnitPolicy::default(),
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    pub fn with_policy(mut self, policy: UnitPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn continue_on_error(mut self, enabled: bool) -> Self {
        self.policy.continue_on_error = enabled;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.policy.retry = Some(retry);
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.policy.max_concurrency = Some(limit);
        self
    }

    pub fn kind(&self) -> &str {
        self.unit.kind()
    }
}

impl std::fmt::Debug for UnitRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitRef")
            .field("id", &self.id)
            .field("kind", &self.unit.kind())
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_unit_invokes_closure() {
        let unit = FnUnit::new("tag", |item: ContentItem, ctx: UnitContext| async move {
            Ok(vec![item.with_field("seen_by", json!(ctx.unit_id()))])
        });
        let ctx = UnitContext::new(
            "tagger",
            Arc::new(Settings::new()),
            1,
            ExecutionContext::new(RuntimeConfig::default()),
        );

        let out = unit
            .invoke(&ContentItem::from_value(json!({"n": 1})), &ctx)
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("seen_by"), Some(&json!("tagger")));
        assert_eq!(unit.kind(), "tag");
    }

    #[test]
    fn test_unit_ref_builders() {
        let unit = UnitRef::new("a", FnUnit::new("noop", |item, _ctx| async move { Ok(vec![item]) }))
            .continue_on_error(true)
            .with_max_concurrency(2)
            .with_retry(RetryPolicy::new(3));
        assert!(unit.policy.continue_on_error);
        assert_eq!(unit.policy.max_concurrency, Some(2));
        assert_eq!(unit.policy.retry.as_ref().map(|r| r.max_retries), Some(3));
        assert!(format!("{unit:?}").contains("noop"));
    }
}
