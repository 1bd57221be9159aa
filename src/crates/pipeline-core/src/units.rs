//! Generic built-in units
//!
//! These carry no domain logic. They exist so pipelines can be wired, tested
//! and demonstrated from YAML alone: `passthrough`, `set_fields`,
//! `split_field`, `delay` and `fail`. Each one parses its own settings.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::content::ContentItem;
use crate::error::{PipelineError, Result, UnitError};
use crate::unit::{ExecutionUnit, Settings, UnitContext, UnitResult};

fn parse_settings<T: DeserializeOwned>(kind: &str, settings: &Settings) -> Result<T> {
    serde_json::from_value(Value::Object(settings.clone()))
        .map_err(|e| PipelineError::Configuration(format!("invalid settings for '{kind}' unit: {e}")))
}

/// Emits its input unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

#[async_trait]
impl ExecutionUnit for Passthrough {
    async fn invoke(&self, item: &ContentItem, _ctx: &UnitContext) -> UnitResult {
        Ok(vec![item.clone()])
    }

    fn kind(&self) -> &str {
        "passthrough"
    }
}

/// Adds or replaces fixed fields
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetFields {
    fields: Map<String, Value>,
}

impl SetFields {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        parse_settings("set_fields", settings)
    }
}

#[async_trait]
impl ExecutionUnit for SetFields {
    async fn invoke(&self, item: &ContentItem, _ctx: &UnitContext) -> UnitResult {
        Ok(vec![item.with_fields(self.fields.clone())])
    }

    fn kind(&self) -> &str {
        "set_fields"
    }
}

/// Emits one item per element of an array field
///
/// Each output is the input with the element stored under `as` and its
/// position under `split_index`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SplitField {
    field: String,
    #[serde(rename = "as", default = "SplitField::default_target")]
    target: String,
}

impl SplitField {
    pub fn new(field: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            target: target.into(),
        }
    }

    fn default_target() -> String {
        "value".to_string()
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        parse_settings("split_field", settings)
    }
}

#[async_trait]
impl ExecutionUnit for SplitField {
    async fn invoke(&self, item: &ContentItem, _ctx: &UnitContext) -> UnitResult {
        let elements = item
            .get_path(&self.field)
            .and_then(Value::as_array)
            .ok_or_else(|| UnitError::permanent(format!("field '{}' is not an array", self.field)))?;

        Ok(elements
            .iter()
            .enumerate()
            .map(|(index, element)| {
                item.with_fields([
                    (self.target.clone(), element.clone()),
                    ("split_index".to_string(), json!(index)),
                ])
            })
            .collect())
    }

    fn kind(&self) -> &str {
        "split_field"
    }
}

/// Waits, then passes its input through
///
/// The wait ends early when the unit is cancelled.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Delay {
    ms: u64,
}

impl Delay {
    pub fn new(duration: Duration) -> Self {
        Self {
            ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        parse_settings("delay", settings)
    }
}

#[async_trait]
impl ExecutionUnit for Delay {
    async fn invoke(&self, item: &ContentItem, ctx: &UnitContext) -> UnitResult {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(self.ms)) => Ok(vec![item.clone()]),
            _ = ctx.cancellation().cancelled() => Err(UnitError::permanent("delay interrupted by cancellation")),
        }
    }

    fn kind(&self) -> &str {
        "delay"
    }
}

/// Fails on purpose
///
/// With `times` set, only the first `times` attempts fail and later attempts
/// pass the input through, which makes retry behaviour observable.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Fail {
    #[serde(default = "Fail::default_message")]
    message: String,
    #[serde(default)]
    transient: bool,
    #[serde(default)]
    times: Option<u32>,
}

impl Fail {
    pub fn new(message: impl Into<String>, transient: bool) -> Self {
        Self {
            message: message.into(),
            transient,
            times: None,
        }
    }

    pub fn times(mut self, times: u32) -> Self {
        self.times = Some(times);
        self
    }

    fn default_message() -> String {
        "configured failure".to_string()
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        parse_settings("fail", settings)
    }
}

#[async_trait]
impl ExecutionUnit for Fail {
    async fn invoke(&self, item: &ContentItem, ctx: &UnitContext) -> UnitResult {
        if self.times.is_some_and(|times| ctx.attempt() > times) {
            return Ok(vec![item.clone()]);
        }
        if self.transient {
            Err(UnitError::transient(self.message.clone()))
        } else {
            Err(UnitError::permanent(self.message.clone()))
        }
    }

    fn kind(&self) -> &str {
        "fail"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::context::ExecutionContext;
    use std::sync::Arc;

    fn ctx(attempt: u32) -> UnitContext {
        UnitContext::new(
            "test",
            Arc::new(Settings::new()),
            attempt,
            ExecutionContext::new(RuntimeConfig::default()),
        )
    }

    fn settings(value: Value) -> Settings {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_set_fields() {
        let unit = SetFields::from_settings(&settings(json!({"fields": {"lang": "en"}}))).unwrap();
        let out = unit
            .invoke(&ContentItem::from_value(json!({"text": "hi"})), &ctx(1))
            .await
            .unwrap();
        assert_eq!(out[0].get("lang"), Some(&json!("en")));
        assert_eq!(out[0].get("text"), Some(&json!("hi")));
    }

    #[tokio::test]
    async fn test_split_field() {
        let unit = SplitField::from_settings(&settings(json!({"field": "parts", "as": "part"}))).unwrap();
        let input = ContentItem::from_value(json!({"parts": ["a", "b"]}));
        let out = unit.invoke(&input, &ctx(1)).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].get("part"), Some(&json!("b")));
        assert_eq!(out[1].get("split_index"), Some(&json!(1)));
        assert_eq!(out[1].canonical_id(), input.canonical_id());

        let err = unit
            .invoke(&ContentItem::from_value(json!({"parts": 3})), &ctx(1))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_unknown_settings_rejected() {
        let err = Delay::from_settings(&settings(json!({"ms": 5, "extra": true}))).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_fail_times() {
        let unit = Fail::new("flaky", true).times(2);
        let item = ContentItem::from_value(json!({}));
        assert!(unit.invoke(&item, &ctx(1)).await.unwrap_err().is_transient());
        assert!(unit.invoke(&item, &ctx(2)).await.is_err());
        assert!(unit.invoke(&item, &ctx(3)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_stops_on_cancel() {
        let unit = Delay::new(Duration::from_secs(30));
        let context = ctx(1);
        context.execution().cancel("stop");
        let err = unit
            .invoke(&ContentItem::from_value(json!({})), &context)
            .await
            .unwrap_err();
        assert!(err.message().contains("cancellation"));
    }
}
