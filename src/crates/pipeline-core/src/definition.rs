//! YAML pipeline definitions
//!
//! A definition names its units by `type`, wires them with edges tagged by
//! `kind`, and may declare named sub-pipelines that `sub_pipeline` and `batch`
//! units run per item.
//!
//! ```yaml
//! name: ingest
//! start: load
//! units:
//!   - id: load
//!     type: passthrough
//!   - id: route
//!     type: passthrough
//!   - id: pages
//!     type: batch
//!     settings: { pipeline: per_page, field: pages, max_concurrent: 4 }
//!     retry: { max_retries: 2, base_delay_ms: 100 }
//!   - id: other
//!     type: set_fields
//!     settings: { fields: { skipped: true } }
//! edges:
//!   - { kind: sequential, from: load, to: route }
//!   - kind: conditional
//!     from: route
//!     branches:
//!       - when: { field: format, equals: pdf }
//!         to: pages
//!     default: other
//! pipelines:
//!   per_page:
//!     start: clean
//!     units:
//!       - { id: clean, type: set_fields, settings: { fields: { clean: true } } }
//! runtime:
//!   max_concurrency: ${PIPELINE_WORKERS:8}
//! ```
//!
//! String values may reference environment variables as `${VAR}` or
//! `${VAR:default}`. A value that consists of a single reference and expands
//! to a number or boolean takes that type.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_yaml::Value as YamlValue;

use crate::batch::{extract_field, BatchConfig, BatchCoordinator, BatchUnit, SubPipelineUnit};
use crate::config::{check_limit, RetryConfig, RuntimeConfig};
use crate::content::ContentItem;
use crate::error::{PipelineError, Result};
use crate::graph::{build_graph, Branch, Edge, Graph, Predicate, WaitStrategy};
use crate::registry::UnitRegistry;
use crate::unit::{ExecutionUnit, Settings, UnitPolicy, UnitRef};

const SUB_PIPELINE: &str = "sub_pipeline";
const BATCH: &str = "batch";
const ENV_REFERENCE: &str = r"\$\{([^:}]+)(?::([^}]*))?\}";

/// Top-level pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Id of the unit that receives the root item
    pub start: String,

    pub units: Vec<UnitDefinition>,

    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,

    /// Named graphs referenced by `sub_pipeline` and `batch` units
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pipelines: BTreeMap<String, SubPipelineDefinition>,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Named graph nested inside a definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubPipelineDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub start: String,
    pub units: Vec<UnitDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitDefinition {
    pub id: String,

    /// Registry name, or `sub_pipeline` / `batch`
    #[serde(rename = "type")]
    pub unit_type: String,

    /// Handed to the unit factory as is
    #[serde(default, skip_serializing_if = "Settings::is_empty")]
    pub settings: Settings,

    #[serde(default)]
    pub continue_on_error: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EdgeDefinition {
    Sequential {
        from: String,
        to: String,
    },
    Parallel {
        from: String,
        to: Vec<String>,
    },
    Join {
        from: Vec<String>,
        to: String,
        #[serde(default)]
        wait: WaitStrategy,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    Conditional {
        from: String,
        branches: Vec<BranchDefinition>,
        /// Required; kept optional here so a missing default is reported as a
        /// validation error rather than a parse error
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchDefinition {
    pub when: Condition,
    pub to: String,
}

/// Declarative test over one field of a content item
///
/// Every test that is set must hold. At least one must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Condition {
    /// Dotted path into the item
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_equals: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,
    /// Regular expression matched against string values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matches: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_of: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub greater_than: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub less_than: Option<f64>,
}

impl Condition {
    /// Compile into a predicate for a conditional edge
    pub fn to_predicate(&self) -> Result<Predicate> {
        if self.field.is_empty() {
            return Err(PipelineError::validation("condition field must not be empty"));
        }

        let mut labels = Vec::new();
        let field = &self.field;
        if let Some(value) = &self.equals {
            labels.push(format!("{field} == {value}"));
        }
        if let Some(value) = &self.not_equals {
            labels.push(format!("{field} != {value}"));
        }
        if let Some(exists) = self.exists {
            labels.push(if exists { format!("{field} exists") } else { format!("{field} missing") });
        }
        if let Some(pattern) = &self.matches {
            labels.push(format!("{field} =~ /{pattern}/"));
        }
        if let Some(values) = &self.one_of {
            labels.push(format!("{field} in {}", Value::Array(values.clone())));
        }
        if let Some(bound) = self.greater_than {
            labels.push(format!("{field} > {bound}"));
        }
        if let Some(bound) = self.less_than {
            labels.push(format!("{field} < {bound}"));
        }
        if labels.is_empty() {
            return Err(PipelineError::validation(format!(
                "condition on '{field}' does not test anything"
            )));
        }

        let pattern = self
            .matches
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| PipelineError::validation(format!("invalid pattern in condition on '{field}': {e}")))?;

        let condition = self.clone();
        Ok(Predicate::new(labels.join(" && "), move |item: &ContentItem| {
            condition.holds(item.get_path(&condition.field), pattern.as_ref())
        }))
    }

    fn holds(&self, value: Option<&Value>, pattern: Option<&Regex>) -> bool {
        if let Some(exists) = self.exists {
            if value.is_some() != exists {
                return false;
            }
        }
        if let Some(expected) = &self.equals {
            if value != Some(expected) {
                return false;
            }
        }
        if let Some(unexpected) = &self.not_equals {
            if value == Some(unexpected) {
                return false;
            }
        }
        if let Some(pattern) = pattern {
            if !value.and_then(Value::as_str).is_some_and(|s| pattern.is_match(s)) {
                return false;
            }
        }
        if let Some(values) = &self.one_of {
            if !value.is_some_and(|v| values.contains(v)) {
                return false;
            }
        }
        let number = value.and_then(Value::as_f64);
        if let Some(bound) = self.greater_than {
            if !number.is_some_and(|n| n > bound) {
                return false;
            }
        }
        if let Some(bound) = self.less_than {
            if !number.is_some_and(|n| n < bound) {
                return false;
            }
        }
        true
    }
}

impl EdgeDefinition {
    pub fn to_edge(&self) -> Result<Edge> {
        match self {
            EdgeDefinition::Sequential { from, to } => Ok(Edge::sequential(from, to)),
            EdgeDefinition::Parallel { from, to } => Ok(Edge::parallel(from, to)),
            EdgeDefinition::Join {
                from,
                to,
                wait,
                timeout_ms,
            } => {
                let mut edge = Edge::join(from, to).with_wait(*wait);
                if let Some(ms) = timeout_ms {
                    edge = edge.with_timeout(Duration::from_millis(*ms));
                }
                Ok(edge)
            }
            EdgeDefinition::Conditional {
                from,
                branches,
                default,
            } => {
                let default = default.as_ref().ok_or_else(|| {
                    PipelineError::validation(format!("conditional edge from '{from}' has no default target"))
                })?;
                let branches = branches
                    .iter()
                    .map(|b| Ok(Branch::new(b.when.to_predicate()?, &b.to)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Edge::conditional(from, branches, default))
            }
        }
    }
}

/// Settings of a `sub_pipeline` unit
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SubPipelineSettings {
    pipeline: String,
}

/// Settings of a `batch` unit; unset limits fall back to `runtime.batch`
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BatchSettings {
    pipeline: String,
    field: String,
    #[serde(default)]
    max_concurrent: Option<usize>,
    #[serde(default)]
    item_timeout_ms: Option<u64>,
    #[serde(default)]
    continue_on_error: Option<bool>,
    #[serde(default)]
    output_field: Option<String>,
}

fn parse_settings<T: for<'de> Deserialize<'de>>(unit: &UnitDefinition) -> Result<T> {
    serde_json::from_value(Value::Object(unit.settings.clone())).map_err(|e| {
        PipelineError::Configuration(format!(
            "invalid settings for {} unit '{}': {e}",
            unit.unit_type, unit.id
        ))
    })
}

impl PipelineDefinition {
    /// Load a definition from a YAML file, expanding environment references
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse a definition, expanding references from the process environment
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::from_yaml_with_env(yaml, |name| std::env::var(name).ok())
    }

    /// Parse a definition, resolving `${VAR}` references through `lookup`
    pub fn from_yaml_with_env<F>(yaml: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut value: YamlValue = serde_yaml::from_str(yaml)?;
        let pattern = Regex::new(ENV_REFERENCE)
            .map_err(|e| PipelineError::Configuration(format!("invalid reference pattern: {e}")))?;
        expand_env(&mut value, &pattern, &lookup);
        Ok(serde_yaml::from_value(value)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Build the graph and discard it
    pub fn validate(&self, registry: &UnitRegistry) -> Result<()> {
        self.build(registry).map(|_| ())
    }

    /// Assemble the validated, immutable graph
    ///
    /// Named sub-pipelines are built once each, on first reference. A
    /// sub-pipeline that reaches itself again is rejected.
    pub fn build(&self, registry: &UnitRegistry) -> Result<Graph> {
        self.runtime.validate()?;
        let mut assembler = Assembler {
            definition: self,
            registry,
            built: HashMap::new(),
            stack: Vec::new(),
        };
        assembler.assemble(&self.name, &self.start, &self.units, &self.edges)
    }
}

struct Assembler<'a> {
    definition: &'a PipelineDefinition,
    registry: &'a UnitRegistry,
    built: HashMap<String, Graph>,
    stack: Vec<String>,
}

impl Assembler<'_> {
    fn assemble(
        &mut self,
        name: &str,
        start: &str,
        units: &[UnitDefinition],
        edges: &[EdgeDefinition],
    ) -> Result<Graph> {
        let units = units
            .iter()
            .map(|unit| self.unit(unit))
            .collect::<Result<Vec<_>>>()?;
        let edges = edges
            .iter()
            .map(EdgeDefinition::to_edge)
            .collect::<Result<Vec<_>>>()?;
        build_graph(name, units, edges, start)
    }

    fn pipeline(&mut self, name: &str) -> Result<Graph> {
        if let Some(graph) = self.built.get(name) {
            return Ok(graph.clone());
        }
        if self.stack.iter().any(|entered| entered == name) {
            let mut path = self.stack.clone();
            path.push(name.to_string());
            return Err(PipelineError::validation(format!(
                "recursive sub-pipeline reference: {}",
                path.join(" -> ")
            )));
        }
        let definition = self.definition;
        let body = definition
            .pipelines
            .get(name)
            .ok_or_else(|| PipelineError::validation(format!("unknown sub-pipeline '{name}'")))?;

        self.stack.push(name.to_string());
        let graph = self.assemble(name, &body.start, &body.units, &body.edges);
        self.stack.pop();

        let graph = graph?;
        self.built.insert(name.to_string(), graph.clone());
        Ok(graph)
    }

    fn unit(&mut self, def: &UnitDefinition) -> Result<UnitRef> {
        let unit: Arc<dyn ExecutionUnit> = match def.unit_type.as_str() {
            SUB_PIPELINE => {
                let settings: SubPipelineSettings = parse_settings(def)?;
                Arc::new(SubPipelineUnit::new(self.pipeline(&settings.pipeline)?))
            }
            BATCH => {
                let settings: BatchSettings = parse_settings(def)?;
                let graph = self.pipeline(&settings.pipeline)?;
                let mut config = BatchConfig::from(&self.definition.runtime.batch);
                if let Some(limit) = settings.max_concurrent {
                    config = config.with_max_concurrent(limit);
                }
                if let Some(ms) = settings.item_timeout_ms {
                    config = config.with_item_timeout(Duration::from_millis(ms));
                }
                if let Some(enabled) = settings.continue_on_error {
                    config = config.continue_on_error(enabled);
                }
                check_limit(&format!("max_concurrent of batch unit '{}'", def.id), config.max_concurrent)?;
                let coordinator = BatchCoordinator::new(graph, extract_field(settings.field)).with_config(config);
                let mut unit = BatchUnit::new(coordinator);
                if let Some(field) = settings.output_field {
                    unit = unit.with_output_field(field);
                }
                Arc::new(unit)
            }
            other => self.registry.create(other, &def.settings).map_err(|err| match err {
                PipelineError::UnknownUnitType(name) => PipelineError::Configuration(format!(
                    "unit '{}' has unknown type '{name}' (known: {}, {SUB_PIPELINE}, {BATCH})",
                    def.id,
                    self.registry.names().join(", ")
                )),
                other => other,
            })?,
        };

        let retry = match &def.retry {
            Some(retry) => {
                retry.validate()?;
                Some(retry.to_policy())
            }
            None => None,
        };
        if let Some(limit) = def.max_concurrency {
            check_limit(&format!("max_concurrency of unit '{}'", def.id), limit)?;
        }

        Ok(UnitRef::from_arc(&def.id, unit)
            .with_settings(def.settings.clone())
            .with_policy(UnitPolicy {
                continue_on_error: def.continue_on_error,
                retry,
                max_concurrency: def.max_concurrency,
            }))
    }
}

/// Replace `${VAR:default}` references in every string of a YAML tree
fn expand_env<F>(value: &mut YamlValue, pattern: &Regex, lookup: &F)
where
    F: Fn(&str) -> Option<String>,
{
    let replacement = match value {
        YamlValue::String(s) if s.contains("${") => {
            let whole = pattern
                .find(s)
                .is_some_and(|m| m.start() == 0 && m.end() == s.len());
            let expanded = pattern
                .replace_all(s, |caps: &Captures| {
                    lookup(&caps[1]).unwrap_or_else(|| caps.get(2).map_or("", |m| m.as_str()).to_string())
                })
                .into_owned();
            Some(if whole { typed_scalar(expanded) } else { YamlValue::String(expanded) })
        }
        YamlValue::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                expand_env(v, pattern, lookup);
            }
            None
        }
        YamlValue::Sequence(seq) => {
            for item in seq.iter_mut() {
                expand_env(item, pattern, lookup);
            }
            None
        }
        _ => None,
    };
    if let Some(replacement) = replacement {
        *value = replacement;
    }
}

fn typed_scalar(expanded: String) -> YamlValue {
    match serde_yaml::from_str::<YamlValue>(&expanded) {
        Ok(scalar @ (YamlValue::Bool(_) | YamlValue::Number(_))) => scalar,
        _ => YamlValue::String(expanded),
    }
}
