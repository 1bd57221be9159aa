//! # pipeline-core - Execution graphs for content-processing pipelines
//!
//! Runs a declarative graph of execution units against one root content item:
//! sequential chains, parallel fan-out, `all`/`first` joins, conditional
//! routing, nested sub-pipelines and batch splitting, with bounded
//! concurrency, retries and cooperative cancellation.
//!
//! ## Overview
//!
//! - **Graph** - units plus typed edges, validated once and immutable after
//! - **Scheduler** - dispatches ready units as tasks under a run-wide
//!   semaphore, resolves joins and branches, reports per-unit outcomes
//! - **BatchCoordinator** - splits an item, runs a sub-graph per sub-item
//!   with its own concurrency bound, reassembles results in input order
//! - **RetryPolicy** - exponential backoff for transient unit failures
//! - **EventSink** - lifecycle events for every graph, unit and batch
//!
//! Units are anything implementing [`ExecutionUnit`]: they take one
//! [`ContentItem`] and return zero or more. Items are copy-on-write, so
//! parallel branches can share their input safely.
//!
//! ## Quick Start
//!
//! ```rust
//! use pipeline_core::{build_graph, Edge, RuntimeConfig, Scheduler, UnitRef};
//! use pipeline_core::units::{Passthrough, SetFields};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> pipeline_core::Result<()> {
//! let tag = SetFields::new(json!({"tagged": true}).as_object().cloned().unwrap_or_default());
//! let graph = build_graph(
//!     "demo",
//!     vec![UnitRef::new("load", Passthrough), UnitRef::new("tag", tag)],
//!     vec![Edge::sequential("load", "tag")],
//!     "load",
//! )?;
//!
//! let report = Scheduler::new(RuntimeConfig::default())
//!     .run(&graph, pipeline_core::ContentItem::from_value(json!({"text": "hi"})))
//!     .await;
//! let outputs = report.into_result()?;
//! assert_eq!(outputs[0].get("tagged"), Some(&json!(true)));
//! # Ok(())
//! # }
//! ```
//!
//! ## Pipelines from YAML
//!
//! [`PipelineDefinition`] parses a YAML file, expands `${VAR:default}`
//! references, and builds a [`Graph`] through a [`UnitRegistry`].

pub mod batch;
pub mod config;
pub mod content;
pub mod context;
pub mod definition;
pub mod error;
pub mod events;
pub mod graph;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod unit;
pub mod units;

pub use batch::{
    extract_field, run_batch, BatchConfig, BatchCoordinator, BatchResult, BatchSlot, BatchUnit,
    ItemExtractor, SubPipelineUnit,
};
pub use config::{BatchDefaults, RetryConfig, RuntimeConfig};
pub use content::{ContentData, ContentItem};
pub use context::{ExecutionContext, MetricsSnapshot, UnitRecord, UnitStatus};
pub use definition::{Condition, EdgeDefinition, PipelineDefinition, UnitDefinition};
pub use error::{PipelineError, Result, UnitError};
pub use events::{
    ChannelSink, EventSink, EventType, MemorySink, NoopSink, PipelineEvent, TracingSink,
};
pub use graph::{build_graph, Branch, Edge, EdgeKind, Graph, GraphBuilder, Predicate, UnitId, WaitStrategy};
pub use registry::{UnitFactory, UnitRegistry};
pub use retry::{invoke_with_retry, RetryPolicy};
pub use scheduler::{execute, RunFailure, RunReport, RunStatus, Scheduler, UnitOutcome};
pub use unit::{ExecutionUnit, FnUnit, Settings, UnitContext, UnitPolicy, UnitRef, UnitResult};
