//! Error types for graph construction, scheduling and batch processing
//!
//! Two error types cross the public API:
//!
//! - [`UnitError`] is what an [`ExecutionUnit`](crate::unit::ExecutionUnit) returns
//!   when one invocation fails. It carries the `transient` flag that the retry
//!   layer uses to decide whether another attempt is allowed.
//! - [`PipelineError`] is everything the orchestrator itself reports.
//!
//! # Error Hierarchy
//!
//! ```text
//! PipelineError
//! ├── Validation        - Graph malformed, raised before any unit runs
//! ├── UnitFailure       - One unit invocation failed
//! ├── RetryExhausted    - UnitFailure after every retry was spent
//! ├── JoinTimeout       - An `all` join never saw every predecessor finish
//! ├── BatchItemFailure  - One batch sub-item failed (fail-fast batches)
//! ├── Cancelled         - Explicit cancel or run deadline
//! ├── Timeout           - Per-item batch timeout
//! ├── NestingTooDeep    - Sub-pipeline recursion beyond the configured depth
//! ├── Configuration     - Runtime or definition settings rejected
//! ├── UnknownUnitType   - Definition names a unit type nobody registered
//! ├── Serialization     - JSON errors
//! ├── Yaml              - YAML errors
//! ├── Io                - File errors
//! └── Execution         - Scheduler invariants broken at runtime
//! ```
//!
//! # Cause Chains
//!
//! Run reports keep the whole chain rather than the last message:
//!
//! ```rust
//! use pipeline_core::error::{PipelineError, UnitError};
//!
//! let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "socket timed out");
//! let err = PipelineError::unit_failure("fetch", UnitError::transient("upstream unavailable").with_source(io));
//!
//! let chain = err.cause_chain();
//! assert_eq!(chain.len(), 3);
//! assert!(chain[2].contains("socket timed out"));
//! ```

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Convenience result type using [`PipelineError`]
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Failure returned by a single unit invocation
///
/// Retryability is an input, never a guess: the unit (or whoever wraps it)
/// decides whether the failure is transient.
#[derive(Debug, Clone)]
pub struct UnitError {
    message: String,
    transient: bool,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl UnitError {
    /// A failure that may succeed if attempted again (rate limit, timeout, 503...)
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
            source: None,
        }
    }

    /// A failure that will not go away by retrying
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
            source: None,
        }
    }

    /// Attach the underlying error so it shows up in the cause chain
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for UnitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for UnitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn std::error::Error + 'static))
    }
}

/// Every error the orchestrator can report
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Graph structure is invalid. Always raised before the first unit runs.
    #[error("Graph validation failed: {0}")]
    Validation(String),

    /// A unit invocation failed and was not retried (or could not be).
    #[error("Unit '{unit}' failed: {cause}")]
    UnitFailure {
        /// Id of the failing unit
        unit: String,
        /// Failure reported by the unit
        #[source]
        cause: UnitError,
    },

    /// A transient failure persisted through every configured retry.
    #[error("Unit '{unit}' failed after {attempts} attempts: {cause}")]
    RetryExhausted {
        /// Id of the failing unit
        unit: String,
        /// Attempts made, the first one included
        attempts: u32,
        /// Failure from the last attempt
        #[source]
        cause: UnitError,
    },

    /// An `all` join waited longer than its timeout for its predecessors.
    #[error("Join into '{target}' timed out after {waited_ms}ms waiting for {pending:?}")]
    JoinTimeout {
        /// Unit the join feeds
        target: String,
        /// Predecessors that had not finished
        pending: Vec<String>,
        /// How long the join waited
        waited_ms: u64,
    },

    /// A batch sub-item failed and the batch does not continue on error.
    #[error("Batch item {index} failed: {cause}")]
    BatchItemFailure {
        /// Position of the sub-item in the extracted collection
        index: usize,
        /// Why the sub-run failed
        #[source]
        cause: Box<PipelineError>,
    },

    /// The run (or a branch of it) was cancelled or hit its deadline.
    #[error("Run cancelled: {reason}")]
    Cancelled {
        /// Why cancellation was requested
        reason: String,
    },

    #[error("Operation timed out after {duration_ms}ms: {operation}")]
    Timeout {
        /// Description of the operation that timed out
        operation: String,
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    #[error("Nesting depth {depth} exceeds the configured maximum of {max}")]
    NestingTooDeep {
        /// Depth the new context would have had
        depth: usize,
        /// Configured maximum
        max: usize,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown unit type '{0}'")]
    UnknownUnitType(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Execution failed: {0}")]
    Execution(String),
}

impl PipelineError {
    pub fn unit_failure(unit: impl Into<String>, cause: UnitError) -> Self {
        Self::UnitFailure {
            unit: unit.into(),
            cause,
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// True for user-initiated stops and deadlines, which callers report
    /// differently from genuine failures.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Id of the unit the error originated from, when there is one
    pub fn unit_id(&self) -> Option<&str> {
        match self {
            Self::UnitFailure { unit, .. } | Self::RetryExhausted { unit, .. } => Some(unit),
            Self::JoinTimeout { target, .. } => Some(target),
            Self::BatchItemFailure { cause, .. } => cause.unit_id(),
            _ => None,
        }
    }

    /// This error followed by every `source()` below it
    pub fn cause_chain(&self) -> Vec<String> {
        let mut chain = vec![self.to_string()];
        let mut current = std::error::Error::source(self);
        while let Some(err) = current {
            chain.push(err.to_string());
            current = err.source();
        }
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_error_flags() {
        assert!(UnitError::transient("busy").is_transient());
        assert!(!UnitError::permanent("bad input").is_transient());
        assert_eq!(UnitError::permanent("bad input").message(), "bad input");
    }

    #[test]
    fn test_display_formats() {
        let err = PipelineError::unit_failure("summarize", UnitError::permanent("model refused"));
        assert_eq!(err.to_string(), "Unit 'summarize' failed: model refused");

        let err = PipelineError::RetryExhausted {
            unit: "embed".to_string(),
            attempts: 4,
            cause: UnitError::transient("429"),
        };
        assert_eq!(err.to_string(), "Unit 'embed' failed after 4 attempts: 429");
    }

    #[test]
    fn test_batch_failure_keeps_inner_chain() {
        let inner = PipelineError::unit_failure("ocr", UnitError::permanent("unreadable page"));
        let err = PipelineError::BatchItemFailure {
            index: 3,
            cause: Box::new(inner),
        };

        assert_eq!(err.unit_id(), Some("ocr"));
        let chain = err.cause_chain();
        assert_eq!(chain[0], "Batch item 3 failed: Unit 'ocr' failed: unreadable page");
        assert_eq!(chain.last().map(String::as_str), Some("unreadable page"));
    }

    #[test]
    fn test_cancelled_is_distinguished() {
        assert!(PipelineError::cancelled("user request").is_cancelled());
        assert!(!PipelineError::Validation("x".into()).is_cancelled());
    }
}
