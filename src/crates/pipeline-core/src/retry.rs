//! Retry Policies - bounded exponential backoff for transient unit failures
//!
//! Every unit invocation goes through [`invoke_with_retry`]. Only failures the
//! unit itself marks as transient ([`UnitError::transient`]) are retried;
//! permanent failures surface after a single attempt.
//!
//! # Backoff
//!
//! ```text
//! delay before retry n (n >= 1) = base_delay × backoff_multiplier^(n-1)
//! delay = min(delay, max_delay)
//! if jitter: delay *= random(0.5..1.5)
//! ```
//!
//! With `base_delay = 10ms` and `backoff_multiplier = 2.0`, the schedule is
//! 10ms, 20ms, 40ms, ...
//!
//! ```rust
//! use std::time::Duration;
//! use pipeline_core::retry::RetryPolicy;
//!
//! let policy = RetryPolicy::new(3)
//!     .with_base_delay(Duration::from_millis(10))
//!     .with_backoff_multiplier(2.0);
//!
//! assert_eq!(
//!     policy.schedule(),
//!     vec![
//!         Duration::from_millis(10),
//!         Duration::from_millis(20),
//!         Duration::from_millis(40),
//!     ]
//! );
//! ```
//!
//! # Cancellation
//!
//! A backoff sleep races the invocation's cancellation token, so cancelling a
//! run never waits out a long delay. A unit that panics is reported as a
//! permanent failure.

use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures::FutureExt;
use rand::Rng;
use serde_json::json;

use crate::content::ContentItem;
use crate::context::ExecutionContext;
use crate::error::{PipelineError, Result, UnitError};
use crate::events::EventType;
use crate::unit::{UnitContext, UnitRef};

/// How many times, and how patiently, a unit is retried
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Factor applied to the delay after each retry
    pub backoff_multiplier: f64,

    /// Upper bound for any single delay (before jitter)
    pub max_delay: Duration,

    /// Multiply each delay by a random factor in 0.5..=1.5
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(128),
            jitter: false,
        }
    }

    /// Single attempt, no retries
    pub fn none() -> Self {
        Self::new(0)
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry `retry` (1-indexed)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());

        let delay = if self.jitter {
            capped * rand::thread_rng().gen_range(0.5..=1.5)
        } else {
            capped
        };

        Duration::try_from_secs_f64(delay).unwrap_or(self.max_delay)
    }

    /// True while another retry is allowed after `retries_done` retries
    pub fn should_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }

    /// Every delay the policy would wait, in order (jitter not applied)
    pub fn schedule(&self) -> Vec<Duration> {
        let plain = Self {
            jitter: false,
            ..self.clone()
        };
        (1..=self.max_retries).map(|n| plain.delay_for_retry(n)).collect()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Attempt bookkeeping for one invocation in progress
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Attempts made so far, the first included
    pub attempts: u32,
    pub last_error: Option<UnitError>,
    /// Delays actually waited
    pub delays: Vec<Duration>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&mut self, error: Option<UnitError>) {
        self.attempts += 1;
        self.last_error = error;
    }

    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Invokes `unit` on `item`, retrying transient failures under `policy`
///
/// `ctx` should already be bound to the invocation's cancellation token.
pub async fn invoke_with_retry(
    unit: &UnitRef,
    item: &ContentItem,
    ctx: &ExecutionContext,
    policy: &RetryPolicy,
) -> Result<Vec<ContentItem>> {
    let mut state = RetryState::new();

    loop {
        if ctx.is_cancelled() {
            return Err(cancelled(ctx));
        }

        let unit_ctx = UnitContext::new(
            unit.id.clone(),
            unit.settings.clone(),
            state.attempts + 1,
            ctx.clone(),
        );
        ctx.update_record(&unit.id, |record| record.attempts += 1);

        let started = Instant::now();
        let outcome = AssertUnwindSafe(unit.unit.invoke(item, &unit_ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(UnitError::permanent(panic_message(panic.as_ref()))));
        ctx.note_busy(started.elapsed());

        let error = match outcome {
            Ok(outputs) => return Ok(outputs),
            Err(error) => error,
        };
        state.record_attempt(Some(error.clone()));

        if !error.is_transient() {
            return Err(PipelineError::unit_failure(&unit.id, error));
        }
        if !policy.should_retry(state.retries()) {
            if policy.max_retries == 0 {
                return Err(PipelineError::unit_failure(&unit.id, error));
            }
            tracing::error!(
                unit = %unit.id,
                attempts = state.attempts,
                error = %error,
                "Unit failed after all retry attempts"
            );
            return Err(PipelineError::RetryExhausted {
                unit: unit.id.clone(),
                attempts: state.attempts,
                cause: error,
            });
        }

        let delay = policy.delay_for_retry(state.attempts);
        tracing::warn!(
            unit = %unit.id,
            attempt = state.attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Unit failed transiently, retrying after delay"
        );
        ctx.note_retry();
        ctx.emit(ctx.event(EventType::UnitRetrying).with_unit(&unit.id).with_data(json!({
            "attempt": state.attempts,
            "delay_ms": delay.as_millis() as u64,
            "error": error.to_string(),
        })));
        state.delays.push(delay);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.cancellation_token().cancelled() => return Err(cancelled(ctx)),
        }
    }
}

fn cancelled(ctx: &ExecutionContext) -> PipelineError {
    PipelineError::cancelled(
        ctx.cancel_reason()
            .unwrap_or_else(|| "cancelled".to_string()),
    )
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("unit panicked: {detail}")
}
