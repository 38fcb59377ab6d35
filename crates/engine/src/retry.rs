//! Requeue policy for `ERRORED` chunks.
//!
//! The state machine never retries on its own. A maintenance pass asks the
//! injected [`RequeuePolicy`] whether an errored chunk goes back to `READY`
//! now, later, or not at all.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use batchgate_core::WorkChunk;

/// What a maintenance pass should do with an `ERRORED` chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueDecision {
    /// Move the chunk back to `READY` in this pass.
    Requeue,
    /// Leave it `ERRORED`; eligible again at `until`.
    Wait { until: DateTime<Utc> },
    /// Retry budget spent; the orchestrator decides what happens next.
    GiveUp,
}

/// Injectable retry policy consulted by the maintenance runner.
pub trait RequeuePolicy: Send + Sync {
    fn decide(&self, chunk: &WorkChunk, now: DateTime<Utc>) -> RequeueDecision;
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Bounded requeue budget with backoff between a chunk's errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Requeues allowed per chunk (0 = an error is final)
    pub max_requeues: u32,
    /// Wait after the first error
    pub base_delay: Duration,
    /// Upper bound on any wait
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Fraction of the wait that is spread across chunks (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(5, Duration::from_millis(500), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    /// Every error is final.
    pub fn no_retry() -> Self {
        Self::immediate(0)
    }

    /// Requeue on the next pass, up to `max_requeues` times.
    pub fn immediate(max_requeues: u32) -> Self {
        Self::fixed(max_requeues, Duration::ZERO)
    }

    /// Same wait after every error.
    pub fn fixed(max_requeues: u32, delay: Duration) -> Self {
        Self::with_backoff(max_requeues, BackoffStrategy::Fixed, delay, delay, 0.0)
    }

    /// Wait doubles with each error, capped at `max_delay`.
    pub fn exponential(max_requeues: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self::with_backoff(max_requeues, BackoffStrategy::Exponential, base_delay, max_delay, 0.1)
    }

    fn with_backoff(
        max_requeues: u32,
        strategy: BackoffStrategy,
        base_delay: Duration,
        max_delay: Duration,
        jitter: f64,
    ) -> Self {
        Self {
            max_requeues,
            base_delay,
            max_delay,
            strategy,
            jitter,
        }
    }

    /// Whether a chunk that has already been requeued `requeues_so_far`
    /// times may go back to `READY` once more.
    pub fn has_requeues_left(&self, requeues_so_far: u32) -> bool {
        requeues_so_far < self.max_requeues
    }

    /// Wait owed by a chunk after its `error_count`-th error, before jitter.
    pub fn backoff_after(&self, error_count: u32) -> Duration {
        let Some(step) = error_count.checked_sub(1) else {
            return Duration::ZERO;
        };
        let raw = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(error_count),
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(step).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        raw.min(self.max_delay.max(self.base_delay))
    }

    /// Backoff for `chunk`, shifted by up to `jitter` of itself.
    ///
    /// The shift is derived from the chunk id and its error count, so chunks
    /// that errored together are released at different passes while repeated
    /// passes over one chunk see the same deadline.
    pub fn backoff_for(&self, chunk: &WorkChunk) -> Duration {
        let base = self.backoff_after(chunk.error_count.max(1));
        let spread = base.mul_f64(self.jitter.clamp(0.0, 1.0));
        if spread.is_zero() {
            return base;
        }
        let bytes = chunk.id.as_uuid().as_bytes();
        let seed = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]])
            .wrapping_add(chunk.error_count.wrapping_mul(0x9e37_79b9));
        // Maps the seed onto [-1.0, 1.0].
        let offset = f64::from(seed) / f64::from(u32::MAX) * 2.0 - 1.0;
        if offset >= 0.0 {
            base.saturating_add(spread.mul_f64(offset))
        } else {
            base.saturating_sub(spread.mul_f64(-offset))
        }
    }
}

impl RequeuePolicy for RetryPolicy {
    fn decide(&self, chunk: &WorkChunk, now: DateTime<Utc>) -> RequeueDecision {
        // error_count includes the failure that put the chunk in ERRORED.
        let requeues_so_far = chunk.error_count.saturating_sub(1);
        if !self.has_requeues_left(requeues_so_far) {
            return RequeueDecision::GiveUp;
        }

        let errored_at = chunk.ended_at.unwrap_or(chunk.updated_at);
        let until = errored_at + chrono::Duration::from_std(self.backoff_for(chunk)).unwrap_or_default();

        if until <= now {
            RequeueDecision::Requeue
        } else {
            RequeueDecision::Wait { until }
        }
    }
}

impl<P> RequeuePolicy for std::sync::Arc<P>
where
    P: RequeuePolicy + ?Sized,
{
    fn decide(&self, chunk: &WorkChunk, now: DateTime<Utc>) -> RequeueDecision {
        (**self).decide(chunk, now)
    }
}
