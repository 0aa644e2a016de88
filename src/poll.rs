//! Bounded retry-with-backoff waits for asynchronous conditions.
//!
//! A check reports `Ok(Some(value))` when the condition holds, `Ok(None)` when
//! it does not hold *yet*, and `Err(e)` only for failures that make further
//! waiting pointless (a VM in the error state, a malformed backend reply).
//! Transient trouble such as a refused connection is the check's job to turn
//! into `Ok(None)`.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

/// Cadence and budget of a single readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    /// Sleep after the first failed check, in milliseconds.
    pub interval_ms: u64,

    /// Total number of check invocations before giving up.
    pub max_attempts: u32,

    /// Multiplier applied to the sleep after every failed check.
    /// `1.0` keeps the interval fixed.
    pub backoff: f64,

    /// Upper bound on the sleep when `backoff > 1.0`.
    pub max_interval_ms: Option<u64>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self { interval_ms: 5_000, max_attempts: 60, backoff: 1.0, max_interval_ms: None }
    }
}

impl PollPolicy {
    /// Fixed-interval policy.
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            max_attempts,
            backoff: 1.0,
            max_interval_ms: None,
        }
    }

    /// Sleep to apply after the `failures`-th consecutive failed check
    /// (1-based).
    pub fn delay_after(&self, failures: u32) -> Duration {
        let base = self.interval_ms as f64;
        let factor = if self.backoff > 1.0 {
            self.backoff.powi(i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX))
        } else {
            1.0
        };
        let mut ms = base * factor;
        if let Some(cap) = self.max_interval_ms {
            ms = ms.min(cap as f64);
        }
        if !ms.is_finite() {
            ms = self.max_interval_ms.unwrap_or(u64::MAX) as f64;
        }
        Duration::from_millis(ms as u64)
    }

    /// Worst-case time spent sleeping if every check fails.
    pub fn worst_case_sleep(&self) -> Duration {
        (1..self.max_attempts).map(|n| self.delay_after(n)).sum()
    }
}

/// Why a wait ended without success.
#[derive(Debug, thiserror::Error)]
pub enum PollError<E> {
    /// Every check reported not-ready.
    #[error("condition not met after {attempts} attempts ({elapsed:?})")]
    Timeout { attempts: u32, elapsed: Duration },

    /// A check reported a failure that ends the wait immediately.
    #[error("wait aborted: {0}")]
    Aborted(E),
}

/// Invoke `check` until it yields a value or `policy.max_attempts` checks
/// have reported not-ready.
///
/// The check receives the 1-based attempt number. Sleeping only happens
/// between attempts, never after the last one.
pub async fn poll_until<T, E, F, Fut>(
    policy: &PollPolicy,
    what: &str,
    mut check: F,
) -> Result<T, PollError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let started = Instant::now();
    let budget = policy.max_attempts.max(1);
    debug!(
        what,
        budget,
        worst_case_ms = u64::try_from(policy.worst_case_sleep().as_millis()).unwrap_or(u64::MAX),
        "waiting"
    );

    for attempt in 1..=budget {
        match check(attempt).await {
            Ok(Some(value)) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                debug!(what, attempt, elapsed_ms, "condition met");
                return Ok(value);
            }
            Ok(None) => {
                debug!(what, attempt, budget, "not ready");
            }
            Err(e) => return Err(PollError::Aborted(e)),
        }

        if attempt < budget {
            tokio::time::sleep(policy.delay_after(attempt)).await;
        }
    }

    Err(PollError::Timeout { attempts: budget, elapsed: started.elapsed() })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
