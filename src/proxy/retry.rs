//! Bounded retry-until-success for probes

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Result;
use crate::proxy::models::ProbeResult;

/// How many times to run a probe and how long to wait between failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Upper bound on attempts; values below 1 still make one attempt
    pub max_attempts: u32,
    /// Pause after a failed attempt that is not the last one
    pub wait_between_attempts: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            wait_between_attempts: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, wait_between_attempts: Duration) -> Self {
        Self {
            max_attempts,
            wait_between_attempts,
        }
    }
}

/// Run `attempt` until it yields an ok result or the policy runs out.
///
/// The closure receives the 1-based attempt number. The last attempt's result
/// is returned as-is. An `Err` from the closure is a hard failure: it stops
/// the loop and is propagated without further attempts.
pub async fn with_retry<F, Fut>(policy: &RetryPolicy, mut attempt: F) -> Result<ProbeResult>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<ProbeResult>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut number = 1;

    loop {
        let result = attempt(number).await?;

        if result.ok {
            if number > 1 {
                debug!("Probe succeeded on attempt {}/{}", number, max_attempts);
            }
            return Ok(result);
        }

        if number >= max_attempts {
            if max_attempts > 1 {
                warn!(
                    "Probe failed after {} attempts: {}",
                    max_attempts,
                    result
                        .error
                        .as_ref()
                        .map_or_else(|| "unknown error".to_string(), |e| e.to_string())
                );
            }
            return Ok(result);
        }

        debug!("Probe attempt {}/{} failed, retrying", number, max_attempts);
        if !policy.wait_between_attempts.is_zero() {
            tokio::time::sleep(policy.wait_between_attempts).await;
        }
        number += 1;
    }
}
