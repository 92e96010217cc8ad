//! Automatic error recovery strategies.
//
// Bounded retry for robot transport failures. The agent re-dials on its own,
// so recovery here means waiting and trying the same step again until the
// step deadline runs out or the run is cancelled.

use crate::config::NavigationConfig;
use crate::error::ChannelError;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// The maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
    /// Overall deadline measured from the first attempt.
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
            deadline: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Policy for a single navigation step: retry until the step timeout.
    pub fn for_navigation(config: &NavigationConfig) -> Self {
        Self {
            max_attempts: u32::MAX,
            backoff_delay: config.reconnect_backoff(),
            deadline: config.step_timeout(),
        }
    }
}

/// Why a retried step gave up.
#[derive(Debug)]
pub enum StepError {
    /// The run was cancelled before the step succeeded.
    Cancelled,
    /// Attempts or deadline exhausted, or a non-transient failure.
    Failed(ChannelError),
}

/// Runs `op` until it succeeds, retrying transient transport failures.
///
/// Cancellation is checked before every attempt and interrupts the backoff
/// sleep. A non-transient error is returned on first occurrence.
pub async fn retry_transport<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    mut op: F,
) -> Result<T, StepError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChannelError>>,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        attempt += 1;

        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_transient() {
            return Err(StepError::Failed(err));
        }
        if attempt >= policy.max_attempts || started.elapsed() + policy.backoff_delay > policy.deadline
        {
            warn!(step = label, attempt, error = %err, "Giving up on robot step");
            return Err(StepError::Failed(err));
        }

        debug!(step = label, attempt, error = %err, "Robot step failed, backing off");
        tokio::select! {
            _ = cancel.cancelled() => return Err(StepError::Cancelled),
            _ = sleep(policy.backoff_delay) => {}
        }
    }
}
