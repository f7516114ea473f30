//! Bounds synchronizer: pushes aggregate bounds to the control surface.
//!
//! One call to [`BoundsSynchronizer::sync`] is one round. A round makes at
//! most `max_retries + 1` attempts, waits the policy's delay between
//! attempts, and ends with a [`SyncOutcome`] that tells the caller what to do
//! with the flushed batch.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use coldchain_types::AggregateBounds;

use crate::error::PushError;
use crate::retry::RetryPolicy;
use crate::traits::BoundsTarget;

/// Result of one sync round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// The target accepted the update.
    Succeeded { attempts: u32 },
    /// The target answered with a non-retryable failure.
    Failed { attempts: u32, error: PushError },
    /// Every allowed attempt failed with a retryable failure.
    Exhausted { attempts: u32, last_error: PushError },
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Succeeded { .. })
    }

    /// Number of attempts made in the round.
    pub fn attempts(&self) -> u32 {
        match self {
            SyncOutcome::Succeeded { attempts }
            | SyncOutcome::Failed { attempts, .. }
            | SyncOutcome::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Progress of a round in progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncAttempt {
    /// Attempts made so far.
    pub attempt: u32,
    /// Failure of the most recent attempt.
    pub last_error: Option<PushError>,
    /// Wait before the next attempt, if one is scheduled.
    pub next_delay: Option<Duration>,
}

/// Pushes bounds to a [`BoundsTarget`] under a [`RetryPolicy`].
#[derive(Clone)]
pub struct BoundsSynchronizer {
    target: Arc<dyn BoundsTarget>,
    policy: RetryPolicy,
}

impl BoundsSynchronizer {
    pub fn new(target: Arc<dyn BoundsTarget>, policy: RetryPolicy) -> Self {
        Self { target, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run one sync round for `bounds`.
    pub async fn sync(&self, bounds: &AggregateBounds) -> SyncOutcome {
        let payload = bounds.to_payload();
        let mut state = SyncAttempt::default();

        loop {
            state.attempt += 1;
            debug!(
                "Bounds sync attempt {}/{}: {:?}",
                state.attempt,
                self.policy.max_attempts(),
                payload
            );

            let error = match self.target.put_bounds(&payload).await {
                Ok(()) => {
                    if state.attempt > 1 {
                        info!("Bounds sync succeeded after {} attempts", state.attempt);
                    } else {
                        info!("Bounds synced");
                    }
                    return SyncOutcome::Succeeded {
                        attempts: state.attempt,
                    };
                }
                Err(e) => e,
            };

            if !self.policy.is_retryable(&error) {
                error!(
                    "Bounds sync failed with non-retryable error on attempt {}: {}",
                    state.attempt, error
                );
                return SyncOutcome::Failed {
                    attempts: state.attempt,
                    error,
                };
            }

            let retries_used = state.attempt - 1;
            if retries_used >= self.policy.max_retries {
                error!(
                    "Bounds sync gave up after {} attempts: {}",
                    state.attempt, error
                );
                return SyncOutcome::Exhausted {
                    attempts: state.attempt,
                    last_error: error,
                };
            }

            let delay = self.policy.delay_for_attempt(retries_used);
            warn!(
                "Bounds sync failed (attempt {}/{}), retrying in {:?}: {}",
                state.attempt,
                self.policy.max_attempts(),
                delay,
                error
            );
            state.last_error = Some(error);
            state.next_delay = Some(delay);
            sleep(delay).await;
        }
    }
}
