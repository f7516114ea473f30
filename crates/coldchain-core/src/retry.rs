//! Retry policy for outbound bounds updates.
//!
//! The policy decides how many times a failed push is repeated, how long to
//! wait between attempts, and which failures are worth repeating at all.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use coldchain_core::{PushError, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//! assert_eq!(policy.max_retries, 3);
//! assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(5));
//! assert!(policy.is_retryable(&PushError::Status(502)));
//! assert!(!policy.is_retryable(&PushError::Status(400)));
//!
//! // Faster schedule for a local control surface
//! let quick = RetryPolicy::new(5).initial_delay(Duration::from_millis(250));
//! assert_eq!(quick.delay_for_attempt(1), Duration::from_millis(250));
//! ```

use std::time::Duration;

use rand::Rng;

use crate::error::{Error, PushError, Result};

/// Statuses retried by default: rate limiting and gateway failures.
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 4] = [429, 502, 503, 504];

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first (0 means no retries).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Backoff multiplier (1.0 = constant delay, 2.0 = double each time).
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter to delays.
    pub jitter: bool,
    /// HTTP statuses that are worth retrying.
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 1.0,
            jitter: false,
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.to_vec(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with `max_retries` and default settings otherwise.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// No retries: every failure is final.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set maximum number of retries.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set delay before the first retry.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Replace the set of retryable HTTP statuses.
    #[must_use]
    pub fn retryable_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_statuses = statuses.into_iter().collect();
        self
    }

    /// Total number of attempts this policy allows (first try included).
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait after failed retry number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay.as_secs_f64());

        let final_delay = if self.jitter {
            let jitter_factor = 1.0 + (rand::rng().random::<f64>() * 0.25);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }

    /// Whether an HTTP status is worth retrying.
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }

    /// Whether a push failure is worth retrying.
    ///
    /// Unreachable endpoints are always retried. Other request failures are
    /// terminal.
    pub fn is_retryable(&self, error: &PushError) -> bool {
        match error {
            PushError::Status(status) => self.is_retryable_status(*status),
            PushError::Unreachable(_) => true,
            PushError::Request(_) => false,
        }
    }

    /// Validate the policy.
    pub fn validate(&self) -> Result<()> {
        if self.backoff_multiplier < 1.0 {
            return Err(Error::invalid_config(
                "backoff_multiplier must be at least 1.0",
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err(Error::invalid_config(
                "initial_delay must not exceed max_delay",
            ));
        }
        Ok(())
    }
}
