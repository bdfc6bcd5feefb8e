use std::time::Duration;

use diarist_config::SyncConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Attempt cap plus exponential backoff, shared by summarizer calls and the
/// pending-document sweep.  Pure: no clocks, no I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms.max(config.base_backoff_ms)),
        }
    }

    /// What to do after `attempts_made` tries, the last of which failed with
    /// `class`.
    pub fn decide(&self, attempts_made: u32, class: FailureClass) -> RetryDecision {
        match class {
            FailureClass::Permanent => RetryDecision::GiveUp,
            FailureClass::Transient if attempts_made >= self.max_attempts => RetryDecision::GiveUp,
            FailureClass::Transient => RetryDecision::RetryAfter(self.backoff(attempts_made)),
        }
    }

    /// Delay before the next try: `base * 2^(attempts_made - 1)`, capped.
    pub fn backoff(&self, attempts_made: u32) -> Duration {
        let shift = attempts_made.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1_u32 << shift);
        delay.min(self.max_delay)
    }
}
