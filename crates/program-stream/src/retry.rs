use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{GenerationError, message_looks_transient};

/// Fixed-delay retry policy for generation attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Wait before every retry. Not scaled between attempts.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

const fn default_max_retries() -> u32 {
    2
}

const fn default_retry_delay_ms() -> u64 {
    3_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            retry_delay_ms: default_retry_delay_ms(),
        }
    }

    pub fn fixed(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay_ms: retry_delay.as_millis() as u64,
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn can_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }

    /// Gateway-class statuses, network failures and timeouts are retryable.
    /// In-band server errors only when their message names one of those.
    pub fn is_retryable(&self, error: &GenerationError) -> bool {
        match error {
            GenerationError::Transport(err) => err.is_transient(),
            GenerationError::Timeout { .. } => true,
            GenerationError::Protocol { message } => message_looks_transient(message),
            GenerationError::Authentication(_)
            | GenerationError::Validation(_)
            | GenerationError::Config(_)
            | GenerationError::Cancelled => false,
        }
    }

    /// Whether a failure after `retries_done` retries gets another attempt.
    pub fn should_retry(&self, error: &GenerationError, retries_done: u32) -> bool {
        self.can_retry(retries_done) && self.is_retryable(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransportError;

    #[test]
    fn default_policy_is_two_retries_three_seconds_apart() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_retries, 2);
        assert_eq!(p.retry_delay(), Duration::from_millis(3_000));
        assert!(p.can_retry(0));
        assert!(p.can_retry(1));
        assert!(!p.can_retry(2));
    }

    #[test]
    fn classification() {
        let p = RetryPolicy::default();
        assert!(p.is_retryable(&TransportError::status(503, "").into()));
        assert!(p.is_retryable(&TransportError::network("reset").into()));
        assert!(p.is_retryable(&GenerationError::Timeout {
            after: Duration::from_secs(300)
        }));
        assert!(!p.is_retryable(&TransportError::status(422, "bad").into()));
        assert!(!p.is_retryable(&GenerationError::authentication("no session")));
        assert!(!p.is_retryable(&GenerationError::protocol("invalid methodology")));
        assert!(p.is_retryable(&GenerationError::protocol("upstream 504 from model host")));
        assert!(!p.is_retryable(&GenerationError::Cancelled));
    }

    #[test]
    fn none_policy_never_retries() {
        let p = RetryPolicy::none();
        assert!(!p.should_retry(&TransportError::network("x").into(), 0));
    }
}
