use courier_error::TransportError;
use courier_types::settings::RetryPolicyConfig;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_initial: Duration::from_millis(50),
            backoff_max: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: Option<&RetryPolicyConfig>) -> Self {
        let mut policy = Self::default();
        let Some(config) = config else {
            return policy;
        };

        if let Some(max) = config.max.filter(|max| *max > 0) {
            policy.max_attempts = max as usize;
        }
        if let Some(initial) = config.backoff_ms_initial.filter(|ms| *ms > 0) {
            policy.backoff_initial = Duration::from_millis(initial);
        }
        if let Some(max) = config.backoff_ms_max.filter(|ms| *ms > 0) {
            policy.backoff_max = Duration::from_millis(max);
        }
        policy
    }

    /// Per-command override of the attempt count.
    pub fn with_attempts(&self, attempts: Option<u32>) -> Self {
        match attempts.filter(|attempts| *attempts > 0) {
            Some(attempts) => Self {
                max_attempts: attempts as usize,
                ..self.clone()
            },
            None => self.clone(),
        }
    }

    /// Only connection failures are retried; a reply of any kind, including
    /// a timeout, means the command may already have run.
    pub fn should_retry(&self, attempt: usize, error: &TransportError) -> bool {
        attempt < self.max_attempts && error.is_connection()
    }

    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.backoff_initial;
        }

        let capped = attempt.saturating_sub(1).min(16) as u32;
        let multiplier = 1u64.checked_shl(capped).unwrap_or(u64::MAX);
        let min_delay = self.backoff_initial.as_millis() as u64;
        let max_delay = self.backoff_max.as_millis() as u64;
        let delay = min_delay
            .saturating_mul(multiplier)
            .clamp(min_delay, max_delay.max(min_delay));
        Duration::from_millis(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_initial: Duration::from_millis(50),
            backoff_max: Duration::from_millis(150),
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(50));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(150));
        assert_eq!(policy.backoff_delay(40), Duration::from_millis(150));
    }

    #[test]
    fn retries_connection_errors_only() {
        let policy = RetryPolicy::from_config(Some(&RetryPolicyConfig {
            max: Some(3),
            ..Default::default()
        }));
        let refused = TransportError::Connection("refused".into());
        assert!(policy.should_retry(1, &refused));
        assert!(policy.should_retry(2, &refused));
        assert!(!policy.should_retry(3, &refused));
        assert!(!policy.should_retry(1, &TransportError::Send("rejected".into())));
    }

    #[test]
    fn zero_values_keep_defaults() {
        let policy = RetryPolicy::from_config(Some(&RetryPolicyConfig {
            max: Some(0),
            backoff_ms_initial: Some(0),
            backoff_ms_max: None,
        }));
        assert_eq!(policy, RetryPolicy::default());
        assert_eq!(policy.with_attempts(Some(4)).max_attempts, 4);
        assert_eq!(policy.with_attempts(Some(0)).max_attempts, 1);
    }
}
