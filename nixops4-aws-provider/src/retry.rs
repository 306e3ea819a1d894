//! Bounded exponential backoff for provider calls.

use crate::{CloudProvider, ErrorClass, Output, Params, ProviderError};
use std::time::Duration;

/// When and how often a failed provider call is repeated.
///
/// A call is only retried when its error code is listed in `retry_on`, or
/// when the policy takes every conflict and the code classifies as one. A
/// policy that retries anything also retries errors the provider marks
/// `retryable`. Permission errors are never retried. The default policy never
/// retries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub retry_on: Vec<String>,
    pub retry_conflicts: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
            retry_on: Vec::new(),
            retry_conflicts: false,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self::default()
    }

    /// Retry up to 8 attempts on the given error codes.
    pub fn on_codes(codes: &[&str]) -> Self {
        RetryPolicy {
            max_attempts: 8,
            retry_on: codes.iter().map(|c| c.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Retry up to 8 attempts on any error classified as a conflict, such as
    /// a resource still referenced by one being deleted.
    pub fn on_conflicts() -> Self {
        RetryPolicy {
            max_attempts: 8,
            retry_conflicts: true,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Delay after the failed attempt `attempt` (0-indexed), capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.base_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    fn retries_anything(&self) -> bool {
        self.retry_conflicts || !self.retry_on.is_empty()
    }

    pub fn should_retry(&self, error: &ProviderError) -> bool {
        match error.class() {
            ErrorClass::PermissionDenied => false,
            class => {
                self.retry_on.iter().any(|code| *code == error.code)
                    || (self.retry_conflicts && class == ErrorClass::Conflict)
                    || (error.retryable && self.retries_anything())
            }
        }
    }
}

/// Invoke `operation`, retrying whitelisted errors with exponential backoff.
///
/// Returns the last error once `policy.max_attempts` is exhausted.
pub async fn invoke_with_retry(
    provider: &dyn CloudProvider,
    operation: &str,
    params: &Params,
    policy: &RetryPolicy,
) -> Result<Output, ProviderError> {
    let mut attempt = 0;
    loop {
        match provider.invoke(operation, params.clone()).await {
            Ok(output) => return Ok(output),
            Err(e) if policy.should_retry(&e) && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    operation,
                    code = %e.code,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "provider call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FakeProvider;

    #[test]
    fn delays_grow_and_are_capped() {
        let policy = RetryPolicy::on_codes(&["DependencyViolation"]);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_whitelisted_code_until_success() {
        let provider = FakeProvider::new();
        for _ in 0..2 {
            provider.push(
                "rds:DeleteDBSubnetGroup",
                Err(ProviderError::new("DependencyViolation", "still in use")),
            );
        }
        let policy = RetryPolicy::on_codes(&["DependencyViolation"]);
        invoke_with_retry(&provider, "rds:DeleteDBSubnetGroup", &Params::new(), &policy)
            .await
            .unwrap();
        assert_eq!(provider.count("rds:DeleteDBSubnetGroup"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let provider = FakeProvider::new();
        provider.on("rds:DeleteDBSubnetGroup", |_| {
            Err(ProviderError::new("DependencyViolation", "still in use"))
        });
        let policy = RetryPolicy::on_codes(&["DependencyViolation"]).with_max_attempts(3);
        let err = invoke_with_retry(&provider, "rds:DeleteDBSubnetGroup", &Params::new(), &policy)
            .await
            .unwrap_err();
        assert_eq!(err.code, "DependencyViolation");
        assert_eq!(provider.count("rds:DeleteDBSubnetGroup"), 3);
    }

    #[test]
    fn conflicts_and_provider_hints_are_retried() {
        let conflicts = RetryPolicy::on_conflicts();
        assert!(conflicts.should_retry(&ProviderError::new("DependencyViolation", "in use")));
        assert!(conflicts.should_retry(&ProviderError::new("InvalidGroup.InUse", "in use")));
        assert!(!conflicts.should_retry(&ProviderError::new("InvalidParameterValue", "bad")));

        let throttled = ProviderError {
            retryable: true,
            ..ProviderError::new("Throttling", "slow down")
        };
        assert!(conflicts.should_retry(&throttled));
        assert!(RetryPolicy::on_codes(&["DependencyViolation"]).should_retry(&throttled));
        assert!(!RetryPolicy::none().should_retry(&throttled));

        let denied = ProviderError {
            retryable: true,
            ..ProviderError::new("AccessDenied", "no")
        };
        assert!(!conflicts.should_retry(&denied));
        assert!(!RetryPolicy::on_codes(&["AccessDenied"]).should_retry(&denied));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_conflicts_until_success() {
        let provider = FakeProvider::new();
        provider.push(
            "ec2:DeleteSecurityGroup",
            Err(ProviderError::new("InvalidGroup.InUse", "still attached")),
        );
        invoke_with_retry(
            &provider,
            "ec2:DeleteSecurityGroup",
            &Params::new(),
            &RetryPolicy::on_conflicts(),
        )
        .await
        .unwrap();
        assert_eq!(provider.count("ec2:DeleteSecurityGroup"), 2);
    }

    #[tokio::test]
    async fn does_not_retry_by_default() {
        let provider = FakeProvider::new();
        provider.push(
            "ec2:DeleteVpc",
            Err(ProviderError::new("DependencyViolation", "still in use")),
        );
        let err = invoke_with_retry(&provider, "ec2:DeleteVpc", &Params::new(), &RetryPolicy::none())
            .await
            .unwrap_err();
        assert_eq!(err.code, "DependencyViolation");
        assert_eq!(provider.count("ec2:DeleteVpc"), 1);
    }

    #[tokio::test]
    async fn does_not_retry_other_codes() {
        let provider = FakeProvider::new();
        provider.push(
            "ec2:DeleteVpc",
            Err(ProviderError::new("UnauthorizedOperation", "no")),
        );
        let policy = RetryPolicy::on_codes(&["DependencyViolation"]);
        assert!(
            invoke_with_retry(&provider, "ec2:DeleteVpc", &Params::new(), &policy)
                .await
                .is_err()
        );
        assert_eq!(provider.count("ec2:DeleteVpc"), 1);
    }
}
