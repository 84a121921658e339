use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::common::error::{Continuation, ErrorKind};

/// Errors that know whether the failed operation is worth repeating.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    /// Three attempts, waiting 2 s and then 4 s (capped at 10 s).
    pub const CLOUD: RetryPolicy = RetryPolicy::new(3, Duration::from_secs(2), Duration::from_secs(10));

    pub const fn new(attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts,
            initial_delay,
            max_delay,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the attempt following `failed_attempt` (counted from 0).
    pub fn delay(&self, failed_attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(failed_attempt);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Runs `operation` until it succeeds, fails with an error that should not be
/// retried, or the policy runs out of attempts. The last error is returned.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    description: &str,
    mut operation: F,
) -> Result<T, E>
where
    E: Classify + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                attempt += 1;
                if attempt >= policy.attempts || error.kind().continuation() == Continuation::Abort
                {
                    return Err(error);
                }
                let delay = policy.delay(attempt - 1);
                log::warn!(
                    "{description} failed (attempt {attempt}/{}), retrying in {}: {error}",
                    policy.attempts,
                    humantime::format_duration(delay)
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::fmt::{Display, Formatter};
    use std::time::Duration;

    use super::{Classify, RetryPolicy, retry_with_backoff};
    use crate::common::error::ErrorKind;

    #[derive(Debug)]
    struct TestError(ErrorKind);

    impl Display for TestError {
        fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }

    impl Classify for TestError {
        fn kind(&self) -> ErrorKind {
            self.0
        }
    }

    const FAST: RetryPolicy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2));

    #[test]
    fn test_delay_is_capped() {
        assert_eq!(RetryPolicy::CLOUD.delay(0), Duration::from_secs(2));
        assert_eq!(RetryPolicy::CLOUD.delay(1), Duration::from_secs(4));
        assert_eq!(RetryPolicy::CLOUD.delay(2), Duration::from_secs(8));
        assert_eq!(RetryPolicy::CLOUD.delay(10), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = Cell::new(0);
        let result = retry_with_backoff(&FAST, "test", || {
            calls.set(calls.get() + 1);
            let value = calls.get();
            async move {
                if value < 3 {
                    Err(TestError(ErrorKind::Cluster))
                } else {
                    Ok(value)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let calls = Cell::new(0);
        let result: Result<(), _> = retry_with_backoff(&FAST, "test", || {
            calls.set(calls.get() + 1);
            async { Err(TestError(ErrorKind::Cluster)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_no_retry_on_fatal_error() {
        let calls = Cell::new(0);
        let result: Result<(), _> = retry_with_backoff(&FAST, "test", || {
            calls.set(calls.get() + 1);
            async { Err(TestError(ErrorKind::Dependency)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }
}
