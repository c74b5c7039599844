//! Fixed-delay retry policy shared by media lookup and schedule upload.
use std::future::Future;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `None` retries forever.
    pub max_retries: Option<u32>,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: Option<u32>, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Policy from a configured retry count where a negative value means
    /// "retry forever".
    pub fn from_signed(retries: i64, delay: Duration) -> Self {
        let max_retries = if retries < 0 { None } else { Some(retries.min(u32::MAX as i64) as u32) };
        Self { max_retries, delay }
    }

    /// Policy from a total attempt count (at least one attempt is made).
    pub fn from_attempts(attempts: u32, delay: Duration) -> Self {
        Self { max_retries: Some(attempts.saturating_sub(1)), delay }
    }

    pub fn allows_retry(&self, retries_done: u32) -> bool {
        self.max_retries.map_or(true, |max| retries_done < max)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: E },
}

/// Run `f` until it succeeds or the policy runs out of retries.
pub async fn with_retry<F, Fut, T, E>(
    policy: RetryPolicy,
    what: &str,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut retries = 0u32;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if !policy.allows_retry(retries) {
                    return Err(RetryError::Exhausted { attempts: retries + 1, last: e });
                }
                retries += 1;
                match policy.max_retries {
                    Some(max) => warn!("{what} failed ({e}); retry {retries}/{max} in {:?}", policy.delay),
                    None => warn!("{what} failed ({e}); retry {retries} in {:?}", policy.delay),
                }
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_failures() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let result = with_retry(RetryPolicy::new(Some(3), Duration::from_secs(5)), "probe", move || {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move { if n < 2 { Err("not yet") } else { Ok(n) } }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_retries() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let start = tokio::time::Instant::now();
        let result: Result<(), _> =
            with_retry(RetryPolicy::new(Some(2), Duration::from_secs(5)), "probe", move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err("missing") }
            })
            .await;
        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last, "missing");
            }
            Ok(_) => panic!("expected exhaustion"),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[test]
    fn signed_and_attempt_conversions() {
        assert_eq!(RetryPolicy::from_signed(-1, Duration::ZERO).max_retries, None);
        assert_eq!(RetryPolicy::from_signed(0, Duration::ZERO).max_retries, Some(0));
        assert_eq!(RetryPolicy::from_attempts(5, Duration::ZERO).max_retries, Some(4));
        assert_eq!(RetryPolicy::from_attempts(0, Duration::ZERO).max_retries, Some(0));
        assert!(RetryPolicy::from_signed(-1, Duration::ZERO).allows_retry(u32::MAX - 1));
    }
}
