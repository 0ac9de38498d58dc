use crate::analysis::AnalyzerError;
use log::warn;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// Doubles after every attempt, capped at `max`
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, max } => {
                let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Per-call retry loop around the analyzer. Transient errors are retried up to
/// `max_attempts` calls in total; a permanent error ends the loop at once.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub async fn run<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, AnalyzerError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AnalyzerError>>,
    {
        let mut attempt = 1;
        loop {
            match call(attempt).await {
                Ok(value) => return Ok(value),
                Err(AnalyzerError::Transient(msg)) if attempt < self.max_attempts => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        what, attempt, self.max_attempts, delay, msg
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// `base` spread by up to a quarter either way, so idle workers do not poll in lockstep
pub fn jittered(base: Duration) -> Duration {
    let spread = base.as_millis() as u64 / 4;
    if spread == 0 {
        return base;
    }
    let offset = rand::thread_rng().gen_range(0..=spread * 2);
    (base + Duration::from_millis(offset)).saturating_sub(Duration::from_millis(spread))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Backoff::Fixed(Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_exhausted() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = policy(3)
            .run("analyze", move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(AnalyzerError::Transient("503".into()))
            })
            .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_stops_the_loop() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = policy(5)
            .run("analyze", move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(AnalyzerError::Permanent("400".into()))
            })
            .await;
        assert!(!result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_after_a_transient_error() {
        let result = policy(3)
            .run("analyze", |attempt| async move {
                if attempt < 2 {
                    Err(AnalyzerError::Transient("reset".into()))
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result, Ok(2));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(5),
        };
        let delays: Vec<_> = (1..=5).map(|a| backoff.delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        assert_eq!(backoff.delay(64), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let base = Duration::from_secs(8);
        for _ in 0..100 {
            let d = jittered(base);
            assert!(d >= Duration::from_secs(6) && d <= Duration::from_secs(10), "{:?}", d);
        }
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }
}
