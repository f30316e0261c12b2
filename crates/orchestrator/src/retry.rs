use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::task_manager::TaskError;

/// Exponential backoff around a single unit of work.
///
/// The delay after failed attempt `n` (0-based) is
/// `backoff_factor * 2^n` seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_factor: f64,
    /// Per-attempt deadline.
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_factor: 1.0,
            timeout: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_factor: f64) -> Self {
        Self {
            max_retries,
            backoff_factor,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.backoff_factor * 2f64.powi(exponent);
        if secs.is_nan() || secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Runs `work` until it succeeds or `max_retries` retries are used up,
    /// then returns the last error.
    pub async fn run<T, E, F, Fut>(&self, mut work: F) -> Result<T, TaskError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            let outcome = match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, work()).await {
                    Ok(result) => result.map_err(|e| TaskError::Failed(e.to_string())),
                    Err(_) => Err(TaskError::Timeout(limit)),
                },
                None => work().await.map_err(|e| TaskError::Failed(e.to_string())),
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if attempt >= self.max_retries {
                warn!(attempts = attempt + 1, error = %err, "Giving up after retries");
                return Err(err);
            }

            let delay = self.delay_for(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

pub async fn run_with_retry<T, E, F, Fut>(
    work: F,
    timeout: Option<Duration>,
    max_retries: u32,
    backoff_factor: f64,
) -> Result<T, TaskError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    RetryPolicy {
        max_retries,
        backoff_factor,
        timeout,
    }
    .run(work)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[test]
    fn test_delay_doubles() {
        let policy = RetryPolicy::new(3, 0.5);
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(RetryPolicy::new(3, 0.0).delay_for(4), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_unit_is_attempted_four_times() {
        let attempts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));

        let recorder = Arc::clone(&attempts);
        let result: Result<(), TaskError> = run_with_retry(
            move || {
                let recorder = Arc::clone(&recorder);
                async move {
                    let mut seen = recorder.lock().unwrap();
                    seen.push(Instant::now());
                    Err::<(), _>(format!("attempt {} failed", seen.len()))
                }
            },
            None,
            3,
            1.0,
        )
        .await;

        assert_eq!(result, Err(TaskError::Failed("attempt 4 failed".into())));

        let attempts = attempts.lock().unwrap();
        assert_eq!(attempts.len(), 4);
        let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert!(gaps.windows(2).all(|w| w[1] > w[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_at_first_success() {
        let calls = Arc::new(Mutex::new(0u32));

        let counter = Arc::clone(&calls);
        let result = RetryPolicy::new(5, 1.0)
            .run(move || {
                let counter = Arc::clone(&counter);
                async move {
                    let mut calls = counter.lock().unwrap();
                    *calls += 1;
                    if *calls < 3 {
                        Err("not yet")
                    } else {
                        Ok(*calls)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_attempt_has_its_own_timeout() {
        let result: Result<(), TaskError> = RetryPolicy::new(1, 1.0)
            .with_timeout(Duration::from_secs(2))
            .run(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, String>(())
            })
            .await;

        assert_eq!(result, Err(TaskError::Timeout(Duration::from_secs(2))));
    }
}
