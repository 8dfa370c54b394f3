//! Bounded retry for optimistic-concurrency conflicts.

use std::future::Future;
use std::time::Duration;

use crate::error::SyncError;

/// Exponential backoff parameters for conflict retries. Defaults mirror a
/// short in-process retry: five quick attempts, mild jitter, no cap.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub duration: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub steps: u32,
    pub cap: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            duration: Duration::from_millis(10),
            factor: 1.0,
            jitter: 0.1,
            steps: 5,
            cap: None,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the attempt after `attempt` (0-indexed) failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut secs = self.duration.as_secs_f64() * self.factor.powi(attempt as i32);
        if let Some(cap) = self.cap {
            secs = secs.min(cap.as_secs_f64());
        }
        if self.jitter > 0.0 {
            // Sub-second clock noise stands in for a PRNG; spread matters
            // here, not unpredictability.
            let frac = f64::from(
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.subsec_nanos())
                    .unwrap_or(0),
            ) / f64::from(u32::MAX);
            secs *= 1.0 + self.jitter * frac;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Run `op` until it succeeds, fails with a non-conflict error, or the step
/// budget runs out. Only conflict-classified errors are retried; the last
/// conflict is returned when the budget is exhausted.
pub async fn retry_on_conflict<T, F, Fut>(policy: &BackoffPolicy, mut op: F) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let steps = policy.steps.max(1);
    let mut last = SyncError::Conflict("retry budget exhausted".into());
    for attempt in 0..steps {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_conflict() => {
                if attempt + 1 < steps {
                    tokio::time::sleep(policy.delay(attempt)).await;
                }
                last = err;
            }
            Err(err) => return Err(err),
        }
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy {
            duration: Duration::from_millis(1),
            jitter: 0.0,
            ..BackoffPolicy::default()
        }
    }

    #[tokio::test]
    async fn succeeds_after_conflicts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);
        let out = retry_on_conflict(&fast_policy(), move || {
            let calls = Arc::clone(&calls_in);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SyncError::Conflict("stale".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(out.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_conflict_errors_abort_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);
        let out: Result<(), _> = retry_on_conflict(&fast_policy(), move || {
            let calls = Arc::clone(&calls_in);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::Remote("down".into()))
            }
        })
        .await;
        assert!(!out.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn budget_exhaustion_returns_last_conflict() {
        let policy = BackoffPolicy {
            steps: 3,
            ..fast_policy()
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);
        let out: Result<(), _> = retry_on_conflict(&policy, move || {
            let calls = Arc::clone(&calls_in);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::Conflict(format!("attempt {}", n)))
            }
        })
        .await;
        let err = out.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(err.to_string(), "write conflict: attempt 2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn delay_grows_with_factor_and_respects_cap() {
        let policy = BackoffPolicy {
            duration: Duration::from_millis(10),
            factor: 2.0,
            jitter: 0.0,
            steps: 5,
            cap: Some(Duration::from_millis(25)),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(10));
        assert_eq!(policy.delay(1), Duration::from_millis(20));
        assert_eq!(policy.delay(2), Duration::from_millis(25));
    }
}
