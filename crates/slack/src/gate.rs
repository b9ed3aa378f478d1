use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::client::ApiError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("rate limited after {attempts} attempts (last wait {last_wait:?})")]
    RateLimited { attempts: u32, last_wait: Duration },
    #[error("access denied: {0}")]
    Access(String),
    #[error("fatal gateway failure: {0}")]
    Fatal(String),
}

/// Backoff schedule for rate-limit responses. A server-provided hint wins,
/// padded with a safety buffer; otherwise the wait doubles per attempt from
/// the configured base.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_attempts: u32,
    pub hint_buffer: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { base: Duration::from_secs(60), max_attempts: 3, hint_buffer: Duration::from_secs(5) }
    }
}

impl BackoffPolicy {
    pub fn wait_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint + self.hint_buffer;
        }
        let exponent = attempt.min(16);
        self.base.saturating_mul(1_u32 << exponent)
    }
}

/// Seam over waiting so tests can observe imposed delays instead of serving
/// them.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Wraps every call to one remote service with baseline spacing and bounded
/// rate-limit backoff. One gate instance per remote service: the spacing
/// clock is shared across all operations because the remote budget is.
pub struct ApiGate {
    spacing: Duration,
    policy: BackoffPolicy,
    sleeper: Arc<dyn Sleeper>,
    last_call: Mutex<Option<Instant>>,
}

impl ApiGate {
    pub fn new(spacing: Duration, policy: BackoffPolicy) -> Self {
        Self::with_sleeper(spacing, policy, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(
        spacing: Duration,
        policy: BackoffPolicy,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self { spacing, policy, sleeper, last_call: Mutex::new(None) }
    }

    /// Run `call`, retrying rate-limit responses per the backoff policy.
    /// Non-rate-limit errors return immediately. After the retry budget is
    /// spent the final wait is still served, leaving the remote budget room
    /// to recover before the caller defers the work.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, GateError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempts = 0_u32;

        loop {
            self.pace(operation).await;

            match call().await {
                Ok(value) => return Ok(value),
                Err(ApiError::RateLimited { retry_after }) => {
                    attempts += 1;
                    let wait = self.policy.wait_for(attempts - 1, retry_after);
                    warn!(
                        event_name = "gate.rate_limited",
                        operation,
                        attempt = attempts,
                        max_attempts = self.policy.max_attempts,
                        wait_secs = wait.as_secs(),
                        hinted = retry_after.is_some(),
                        "rate limited; backing off"
                    );
                    self.sleeper.sleep(wait).await;

                    if attempts >= self.policy.max_attempts {
                        return Err(GateError::RateLimited { attempts, last_wait: wait });
                    }
                }
                Err(ApiError::Access(code)) => return Err(GateError::Access(code)),
                Err(ApiError::Transport(message)) | Err(ApiError::Fatal(message)) => {
                    return Err(GateError::Fatal(message));
                }
            }
        }
    }

    /// Enforce minimum spacing since the previous outbound call, whatever
    /// operation it was for.
    async fn pace(&self, operation: &str) {
        let wait = {
            let mut last_call = self.last_call.lock().await;
            let now = Instant::now();
            let wait = match *last_call {
                Some(previous) => self.spacing.saturating_sub(now.duration_since(previous)),
                None => Duration::ZERO,
            };
            *last_call = Some(now + wait);
            wait
        };

        if !wait.is_zero() {
            debug!(
                event_name = "gate.pacing",
                operation,
                wait_ms = wait.as_millis() as u64,
                "spacing outbound call"
            );
            self.sleeper.sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::Mutex;

    use crate::client::ApiError;

    use super::{ApiGate, BackoffPolicy, GateError, Sleeper};

    #[derive(Default)]
    struct RecordingSleeper {
        waits: Mutex<Vec<Duration>>,
    }

    #[async_trait::async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.waits.lock().await.push(duration);
        }
    }

    impl RecordingSleeper {
        async fn waits(&self) -> Vec<Duration> {
            self.waits.lock().await.clone()
        }
    }

    fn gate(sleeper: Arc<RecordingSleeper>) -> ApiGate {
        ApiGate::with_sleeper(Duration::ZERO, BackoffPolicy::default(), sleeper)
    }

    #[test]
    fn backoff_doubles_per_attempt_from_base() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.wait_for(0, None), Duration::from_secs(60));
        assert_eq!(policy.wait_for(1, None), Duration::from_secs(120));
        assert_eq!(policy.wait_for(2, None), Duration::from_secs(240));
    }

    #[test]
    fn server_hint_wins_and_gets_a_safety_buffer() {
        let policy = BackoffPolicy::default();
        assert_eq!(
            policy.wait_for(0, Some(Duration::from_secs(30))),
            Duration::from_secs(35)
        );
    }

    #[tokio::test]
    async fn three_rate_limits_produce_the_documented_backoff_sequence() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let gate = gate(sleeper.clone());

        let result: Result<(), GateError> = gate
            .execute("conversations.history", || async {
                Err(ApiError::RateLimited { retry_after: None })
            })
            .await;

        assert_eq!(
            result,
            Err(GateError::RateLimited {
                attempts: 3,
                last_wait: Duration::from_secs(240)
            })
        );
        assert_eq!(
            sleeper.waits().await,
            vec![
                Duration::from_secs(60),
                Duration::from_secs(120),
                Duration::from_secs(240)
            ]
        );
    }

    #[tokio::test]
    async fn recovers_when_a_retry_succeeds() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let gate = gate(sleeper.clone());
        let failures = Mutex::new(1_u32);

        let result = gate
            .execute("conversations.list", || async {
                let mut remaining = failures.lock().await;
                if *remaining > 0 {
                    *remaining -= 1;
                    Err(ApiError::RateLimited { retry_after: None })
                } else {
                    Ok(42_u32)
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(sleeper.waits().await, vec![Duration::from_secs(60)]);
    }

    #[tokio::test]
    async fn access_errors_are_never_retried() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let gate = gate(sleeper.clone());
        let calls = Mutex::new(0_u32);

        let result: Result<(), GateError> = gate
            .execute("conversations.join", || async {
                *calls.lock().await += 1;
                Err(ApiError::Access("is_archived".to_string()))
            })
            .await;

        assert_eq!(result, Err(GateError::Access("is_archived".to_string())));
        assert_eq!(*calls.lock().await, 1);
        assert!(sleeper.waits().await.is_empty());
    }

    #[tokio::test]
    async fn baseline_spacing_applies_between_consecutive_calls() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let gate = ApiGate::with_sleeper(
            Duration::from_secs(2),
            BackoffPolicy::default(),
            sleeper.clone(),
        );

        for _ in 0..3 {
            gate.execute("conversations.list", || async { Ok(()) })
                .await
                .expect("call succeeds");
        }

        let waits = sleeper.waits().await;
        // First call goes straight through; the following two are paced.
        assert_eq!(waits.len(), 2);
        assert!(waits.iter().all(|wait| *wait <= Duration::from_secs(2)));
    }
}
