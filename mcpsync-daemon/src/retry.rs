//! Bounded exponential backoff for transient daemon failures.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::client::DaemonClient;
use crate::error::ClientError;
use crate::protocol::DaemonRequest;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Wait before retry number `retry` (0 for the first retry):
    /// `base_delay * multiplier^retry`, capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let scaled = self.base_delay.as_nanos() as f64 * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(scaled.max(0.0) as u64)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, runs out of
/// attempts, or `deadline` passes. The deadline bounds every attempt and
/// every wait.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    deadline: Option<Instant>,
    mut op: F,
) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let attempts = policy.max_attempts.max(1);
    let started = Instant::now();
    let expired = || ClientError::DeadlineExceeded(started.elapsed());

    let mut retries = 0;
    loop {
        let outcome = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, op())
                .await
                .map_err(|_| expired())?,
            None => op().await,
        };
        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !err.is_retryable() || retries + 1 >= attempts {
            return Err(err);
        }

        let delay = policy.delay_for(retries);
        if let Some(deadline) = deadline {
            if Instant::now() + delay >= deadline {
                tracing::debug!(error = %err, "retry would pass the deadline");
                return Err(expired());
            }
        }
        tracing::debug!(
            attempt = retries + 1,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient daemon error; retrying",
        );
        tokio::time::sleep(delay).await;
        retries += 1;
    }
}

/// [`DaemonClient`] with [`retry`] around every call.
#[derive(Debug, Clone)]
pub struct RetryingClient {
    client: DaemonClient,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(client: DaemonClient, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub fn client(&self) -> &DaemonClient {
        &self.client
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn call(&self, request: &DaemonRequest) -> Result<Value, ClientError> {
        retry(&self.policy, None, || self.client.call(request)).await
    }

    /// Like [`call`](Self::call), but gives up once `deadline` passes.
    pub async fn call_with_deadline(
        &self,
        request: &DaemonRequest,
        deadline: Instant,
    ) -> Result<Value, ClientError> {
        retry(&self.policy, Some(deadline), || self.client.call(request)).await
    }
}
