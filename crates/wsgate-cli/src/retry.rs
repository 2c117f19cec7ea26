//! Bounded exponential backoff around a reconcile.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use wsgate_deploy::ReconcileResult;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial: Duration::from_secs(1),
            factor: 2,
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails fatally, or attempts run out.
    pub async fn run<F, Fut, T>(&self, mut op: F) -> ReconcileResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ReconcileResult<T>>,
    {
        let mut delay = self.initial;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.attempts => {
                    warn!(attempt, delay = ?delay, error = %err, "reconcile failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= self.factor;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
