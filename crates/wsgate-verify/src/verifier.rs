//! Post-deploy connection verifier.
//!
//! Opens a streaming connection to a freshly deployed stage, sends a single
//! probe frame and asserts on the response. A new stage can refuse the
//! handshake for a while after deployment, so provisioning failures are
//! retried with exponential backoff up to an attempt ceiling. Everything
//! else fails immediately.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::transport::{StreamConnection, StreamTransport, TransportError};

#[derive(Debug, Clone, PartialEq)]
pub struct VerifyConfig {
    pub max_attempts: u32,
    pub initial_sleep: Duration,
    pub backoff_factor: f64,
    /// Ceiling for a single sleep between attempts.
    pub max_sleep: Duration,
    /// How long to wait for the response after the probe is sent.
    pub response_timeout: Duration,
    /// Upper bound on the whole verification, sleeps included.
    pub deadline: Option<Duration>,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_sleep: Duration::from_secs(2),
            backoff_factor: 1.5,
            max_sleep: Duration::from_secs(60),
            response_timeout: Duration::from_secs(30),
            deadline: Some(Duration::from_secs(120)),
        }
    }
}

impl VerifyConfig {
    /// Reject settings the retry loop cannot run with.
    pub fn validate(&self) -> VerifyResult<()> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(VerifyError::InvalidConfig(format!(
                "backoff factor must be a finite number >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        if self.max_attempts == 0 {
            return Err(VerifyError::InvalidConfig(
                "max attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn next_sleep(&self, sleep: Duration) -> Duration {
        Duration::try_from_secs_f64(sleep.as_secs_f64() * self.backoff_factor)
            .unwrap_or(self.max_sleep)
            .min(self.max_sleep)
    }
}

/// The frame sent to the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub action: String,
}

impl Probe {
    pub fn action(name: &str) -> Self {
        Self {
            action: name.to_string(),
        }
    }

    pub fn frame(&self) -> String {
        serde_json::json!({ "action": self.action }).to_string()
    }
}

/// Field/value pair the response must carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedMarker {
    pub field: String,
    pub value: String,
}

impl ExpectedMarker {
    pub fn new(field: &str, value: &str) -> Self {
        Self {
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    fn check(&self, response: &Value) -> Result<(), VerifyError> {
        let object = response
            .as_object()
            .ok_or_else(|| VerifyError::Malformed(format!("expected a JSON object, got {response}")))?;
        match object.get(&self.field) {
            Some(Value::String(actual)) if *actual == self.value => Ok(()),
            other => Err(VerifyError::AssertionMismatch {
                field: self.field.clone(),
                expected: self.value.clone(),
                actual: other.map(Value::to_string),
            }),
        }
    }
}

impl Default for ExpectedMarker {
    fn default() -> Self {
        Self::new("message", "success")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifyReport {
    pub attempts: u32,
    /// Sleeps taken between attempts, in order.
    pub waits: Vec<Duration>,
    pub response: Value,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum VerifyError {
    #[error("gave up after {attempts} attempts: {last}")]
    GaveUp { attempts: u32, last: TransportError },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("expected {field} = {expected:?}, got {}", .actual.as_deref().unwrap_or("nothing"))]
    AssertionMismatch {
        field: String,
        expected: String,
        actual: Option<String>,
    },

    #[error("deadline of {deadline:?} exceeded after {attempts} attempts")]
    DeadlineExceeded { deadline: Duration, attempts: u32 },

    #[error("invalid verify config: {0}")]
    InvalidConfig(String),

    #[error("no response within {0:?}")]
    ResponseTimeout(Duration),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type VerifyResult<T> = Result<T, VerifyError>;

pub struct ConnectionVerifier<T> {
    transport: T,
    config: VerifyConfig,
}

impl<T: StreamTransport> ConnectionVerifier<T> {
    pub fn new(transport: T, config: VerifyConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &VerifyConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Probe `url` until it answers with `expected` or the budget runs out.
    pub async fn verify(
        &self,
        url: &str,
        probe: &Probe,
        expected: &ExpectedMarker,
    ) -> VerifyResult<VerifyReport> {
        self.config.validate()?;
        let started = Instant::now();
        let deadline = self.config.deadline.map(|d| (d, started + d));
        let mut attempt = 0u32;
        let mut sleep = self.config.initial_sleep;
        let mut waits = Vec::new();

        loop {
            if let Some((limit, at)) = deadline {
                if Instant::now() >= at {
                    warn!(%url, attempts = attempt, "verification deadline exceeded");
                    return Err(VerifyError::DeadlineExceeded {
                        deadline: limit,
                        attempts: attempt,
                    });
                }
            }

            attempt += 1;
            debug!(%url, attempt, max_attempts = self.config.max_attempts, "probing endpoint");

            let result = self.attempt(url, probe, expected, attempt, deadline).await;

            match result {
                Ok(response) => {
                    info!(%url, attempt, "endpoint verified");
                    return Ok(VerifyReport {
                        attempts: attempt,
                        waits,
                        response,
                        elapsed: started.elapsed(),
                    });
                }
                Err(VerifyError::Transport(err)) if err.is_transient() => {
                    if attempt >= self.config.max_attempts {
                        warn!(%url, attempts = attempt, error = %err, "giving up on endpoint");
                        return Err(VerifyError::GaveUp {
                            attempts: attempt,
                            last: err,
                        });
                    }
                    let wait = match deadline {
                        Some((_, at)) => sleep.min(at.saturating_duration_since(Instant::now())),
                        None => sleep,
                    };
                    warn!(%url, attempt, wait = ?wait, error = %err, "endpoint not ready, retrying");
                    tokio::time::sleep(wait).await;
                    waits.push(wait);
                    sleep = self.config.next_sleep(sleep);
                }
                Err(err) => {
                    warn!(%url, attempt, error = %err, "verification failed");
                    return Err(err);
                }
            }
        }
    }

    /// One connect/exchange/close cycle. The overall deadline cuts connect
    /// and exchange short; close always runs once a connection exists.
    async fn attempt(
        &self,
        url: &str,
        probe: &Probe,
        expected: &ExpectedMarker,
        attempt: u32,
        deadline: Option<(Duration, Instant)>,
    ) -> VerifyResult<Value> {
        let exceeded = |limit: Duration| {
            warn!(%url, attempt, "verification deadline exceeded mid-attempt");
            VerifyError::DeadlineExceeded {
                deadline: limit,
                attempts: attempt,
            }
        };

        let mut conn = match deadline {
            Some((limit, at)) => tokio::time::timeout_at(at, self.transport.connect(url))
                .await
                .map_err(|_| exceeded(limit))??,
            None => self.transport.connect(url).await?,
        };

        let exchange = self.exchange(conn.as_mut(), probe, expected);
        let result = match deadline {
            Some((limit, at)) => match tokio::time::timeout_at(at, exchange).await {
                Ok(result) => result,
                Err(_) => Err(exceeded(limit)),
            },
            None => exchange.await,
        };

        if let Err(e) = conn.close().await {
            debug!(%url, error = %e, "close failed");
        }
        result
    }

    async fn exchange(
        &self,
        conn: &mut dyn StreamConnection,
        probe: &Probe,
        expected: &ExpectedMarker,
    ) -> VerifyResult<Value> {
        conn.send_text(&probe.frame()).await?;
        let raw = tokio::time::timeout(self.config.response_timeout, conn.recv_text())
            .await
            .map_err(|_| VerifyError::ResponseTimeout(self.config.response_timeout))??;
        let response: Value = serde_json::from_str(&raw)
            .map_err(|e| VerifyError::Malformed(format!("{e}: {raw}")))?;
        expected.check(&response)?;
        Ok(response)
    }
}
