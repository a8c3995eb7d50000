//! Resilient execution of remote operations.
//!
//! Every remote call made by the engine goes through a [`RetryingExecutor`].
//! Each attempt runs under its own deadline, which grows linearly with the
//! attempt number up to a cap. Transient failures (including a missed
//! deadline) re-establish the [`Session`] and try again; anything else
//! propagates straight away.

use crate::error::{ErrorKind, Result};
use depotsync_config::Config;
use depotsync_depot::error::{ErrorKind as DepotErrorKind, Result as DepotResult};
use depotsync_depot::{Credentials, DepotHandle};
use std::future::Future;
use std::time::Duration;
use tracing::instrument;

/// The one shared, mutable remote session of a depot connection.
///
/// Holds everything needed to bring the connection back after a drop:
/// credentials and the selected workspace. Only the executor re-establishes
/// it, and only between attempts.
pub struct Session {
    depot: DepotHandle,
    credentials: Credentials,
    workspace: Option<String>,
}
impl Session {
    pub fn new(depot: DepotHandle, credentials: Credentials) -> Self {
        Self { depot, credentials, workspace: None }
    }

    pub fn with_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn depot(&self) -> &DepotHandle {
        &self.depot
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn workspace(&self) -> Option<&str> {
        self.workspace.as_deref()
    }

    /// Authenticate and restore the selected workspace.
    async fn establish(&self) -> DepotResult<()> {
        self.depot.connect(&self.credentials).await?;
        if let Some(workspace) = &self.workspace {
            self.depot.set_working_set(workspace).await?;
        }
        Ok(())
    }
}

/// Retry discipline for one class of remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retry_count: u32,
    pub initial_timeout: Duration,
    /// Attempt `n` runs under `initial_timeout * min(n, max_attempt_multiplier)`.
    pub max_attempt_multiplier: u32,
}
impl Default for RetryPolicy {
    fn default() -> Self {
        Self { retry_count: 3, initial_timeout: Duration::from_secs(30), max_attempt_multiplier: 5 }
    }
}
impl From<&Config> for RetryPolicy {
    fn from(config: &Config) -> Self {
        Self {
            retry_count: config.retry_count,
            initial_timeout: config.command_timeout(),
            max_attempt_multiplier: config.max_attempt_multiplier,
        }
    }
}
impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    /// Deadline for a 1-based attempt number.
    pub fn timeout_for(&self, attempt: u32) -> Duration {
        self.initial_timeout * attempt.clamp(1, self.max_attempt_multiplier.max(1))
    }

    /// The same policy with every deadline multiplied by `factor`.
    pub fn scaled(&self, factor: u32) -> Self {
        Self { initial_timeout: self.initial_timeout * factor.max(1), ..*self }
    }
}

/// Information handed to each attempt of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based.
    pub number: u32,
    pub timeout: Duration,
}

pub struct RetryingExecutor {
    session: Session,
    policy: RetryPolicy,
    sync_multiplier: u32,
}

impl RetryingExecutor {
    pub fn new(session: Session, policy: RetryPolicy) -> Self {
        Self { session, policy, sync_multiplier: 1 }
    }

    pub fn from_config(session: Session, config: &Config) -> Self {
        Self::new(session, RetryPolicy::from(config)).with_sync_multiplier(config.sync_timeout_multiplier)
    }

    /// Sync and submit commands move file content and start at this multiple
    /// of the interrogation timeout.
    pub fn with_sync_multiplier(mut self, multiplier: u32) -> Self {
        self.sync_multiplier = multiplier.max(1);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn sync_policy(&self) -> RetryPolicy {
        self.policy.scaled(self.sync_multiplier)
    }

    /// Establish the session, retrying transient failures.
    pub async fn connect(&self) -> Result<()> {
        self.execute("connect", |_, _| self.session.establish()).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.execute("disconnect", |depot, _| async move { depot.disconnect().await }).await
    }

    /// Run `op` under the interrogation [`RetryPolicy`].
    pub async fn execute<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut(DepotHandle, Attempt) -> Fut,
        Fut: Future<Output = DepotResult<T>>,
    {
        self.execute_with(&self.policy, operation, op).await
    }

    /// Run `op` under the sync [`RetryPolicy`].
    pub async fn execute_sync<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut(DepotHandle, Attempt) -> Fut,
        Fut: Future<Output = DepotResult<T>>,
    {
        self.execute_with(&self.sync_policy(), operation, op).await
    }

    /// Run `op` until it succeeds, fails non-transiently, or runs out of
    /// attempts.
    ///
    /// Before every attempt after the first, the session is re-established;
    /// a failure to do so counts against that attempt. Missing the attempt's
    /// deadline is a transient failure.
    #[instrument(skip_all, fields(operation = operation, depot = self.session.depot.name()))]
    pub async fn execute_with<T, F, Fut>(&self, policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut(DepotHandle, Attempt) -> Fut,
        Fut: Future<Output = DepotResult<T>>,
    {
        let attempts = policy.attempts();
        let mut number = 1;
        loop {
            let attempt = Attempt { number, timeout: policy.timeout_for(number) };
            let depot = self.session.depot.clone();
            let reconnect = number > 1;
            let future = op(depot, attempt);
            let outcome = tokio::time::timeout(attempt.timeout, async {
                if reconnect {
                    self.session.establish().await?;
                }
                future.await
            })
            .await;
            let err = match outcome {
                Ok(Ok(value)) => {
                    if number > 1 {
                        tracing::info!(operation, attempt = number, "Remote operation recovered");
                    }
                    return Ok(value);
                },
                Ok(Err(err)) => err,
                Err(_elapsed) => exn::Exn::from(DepotErrorKind::TimedOut(attempt.timeout)),
            };
            let reason = (*err).to_string();
            if !err.is_retryable() {
                tracing::error!(operation, attempt = number, error = %reason, "Remote operation failed");
                return Err(err.raise(ErrorKind::Remote(operation.to_string())));
            }
            if number >= attempts {
                tracing::error!(operation, attempts, error = %reason, "Remote operation failed; retries exhausted");
                return Err(err.raise(ErrorKind::RetriesExhausted { operation: operation.to_string(), attempts }));
            }
            tracing::warn!(
                operation,
                attempt = number,
                timeout_ms = attempt.timeout.as_millis() as u64,
                error = %reason,
                "Transient remote failure; reconnecting and retrying"
            );
            number += 1;
        }
    }
}
