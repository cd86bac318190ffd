//! # Operation Context
//!
//! Caller-supplied cancellation and timeout signal threaded through every
//! suspension point of the driver contract (`open`, `execute`,
//! `execute_migration`, `sync_schema`, `dump`, `restore`).
//!
//! An [`OperationContext`] wraps a [`CancellationToken`] and an optional
//! deadline. [`OperationContext::run`] races a future against both; when either
//! fires the future is dropped and a `Cancelled` error is returned so the
//! caller can roll back its transaction.

use crate::error::{Result, SchemaflowError};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context cancelled by an externally owned token
    pub fn with_token(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Same token, bounded by `timeout` from now (or the existing deadline if sooner)
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            cancel: self.cancel.clone(),
            deadline: Some(deadline),
        }
    }

    /// Child context: cancelled with the parent, cancellable on its own
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail fast if the context already fired
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SchemaflowError::cancelled(operation, "cancelled by caller"));
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(SchemaflowError::cancelled(operation, "deadline exceeded"));
        }
        Ok(())
    }

    /// Run `fut` until it completes, the token is cancelled, or the deadline passes.
    pub async fn run<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check(operation)?;
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        Err(SchemaflowError::cancelled(operation, "cancelled by caller"))
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        Err(SchemaflowError::cancelled(operation, "deadline exceeded"))
                    }
                    result = fut => result,
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        Err(SchemaflowError::cancelled(operation, "cancelled by caller"))
                    }
                    result = fut => result,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_run_completes() {
        let ctx = OperationContext::new();
        let value = ctx.run("noop", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_run_observes_cancellation() {
        let ctx = OperationContext::new();
        ctx.cancel();
        let err = ctx
            .run("execute", async { Ok::<_, SchemaflowError>(()) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancellation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_observes_deadline() {
        let ctx = OperationContext::new().with_timeout(Duration::from_millis(50));
        let err = ctx
            .run("execute", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, SchemaflowError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SchemaflowError::Cancelled { ref reason, .. } if reason == "deadline exceeded"));
    }

    #[test]
    fn test_child_follows_parent() {
        let parent = OperationContext::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_child_cancel_does_not_affect_parent() {
        let parent = OperationContext::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_with_timeout_keeps_earlier_deadline() {
        let ctx = OperationContext::new().with_timeout(Duration::from_secs(1));
        let narrowed = ctx.with_timeout(Duration::from_secs(60));
        assert_eq!(ctx.deadline(), narrowed.deadline());
    }
}
