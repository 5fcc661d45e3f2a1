//! Cancellation and deadline handle for long-running operations.

use crate::error::{PulseError, PulseResult};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Deadline-bearing cancellation handle passed down to sync jobs and
/// paged pulls. Work checks it between units (pages, customers) and stops
/// cleanly when either the deadline passes or shutdown is signalled.
#[derive(Debug, Clone)]
pub struct OpContext {
    deadline: Option<Instant>,
    shutdown: Option<watch::Receiver<bool>>,
    operation: &'static str,
}

impl OpContext {
    /// A context that never expires and cannot be cancelled.
    pub fn background(operation: &'static str) -> Self {
        Self {
            deadline: None,
            shutdown: None,
            operation,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        self
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Child context for a nested operation; inherits deadline and shutdown.
    pub fn child(&self, operation: &'static str) -> Self {
        Self {
            deadline: self.deadline,
            shutdown: self.shutdown.clone(),
            operation,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Fails once the context has been cancelled or its deadline passed.
    pub fn check(&self) -> PulseResult<()> {
        if self.is_cancelled() {
            return Err(PulseError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(PulseError::DeadlineExceeded {
                    operation: self.operation.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_context_never_fails() {
        let ctx = OpContext::background("test");
        assert!(ctx.check().is_ok());
        assert!(ctx.remaining().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let ctx = OpContext::background("sync").with_timeout(Duration::from_secs(5));
        assert!(ctx.check().is_ok());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(matches!(
            ctx.check(),
            Err(PulseError::DeadlineExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_children() {
        let (tx, rx) = watch::channel(false);
        let ctx = OpContext::background("sync").with_shutdown(rx);
        let child = ctx.child("pull");
        assert!(child.check().is_ok());
        tx.send(true).unwrap();
        assert_eq!(child.check(), Err(PulseError::Cancelled));
    }

    #[tokio::test]
    async fn test_with_timeout_keeps_earlier_deadline() {
        let ctx = OpContext::background("x")
            .with_timeout(Duration::from_secs(1))
            .with_timeout(Duration::from_secs(60));
        assert!(ctx.remaining().unwrap() <= Duration::from_secs(1));
    }
}
