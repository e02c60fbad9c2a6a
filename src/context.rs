//! Request-scoped cancellation and deadlines.
//!
//! Every client and transaction call takes a [`Context`]. Backend work runs
//! inside [`Context::run`], which drops the in-flight future as soon as the
//! context is cancelled or its deadline passes. Dropping a pending `sqlx`
//! transaction rolls it back, so a cancelled commit never applies partially.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{MetaError, Result};

/// Cancellation and deadline carried by a single request.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: Option<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

/// Handle that cancels every [`Context`] derived from [`Context::with_cancel`].
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    /// Cancel the associated contexts. Idempotent.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A cancellable context and the handle that cancels it.
    pub fn with_cancel() -> (Self, CancelHandle) {
        let (sender, receiver) = watch::channel(false);
        let ctx = Self {
            cancel: Some(receiver),
            deadline: None,
        };
        (ctx, CancelHandle { sender })
    }

    /// Derive a context that additionally expires after `timeout`.
    ///
    /// An existing earlier deadline is kept.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing <= candidate => existing,
            _ => candidate,
        };
        Self {
            cancel: self.cancel.clone(),
            deadline: Some(deadline),
        }
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the cancel handle has fired.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Fail fast if the context is already done.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(MetaError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(MetaError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Run `fut` unless the context finishes first.
    ///
    /// When the context wins the race, `fut` is dropped without being polled
    /// again and the cancellation error is returned.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            res = fut => res,
        }
    }

    /// Resolves when the context is cancelled or expires.
    async fn done(&self) -> MetaError {
        let cancelled = async {
            if let Some(rx) = &self.cancel {
                let mut rx = rx.clone();
                let fired = rx.wait_for(|cancelled| *cancelled).await.is_ok();
                if fired {
                    return;
                }
            }
            // no handle, or the handle was dropped without cancelling
            std::future::pending::<()>().await
        };

        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = cancelled => MetaError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => MetaError::DeadlineExceeded,
            },
            None => {
                cancelled.await;
                MetaError::Cancelled
            }
        }
    }
}
