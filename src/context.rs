//! The caller-supplied context that bounds every suspension point of an operation.

use std::{future::Future, time::Duration};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Interruption, Result};

/// Carries a caller's deadline and cancellation signal into the executor. Server selection,
/// connection checkout, socket reads and writes, and encryption callbacks all run under
/// [`Context::run`], so ending the context interrupts whichever of them is in progress.
///
/// Retries never extend the deadline: every attempt of an operation shares the same context.
#[derive(Clone, Debug, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancellation: CancellationToken,
}

impl Context {
    /// A context with no deadline that is never cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a context that expires at `deadline`, or at the current deadline if that is
    /// earlier.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Returns a context that expires `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Returns a context that is interrupted when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The time left before the deadline. Returns `Some(Duration::ZERO)` once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// The token whose cancellation interrupts this context.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Returns the interruption error if this context has already ended.
    pub fn check(&self) -> Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(Error::interrupted(Interruption::Cancelled));
        }
        if matches!(self.deadline, Some(deadline) if deadline <= Instant::now()) {
            return Err(Error::interrupted(Interruption::DeadlineExceeded));
        }
        Ok(())
    }

    /// Drives `fut` to completion unless the context is cancelled or its deadline passes first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(Error::interrupted(Interruption::Cancelled)),
            _ = expired => Err(Error::interrupted(Interruption::DeadlineExceeded)),
            result = fut => result,
        }
    }
}
