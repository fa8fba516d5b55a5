//! Monotonic deadlines with cancellation propagation.
//!
//! A run owns one root `RunDeadline`; every stage derives a child scope whose
//! budget is clamped to the remaining root budget. Cancelling the root (or
//! letting it elapse) cancels every child token.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use bayline_types::SourceError;

/// Monotonic now. All deadline math uses this, never wall-clock.
pub fn now() -> Instant {
    Instant::now()
}

#[derive(Debug, Clone)]
pub struct RunDeadline {
    token: CancellationToken,
    deadline: Instant,
}

impl RunDeadline {
    /// Root deadline scope for a run.
    pub fn new(budget: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Instant::now() + budget,
        }
    }

    /// Child scope: its budget may not exceed what remains of the parent,
    /// and cancelling the parent cancels the child.
    pub fn with_deadline(&self, budget: Duration) -> Self {
        let budget = budget.min(self.remaining());
        Self {
            token: self.token.child_token(),
            deadline: Instant::now() + budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn deadline_elapsed(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancels this scope and every child derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Runs `fut` under this scope. Fails with `DEADLINE_EXCEEDED` when the
    /// budget elapses or the scope is cancelled first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, SourceError>
    where
        F: std::future::Future<Output = Result<T, SourceError>>,
    {
        if self.is_cancelled() || self.deadline_elapsed() {
            return Err(SourceError::DeadlineExceeded);
        }
        tokio::select! {
            _ = self.token.cancelled() => Err(SourceError::DeadlineExceeded),
            _ = tokio::time::sleep(self.remaining()) => {
                self.token.cancel();
                Err(SourceError::DeadlineExceeded)
            }
            out = fut => out,
        }
    }
}
