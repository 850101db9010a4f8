//! Per-commit transaction options.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Resync flavor requested for a transaction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResyncType {
    /// Plain data-change transaction, no southbound dump.
    #[default]
    None,
    /// NB supplies the complete desired state; SB is dumped and reconciled.
    Full,
    /// NB intent is unchanged; SB is re-dumped and drift reconciled.
    Downstream,
}

/// Retry policy for retriable failures within a transaction.
#[derive(Clone, Copy, Debug)]
pub struct RetryOptions {
    /// Interval before the first retry attempt.
    pub period: Duration,
    /// Double the interval after each failed attempt.
    pub exp_backoff: bool,
}

/// Cooperative cancellation token, checked between operations.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options attached to a transaction commit.
#[derive(Clone, Debug, Default)]
pub struct CommitOptions {
    pub revert_on_failure: bool,
    pub resync: ResyncType,
    pub retry: Option<RetryOptions>,
    pub cancel: Option<CancelToken>,
}

impl CommitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Undo all executed operations if any operation fails.
    pub fn with_revert(mut self) -> Self {
        self.revert_on_failure = true;
        self
    }

    /// Treat the transaction values as the complete desired NB state and
    /// reconcile against a fresh southbound dump.
    pub fn with_full_resync(mut self) -> Self {
        self.resync = ResyncType::Full;
        self
    }

    /// Re-dump the southbound and reconcile drift against unchanged NB
    /// intent.
    pub fn with_downstream_resync(mut self) -> Self {
        self.resync = ResyncType::Downstream;
        self
    }

    /// Schedule retries for retriable failures, starting after `period`.
    pub fn with_retry(mut self, period: Duration, exp_backoff: bool) -> Self {
        self.retry = Some(RetryOptions {
            period,
            exp_backoff,
        });
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates() {
        let opts = CommitOptions::new()
            .with_revert()
            .with_retry(Duration::from_millis(50), true);
        assert!(opts.revert_on_failure);
        assert_eq!(opts.resync, ResyncType::None);
        assert!(opts.retry.is_some());
    }

    #[test]
    fn cancel_token_trips_once() {
        let token = CancelToken::new();
        let opts = CommitOptions::new().with_cancel(token.clone());
        assert!(!opts.is_cancelled());
        token.cancel();
        assert!(opts.is_cancelled());
    }
}
