//! Transaction queue types and the retry schedule.
//!
//! NB commits, SB notifications and retry tickets all funnel through one
//! crossbeam channel consumed by the worker thread. Retry tickets wait in
//! a small in-worker schedule; overlapping tickets are coalesced by key
//! union.

use std::time::Duration;

use crossbeam::channel::Sender;

use crate::api::{CommitOptions, KeyWithError, Metadata, ValueOrigin, ValueRef};
use crate::error::SchedulerError;

use super::recorder::TxnType;
use super::utils::KeySet;

/// One requested change of a single key.
#[derive(Clone)]
pub struct KVChange {
    pub key: String,
    /// None requests a deletion.
    pub value: Option<ValueRef>,
    pub origin: ValueOrigin,
    /// Metadata reported alongside an SB notification.
    pub metadata: Option<Metadata>,
}

/// Outcome delivered back to a blocked committer.
pub struct CommitOutcome {
    pub seq_num: u64,
    pub kv_errors: Vec<KeyWithError>,
    pub error: Option<SchedulerError>,
}

/// Work item consumed by the worker thread.
pub struct QueuedTxn {
    pub txn_type: TxnType,
    pub values: Vec<KVChange>,
    pub options: CommitOptions,
    pub reply: Option<Sender<CommitOutcome>>,
    /// Retry attempt counter, zero for ordinary transactions.
    pub attempt: u32,
}

/// A scheduled re-attempt of failed keys.
#[derive(Clone, Debug)]
pub struct RetryTicket {
    pub keys: KeySet,
    pub due_ms: u64,
    pub attempt: u32,
    /// Interval to apply on the next reschedule.
    pub interval: Duration,
    pub exp_backoff: bool,
}

/// In-worker schedule of pending retries.
#[derive(Default)]
pub struct RetrySchedule {
    tickets: Vec<RetryTicket>,
    max_interval: Duration,
}

impl RetrySchedule {
    pub fn new(max_interval: Duration) -> Self {
        RetrySchedule {
            tickets: Vec::new(),
            max_interval,
        }
    }

    /// Add a ticket, merging it with any ticket targeting overlapping
    /// keys: key sets union, the earlier due time and the higher attempt
    /// win.
    pub fn schedule(&mut self, mut ticket: RetryTicket) {
        ticket.interval = ticket.interval.min(self.max_interval);
        let mut merged = ticket;
        self.tickets.retain(|existing| {
            if existing.keys.is_disjoint(&merged.keys) {
                return true;
            }
            merged.keys.extend(existing.keys.iter().cloned());
            merged.due_ms = merged.due_ms.min(existing.due_ms);
            merged.attempt = merged.attempt.max(existing.attempt);
            merged.interval = merged.interval.max(existing.interval);
            false
        });
        self.tickets.push(merged);
    }

    /// Earliest due time of any waiting ticket.
    pub fn next_due_ms(&self) -> Option<u64> {
        self.tickets.iter().map(|t| t.due_ms).min()
    }

    /// Remove and return every ticket due at `now_ms`.
    pub fn pop_due(&mut self, now_ms: u64) -> Vec<RetryTicket> {
        let mut due = Vec::new();
        self.tickets.retain(|t| {
            if t.due_ms <= now_ms {
                due.push(t.clone());
                false
            } else {
                true
            }
        });
        due
    }

    /// Interval for the attempt after this ticket, doubled under
    /// exponential backoff and capped.
    pub fn next_interval(&self, ticket: &RetryTicket) -> Duration {
        if ticket.exp_backoff {
            (ticket.interval * 2).min(self.max_interval)
        } else {
            ticket.interval
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }
}
