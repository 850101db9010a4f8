//! Transaction recording.
//!
//! Every processed transaction leaves a record: requested values, the
//! planned operation list, the executed operation list with per-op errors
//! and revert marks, timing and sequencing. History is in-memory and
//! bounded by count and age.

use std::collections::VecDeque;

use serde::Serialize;

use crate::api::{ResyncType, TxnOperation, ValueOrigin};

/// Flavor of a processed transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TxnType {
    NbTransaction,
    SbNotification,
    RetryFailedOps,
}

/// One requested key-value change, rendered for the record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecordedKVPair {
    pub key: String,
    /// None records a requested deletion.
    pub value: Option<String>,
    pub origin: ValueOrigin,
}

/// Planning-phase error attached to a key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecordedKeyError {
    pub key: String,
    pub error: String,
}

/// One planned or executed operation.
#[derive(Clone, Debug, Serialize)]
pub struct RecordedOp {
    pub operation: TxnOperation,
    pub key: String,
    pub derived: bool,
    pub prev_value: Option<String>,
    pub new_value: Option<String>,
    pub prev_origin: ValueOrigin,
    pub new_origin: ValueOrigin,
    /// The operation left (or leaves) the value unrealized.
    pub is_pending: bool,
    /// The value had been waiting for its dependencies before this
    /// operation realized it.
    pub was_pending: bool,
    /// The operation undoes a previously executed one.
    pub is_revert: bool,
    pub error: Option<String>,
}

/// Full record of one transaction.
#[derive(Clone, Debug, Serialize)]
pub struct RecordedTxn {
    pub seq_num: u64,
    pub txn_type: TxnType,
    pub resync: ResyncType,
    pub with_revert: bool,
    pub start_ms: u64,
    pub stop_ms: u64,
    pub values: Vec<RecordedKVPair>,
    pub pre_errors: Vec<RecordedKeyError>,
    pub planned: Vec<RecordedOp>,
    pub executed: Vec<RecordedOp>,
}

/// Bounded in-memory transaction history.
pub struct TxnHistory {
    entries: VecDeque<RecordedTxn>,
    max_entries: usize,
    max_age_ms: u64,
}

impl TxnHistory {
    pub fn new(max_entries: usize, max_age_ms: u64) -> Self {
        TxnHistory {
            entries: VecDeque::new(),
            max_entries,
            max_age_ms,
        }
    }

    pub fn record(&mut self, txn: RecordedTxn, now_ms: u64) {
        self.entries.push_back(txn);
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
        while self
            .entries
            .front()
            .is_some_and(|t| t.stop_ms + self.max_age_ms < now_ms)
        {
            self.entries.pop_front();
        }
    }

    /// Records whose execution started inside the given window.
    pub fn get_history(&self, since_ms: Option<u64>, until_ms: Option<u64>) -> Vec<RecordedTxn> {
        self.entries
            .iter()
            .filter(|t| since_ms.map_or(true, |since| t.start_ms >= since))
            .filter(|t| until_ms.map_or(true, |until| t.start_ms <= until))
            .cloned()
            .collect()
    }

    pub fn get(&self, seq_num: u64) -> Option<RecordedTxn> {
        self.entries.iter().find(|t| t.seq_num == seq_num).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(seq: u64, start: u64, stop: u64) -> RecordedTxn {
        RecordedTxn {
            seq_num: seq,
            txn_type: TxnType::NbTransaction,
            resync: ResyncType::None,
            with_revert: false,
            start_ms: start,
            stop_ms: stop,
            values: Vec::new(),
            pre_errors: Vec::new(),
            planned: Vec::new(),
            executed: Vec::new(),
        }
    }

    #[test]
    fn history_is_bounded_by_count() {
        let mut history = TxnHistory::new(2, u64::MAX);
        history.record(txn(0, 0, 1), 1);
        history.record(txn(1, 2, 3), 3);
        history.record(txn(2, 4, 5), 5);
        assert_eq!(history.len(), 2);
        assert!(history.get(0).is_none());
        assert!(history.get(2).is_some());
    }

    #[test]
    fn history_is_bounded_by_age() {
        let mut history = TxnHistory::new(100, 1_000);
        history.record(txn(0, 0, 10), 10);
        history.record(txn(1, 5_000, 5_010), 5_010);
        assert_eq!(history.len(), 1);
        assert!(history.get(1).is_some());
    }

    #[test]
    fn window_filters_on_start_time() {
        let mut history = TxnHistory::new(100, u64::MAX);
        history.record(txn(0, 100, 110), 110);
        history.record(txn(1, 200, 210), 210);
        history.record(txn(2, 300, 310), 310);

        let window = history.get_history(Some(150), Some(250));
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].seq_num, 1);

        assert_eq!(history.get_history(None, None).len(), 3);
    }
}
