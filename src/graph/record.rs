//! Timeline records and flag statistics.
//!
//! Every graph write closes the open timeline record of each touched key
//! and appends a fresh one; deletions only close. Snapshots at a point in
//! time and flag statistics are both computed over these records.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::api::render_value;

use super::flags::FlagKind;
use super::node::Node;

/// Rendered form of one node flag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecordedFlag {
    pub name: String,
    pub value: String,
}

/// State of one key over the interval `[since_ms, until_ms)`.
///
/// `until_ms == None` marks the record still open (current state).
#[derive(Clone, Debug, Serialize)]
pub struct RecordedNode {
    pub key: String,
    pub value: Option<String>,
    pub flags: Vec<RecordedFlag>,
    pub since_ms: u64,
    pub until_ms: Option<u64>,
}

impl RecordedNode {
    pub fn from_node(node: &Node, since_ms: u64) -> Self {
        RecordedNode {
            key: node.key.clone(),
            value: node.value.as_ref().map(render_value),
            flags: node
                .flags
                .iter()
                .map(|f| RecordedFlag {
                    name: f.kind().name().to_string(),
                    value: f.value_label(),
                })
                .collect(),
            since_ms,
            until_ms: None,
        }
    }

    pub fn covers(&self, time_ms: u64) -> bool {
        self.since_ms <= time_ms && self.until_ms.map_or(true, |until| time_ms < until)
    }

    pub fn flag_value(&self, kind: FlagKind) -> Option<&str> {
        self.flags
            .iter()
            .find(|f| f.name == kind.name())
            .map(|f| f.value.as_str())
    }
}

/// Occurrence counts for one flag kind across all timeline records.
#[derive(Clone, Debug, Default, Serialize)]
pub struct FlagStats {
    pub total_count: u64,
    pub per_value_count: BTreeMap<String, u64>,
}

impl FlagStats {
    pub(crate) fn account(&mut self, record: &RecordedNode, kind: FlagKind) {
        if let Some(value) = record.flag_value(kind) {
            self.total_count += 1;
            if !value.is_empty() {
                *self.per_value_count.entry(value.to_string()).or_default() += 1;
            }
        }
    }
}
