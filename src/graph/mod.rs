//! In-memory graph of key-value nodes with typed edges.
//!
//! Provides:
//! - `Graph` - shared store with copy-on-write state
//! - `GraphSnapshot` - immutable read view (released on drop)
//! - `GraphWriter` - single mutable transaction, published by `save`
//!
//! Readers clone an `Arc` of the whole state and never block the writer;
//! the writer clones the node map (cheap, nodes are `Arc`ed) and swaps it
//! in atomically on save. Every save records a monotonic sequence number
//! and appends to the per-key timeline.

pub mod flags;
pub mod node;
pub mod record;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

pub use flags::{Flag, FlagKind, Flags, LastChangeFlag, LastUpdateFlag};
pub use node::{Node, Relation, RelationTarget};
pub use record::{FlagStats, RecordedFlag, RecordedNode};

type NodeMap = BTreeMap<String, Arc<Node>>;

#[derive(Clone, Default)]
struct GraphState {
    nodes: NodeMap,
    timelines: BTreeMap<String, Vec<RecordedNode>>,
    seq: u64,
}

/// Shared graph store. One writer at a time (enforced by the scheduler's
/// single worker thread); any number of concurrent readers.
#[derive(Default)]
pub struct Graph {
    state: RwLock<Arc<GraphState>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Immutable snapshot of the current state.
    pub fn read(&self) -> GraphSnapshot {
        let state = self
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        GraphSnapshot { state }
    }

    /// Mutable transaction over a private copy of the state. Nothing is
    /// visible to readers until `save`; dropping the writer discards it.
    pub fn write(&self) -> GraphWriter<'_> {
        let state = self.read().state.as_ref().clone();
        GraphWriter {
            graph: self,
            state,
            touched: BTreeSet::new(),
        }
    }
}

/// Immutable view of the graph at the moment `Graph::read` was called.
pub struct GraphSnapshot {
    state: Arc<GraphState>,
}

impl GraphSnapshot {
    pub fn get_node(&self, key: &str) -> Option<&Node> {
        self.state.nodes.get(key).map(|n| n.as_ref())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.state.nodes.values().map(|n| n.as_ref())
    }

    /// Nodes satisfying the given predicate, in key order.
    pub fn get_nodes(&self, filter: impl Fn(&Node) -> bool) -> Vec<&Node> {
        self.nodes().filter(|n| filter(n)).collect()
    }

    /// Ordered history of value/flag changes for one key, oldest first.
    pub fn get_node_timeline(&self, key: &str) -> Vec<RecordedNode> {
        self.state.timelines.get(key).cloned().unwrap_or_default()
    }

    /// State of the whole graph as of the given time.
    pub fn get_snapshot_at(&self, time_ms: u64) -> Vec<RecordedNode> {
        let mut out = Vec::new();
        for records in self.state.timelines.values() {
            if let Some(record) = records.iter().find(|r| r.covers(time_ms)) {
                out.push(record.clone());
            }
        }
        out
    }

    /// Flag occurrence counts across all timeline records (historical
    /// records included), restricted to keys accepted by the predicate.
    pub fn get_flag_stats(&self, kind: FlagKind, key_filter: impl Fn(&str) -> bool) -> FlagStats {
        let mut stats = FlagStats::default();
        for (key, records) in &self.state.timelines {
            if !key_filter(key) {
                continue;
            }
            for record in records {
                stats.account(record, kind);
            }
        }
        stats
    }

    /// Sequence number of the last saved write.
    pub fn seq(&self) -> u64 {
        self.state.seq
    }

    /// Keys of nodes whose dependency edges resolve to the given key.
    pub fn dependency_sources(&self, key: &str) -> Vec<String> {
        dependency_sources(&self.state.nodes, key)
    }
}

/// Mutable graph transaction.
pub struct GraphWriter<'a> {
    graph: &'a Graph,
    state: GraphState,
    touched: BTreeSet<String>,
}

impl GraphWriter<'_> {
    pub fn get_node(&self, key: &str) -> Option<&Node> {
        self.state.nodes.get(key).map(|n| n.as_ref())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.nodes.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.state.nodes.keys().map(|k| k.as_str())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.state.nodes.values().map(|n| n.as_ref())
    }

    /// Get-or-create the node for a key and mark it touched.
    pub fn set_node(&mut self, key: &str) -> &mut Node {
        self.touched.insert(key.to_string());
        let entry = self
            .state
            .nodes
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Node::new(key)));
        Arc::make_mut(entry)
    }

    /// Mutable access to an existing node, marking it touched.
    pub fn node_mut(&mut self, key: &str) -> Option<&mut Node> {
        if let Some(entry) = self.state.nodes.get_mut(key) {
            self.touched.insert(key.to_string());
            Some(Arc::make_mut(entry))
        } else {
            None
        }
    }

    pub fn remove_node(&mut self, key: &str) {
        if self.state.nodes.remove(key).is_some() {
            self.touched.insert(key.to_string());
        }
    }

    /// Insert a fully-formed node, replacing any existing one.
    pub fn put_node(&mut self, node: Node) {
        self.touched.insert(node.key.clone());
        self.state.nodes.insert(node.key.clone(), Arc::new(node));
    }

    /// Keys the given relation target resolves to, in key order.
    pub fn resolve_target(&self, target: &RelationTarget) -> Vec<String> {
        resolve_target_keys(&self.state.nodes, target)
    }

    /// Keys of nodes whose dependency edges resolve to the given key.
    pub fn dependency_sources(&self, key: &str) -> Vec<String> {
        dependency_sources(&self.state.nodes, key)
    }

    /// Concrete keys of the derived children of a node.
    pub fn derived_children(&self, key: &str) -> Vec<String> {
        match self.get_node(key) {
            Some(node) => node
                .target_keys(Relation::Derives)
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Publish the transaction: bump the write sequence, append timeline
    /// records for touched keys and swap the state in.
    pub fn save(mut self, now_ms: u64) -> u64 {
        self.state.seq += 1;
        let seq = self.state.seq;

        for key in std::mem::take(&mut self.touched) {
            let records = self.state.timelines.entry(key.clone()).or_default();
            if let Some(open) = records.iter_mut().rev().find(|r| r.until_ms.is_none()) {
                open.until_ms = Some(now_ms);
            }
            if let Some(node) = self.state.nodes.get(&key) {
                records.push(RecordedNode::from_node(node, now_ms));
            }
        }

        let mut guard = self
            .graph
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(self.state);
        seq
    }
}

fn resolve_target_keys(nodes: &NodeMap, target: &RelationTarget) -> Vec<String> {
    match (&target.key, &target.selector) {
        (Some(key), _) => {
            if nodes.contains_key(key) {
                vec![key.clone()]
            } else {
                Vec::new()
            }
        }
        (None, Some(selector)) => nodes
            .keys()
            .filter(|k| selector(k.as_str()))
            .cloned()
            .collect(),
        (None, None) => Vec::new(),
    }
}

fn dependency_sources(nodes: &NodeMap, key: &str) -> Vec<String> {
    let mut out = Vec::new();
    for (source, node) in nodes {
        if source == key {
            continue;
        }
        if node
            .relations(Relation::Dependency)
            .any(|t| t.matches(key))
        {
            out.push(source.clone());
        }
    }
    out
}
