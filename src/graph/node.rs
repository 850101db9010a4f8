//! Graph nodes and typed relation targets.

use std::fmt;

use crate::api::{Dependency, KeySelector, Metadata, SbError, ValueOrigin, ValueRef};

use super::flags::{Flag, FlagKind, Flags, LastChangeFlag, LastUpdateFlag};

/// Relation carried by an outgoing edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Relation {
    /// Source requires target to exist and be non-pending.
    Dependency,
    /// Source owns target; target was produced by `DerivedValues`.
    Derives,
}

/// One outgoing edge. Either a concrete target key or a selector matched
/// against the current key set at evaluation time.
#[derive(Clone)]
pub struct RelationTarget {
    pub relation: Relation,
    pub label: String,
    pub key: Option<String>,
    pub selector: Option<KeySelector>,
}

impl RelationTarget {
    pub fn from_dependency(dep: &Dependency) -> Self {
        RelationTarget {
            relation: Relation::Dependency,
            label: dep.label.clone(),
            key: dep.key.clone(),
            selector: dep.any_of.clone(),
        }
    }

    pub fn derives(key: impl Into<String>) -> Self {
        let key = key.into();
        RelationTarget {
            relation: Relation::Derives,
            label: key.clone(),
            key: Some(key),
            selector: None,
        }
    }

    /// True if the target resolves to the given key.
    pub fn matches(&self, key: &str) -> bool {
        match (&self.key, &self.selector) {
            (Some(target), _) => target == key,
            (None, Some(selector)) => selector(key),
            (None, None) => false,
        }
    }
}

impl fmt::Debug for RelationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationTarget")
            .field("relation", &self.relation)
            .field("label", &self.label)
            .field("key", &self.key)
            .field("selector", &self.selector.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// One graph vertex per key: value, metadata, flags and outgoing edges.
#[derive(Clone)]
pub struct Node {
    pub key: String,
    pub value: Option<ValueRef>,
    pub metadata: Option<Metadata>,
    pub flags: Flags,
    pub targets: Vec<RelationTarget>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("metadata", &self.metadata.as_ref().map(|_| "<opaque>"))
            .field("flags", &self.flags)
            .field("targets", &self.targets)
            .finish()
    }
}

impl Node {
    pub fn new(key: impl Into<String>) -> Self {
        Node {
            key: key.into(),
            value: None,
            metadata: None,
            flags: Flags::default(),
            targets: Vec::new(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.flags.has(FlagKind::Pending)
    }

    pub fn is_derived(&self) -> bool {
        self.flags.has(FlagKind::Derived)
    }

    pub fn derived_base(&self) -> Option<&str> {
        match self.flags.get(FlagKind::Derived) {
            Some(Flag::Derived { base_key }) => Some(base_key),
            _ => None,
        }
    }

    pub fn origin(&self) -> ValueOrigin {
        match self.flags.get(FlagKind::Origin) {
            Some(Flag::Origin(origin)) => *origin,
            _ => ValueOrigin::Unknown,
        }
    }

    pub fn descriptor(&self) -> Option<&str> {
        match self.flags.get(FlagKind::Descriptor) {
            Some(Flag::Descriptor(name)) => Some(name),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<SbError> {
        match self.flags.get(FlagKind::Error) {
            Some(Flag::Error(err)) => Some(err.clone()),
            _ => None,
        }
    }

    pub fn last_update(&self) -> Option<&LastUpdateFlag> {
        match self.flags.get(FlagKind::LastUpdate) {
            Some(Flag::LastUpdate(flag)) => Some(flag),
            _ => None,
        }
    }

    pub fn last_change(&self) -> Option<&LastChangeFlag> {
        match self.flags.get(FlagKind::LastChange) {
            Some(Flag::LastChange(flag)) => Some(flag),
            _ => None,
        }
    }

    /// Keys of edges with the given relation that resolve to a concrete
    /// target key (selector edges are resolved by the graph, which knows
    /// the current key set).
    pub fn target_keys(&self, relation: Relation) -> impl Iterator<Item = &str> {
        self.targets
            .iter()
            .filter(move |t| t.relation == relation)
            .filter_map(|t| t.key.as_deref())
    }

    /// Outgoing edges of the given relation.
    pub fn relations(&self, relation: Relation) -> impl Iterator<Item = &RelationTarget> {
        self.targets.iter().filter(move |t| t.relation == relation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::prefix_selector;

    #[test]
    fn selector_target_matches_at_evaluation_time() {
        let target = RelationTarget {
            relation: Relation::Dependency,
            label: "any-iface".into(),
            key: None,
            selector: Some(prefix_selector("iface/")),
        };
        assert!(target.matches("iface/eth0"));
        assert!(!target.matches("route/r1"));
    }

    #[test]
    fn derived_base_reads_flag() {
        let mut node = Node::new("iface/eth0/addr");
        node.flags.set(Flag::Derived {
            base_key: "iface/eth0".into(),
        });
        assert_eq!(node.derived_base(), Some("iface/eth0"));
    }
}
