//! Transaction planning.
//!
//! Resolves requested changes against registered descriptors, orders them
//! (removals in reverse dependency order first, then additions and
//! modifications in dependency order, lexicographic ties) and produces
//! the planned operation list by dry-running the apply engine over a
//! scratch copy of the graph.

use std::collections::BTreeMap;

use crate::api::CommitOptions;
use crate::graph::{Graph, GraphSnapshot};

use super::exec::{execute_ordered, ExecEngine};
use super::queue::KVChange;
use super::recorder::{RecordedKeyError, RecordedOp, TxnType};
use super::registry::DescriptorRegistry;
use super::utils::{topological_order, DepMap, KeySet};

/// Keys of NB changes without a registered descriptor; such a transaction
/// fails before anything executes.
pub(crate) fn resolve_changes(
    registry: &DescriptorRegistry,
    changes: &[KVChange],
) -> Vec<RecordedKeyError> {
    let mut pre_errors = Vec::new();
    for change in changes {
        if change.value.is_none() {
            // deletions of unknown keys are silently ignored later
            continue;
        }
        if registry.descriptor_for_key(&change.key).is_none() {
            pre_errors.push(RecordedKeyError {
                key: change.key.clone(),
                error: crate::error::SchedulerError::UnknownKey {
                    key: change.key.clone(),
                }
                .to_string(),
            });
        }
    }
    pre_errors
}

/// Order root changes for execution.
pub(crate) fn order_changes(
    registry: &DescriptorRegistry,
    snapshot: &GraphSnapshot,
    changes: &[KVChange],
) -> Vec<KVChange> {
    // last request per key wins
    let mut by_key: BTreeMap<String, KVChange> = BTreeMap::new();
    for change in changes {
        by_key.insert(change.key.clone(), change.clone());
    }

    let removal_keys: KeySet = by_key
        .values()
        .filter(|c| c.value.is_none())
        .map(|c| c.key.clone())
        .collect();
    let change_keys: KeySet = by_key
        .values()
        .filter(|c| c.value.is_some())
        .map(|c| c.key.clone())
        .collect();

    // removals: dependents first, using the edges of the current graph
    let mut removal_deps = DepMap::new();
    for key in &removal_keys {
        for source in snapshot.dependency_sources(key) {
            if removal_keys.contains(&source) {
                removal_deps.entry(source).or_default().insert(key.clone());
            }
        }
    }
    let removal_order = ordered_or_sorted(&removal_keys, &removal_deps, false);

    // additions/modifications: dependencies first, using the edges the new
    // values will have
    let mut change_deps = DepMap::new();
    for key in &change_keys {
        let change = &by_key[key];
        let Some(value) = change.value.as_ref() else {
            continue;
        };
        let handler = registry.handler_for_key(key);
        for dep in handler.dependencies(key, value) {
            match (&dep.key, &dep.any_of) {
                (Some(target), _) => {
                    change_deps
                        .entry(key.clone())
                        .or_default()
                        .insert(target.clone());
                }
                (None, Some(selector)) => {
                    for other in change_keys.iter().filter(|k| selector(k)) {
                        change_deps
                            .entry(key.clone())
                            .or_default()
                            .insert(other.clone());
                    }
                }
                (None, None) => {}
            }
        }
    }
    let change_order = ordered_or_sorted(&change_keys, &change_deps, true);

    removal_order
        .into_iter()
        .chain(change_order)
        .filter_map(|key| by_key.get(&key).cloned())
        .collect()
}

fn ordered_or_sorted(keys: &KeySet, deps: &DepMap, dep_first: bool) -> Vec<String> {
    topological_order(keys, deps, dep_first, true)
        .unwrap_or_else(|_| keys.iter().cloned().collect())
}

/// Compute the planned operation list by executing the ordered changes
/// against a scratch copy of the graph with every southbound call assumed
/// successful.
pub(crate) fn plan(
    registry: &DescriptorRegistry,
    graph: &Graph,
    ordered: &[KVChange],
    txn_type: TxnType,
    txn_seq: u64,
    now_ms: u64,
) -> Vec<RecordedOp> {
    let writer = graph.write();
    let mut engine = ExecEngine::new(registry, BTreeMap::new(), writer, txn_seq, now_ms, true);
    // a dry run cannot fail, so revert/cancellation options are irrelevant
    execute_ordered(&mut engine, ordered, &CommitOptions::new(), txn_type);
    let (_scratch, applied) = engine.finish();
    applied.into_iter().map(|op| op.rec).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Dependency, KVDescriptor, ValueOrigin, ValueRef};
    use std::sync::Arc;

    fn val(s: &str) -> ValueRef {
        Arc::new(s.to_string())
    }

    fn change(key: &str, value: Option<&str>) -> KVChange {
        KVChange {
            key: key.to_string(),
            value: value.map(val),
            origin: ValueOrigin::FromNB,
            metadata: None,
        }
    }

    fn registry_with_dep() -> DescriptorRegistry {
        let mut registry = DescriptorRegistry::new();
        registry
            .register(KVDescriptor::new("a", "a/", "T"))
            .unwrap();
        let mut b = KVDescriptor::new("b", "b/", "T");
        b.dependencies = Some(Arc::new(|key: &str, _value: &ValueRef| {
            if key == "b/x" {
                vec![Dependency::on_key("a/y")]
            } else {
                Vec::new()
            }
        }));
        registry.register(b).unwrap();
        registry
    }

    #[test]
    fn additions_follow_their_dependencies() {
        let registry = registry_with_dep();
        let graph = Graph::new();
        let ordered = order_changes(
            &registry,
            &graph.read(),
            &[change("b/x", Some("1")), change("a/y", Some("2"))],
        );
        let keys: Vec<&str> = ordered.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["a/y", "b/x"]);
    }

    #[test]
    fn removals_run_before_additions() {
        let registry = registry_with_dep();
        let graph = Graph::new();
        let ordered = order_changes(
            &registry,
            &graph.read(),
            &[change("a/y", Some("2")), change("a/z", None)],
        );
        let keys: Vec<&str> = ordered.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["a/z", "a/y"]);
    }

    #[test]
    fn unknown_descriptor_is_a_pre_error() {
        let registry = registry_with_dep();
        let errors = resolve_changes(&registry, &[change("nowhere/x", Some("1"))]);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].key, "nowhere/x");
    }

    #[test]
    fn duplicate_keys_keep_the_last_request() {
        let registry = registry_with_dep();
        let graph = Graph::new();
        let ordered = order_changes(
            &registry,
            &graph.read(),
            &[change("a/y", Some("old")), change("a/y", Some("new"))],
        );
        assert_eq!(ordered.len(), 1);
        assert_eq!(
            ordered[0].value.as_ref().map(crate::api::render_value),
            Some("\"new\"".to_string())
        );
    }
}
