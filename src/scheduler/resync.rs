//! Resync: correlating desired state with the actual southbound.
//!
//! A resync transaction first refreshes the graph from descriptor dumps
//! (in dump-dependency order), then runs a reconciling change set through
//! the ordinary planning/execution path. The value comparator keeps the
//! resulting plan minimal: values already matching are left alone.

use std::collections::BTreeMap;

use tracing::warn;

use crate::api::{KVWithMetadata, ValueOrigin, ValueRef};
use crate::graph::{Flag, FlagKind, GraphWriter, RelationTarget};

use super::handler::DescriptorHandler;
use super::queue::KVChange;
use super::registry::DescriptorRegistry;
use super::utils::KeySet;
use super::MetadataMap;

/// NB intent captured before a refresh overwrites graph values with the
/// dumped SB state.
pub(crate) fn capture_nb_intent(writer: &GraphWriter<'_>) -> BTreeMap<String, ValueRef> {
    let mut intent = BTreeMap::new();
    for node in writer.nodes() {
        if node.is_derived() || node.origin() != ValueOrigin::FromNB {
            continue;
        }
        if let Some(value) = node.value.clone() {
            intent.insert(node.key.clone(), value);
        }
    }
    intent
}

/// Refresh the graph to mirror the southbound: dump every descriptor able
/// to dump, correlate against the scheduler's current view, update values
/// and metadata, and drop realized nodes the southbound no longer has.
pub(crate) fn refresh_graph(
    registry: &DescriptorRegistry,
    metadata_maps: &BTreeMap<String, MetadataMap>,
    writer: &mut GraphWriter<'_>,
) {
    for descriptor in registry.dump_order() {
        if descriptor.dump.is_none() {
            continue;
        }
        let handler = DescriptorHandler::new(descriptor.clone());
        let name = descriptor.name.as_str();

        let correlate: Vec<KVWithMetadata> = writer
            .nodes()
            .filter(|n| n.descriptor() == Some(name) && !n.is_pending() && !n.is_derived())
            .filter_map(|n| {
                n.value.clone().map(|value| KVWithMetadata {
                    key: n.key.clone(),
                    value,
                    metadata: n.metadata.clone(),
                    origin: n.origin(),
                })
            })
            .collect();

        let dumped = match handler.dump(&correlate) {
            Some(Ok(dumped)) => dumped,
            Some(Err(err)) => {
                warn!(descriptor = name, error = %err, "southbound dump failed, skipping refresh");
                continue;
            }
            None => continue,
        };

        let known: KeySet = correlate.iter().map(|kv| kv.key.clone()).collect();
        let mut seen = KeySet::new();
        for kv in dumped {
            seen.insert(kv.key.clone());
            refresh_node(registry, metadata_maps, writer, &handler, kv);
        }

        // realized values the southbound no longer has
        for key in known.difference(&seen) {
            for child in writer.derived_children(key) {
                writer.remove_node(&child);
            }
            writer.remove_node(key);
            if handler.with_metadata() {
                if let Some(map) = metadata_maps.get(name) {
                    map.remove(&handler.key_label(key));
                }
            }
        }
    }
}

fn refresh_node(
    registry: &DescriptorRegistry,
    metadata_maps: &BTreeMap<String, MetadataMap>,
    writer: &mut GraphWriter<'_>,
    handler: &DescriptorHandler,
    kv: KVWithMetadata,
) {
    let deps = handler.dependencies(&kv.key, &kv.value);
    let pairs = handler.derived_values(&kv.key, &kv.value);
    let name = handler.name().map(str::to_string);

    {
        let node = writer.set_node(&kv.key);
        node.value = Some(kv.value.clone());
        node.metadata = kv.metadata.clone();
        node.flags.set(Flag::Origin(kv.origin));
        if let Some(name) = name.as_deref() {
            node.flags.set(Flag::Descriptor(name.to_string()));
        }
        node.flags.unset(FlagKind::Pending);
        node.targets = deps
            .iter()
            .map(RelationTarget::from_dependency)
            .chain(pairs.iter().map(|p| RelationTarget::derives(p.key.clone())))
            .collect();
    }

    if handler.with_metadata() {
        if let (Some(name), Some(meta)) = (name.as_deref(), kv.metadata.clone()) {
            if let Some(map) = metadata_maps.get(name) {
                map.insert(handler.key_label(&kv.key), meta);
            }
        }
    }

    // stale derived children disappear with their base's new value
    let fresh: KeySet = pairs.iter().map(|p| p.key.clone()).collect();
    for child in writer.derived_children(&kv.key) {
        if !fresh.contains(&child) {
            writer.remove_node(&child);
        }
    }
    for pair in pairs {
        let child_handler = registry.handler_for_key(&pair.key);
        let node = writer.set_node(&pair.key);
        node.value = Some(pair.value.clone());
        node.flags.set(Flag::Origin(kv.origin));
        node.flags.set(Flag::Derived {
            base_key: kv.key.clone(),
        });
        match child_handler.name() {
            Some(child_descriptor) => node
                .flags
                .set(Flag::Descriptor(child_descriptor.to_string())),
            None => node.flags.unset(FlagKind::Descriptor),
        }
        node.flags.unset(FlagKind::Pending);
        let child_deps = child_handler.dependencies(&pair.key, &pair.value);
        node.targets = child_deps
            .iter()
            .map(RelationTarget::from_dependency)
            .collect();
    }
}

/// Deletions reconciling the refreshed graph against the desired key set:
/// every base value not desired and not owned by the southbound goes.
pub(crate) fn resync_deletes(
    writer: &GraphWriter<'_>,
    desired: &KeySet,
) -> Vec<KVChange> {
    let mut deletes = Vec::new();
    for node in writer.nodes() {
        if node.is_derived() || node.value.is_none() {
            continue;
        }
        if node.origin() == ValueOrigin::FromSB {
            continue;
        }
        if desired.contains(&node.key) {
            continue;
        }
        deletes.push(KVChange {
            key: node.key.clone(),
            value: None,
            origin: ValueOrigin::FromNB,
            metadata: None,
        });
    }
    deletes
}
