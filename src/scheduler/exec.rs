//! The apply engine.
//!
//! Walks ordered key-value changes, invoking descriptor callbacks and
//! mutating the graph after each step. The same machinery runs twice per
//! transaction: once in dry-run mode over a scratch copy of the graph to
//! produce the plan, and once for real. Dry runs assume every southbound
//! call succeeds.
//!
//! Responsibilities:
//! - add/modify/delete/update application with flag maintenance
//! - derived-value projection and diffing against existing children
//! - readiness checks with strongly-connected components treated as
//!   mutually satisfied
//! - dependency cascades: realizing previously-pending values and
//!   un-realizing values that lost a dependency
//! - best-effort revert of a partially executed transaction

use std::collections::BTreeMap;

use crate::api::{
    render_value, CancelToken, CommitOptions, Metadata, SbError, TxnOperation, ValueOrigin,
    ValueRef,
};
use crate::error::SchedulerError;
use crate::graph::{
    Flag, FlagKind, GraphWriter, LastChangeFlag, LastUpdateFlag, Node, Relation, RelationTarget,
};

use super::handler::DescriptorHandler;
use super::queue::KVChange;
use super::recorder::{RecordedOp, TxnType};
use super::registry::DescriptorRegistry;
use super::utils::KeySet;
use super::MetadataMap;

/// One applied operation, as needed for the record, the per-key error
/// report and the revert phase.
#[derive(Clone)]
pub(crate) struct AppliedOp {
    pub rec: RecordedOp,
    /// Graph node as it was before the operation (None if absent).
    pub prev_node: Option<Node>,
    pub prev_value: Option<ValueRef>,
    pub new_value: Option<ValueRef>,
    pub error: Option<SbError>,
    pub retriable: bool,
    /// A southbound call was actually made and succeeded.
    pub sb_done: bool,
}

pub(crate) struct ExecEngine<'a, 'g> {
    registry: &'a DescriptorRegistry,
    metadata_maps: BTreeMap<String, MetadataMap>,
    writer: GraphWriter<'g>,
    txn_seq: u64,
    now_ms: u64,
    dry_run: bool,
    in_revert: bool,
    applied: Vec<AppliedOp>,
}

impl<'a, 'g> ExecEngine<'a, 'g> {
    pub fn new(
        registry: &'a DescriptorRegistry,
        metadata_maps: BTreeMap<String, MetadataMap>,
        writer: GraphWriter<'g>,
        txn_seq: u64,
        now_ms: u64,
        dry_run: bool,
    ) -> Self {
        ExecEngine {
            registry,
            metadata_maps,
            writer,
            txn_seq,
            now_ms,
            dry_run,
            in_revert: false,
            applied: Vec::new(),
        }
    }

    pub fn finish(self) -> (GraphWriter<'g>, Vec<AppliedOp>) {
        (self.writer, self.applied)
    }

    /// Apply one root-level change request.
    pub fn apply_change(&mut self, change: &KVChange) -> Result<(), SbError> {
        let notified = change.origin == ValueOrigin::FromSB;
        match &change.value {
            None => self.apply_delete(&change.key, false, notified),
            Some(value) => self.apply_value(
                &change.key,
                value.clone(),
                change.origin,
                None,
                notified,
                change.metadata.clone(),
            ),
        }
    }

    /// Route a non-nil value to add or modify depending on the current
    /// node state.
    fn apply_value(
        &mut self,
        key: &str,
        value: ValueRef,
        origin: ValueOrigin,
        derived_of: Option<&str>,
        notified: bool,
        notified_meta: Option<Metadata>,
    ) -> Result<(), SbError> {
        let realized = self
            .writer
            .get_node(key)
            .map(|n| n.value.is_some() && !n.is_pending());
        match realized {
            Some(true) => self.apply_modify(key, value, origin, derived_of, notified, notified_meta),
            _ => self.apply_add(key, value, origin, derived_of, notified, notified_meta),
        }
    }

    fn apply_add(
        &mut self,
        key: &str,
        value: ValueRef,
        origin: ValueOrigin,
        derived_of: Option<&str>,
        notified: bool,
        notified_meta: Option<Metadata>,
    ) -> Result<(), SbError> {
        let handler = self.registry.handler_for_key(key);
        let prev_node = self.writer.get_node(key).cloned();
        let was_pending = prev_node.as_ref().is_some_and(Node::is_pending);
        let prev_origin = prev_node.as_ref().map_or(origin, Node::origin);
        let prev_value = prev_node.as_ref().and_then(|n| n.value.clone());
        let prev_rendered = prev_value.as_ref().map(render_value);
        let new_rendered = render_value(&value);

        let deps = handler.dependencies(key, &value);
        {
            let node = self.writer.set_node(key);
            node.value = Some(value.clone());
            node.flags.set(Flag::Origin(origin));
            match handler.name() {
                Some(name) => node.flags.set(Flag::Descriptor(name.to_string())),
                None => node.flags.unset(FlagKind::Descriptor),
            }
            if let Some(base) = derived_of {
                node.flags.set(Flag::Derived {
                    base_key: base.to_string(),
                });
            }
            node.targets.retain(|t| t.relation == Relation::Derives);
            node.targets
                .extend(deps.iter().map(RelationTarget::from_dependency));
        }

        if !notified && !self.is_node_ready(key) {
            let node = self.writer.set_node(key);
            node.flags.set(Flag::Pending);
            node.metadata = None;
            self.touch_last_update(key, Some(new_rendered.clone()));
            let rec = RecordedOp {
                operation: TxnOperation::Add,
                key: key.to_string(),
                derived: derived_of.is_some(),
                prev_value: prev_rendered,
                new_value: Some(new_rendered),
                prev_origin,
                new_origin: origin,
                is_pending: true,
                was_pending: false,
                is_revert: self.in_revert,
                error: None,
            };
            self.push_applied(rec, prev_node, prev_value, Some(value), None, false, false);
            return Ok(());
        }

        let result = if self.dry_run {
            Ok(None)
        } else if notified {
            Ok(notified_meta)
        } else {
            handler.add(key, &value)
        };
        let sb_called = !self.dry_run && !notified;

        match result {
            Ok(meta) => {
                let is_base = derived_of.is_none();
                {
                    let node = self.writer.set_node(key);
                    node.flags.unset(FlagKind::Pending);
                    node.flags.unset(FlagKind::Error);
                    node.metadata = if is_base { meta.clone() } else { None };
                }
                if is_base && !self.dry_run {
                    self.store_metadata(&handler, key, meta);
                }
                self.touch_last_update(key, Some(new_rendered.clone()));
                if is_base && prev_rendered.as_deref() != Some(new_rendered.as_str()) {
                    self.touch_last_change(key, prev_rendered.clone(), Some(new_rendered.clone()));
                }
                let rec = RecordedOp {
                    operation: TxnOperation::Add,
                    key: key.to_string(),
                    derived: derived_of.is_some(),
                    prev_value: prev_rendered,
                    new_value: Some(new_rendered),
                    prev_origin,
                    new_origin: origin,
                    is_pending: false,
                    was_pending,
                    is_revert: self.in_revert,
                    error: None,
                };
                self.push_applied(
                    rec,
                    prev_node,
                    prev_value.clone(),
                    Some(value.clone()),
                    None,
                    false,
                    sb_called,
                );

                let derived_err = self.apply_derived(key, &value, origin, notified);
                let dep_err = self.run_dep_updates(key, false);
                match derived_err.or(dep_err) {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }
            Err(err) => {
                {
                    let node = self.writer.set_node(key);
                    node.flags.set(Flag::Pending);
                    node.flags.set(Flag::Error(err.clone()));
                    node.metadata = None;
                }
                self.touch_last_update(key, Some(new_rendered.clone()));
                let retriable = handler.retriable_failure(&err);
                let rec = RecordedOp {
                    operation: TxnOperation::Add,
                    key: key.to_string(),
                    derived: derived_of.is_some(),
                    prev_value: prev_rendered,
                    new_value: Some(new_rendered),
                    prev_origin,
                    new_origin: origin,
                    is_pending: true,
                    was_pending,
                    is_revert: self.in_revert,
                    error: Some(err.to_string()),
                };
                self.push_applied(
                    rec,
                    prev_node,
                    prev_value,
                    Some(value),
                    Some(err.clone()),
                    retriable,
                    false,
                );
                Err(err)
            }
        }
    }

    fn apply_modify(
        &mut self,
        key: &str,
        new_value: ValueRef,
        origin: ValueOrigin,
        derived_of: Option<&str>,
        notified: bool,
        notified_meta: Option<Metadata>,
    ) -> Result<(), SbError> {
        let handler = self.registry.handler_for_key(key);
        let Some(prev_node) = self.writer.get_node(key).cloned() else {
            return self.apply_add(key, new_value, origin, derived_of, notified, notified_meta);
        };
        let Some(old_value) = prev_node.value.clone() else {
            return self.apply_add(key, new_value, origin, derived_of, notified, notified_meta);
        };

        if handler.equivalent_values(key, &old_value, &new_value) {
            // value unchanged; only refresh the origin if it moved
            if prev_node.origin() != origin {
                let node = self.writer.set_node(key);
                node.flags.set(Flag::Origin(origin));
                self.touch_last_update(key, Some(render_value(&new_value)));
            }
            return Ok(());
        }

        let metadata = prev_node.metadata.clone();
        if handler.modify_with_recreate(key, &old_value, &new_value, metadata.as_ref()) {
            self.apply_delete(key, true, notified)?;
            return self.apply_value(key, new_value, origin, derived_of, notified, notified_meta);
        }

        // dependency edges follow the new value
        let deps = handler.dependencies(key, &new_value);
        {
            let node = self.writer.set_node(key);
            node.targets.retain(|t| t.relation == Relation::Derives);
            node.targets
                .extend(deps.iter().map(RelationTarget::from_dependency));
        }

        if !notified && !self.is_node_ready(key) {
            // lost a dependency: take the value out of SB, keep the new
            // intent pending
            self.apply_delete(key, true, notified)?;
            let node = self.writer.set_node(key);
            node.value = Some(new_value);
            return Ok(());
        }

        let mut first_err: Option<SbError> = None;

        // children no longer derived by the new value go first
        let new_pairs = handler.derived_values(key, &new_value);
        let new_keys: KeySet = new_pairs.iter().map(|p| p.key.clone()).collect();
        for child in self.writer.derived_children(key) {
            if !new_keys.contains(&child) {
                if let Err(err) = self.apply_delete(&child, false, notified) {
                    first_err.get_or_insert(err);
                }
            }
        }

        let prev_rendered = render_value(&old_value);
        let new_rendered = render_value(&new_value);
        let result = if self.dry_run {
            Ok(metadata.clone())
        } else if notified {
            Ok(notified_meta)
        } else {
            handler.modify(key, &old_value, &new_value, metadata.clone())
        };
        let sb_called = !self.dry_run && !notified;
        let derived = derived_of.is_some() || prev_node.is_derived();
        let is_base = !derived;

        match result {
            Ok(new_meta) => {
                {
                    let node = self.writer.set_node(key);
                    node.value = Some(new_value.clone());
                    node.flags.unset(FlagKind::Error);
                    node.flags.set(Flag::Origin(origin));
                    if is_base {
                        node.metadata = new_meta.clone();
                    }
                }
                if is_base && !self.dry_run {
                    self.store_metadata(&handler, key, new_meta);
                }
                self.touch_last_update(key, Some(new_rendered.clone()));
                if is_base {
                    self.touch_last_change(
                        key,
                        Some(prev_rendered.clone()),
                        Some(new_rendered.clone()),
                    );
                }
                let rec = RecordedOp {
                    operation: TxnOperation::Modify,
                    key: key.to_string(),
                    derived,
                    prev_value: Some(prev_rendered),
                    new_value: Some(new_rendered),
                    prev_origin: prev_node.origin(),
                    new_origin: origin,
                    is_pending: false,
                    was_pending: false,
                    is_revert: self.in_revert,
                    error: None,
                };
                self.push_applied(
                    rec,
                    Some(prev_node),
                    Some(old_value),
                    Some(new_value.clone()),
                    None,
                    false,
                    sb_called,
                );

                if let Some(err) = self.run_dep_updates(key, true) {
                    first_err.get_or_insert(err);
                }
                if let Some(err) = self.apply_derived(key, &new_value, origin, notified) {
                    first_err.get_or_insert(err);
                }
                match first_err {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }
            Err(err) => {
                {
                    let node = self.writer.set_node(key);
                    node.value = Some(new_value.clone());
                    node.flags.set(Flag::Error(err.clone()));
                }
                self.touch_last_update(key, Some(new_rendered.clone()));
                let retriable = handler.retriable_failure(&err);
                let rec = RecordedOp {
                    operation: TxnOperation::Modify,
                    key: key.to_string(),
                    derived,
                    prev_value: Some(prev_rendered),
                    new_value: Some(new_rendered),
                    prev_origin: prev_node.origin(),
                    new_origin: origin,
                    is_pending: false,
                    was_pending: false,
                    is_revert: self.in_revert,
                    error: Some(err.to_string()),
                };
                self.push_applied(
                    rec,
                    Some(prev_node),
                    Some(old_value),
                    Some(new_value),
                    Some(err.clone()),
                    retriable,
                    false,
                );
                Err(err)
            }
        }
    }

    /// Delete a value from the southbound.
    ///
    /// With `to_pending` the value stays desired: the node keeps its value
    /// and turns pending (dependency lost, or the first half of a
    /// re-create). Otherwise the node is removed entirely.
    fn apply_delete(
        &mut self,
        key: &str,
        to_pending: bool,
        notified: bool,
    ) -> Result<(), SbError> {
        let Some(prev_node) = self.writer.get_node(key).cloned() else {
            return Ok(());
        };
        let was_realized = !prev_node.is_pending() && prev_node.value.is_some();
        let handler = self.registry.handler_for_key(key);
        let mut first_err: Option<SbError> = None;

        if was_realized {
            // stage the pending mark so dependents see this value going away
            {
                let node = self.writer.set_node(key);
                node.flags.set(Flag::Pending);
            }
            for source in self.writer.dependency_sources(key) {
                let skip = match self.writer.get_node(&source) {
                    Some(node) => node.is_pending() || node.origin() == ValueOrigin::FromSB,
                    None => true,
                };
                if skip {
                    continue;
                }
                if !self.is_node_ready_without(&source, key) {
                    if let Err(err) = self.apply_delete(&source, true, false) {
                        first_err.get_or_insert(err);
                    }
                }
            }
        }

        // derived children are owned by this value and go first
        for child in self.writer.derived_children(key) {
            if let Err(err) = self.apply_delete(&child, false, notified) {
                first_err.get_or_insert(err);
            }
        }

        let prev_value = prev_node.value.clone();
        let prev_rendered = prev_value.as_ref().map(render_value);
        let derived = prev_node.is_derived();
        let is_base = !derived;

        let mut sb_err: Option<SbError> = None;
        let invoke = was_realized && !self.dry_run && !notified;
        if invoke {
            if let Some(value) = prev_value.as_ref() {
                if let Err(err) = handler.delete(key, value, prev_node.metadata.clone()) {
                    sb_err = Some(err);
                }
            }
        }

        if let Some(err) = sb_err {
            // the value is still realized in SB; drop the staged pending mark
            {
                let node = self.writer.set_node(key);
                node.flags.unset(FlagKind::Pending);
                node.flags.set(Flag::Error(err.clone()));
            }
            self.touch_last_update(key, None);
            let retriable = handler.retriable_failure(&err);
            let rec = RecordedOp {
                operation: TxnOperation::Delete,
                key: key.to_string(),
                derived,
                prev_value: prev_rendered,
                new_value: None,
                prev_origin: prev_node.origin(),
                new_origin: prev_node.origin(),
                is_pending: to_pending,
                was_pending: false,
                is_revert: self.in_revert,
                error: Some(err.to_string()),
            };
            self.push_applied(
                rec,
                Some(prev_node),
                prev_value,
                None,
                Some(err.clone()),
                retriable,
                false,
            );
            return Err(err);
        }

        if is_base && was_realized && !self.dry_run {
            self.store_metadata(&handler, key, None);
        }

        if to_pending {
            let node = self.writer.set_node(key);
            node.flags.set(Flag::Pending);
            node.flags.unset(FlagKind::Error);
            node.metadata = None;
            self.touch_last_update(key, prev_rendered.clone());
        } else {
            self.writer.remove_node(key);
        }

        let rec = RecordedOp {
            operation: TxnOperation::Delete,
            key: key.to_string(),
            derived,
            prev_value: prev_rendered,
            new_value: None,
            prev_origin: prev_node.origin(),
            new_origin: prev_node.origin(),
            is_pending: to_pending,
            was_pending: !was_realized,
            is_revert: self.in_revert,
            error: None,
        };
        self.push_applied(
            rec,
            Some(prev_node),
            prev_value,
            None,
            None,
            false,
            invoke,
        );

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Project derived values of a freshly realized or modified base and
    /// apply additions/modifications of the children.
    fn apply_derived(
        &mut self,
        key: &str,
        value: &ValueRef,
        origin: ValueOrigin,
        notified: bool,
    ) -> Option<SbError> {
        let handler = self.registry.handler_for_key(key);
        let pairs = handler.derived_values(key, value);
        {
            let node = self.writer.set_node(key);
            node.targets.retain(|t| t.relation != Relation::Derives);
            node.targets
                .extend(pairs.iter().map(|p| RelationTarget::derives(p.key.clone())));
        }
        let mut first_err = None;
        for pair in pairs {
            if let Err(err) =
                self.apply_value(&pair.key, pair.value.clone(), origin, Some(key), notified, None)
            {
                first_err.get_or_insert(err);
            }
        }
        first_err
    }

    /// React to a change of `key`: realize previously-pending dependents
    /// whose dependencies are now satisfied, and (when the value changed)
    /// run the update callback of realized dependents.
    fn run_dep_updates(&mut self, key: &str, dep_value_changed: bool) -> Option<SbError> {
        let mut first_err = None;
        for source in self.writer.dependency_sources(key) {
            let snapshot = match self.writer.get_node(&source) {
                Some(node) => (
                    node.is_pending(),
                    node.value.clone(),
                    node.origin(),
                    node.derived_base().map(str::to_string),
                    node.error().is_some(),
                ),
                None => continue,
            };
            let (pending, value, origin, derived_base, has_error) = snapshot;
            if origin == ValueOrigin::FromSB {
                continue;
            }
            if pending {
                // nodes pending because their own SB operation failed are
                // handled by the retry path, not by dependency updates
                if has_error {
                    continue;
                }
                let Some(value) = value else { continue };
                if self.is_node_ready(&source) {
                    if let Err(err) = self.apply_value(
                        &source,
                        value,
                        origin,
                        derived_base.as_deref(),
                        false,
                        None,
                    ) {
                        first_err.get_or_insert(err);
                    }
                }
            } else if dep_value_changed {
                if let Some(err) = self.apply_dep_update(&source) {
                    first_err.get_or_insert(err);
                }
            }
        }
        first_err
    }

    /// Invoke the update callback of a realized value whose dependency
    /// changed while the value itself did not.
    fn apply_dep_update(&mut self, key: &str) -> Option<SbError> {
        let handler = self.registry.handler_for_key(key);
        if !handler.has_update() {
            return None;
        }
        let snapshot = match self.writer.get_node(key) {
            Some(node) => (
                node.value.clone(),
                node.metadata.clone(),
                node.is_derived(),
                node.origin(),
            ),
            None => return None,
        };
        let (Some(value), metadata, derived, origin) = snapshot else {
            return None;
        };
        let rendered = render_value(&value);

        let result = if self.dry_run {
            Ok(())
        } else {
            handler.update(key, &value, metadata)
        };
        match result {
            Ok(()) => {
                self.touch_last_update(key, Some(rendered.clone()));
                let rec = RecordedOp {
                    operation: TxnOperation::Update,
                    key: key.to_string(),
                    derived,
                    prev_value: Some(rendered.clone()),
                    new_value: Some(rendered),
                    prev_origin: origin,
                    new_origin: origin,
                    is_pending: false,
                    was_pending: false,
                    is_revert: self.in_revert,
                    error: None,
                };
                self.push_applied(rec, None, Some(value.clone()), Some(value), None, false, !self.dry_run);
                None
            }
            Err(err) => {
                {
                    let node = self.writer.set_node(key);
                    node.flags.set(Flag::Error(err.clone()));
                }
                let retriable = handler.retriable_failure(&err);
                let rec = RecordedOp {
                    operation: TxnOperation::Update,
                    key: key.to_string(),
                    derived,
                    prev_value: Some(rendered.clone()),
                    new_value: Some(rendered),
                    prev_origin: origin,
                    new_origin: origin,
                    is_pending: false,
                    was_pending: false,
                    is_revert: self.in_revert,
                    error: Some(err.to_string()),
                };
                self.push_applied(
                    rec,
                    None,
                    Some(value.clone()),
                    Some(value),
                    Some(err.clone()),
                    retriable,
                    false,
                );
                Some(err)
            }
        }
    }

    /// True if every dependency of the node resolves to a non-pending
    /// target, counting members of the node's strongly-connected component
    /// as satisfied.
    pub(crate) fn is_node_ready(&self, key: &str) -> bool {
        self.node_ready_impl(key, None)
    }

    /// Readiness as if `removed` were already gone, used while deciding
    /// which dependents a deletion un-realizes.
    fn is_node_ready_without(&self, key: &str, removed: &str) -> bool {
        self.node_ready_impl(key, Some(removed))
    }

    fn node_ready_impl(&self, key: &str, removed: Option<&str>) -> bool {
        let Some(node) = self.writer.get_node(key) else {
            return false;
        };
        // SB-owned values are trusted to exist
        if node.origin() == ValueOrigin::FromSB {
            return true;
        }
        let mut visited = KeySet::new();
        self.is_node_ready_rec(key, key, removed, &mut visited)
    }

    fn is_node_ready_rec(
        &self,
        src: &str,
        current: &str,
        removed: Option<&str>,
        visited: &mut KeySet,
    ) -> bool {
        let Some(node) = self.writer.get_node(current) else {
            return false;
        };
        let targets: Vec<RelationTarget> =
            node.relations(Relation::Dependency).cloned().collect();
        let mut cycle = false;
        visited.insert(current.to_string());

        for target in targets {
            let mut satisfied = false;
            for target_key in self.writer.resolve_target(&target) {
                if removed == Some(target_key.as_str()) {
                    continue;
                }
                let Some(target_node) = self.writer.get_node(&target_key) else {
                    continue;
                };
                if !target_node.is_pending() {
                    satisfied = true;
                    if current == src {
                        break;
                    }
                }
                // a back-edge to the source marks a strongly-connected
                // component, which counts as satisfied
                if target_key == src
                    || (!visited.contains(&target_key)
                        && self.is_node_ready_rec(src, &target_key, removed, visited))
                {
                    cycle = true;
                    satisfied = true;
                    break;
                }
            }
            if !satisfied {
                visited.remove(current);
                return false;
            }
        }

        visited.remove(current);
        current == src || cycle
    }

    /// Undo every successfully executed operation, in reverse order,
    /// best-effort. Failed inverse operations are recorded but do not
    /// cascade further.
    pub(crate) fn revert(&mut self, cancel: Option<&CancelToken>) {
        self.in_revert = true;

        // when the trigger was a failed modify, learn the actual SB state
        // of the key before inverting it
        let failed_modify = self
            .applied
            .iter()
            .rev()
            .find(|op| op.error.is_some())
            .filter(|op| op.rec.operation == TxnOperation::Modify)
            .map(|op| op.rec.key.clone());
        if let Some(key) = failed_modify.as_deref() {
            self.refresh_from_dump(key);
        }

        let to_invert: Vec<AppliedOp> = self
            .applied
            .iter()
            .filter(|op| !op.rec.is_revert)
            .filter(|op| op.rec.operation != TxnOperation::Update)
            .filter(|op| {
                op.error.is_none() || Some(op.rec.key.as_str()) == failed_modify.as_deref()
            })
            .cloned()
            .collect();

        for (idx, op) in to_invert.iter().enumerate().rev() {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                // stop after the op in flight; record the rest as cancelled
                for skipped in to_invert[..=idx].iter().rev() {
                    let mut rec = inverse_record(&skipped.rec);
                    rec.error = Some(SchedulerError::Cancelled.to_string());
                    self.push_applied(rec, None, None, None, None, false, false);
                }
                break;
            }
            self.invert_op(op);
        }

        // the failure that triggered the revert stays visible on its key
        let failures: Vec<(String, SbError)> = self
            .applied
            .iter()
            .filter(|op| !op.rec.is_revert)
            .filter_map(|op| op.error.clone().map(|e| (op.rec.key.clone(), e)))
            .collect();
        for (key, err) in failures {
            if let Some(node) = self.writer.node_mut(&key) {
                node.flags.set(Flag::Error(err));
            }
        }
    }

    fn invert_op(&mut self, op: &AppliedOp) {
        let key = op.rec.key.clone();
        let handler = self.registry.handler_for_key(&key);
        let current = self.writer.get_node(&key).cloned();
        let mut rec = inverse_record(&op.rec);
        let mut err: Option<SbError> = None;
        let mut restored_meta: Option<Metadata> =
            op.prev_node.as_ref().and_then(|n| n.metadata.clone());

        match op.rec.operation {
            TxnOperation::Add => {
                // inverse: delete what was added
                if op.sb_done && !self.dry_run {
                    if let Some(node) = current.as_ref() {
                        if let Some(value) = node.value.as_ref() {
                            if let Err(e) = handler.delete(&key, value, node.metadata.clone()) {
                                err = Some(e);
                            }
                        }
                    }
                }
            }
            TxnOperation::Delete => {
                // inverse: add back the pre-transaction value
                if op.sb_done && !self.dry_run {
                    if let Some(value) = op.prev_value.as_ref() {
                        match handler.add(&key, value) {
                            Ok(meta) => restored_meta = meta,
                            Err(e) => err = Some(e),
                        }
                    }
                }
            }
            TxnOperation::Modify => {
                // inverse: modify back to the pre-transaction value
                if op.sb_done && !self.dry_run {
                    if let (Some(from), Some(to)) = (op.new_value.as_ref(), op.prev_value.as_ref())
                    {
                        let meta = current.as_ref().and_then(|n| n.metadata.clone());
                        match handler.modify(&key, from, to, meta) {
                            Ok(meta) => restored_meta = meta,
                            Err(e) => err = Some(e),
                        }
                    }
                }
            }
            TxnOperation::Update => return,
        }

        match err {
            Some(e) => {
                if let Some(node) = self.writer.node_mut(&key) {
                    node.flags.set(Flag::Error(e.clone()));
                }
                rec.error = Some(e.to_string());
                self.push_applied(rec, current, None, None, Some(e), false, false);
            }
            None => {
                let sb_done = op.sb_done && !self.dry_run;
                match op.prev_node.clone() {
                    Some(mut prev) => {
                        let value_rendered = prev.value.as_ref().map(render_value);
                        prev.metadata = restored_meta.clone();
                        prev.flags.set(Flag::LastUpdate(LastUpdateFlag {
                            txn_seq: self.txn_seq,
                            value: value_rendered,
                            revert: true,
                        }));
                        let is_base = !prev.is_derived();
                        self.writer.put_node(prev);
                        if is_base && !self.dry_run {
                            self.store_metadata(&handler, &key, restored_meta);
                        }
                    }
                    None => {
                        self.writer.remove_node(&key);
                        if !self.dry_run {
                            self.store_metadata(&handler, &key, None);
                        }
                    }
                }
                self.push_applied(rec, current, None, None, None, false, sb_done);
            }
        }
    }

    /// Correlate one key against the descriptor's dump and update the
    /// graph to the actual SB state.
    fn refresh_from_dump(&mut self, key: &str) {
        let handler = self.registry.handler_for_key(key);
        let correlate = match self.writer.get_node(key) {
            Some(node) => match node.value.clone() {
                Some(value) => vec![crate::api::KVWithMetadata {
                    key: key.to_string(),
                    value,
                    metadata: node.metadata.clone(),
                    origin: node.origin(),
                }],
                None => Vec::new(),
            },
            None => Vec::new(),
        };
        let Some(Ok(dumped)) = handler.dump(&correlate) else {
            return;
        };
        match dumped.into_iter().find(|kv| kv.key == key) {
            Some(kv) => {
                let node = self.writer.set_node(key);
                node.value = Some(kv.value);
                node.metadata = kv.metadata;
                node.flags.unset(FlagKind::Pending);
            }
            None => {
                // the key is actually gone from SB
                let node = self.writer.set_node(key);
                node.metadata = None;
                node.flags.set(Flag::Pending);
            }
        }
    }

    /// Record the remaining root changes of a cancelled transaction.
    pub(crate) fn record_cancelled(&mut self, remaining: &[KVChange]) {
        for change in remaining {
            let operation = match (&change.value, self.writer.get_node(&change.key)) {
                (None, _) => TxnOperation::Delete,
                (Some(_), Some(node)) if node.value.is_some() && !node.is_pending() => {
                    TxnOperation::Modify
                }
                (Some(_), _) => TxnOperation::Add,
            };
            let err: SbError = std::sync::Arc::new(SchedulerError::Cancelled);
            let rec = RecordedOp {
                operation,
                key: change.key.clone(),
                derived: false,
                prev_value: None,
                new_value: change.value.as_ref().map(render_value),
                prev_origin: change.origin,
                new_origin: change.origin,
                is_pending: false,
                was_pending: false,
                is_revert: self.in_revert,
                error: Some(err.to_string()),
            };
            self.push_applied(rec, None, None, change.value.clone(), Some(err), false, false);
        }
    }

    fn touch_last_update(&mut self, key: &str, value: Option<String>) {
        let flag = Flag::LastUpdate(LastUpdateFlag {
            txn_seq: self.txn_seq,
            value,
            revert: self.in_revert,
        });
        if let Some(node) = self.writer.node_mut(key) {
            node.flags.set(flag);
        }
    }

    fn touch_last_change(&mut self, key: &str, prev: Option<String>, new: Option<String>) {
        let flag = Flag::LastChange(LastChangeFlag {
            txn_seq: self.txn_seq,
            prev_value: prev,
            new_value: new,
            time_ms: self.now_ms,
        });
        if let Some(node) = self.writer.node_mut(key) {
            node.flags.set(flag);
        }
    }

    fn store_metadata(&self, handler: &DescriptorHandler, key: &str, meta: Option<Metadata>) {
        if !handler.with_metadata() {
            return;
        }
        let Some(name) = handler.name() else {
            return;
        };
        let Some(map) = self.metadata_maps.get(name) else {
            return;
        };
        let label = handler.key_label(key);
        match meta {
            Some(meta) => map.insert(label, meta),
            None => map.remove(&label),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn push_applied(
        &mut self,
        rec: RecordedOp,
        prev_node: Option<Node>,
        prev_value: Option<ValueRef>,
        new_value: Option<ValueRef>,
        error: Option<SbError>,
        retriable: bool,
        sb_done: bool,
    ) {
        self.applied.push(AppliedOp {
            rec,
            prev_node,
            prev_value,
            new_value,
            error,
            retriable,
            sb_done,
        });
    }
}

/// Record skeleton for the inverse of an executed operation.
fn inverse_record(rec: &RecordedOp) -> RecordedOp {
    let operation = match rec.operation {
        TxnOperation::Add => TxnOperation::Delete,
        TxnOperation::Delete => TxnOperation::Add,
        other => other,
    };
    RecordedOp {
        operation,
        key: rec.key.clone(),
        derived: rec.derived,
        prev_value: rec.new_value.clone(),
        new_value: rec.prev_value.clone(),
        prev_origin: rec.new_origin,
        new_origin: rec.prev_origin,
        is_pending: false,
        was_pending: false,
        is_revert: true,
        error: None,
    }
}

/// Walk ordered root changes. On failure under revert semantics, undo the
/// executed prefix and stop. Returns true if the revert phase ran.
pub(crate) fn execute_ordered(
    engine: &mut ExecEngine<'_, '_>,
    ordered: &[KVChange],
    options: &CommitOptions,
    txn_type: TxnType,
) -> bool {
    for (idx, change) in ordered.iter().enumerate() {
        if options.is_cancelled() {
            engine.record_cancelled(&ordered[idx..]);
            if options.revert_on_failure && txn_type == TxnType::NbTransaction {
                engine.revert(options.cancel.as_ref());
                return true;
            }
            return false;
        }
        if engine.apply_change(change).is_err()
            && options.revert_on_failure
            && txn_type == TxnType::NbTransaction
        {
            engine.revert(options.cancel.as_ref());
            return true;
        }
    }
    false
}
