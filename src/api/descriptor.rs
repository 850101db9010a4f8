//! Descriptor contract.
//!
//! A descriptor teaches the scheduler how to realize key-value pairs from
//! its prefix in the southbound: create, modify, delete, dump, derive
//! sub-values and declare dependencies. All callbacks are optional; the
//! handler in `scheduler::handler` supplies defaults for absent ones.

use std::sync::Arc;

use super::value::{Metadata, ValueRef};
use super::{BoxError, KVWithMetadata, KeySelector, KeyValuePair, SbError};

pub type KeyLabelFn = Arc<dyn Fn(&str) -> String + Send + Sync>;
pub type ValueComparatorFn = Arc<dyn Fn(&str, &ValueRef, &ValueRef) -> bool + Send + Sync>;
pub type AddFn = Arc<dyn Fn(&str, &ValueRef) -> Result<Option<Metadata>, BoxError> + Send + Sync>;
pub type ModifyFn = Arc<
    dyn Fn(&str, &ValueRef, &ValueRef, Option<Metadata>) -> Result<Option<Metadata>, BoxError>
        + Send
        + Sync,
>;
pub type ModifyWithRecreateFn =
    Arc<dyn Fn(&str, &ValueRef, &ValueRef, Option<&Metadata>) -> bool + Send + Sync>;
pub type DeleteFn =
    Arc<dyn Fn(&str, &ValueRef, Option<Metadata>) -> Result<(), BoxError> + Send + Sync>;
pub type UpdateFn =
    Arc<dyn Fn(&str, &ValueRef, Option<Metadata>) -> Result<(), BoxError> + Send + Sync>;
pub type RetriableFn = Arc<dyn Fn(&SbError) -> bool + Send + Sync>;
pub type DependenciesFn = Arc<dyn Fn(&str, &ValueRef) -> Vec<Dependency> + Send + Sync>;
pub type DerivedValuesFn = Arc<dyn Fn(&str, &ValueRef) -> Vec<KeyValuePair> + Send + Sync>;
pub type DumpFn =
    Arc<dyn Fn(&[KVWithMetadata]) -> Result<Vec<KVWithMetadata>, BoxError> + Send + Sync>;

/// A single dependency declared for a key-value pair.
///
/// Either a concrete `key` must exist non-pending, or `any_of` must match
/// at least one non-pending node.
#[derive(Clone)]
pub struct Dependency {
    pub label: String,
    pub key: Option<String>,
    pub any_of: Option<KeySelector>,
}

impl Dependency {
    /// Dependency on one concrete key.
    pub fn on_key(key: impl Into<String>) -> Self {
        let key = key.into();
        Dependency {
            label: key.clone(),
            key: Some(key),
            any_of: None,
        }
    }

    /// Dependency satisfied by any key matched by the selector.
    pub fn on_any_of(label: impl Into<String>, selector: KeySelector) -> Self {
        Dependency {
            label: label.into(),
            key: None,
            any_of: Some(selector),
        }
    }
}

/// Descriptor: the plugin contract for one family of keys.
///
/// Construct with [`KVDescriptor::new`] and fill in the callbacks the
/// southbound driver actually supports.
#[derive(Clone)]
pub struct KVDescriptor {
    // NOTE: Debug is implemented manually below because several fields are
    // `Arc<dyn Fn(...)>` callbacks, which don't implement Debug.
    /// Unique descriptor name.
    pub name: String,
    /// Prefix of NB-configured keys owned by this descriptor.
    pub nb_key_prefix: String,
    /// Selects all keys (NB and derived) claimed by this descriptor.
    /// Defaults to a prefix match on `nb_key_prefix`.
    pub key_selector: Option<KeySelector>,
    /// Name of the value type, for introspection.
    pub value_type_name: String,

    pub key_label: Option<KeyLabelFn>,
    pub value_comparator: Option<ValueComparatorFn>,
    pub add: Option<AddFn>,
    pub modify: Option<ModifyFn>,
    pub modify_with_recreate: Option<ModifyWithRecreateFn>,
    pub delete: Option<DeleteFn>,
    pub update: Option<UpdateFn>,
    pub retriable_failure: Option<RetriableFn>,
    pub dependencies: Option<DependenciesFn>,
    pub derived_values: Option<DerivedValuesFn>,
    pub dump: Option<DumpFn>,

    /// Names of descriptors whose dump must run before this one's.
    pub dump_dependencies: Vec<String>,
    /// Whether the scheduler should maintain a metadata map for this
    /// descriptor's base values.
    pub with_metadata: bool,
}

impl std::fmt::Debug for KVDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KVDescriptor")
            .field("name", &self.name)
            .field("nb_key_prefix", &self.nb_key_prefix)
            .field("value_type_name", &self.value_type_name)
            .field("dump_dependencies", &self.dump_dependencies)
            .field("with_metadata", &self.with_metadata)
            .finish_non_exhaustive()
    }
}

impl KVDescriptor {
    pub fn new(
        name: impl Into<String>,
        nb_key_prefix: impl Into<String>,
        value_type_name: impl Into<String>,
    ) -> Self {
        KVDescriptor {
            name: name.into(),
            nb_key_prefix: nb_key_prefix.into(),
            key_selector: None,
            value_type_name: value_type_name.into(),
            key_label: None,
            value_comparator: None,
            add: None,
            modify: None,
            modify_with_recreate: None,
            delete: None,
            update: None,
            retriable_failure: None,
            dependencies: None,
            derived_values: None,
            dump: None,
            dump_dependencies: Vec::new(),
            with_metadata: false,
        }
    }

    /// True if the descriptor claims the given key.
    pub fn selects(&self, key: &str) -> bool {
        match &self.key_selector {
            Some(selector) => selector(key),
            None => key.starts_with(&self.nb_key_prefix),
        }
    }
}
