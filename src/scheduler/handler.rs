//! Defaulting wrapper over descriptor callbacks.
//!
//! Every access to a descriptor goes through this handler; absent
//! callbacks get a default: key label falls back to the key itself,
//! comparison to structural equality, add/modify/delete to an
//! *unimplemented* sentinel error, update to a silent no-op.

use std::sync::Arc;

use crate::api::{
    Dependency, KVDescriptor, KVWithMetadata, KeyValuePair, Metadata, SbError, ValueRef,
};
use crate::error::SchedulerError;

/// Handler for one (possibly absent) descriptor.
#[derive(Clone)]
pub struct DescriptorHandler {
    descriptor: Option<Arc<KVDescriptor>>,
}

impl DescriptorHandler {
    pub fn new(descriptor: Arc<KVDescriptor>) -> Self {
        DescriptorHandler {
            descriptor: Some(descriptor),
        }
    }

    /// Handler for keys without a registered descriptor: every operation
    /// is a no-op. Used for derived values tracked only in the graph.
    pub fn none() -> Self {
        DescriptorHandler { descriptor: None }
    }

    pub fn descriptor(&self) -> Option<&Arc<KVDescriptor>> {
        self.descriptor.as_ref()
    }

    pub fn name(&self) -> Option<&str> {
        self.descriptor.as_ref().map(|d| d.name.as_str())
    }

    pub fn with_metadata(&self) -> bool {
        self.descriptor.as_ref().is_some_and(|d| d.with_metadata)
    }

    /// By default the label of a key is the key itself.
    pub fn key_label(&self, key: &str) -> String {
        match self.descriptor.as_ref().and_then(|d| d.key_label.as_ref()) {
            Some(f) => f(key),
            None => key.to_string(),
        }
    }

    /// By default values are compared structurally.
    pub fn equivalent_values(&self, key: &str, v1: &ValueRef, v2: &ValueRef) -> bool {
        match self
            .descriptor
            .as_ref()
            .and_then(|d| d.value_comparator.as_ref())
        {
            Some(f) => f(key, v1, v2),
            None => v1.equivalent(v2.as_ref()),
        }
    }

    pub fn add(&self, key: &str, value: &ValueRef) -> Result<Option<Metadata>, SbError> {
        let Some(descriptor) = self.descriptor.as_ref() else {
            return Ok(None);
        };
        match descriptor.add.as_ref() {
            Some(f) => f(key, value).map_err(SbError::from),
            None => Err(Arc::new(SchedulerError::UnimplementedAdd)),
        }
    }

    pub fn modify(
        &self,
        key: &str,
        old_value: &ValueRef,
        new_value: &ValueRef,
        old_metadata: Option<Metadata>,
    ) -> Result<Option<Metadata>, SbError> {
        let Some(descriptor) = self.descriptor.as_ref() else {
            return Ok(old_metadata);
        };
        match descriptor.modify.as_ref() {
            Some(f) => f(key, old_value, new_value, old_metadata).map_err(SbError::from),
            None => Err(Arc::new(SchedulerError::UnimplementedModify)),
        }
    }

    /// By default any change can be applied with modify, without
    /// re-creation.
    pub fn modify_with_recreate(
        &self,
        key: &str,
        old_value: &ValueRef,
        new_value: &ValueRef,
        metadata: Option<&Metadata>,
    ) -> bool {
        match self
            .descriptor
            .as_ref()
            .and_then(|d| d.modify_with_recreate.as_ref())
        {
            Some(f) => f(key, old_value, new_value, metadata),
            None => false,
        }
    }

    pub fn delete(
        &self,
        key: &str,
        value: &ValueRef,
        metadata: Option<Metadata>,
    ) -> Result<(), SbError> {
        let Some(descriptor) = self.descriptor.as_ref() else {
            return Ok(());
        };
        match descriptor.delete.as_ref() {
            Some(f) => f(key, value, metadata).map_err(SbError::from),
            None => Err(Arc::new(SchedulerError::UnimplementedDelete)),
        }
    }

    /// Update is entirely optional; absent means nothing to do on a
    /// dependency change.
    pub fn update(
        &self,
        key: &str,
        value: &ValueRef,
        metadata: Option<Metadata>,
    ) -> Result<(), SbError> {
        match self.descriptor.as_ref().and_then(|d| d.update.as_ref()) {
            Some(f) => f(key, value, metadata).map_err(SbError::from),
            None => Ok(()),
        }
    }

    pub fn has_update(&self) -> bool {
        self.descriptor
            .as_ref()
            .is_some_and(|d| d.update.is_some())
    }

    /// Unimplemented-callback errors are never retriable; everything else
    /// is assumed retriable unless the descriptor says otherwise.
    pub fn retriable_failure(&self, err: &SbError) -> bool {
        if err
            .downcast_ref::<SchedulerError>()
            .is_some_and(SchedulerError::is_unimplemented)
        {
            return false;
        }
        match self
            .descriptor
            .as_ref()
            .and_then(|d| d.retriable_failure.as_ref())
        {
            Some(f) => f(err),
            None => true,
        }
    }

    pub fn dependencies(&self, key: &str, value: &ValueRef) -> Vec<Dependency> {
        match self
            .descriptor
            .as_ref()
            .and_then(|d| d.dependencies.as_ref())
        {
            Some(f) => f(key, value),
            None => Vec::new(),
        }
    }

    pub fn derived_values(&self, key: &str, value: &ValueRef) -> Vec<KeyValuePair> {
        match self
            .descriptor
            .as_ref()
            .and_then(|d| d.derived_values.as_ref())
        {
            Some(f) => f(key, value),
            None => Vec::new(),
        }
    }

    /// `None` means the descriptor is unable to dump (as opposed to an
    /// empty southbound).
    pub fn dump(
        &self,
        correlate: &[KVWithMetadata],
    ) -> Option<Result<Vec<KVWithMetadata>, SbError>> {
        let dump = self.descriptor.as_ref()?.dump.as_ref()?;
        Some(dump(correlate).map_err(SbError::from))
    }
}
