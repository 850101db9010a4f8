//! Descriptor registry.
//!
//! Maps keys to their owning descriptor (first registered whose selector
//! matches) and orders descriptors for southbound dumps so that dump
//! dependencies are honored.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::api::KVDescriptor;
use crate::error::SchedulerError;

use super::handler::DescriptorHandler;
use super::utils::{topological_order, DepMap, KeySet};

#[derive(Default)]
pub struct DescriptorRegistry {
    /// Registration order decides key-resolution precedence.
    order: Vec<Arc<KVDescriptor>>,
    by_name: BTreeMap<String, Arc<KVDescriptor>>,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: KVDescriptor) -> Result<Arc<KVDescriptor>, SchedulerError> {
        if self.by_name.contains_key(&descriptor.name) {
            return Err(SchedulerError::DescriptorExists {
                name: descriptor.name,
            });
        }
        let descriptor = Arc::new(descriptor);
        self.order.push(descriptor.clone());
        self.by_name
            .insert(descriptor.name.clone(), descriptor.clone());
        Ok(descriptor)
    }

    pub fn get(&self, name: &str) -> Option<Arc<KVDescriptor>> {
        self.by_name.get(name).cloned()
    }

    /// Handler for the descriptor claiming the given key; a no-op handler
    /// when no descriptor matches.
    pub fn handler_for_key(&self, key: &str) -> DescriptorHandler {
        match self.descriptor_for_key(key) {
            Some(descriptor) => DescriptorHandler::new(descriptor),
            None => DescriptorHandler::none(),
        }
    }

    pub fn descriptor_for_key(&self, key: &str) -> Option<Arc<KVDescriptor>> {
        self.order.iter().find(|d| d.selects(key)).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<KVDescriptor>> {
        self.order.iter()
    }

    /// Descriptors ordered for dumping: a descriptor whose dump depends on
    /// another's is dumped after it.
    pub fn dump_order(&self) -> Vec<Arc<KVDescriptor>> {
        let names: KeySet = self.by_name.keys().cloned().collect();
        let mut deps = DepMap::new();
        for descriptor in &self.order {
            deps.insert(
                descriptor.name.clone(),
                descriptor.dump_dependencies.iter().cloned().collect(),
            );
        }
        // registered descriptors cannot cycle through dump dependencies in
        // any meaningful way; fall back to the cycle handling just in case
        let sorted = topological_order(&names, &deps, true, true).unwrap_or_default();
        sorted
            .into_iter()
            .filter_map(|name| self.by_name.get(&name).cloned())
            .collect()
    }
}
