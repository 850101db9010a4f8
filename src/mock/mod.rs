//! Mock southbound and descriptors for tests and examples.
//!
//! Provides:
//! - `MockSouthbound` - records applied operations, stores realized
//!   values, injects planned failures
//! - `mock_descriptor` - wires a descriptor template to the mock SB
//! - string/array test values with a derived-values builder
//! - integer metadata allocated per add, so re-creations are observable

pub mod southbound;
pub mod values;

use std::sync::Arc;

use crate::api::{KVDescriptor, SbError};

pub use southbound::{MockError, MockOp, MockSouthbound, SbValue};
pub use values::{
    array_derived_values, array_value, integer_meta, string_value, ArrayValue, IntegerMeta,
    StringValue,
};

/// Wire a descriptor template to the mock southbound: add/modify/delete/
/// update/dump callbacks plus retriability classification. Dependencies,
/// derived values, re-create predicates and selectors stay as provided by
/// the template.
pub fn mock_descriptor(mut template: KVDescriptor, sb: &Arc<MockSouthbound>) -> KVDescriptor {
    let name = template.name.clone();
    let prefix = template.nb_key_prefix.clone();

    if template.key_label.is_none() {
        let prefix = prefix.clone();
        template.key_label = Some(Arc::new(move |key: &str| {
            key.strip_prefix(prefix.as_str()).unwrap_or(key).to_string()
        }));
    }

    let with_metadata = template.with_metadata;
    {
        let (sb, name, prefix) = (sb.clone(), name.clone(), prefix.clone());
        template.add = Some(Arc::new(move |key, value| {
            sb.handle_add(&name, &prefix, with_metadata, key, value)
        }));
    }
    {
        let (sb, name) = (sb.clone(), name.clone());
        template.modify = Some(Arc::new(move |key, _old, new, meta| {
            sb.handle_modify(&name, key, new, meta)
        }));
    }
    {
        let (sb, name) = (sb.clone(), name.clone());
        template.delete = Some(Arc::new(move |key, _value, _meta| {
            sb.handle_delete(&name, key)
        }));
    }
    {
        let (sb, name) = (sb.clone(), name.clone());
        template.update = Some(Arc::new(move |key, value, _meta| {
            sb.handle_update(&name, key, value)
        }));
    }
    {
        let (sb, prefix) = (sb.clone(), prefix.clone());
        template.dump = Some(Arc::new(move |_correlate| Ok(sb.dump_prefix(&prefix))));
    }
    template.retriable_failure = Some(Arc::new(|err: &SbError| {
        err.downcast_ref::<MockError>().map_or(true, |e| e.retriable)
    }));

    template
}
