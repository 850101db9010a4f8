//! Test value types.

use std::sync::Arc;

use crate::api::{KeyValuePair, Metadata, ValueRef};

/// A plain string payload, used for derived items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringValue(pub String);

/// An ordered list of item names; each item derives a `StringValue` under
/// `<base-key>/<item>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayValue(pub Vec<String>);

pub fn string_value(s: &str) -> ValueRef {
    Arc::new(StringValue(s.to_string()))
}

pub fn array_value(items: &[&str]) -> ValueRef {
    Arc::new(ArrayValue(items.iter().map(|s| s.to_string()).collect()))
}

/// `DerivedValues` builder for `ArrayValue` bases.
pub fn array_derived_values(key: &str, value: &ValueRef) -> Vec<KeyValuePair> {
    match value.as_any().downcast_ref::<ArrayValue>() {
        Some(array) => array
            .0
            .iter()
            .map(|item| KeyValuePair {
                key: format!("{key}/{item}"),
                value: Arc::new(StringValue(item.clone())),
            })
            .collect(),
        None => Vec::new(),
    }
}

/// Counting metadata handed out by the mock southbound; the integer grows
/// with every add, making re-creation cycles observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegerMeta(pub i64);

/// Downcast helper for `IntegerMeta` stored as opaque metadata.
pub fn integer_meta(metadata: &Metadata) -> Option<i64> {
    metadata.downcast_ref::<IntegerMeta>().map(|m| m.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_derives_one_value_per_item() {
        let base = array_value(&["item1", "item2"]);
        let derived = array_derived_values("c/base", &base);
        assert_eq!(derived.len(), 2);
        assert_eq!(derived[0].key, "c/base/item1");
        assert_eq!(derived[1].key, "c/base/item2");
        assert!(derived[0].value.equivalent(string_value("item1").as_ref()));
    }

    #[test]
    fn non_array_values_derive_nothing() {
        let value = string_value("flat");
        assert!(array_derived_values("k", &value).is_empty());
    }
}
