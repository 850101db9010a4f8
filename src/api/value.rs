//! Opaque value and metadata handles.
//!
//! The scheduler never interprets value contents; it only compares them
//! through the owning descriptor (or structural equality by default) and
//! renders them for transaction records.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// An opaque structured record realized in the southbound.
///
/// Any `PartialEq + Debug` type qualifies through the blanket impl below;
/// equivalence is "same concrete type and equal".
pub trait KvValue: fmt::Debug + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;

    /// Structural equality across type-erased values.
    fn equivalent(&self, other: &dyn KvValue) -> bool;
}

impl<T> KvValue for T
where
    T: PartialEq + fmt::Debug + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn equivalent(&self, other: &dyn KvValue) -> bool {
        other.as_any().downcast_ref::<T>() == Some(self)
    }
}

/// Shared handle to an opaque value.
pub type ValueRef = Arc<dyn KvValue>;

/// Opaque per-key auxiliary record, produced by a descriptor's add/modify
/// and consumed by subsequent modify/delete. Only base values carry one.
pub type Metadata = Arc<dyn Any + Send + Sync>;

/// Render a value for transaction records and timelines.
pub fn render_value(value: &ValueRef) -> String {
    format!("{:?}", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Payload(&'static str);

    #[derive(Debug, PartialEq)]
    struct Other(&'static str);

    #[test]
    fn equivalence_is_structural() {
        let a: ValueRef = Arc::new(Payload("x"));
        let b: ValueRef = Arc::new(Payload("x"));
        let c: ValueRef = Arc::new(Payload("y"));

        assert!(a.equivalent(b.as_ref()));
        assert!(!a.equivalent(c.as_ref()));
    }

    #[test]
    fn equivalence_requires_same_type() {
        let a: ValueRef = Arc::new(Payload("x"));
        let b: ValueRef = Arc::new(Other("x"));
        assert!(!a.equivalent(b.as_ref()));
    }

    #[test]
    fn rendering_uses_the_debug_form() {
        let a: ValueRef = Arc::new(Payload("x"));
        assert_eq!(render_value(&a), "Payload(\"x\")");
    }
}
