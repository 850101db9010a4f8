//! Shared fixtures for the integration tests: a scheduler wired to the
//! mock southbound with three descriptors exercising derived values,
//! dependencies and re-creation.
#![allow(dead_code)]

use std::sync::Arc;

use kvsched::config::Config;
use kvsched::mock::{array_derived_values, mock_descriptor, MockSouthbound};
use kvsched::scheduler::recorder::RecordedOp;
use kvsched::{Dependency, KVDescriptor, Scheduler, TxnOperation, ValueRef};

pub const PREFIX_A: &str = "a/";
pub const PREFIX_B: &str = "b/";
pub const PREFIX_C: &str = "c/";

pub struct Fixture {
    pub scheduler: Scheduler,
    pub sb: Arc<MockSouthbound>,
}

/// Three descriptors:
/// - `desc-a` owns `a/`, derives one sub-value per array item
/// - `desc-b` owns `b/`; `b/base2/item1` depends on `a/base1`,
///   `b/base2/item2` depends on `a/base1/item1`
/// - `desc-c` owns `c/`; `c/base3` can only change by re-creation
pub fn three_descriptors() -> Fixture {
    let sb = MockSouthbound::new();
    let scheduler = Scheduler::new(Config::default());

    let mut a = KVDescriptor::new("desc-a", PREFIX_A, "ArrayValue");
    a.derived_values = Some(Arc::new(array_derived_values));
    a.with_metadata = true;
    scheduler
        .register_kv_descriptor(mock_descriptor(a, &sb))
        .expect("register desc-a");

    let mut b = KVDescriptor::new("desc-b", PREFIX_B, "ArrayValue");
    b.derived_values = Some(Arc::new(array_derived_values));
    b.dependencies = Some(Arc::new(|key: &str, _value: &ValueRef| match key {
        "b/base2/item1" => vec![Dependency::on_key("a/base1")],
        "b/base2/item2" => vec![Dependency::on_key("a/base1/item1")],
        _ => Vec::new(),
    }));
    b.with_metadata = true;
    b.dump_dependencies = vec!["desc-a".into()];
    scheduler
        .register_kv_descriptor(mock_descriptor(b, &sb))
        .expect("register desc-b");

    let mut c = KVDescriptor::new("desc-c", PREFIX_C, "ArrayValue");
    c.derived_values = Some(Arc::new(array_derived_values));
    c.modify_with_recreate = Some(Arc::new(|key: &str, _old, _new, _meta| key == "c/base3"));
    c.with_metadata = true;
    c.dump_dependencies = vec!["desc-b".into()];
    scheduler
        .register_kv_descriptor(mock_descriptor(c, &sb))
        .expect("register desc-c");

    Fixture { scheduler, sb }
}

/// Compact shape of a recorded operation for order assertions.
pub fn op_shape(op: &RecordedOp) -> (TxnOperation, &str, bool, bool, bool, bool) {
    (
        op.operation,
        op.key.as_str(),
        op.derived,
        op.is_pending,
        op.was_pending,
        op.is_revert,
    )
}

pub fn op_shapes(ops: &[RecordedOp]) -> Vec<(TxnOperation, &str, bool, bool, bool, bool)> {
    ops.iter().map(op_shape).collect()
}
