//! Strongly-connected components: mutually dependent values are parked
//! together and realized together.

mod common;

use std::sync::Arc;

use common::op_shapes;
use kvsched::config::Config;
use kvsched::mock::{mock_descriptor, string_value, MockSouthbound};
use kvsched::{CommitOptions, Dependency, KVDescriptor, Scheduler, TxnOperation, ValueRef};

/// `a/1 -> a/2 -> a/3 -> a/1`, plus `a/3 -> a/4`.
fn cycle_scheduler() -> (Scheduler, Arc<MockSouthbound>) {
    let sb = MockSouthbound::new();
    let scheduler = Scheduler::new(Config::default());
    let mut d = KVDescriptor::new("desc-cycle", "a/", "StringValue");
    d.dependencies = Some(Arc::new(|key: &str, _value: &ValueRef| match key {
        "a/1" => vec![Dependency::on_key("a/2")],
        "a/2" => vec![Dependency::on_key("a/3")],
        "a/3" => vec![Dependency::on_key("a/1"), Dependency::on_key("a/4")],
        _ => Vec::new(),
    }));
    scheduler
        .register_kv_descriptor(mock_descriptor(d, &sb))
        .expect("register");
    (scheduler, sb)
}

#[test]
fn cycle_with_an_unmet_external_dependency_stays_parked() {
    let (scheduler, sb) = cycle_scheduler();

    let mut txn = scheduler.start_nb_transaction();
    txn.set_value("a/1", string_value("1"));
    txn.set_value("a/2", string_value("2"));
    txn.set_value("a/3", string_value("3"));
    let result = txn.commit(CommitOptions::new()).expect("commit");
    assert!(result.kv_errors.is_empty());

    // a/3 waits for a/4, which drags the whole component down
    assert!(sb.pop_history().is_empty());
    let pending: Vec<String> = scheduler
        .get_pending_values(None)
        .into_iter()
        .map(|kv| kv.key)
        .collect();
    assert_eq!(pending, vec!["a/1", "a/2", "a/3"]);

    let recorded = scheduler
        .get_recorded_transaction(result.seq_num)
        .expect("recorded");
    for op in &recorded.executed {
        assert_eq!(op.operation, TxnOperation::Add);
        assert!(op.is_pending);
        assert!(op.error.is_none());
    }
}

#[test]
fn adding_the_external_dependency_realizes_the_whole_component() {
    let (scheduler, sb) = cycle_scheduler();

    let mut txn = scheduler.start_nb_transaction();
    txn.set_value("a/1", string_value("1"));
    txn.set_value("a/2", string_value("2"));
    txn.set_value("a/3", string_value("3"));
    txn.commit(CommitOptions::new()).expect("commit");
    sb.pop_history();

    let mut txn = scheduler.start_nb_transaction();
    txn.set_value("a/4", string_value("4"));
    let result = txn.commit(CommitOptions::new()).expect("commit");
    assert!(result.kv_errors.is_empty());

    let ops = sb.pop_history();
    let keys: Vec<String> = ops.iter().map(|op| op.key.clone()).collect();
    assert_eq!(keys, vec!["a/4", "a/3", "a/2", "a/1"]);
    assert!(ops.iter().all(|op| op.op == TxnOperation::Add));
    assert!(scheduler.get_pending_values(None).is_empty());

    let recorded = scheduler
        .get_recorded_transaction(result.seq_num)
        .expect("recorded");
    assert_eq!(
        op_shapes(&recorded.executed),
        vec![
            (TxnOperation::Add, "a/4", false, false, false, false),
            (TxnOperation::Add, "a/3", false, false, true, false),
            (TxnOperation::Add, "a/2", false, false, true, false),
            (TxnOperation::Add, "a/1", false, false, true, false),
        ]
    );
}

#[test]
fn deleting_one_member_unrealizes_its_dependents() {
    let (scheduler, sb) = cycle_scheduler();

    let mut txn = scheduler.start_nb_transaction();
    txn.set_value("a/1", string_value("1"));
    txn.set_value("a/2", string_value("2"));
    txn.set_value("a/3", string_value("3"));
    txn.set_value("a/4", string_value("4"));
    txn.commit(CommitOptions::new()).expect("commit");
    sb.pop_history();

    let mut txn = scheduler.start_nb_transaction();
    txn.delete_value("a/2");
    let result = txn.commit(CommitOptions::new()).expect("commit");
    assert!(result.kv_errors.is_empty());

    // a/1 depends on a/2 directly, a/3 through a/1; the deepest
    // dependent goes first
    let ops = sb.pop_history();
    let keys: Vec<(TxnOperation, String)> =
        ops.iter().map(|op| (op.op, op.key.clone())).collect();
    assert_eq!(
        keys,
        vec![
            (TxnOperation::Delete, "a/3".to_string()),
            (TxnOperation::Delete, "a/1".to_string()),
            (TxnOperation::Delete, "a/2".to_string()),
        ]
    );
    let pending: Vec<String> = scheduler
        .get_pending_values(None)
        .into_iter()
        .map(|kv| kv.key)
        .collect();
    assert_eq!(pending, vec!["a/1", "a/3"]);
    assert!(sb.get_value("a/4").is_some());
}
