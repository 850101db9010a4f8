//! Resync: correlating NB intent with the dumped southbound state, and
//! SB notifications realizing parked values.

mod common;

use std::sync::Arc;

use common::three_descriptors;
use kvsched::config::Config;
use kvsched::mock::{array_value, mock_descriptor, string_value, MockSouthbound};
use kvsched::{CommitOptions, KVDescriptor, ResyncType, Scheduler, TxnOperation, ValueOrigin};

fn flat_scheduler() -> (Scheduler, Arc<MockSouthbound>) {
    let sb = MockSouthbound::new();
    let scheduler = Scheduler::new(Config::default());
    let d = KVDescriptor::new("desc-x", "x/", "StringValue");
    scheduler
        .register_kv_descriptor(mock_descriptor(d, &sb))
        .expect("register");
    (scheduler, sb)
}

#[test]
fn full_resync_reconciles_against_the_dumped_state() {
    let (scheduler, sb) = flat_scheduler();

    // the southbound already holds state nobody asked for
    sb.seed("x/stale", string_value("old"), ValueOrigin::Unknown);
    sb.seed("x/keep", string_value("v1"), ValueOrigin::Unknown);
    sb.seed("x/drift", string_value("v2-old"), ValueOrigin::Unknown);

    let mut txn = scheduler.start_nb_transaction();
    txn.set_value("x/keep", string_value("v1"));
    txn.set_value("x/drift", string_value("v2-new"));
    txn.set_value("x/missing", string_value("v3"));
    let result = txn
        .commit(CommitOptions::new().with_full_resync())
        .expect("resync commit");
    assert!(result.kv_errors.is_empty());

    let ops = sb.pop_history();
    let keys: Vec<(TxnOperation, String)> =
        ops.iter().map(|op| (op.op, op.key.clone())).collect();
    assert_eq!(
        keys,
        vec![
            (TxnOperation::Delete, "x/stale".to_string()),
            (TxnOperation::Modify, "x/drift".to_string()),
            (TxnOperation::Add, "x/missing".to_string()),
        ]
    );

    assert!(sb.get_value("x/stale").is_none());
    assert!(sb
        .get_value("x/keep")
        .expect("kept")
        .value
        .equivalent(string_value("v1").as_ref()));
    assert!(sb
        .get_value("x/drift")
        .expect("reconciled")
        .value
        .equivalent(string_value("v2-new").as_ref()));
    assert!(sb.get_value("x/missing").is_some());

    let recorded = scheduler
        .get_recorded_transaction(result.seq_num)
        .expect("recorded");
    assert_eq!(recorded.resync, ResyncType::Full);
}

#[test]
fn downstream_resync_repairs_southbound_drift() {
    let (scheduler, sb) = flat_scheduler();

    let mut txn = scheduler.start_nb_transaction();
    txn.set_value("x/a", string_value("intended"));
    txn.commit(CommitOptions::new()).expect("commit");
    sb.pop_history();

    // the southbound drifts behind the scheduler's back
    sb.seed("x/a", string_value("mangled"), ValueOrigin::FromNB);
    sb.seed("x/ghost", string_value("boo"), ValueOrigin::Unknown);

    let result = scheduler
        .start_nb_transaction()
        .commit(CommitOptions::new().with_downstream_resync())
        .expect("downstream resync");
    assert!(result.kv_errors.is_empty());

    let ops = sb.pop_history();
    let keys: Vec<(TxnOperation, String)> =
        ops.iter().map(|op| (op.op, op.key.clone())).collect();
    assert_eq!(
        keys,
        vec![
            (TxnOperation::Delete, "x/ghost".to_string()),
            (TxnOperation::Modify, "x/a".to_string()),
        ]
    );
    assert!(sb
        .get_value("x/a")
        .expect("repaired")
        .value
        .equivalent(string_value("intended").as_ref()));
    assert!(sb.get_value("x/ghost").is_none());
}

#[test]
fn downstream_resync_with_no_drift_is_a_no_op() {
    let (scheduler, sb) = flat_scheduler();

    let mut txn = scheduler.start_nb_transaction();
    txn.set_value("x/a", string_value("v"));
    txn.commit(CommitOptions::new()).expect("commit");
    sb.pop_history();

    scheduler
        .start_nb_transaction()
        .commit(CommitOptions::new().with_downstream_resync())
        .expect("downstream resync");
    assert!(sb.pop_history().is_empty());
}

#[test]
fn sb_notification_realizes_parked_dependents() {
    let fx = three_descriptors();

    // b/base2/item1 depends on a/base1, which nobody configures
    let mut txn = fx.scheduler.start_nb_transaction();
    txn.set_value("b/base2", array_value(&["item1"]));
    txn.commit(CommitOptions::new()).expect("commit");
    fx.sb.pop_history();
    assert_eq!(fx.scheduler.get_pending_values(None).len(), 1);

    // the southbound reports a/base1 appearing on its own
    fx.scheduler
        .push_sb_notification("a/base1", Some(array_value(&[])), None)
        .expect("notification");

    // the notification itself makes no SB call; the unparked dependent
    // does
    let ops = fx.sb.pop_history();
    let keys: Vec<(TxnOperation, String)> =
        ops.iter().map(|op| (op.op, op.key.clone())).collect();
    assert_eq!(
        keys,
        vec![(TxnOperation::Add, "b/base2/item1".to_string())]
    );
    assert!(fx.scheduler.get_pending_values(None).is_empty());

    // the SB-owned node is tracked with its origin
    let timeline = fx.scheduler.get_node_timeline("a/base1");
    let last = timeline.last().expect("record");
    let origin = last
        .flags
        .iter()
        .find(|f| f.name == "origin")
        .map(|f| f.value.clone());
    assert_eq!(origin.as_deref(), Some("from-SB"));
}
