//! Failure handling: revert, failed deletes, retries, cancellation and
//! error subscribers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::three_descriptors;
use kvsched::config::Config;
use kvsched::mock::{array_value, mock_descriptor, string_value, MockSouthbound};
use kvsched::{
    prefix_selector, CancelToken, CommitOptions, Dependency, KVDescriptor, Scheduler,
    TxnOperation, ValueRef,
};

#[test]
fn failed_modify_with_revert_restores_the_previous_state() {
    let fx = three_descriptors();

    let mut txn = fx.scheduler.start_nb_transaction();
    txn.set_value("a/base1", array_value(&["item1"]));
    txn.set_value("b/base2", array_value(&["item1"]));
    txn.commit(CommitOptions::new()).expect("initial commit");
    fx.sb.pop_history();

    let (err_tx, err_rx) = crossbeam::channel::unbounded();
    fx.scheduler
        .subscribe_for_errors(err_tx, prefix_selector("a/"));

    fx.sb.plan_error("a/base1", "southbound rejected the change", false);
    let mut txn = fx.scheduler.start_nb_transaction();
    txn.set_value("a/base1", array_value(&["item2"]));
    let result = txn
        .commit(CommitOptions::new().with_revert())
        .expect("commit itself succeeds");

    // one per-key error reported
    assert_eq!(result.kv_errors.len(), 1);
    assert_eq!(result.kv_errors[0].key, "a/base1");

    // southbound is back to the pre-transaction state
    let value = fx.sb.get_value("a/base1").expect("a/base1 still realized");
    assert!(value.value.equivalent(array_value(&["item1"]).as_ref()));
    assert!(fx.sb.get_value("a/base1/item1").is_some());
    assert!(fx.sb.get_value("a/base1/item2").is_none());

    // executed list: forward ops, the failure, then inverse ops
    let recorded = fx
        .scheduler
        .get_recorded_transaction(result.seq_num)
        .expect("recorded");
    let failed: Vec<&str> = recorded
        .executed
        .iter()
        .filter(|op| op.error.is_some() && !op.is_revert)
        .map(|op| op.key.as_str())
        .collect();
    assert_eq!(failed, vec!["a/base1"]);
    let reverts: Vec<(TxnOperation, &str)> = recorded
        .executed
        .iter()
        .filter(|op| op.is_revert)
        .map(|op| (op.operation, op.key.as_str()))
        .collect();
    assert!(!reverts.is_empty());
    assert!(reverts.contains(&(TxnOperation::Modify, "a/base1")));

    // the error flag survives the revert and reaches the subscriber
    let errors = fx.scheduler.get_values_with_error(None);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].key, "a/base1");
    let notification = err_rx
        .recv_timeout(Duration::from_secs(1))
        .expect("subscriber notified");
    assert_eq!(notification.key, "a/base1");
    assert!(notification.error.is_some());
    assert!(err_rx.try_recv().is_err(), "exactly one notification");
}

#[test]
fn failed_delete_leaves_dependents_pending_and_the_key_realized() {
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

    let mut txn = scheduler.start_nb_transaction();
    txn.set_value("a/1", string_value("1"));
    txn.set_value("a/2", string_value("2"));
    txn.set_value("a/3", string_value("3"));
    txn.set_value("a/4", string_value("4"));
    txn.commit(CommitOptions::new()).expect("commit");
    sb.pop_history();

    sb.plan_error("a/2", "device busy", false);
    let mut txn = scheduler.start_nb_transaction();
    txn.delete_value("a/2");
    let result = txn.commit(CommitOptions::new()).expect("commit");
    assert_eq!(result.kv_errors.len(), 1);
    assert_eq!(result.kv_errors[0].key, "a/2");

    // dependents were removed from SB before the failing delete
    let ops = sb.pop_history();
    let keys: Vec<(TxnOperation, String, bool)> = ops
        .iter()
        .map(|op| (op.op, op.key.clone(), op.error.is_some()))
        .collect();
    assert_eq!(
        keys,
        vec![
            (TxnOperation::Delete, "a/3".to_string(), false),
            (TxnOperation::Delete, "a/1".to_string(), false),
            (TxnOperation::Delete, "a/2".to_string(), true),
        ]
    );

    // the key stays realized in SB with its error flag set; the cycle is
    // broken logically in the graph
    assert!(sb.get_value("a/2").is_some());
    assert!(sb.get_value("a/1").is_none());
    assert!(sb.get_value("a/3").is_none());
    let pending: Vec<String> = scheduler
        .get_pending_values(None)
        .into_iter()
        .map(|kv| kv.key)
        .collect();
    assert_eq!(pending, vec!["a/1", "a/3"]);
    let errors = scheduler.get_values_with_error(None);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].key, "a/2");
}

#[test]
fn retriable_failures_are_retried_with_backoff() {
    let fx = three_descriptors();

    fx.sb.plan_error("a/base1", "transient outage", true);
    let mut txn = fx.scheduler.start_nb_transaction();
    txn.set_value("a/base1", array_value(&["item1"]));
    let result = txn
        .commit(CommitOptions::new().with_retry(Duration::from_millis(20), true))
        .expect("commit");
    assert_eq!(result.kv_errors.len(), 1);
    assert!(fx.sb.get_value("a/base1").is_none());

    // the worker re-attempts after the retry period
    std::thread::sleep(Duration::from_millis(300));
    assert!(fx.sb.get_value("a/base1").is_some());
    assert!(fx.sb.get_value("a/base1/item1").is_some());
    assert!(fx.scheduler.get_values_with_error(None).is_empty());
    assert!(fx.scheduler.get_pending_values(None).is_empty());

    let ops = fx.sb.pop_history();
    assert!(ops[0].error.is_some());
    assert!(ops.iter().skip(1).all(|op| op.error.is_none()));
}

#[test]
fn non_retriable_failures_are_not_retried() {
    let fx = three_descriptors();

    fx.sb.plan_error("a/base1", "unsupported", false);
    let mut txn = fx.scheduler.start_nb_transaction();
    txn.set_value("a/base1", array_value(&["item1"]));
    let result = txn
        .commit(CommitOptions::new().with_retry(Duration::from_millis(20), true))
        .expect("commit");
    assert_eq!(result.kv_errors.len(), 1);

    std::thread::sleep(Duration::from_millis(200));
    assert!(fx.sb.get_value("a/base1").is_none());
    assert_eq!(fx.scheduler.get_values_with_error(None).len(), 1);
}

#[test]
fn cancelled_transaction_executes_nothing_further() {
    let fx = three_descriptors();

    let token = CancelToken::new();
    token.cancel();
    let mut txn = fx.scheduler.start_nb_transaction();
    txn.set_value("a/base1", array_value(&["item1"]));
    let result = txn
        .commit(CommitOptions::new().with_cancel(token))
        .expect("commit");

    assert!(fx.sb.pop_history().is_empty());
    assert_eq!(result.kv_errors.len(), 1);
    let err = result.kv_errors[0].error.as_ref().expect("error");
    assert!(err.to_string().contains("cancelled"));
}

#[test]
fn error_subscribers_hear_about_clearing_too() {
    let fx = three_descriptors();

    let (err_tx, err_rx) = crossbeam::channel::unbounded();
    fx.scheduler
        .subscribe_for_errors(err_tx, prefix_selector("a/"));

    fx.sb.plan_error("a/base1", "flaky", true);
    let mut txn = fx.scheduler.start_nb_transaction();
    txn.set_value("a/base1", array_value(&["item1"]));
    txn.commit(CommitOptions::new()).expect("commit");

    let failed = err_rx
        .recv_timeout(Duration::from_secs(1))
        .expect("failure notification");
    assert_eq!(failed.key, "a/base1");
    assert!(failed.error.is_some());

    // re-request the same value; this time the southbound cooperates
    let mut txn = fx.scheduler.start_nb_transaction();
    txn.set_value("a/base1", array_value(&["item1"]));
    txn.commit(CommitOptions::new()).expect("commit");

    let cleared = err_rx
        .recv_timeout(Duration::from_secs(1))
        .expect("clear notification");
    assert_eq!(cleared.key, "a/base1");
    assert!(cleared.error.is_none());
}
