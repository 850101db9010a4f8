//! The key-value scheduler.
//!
//! Provides:
//! - `Scheduler` - the public surface: descriptor registration, NB
//!   transactions, SB notifications, pending/error queries, metadata
//!   maps, transaction history and graph introspection
//! - a single worker thread serializing all state mutations
//! - retry scheduling with exponential backoff
//!
//! Callers enqueue work over a channel and block on a completion signal;
//! readers take graph snapshots and proceed concurrently.

pub mod exec;
pub mod handler;
pub mod notify;
pub mod planner;
pub mod queue;
pub mod recorder;
pub mod registry;
pub mod resync;
pub mod utils;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::api::{
    CommitOptions, KVDescriptor, KVWithMetadata, KeySelector, KeyValuePair, KeyWithError,
    Metadata, ResyncType, SbError, ValueOrigin, ValueRef,
};
use crate::config::Config;
use crate::error::SchedulerError;
use crate::graph::{FlagKind, FlagStats, Graph, Node, RecordedNode};

use exec::{execute_ordered, ExecEngine};
use queue::{CommitOutcome, KVChange, QueuedTxn, RetrySchedule, RetryTicket};
use recorder::{RecordedKVPair, RecordedTxn, TxnHistory, TxnType};
use registry::DescriptorRegistry;
use utils::{now_ms, KeySet};

pub use notify::ErrorSubscribers;
pub use recorder::{RecordedKeyError, RecordedOp};

/// Name-to-metadata mapping maintained for one descriptor.
///
/// Owned by the scheduler, mutated only on the worker thread, readable
/// from anywhere.
#[derive(Clone, Default)]
pub struct MetadataMap {
    inner: Arc<RwLock<BTreeMap<String, Metadata>>>,
}

impl MetadataMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, label: &str) -> Option<Metadata> {
        read_lock(&self.inner).get(label).cloned()
    }

    pub fn insert(&self, label: String, metadata: Metadata) {
        write_lock(&self.inner).insert(label, metadata);
    }

    pub fn remove(&self, label: &str) {
        write_lock(&self.inner).remove(label);
    }

    pub fn labels(&self) -> Vec<String> {
        read_lock(&self.inner).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        read_lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        read_lock(&self.inner).is_empty()
    }
}

/// Result of a committed transaction.
#[derive(Debug)]
pub struct CommitResult {
    pub seq_num: u64,
    /// Errors of individual operations; the transaction itself still
    /// succeeded as long as planning did.
    pub kv_errors: Vec<KeyWithError>,
}

pub(crate) struct SchedulerCore {
    config: Config,
    graph: Graph,
    registry: RwLock<DescriptorRegistry>,
    history: Mutex<TxnHistory>,
    subscribers: Mutex<ErrorSubscribers>,
    metadata_maps: RwLock<BTreeMap<String, MetadataMap>>,
    txn_seq: AtomicU64,
}

/// The scheduler instance. One per process, single writer.
pub struct Scheduler {
    core: Arc<SchedulerCore>,
    queue_tx: Option<Sender<QueuedTxn>>,
    worker: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(config: Config) -> Self {
        let history = TxnHistory::new(
            config.history.max_entries,
            config.history.max_age_secs.saturating_mul(1_000),
        );
        let core = Arc::new(SchedulerCore {
            config,
            graph: Graph::new(),
            registry: RwLock::new(DescriptorRegistry::new()),
            history: Mutex::new(history),
            subscribers: Mutex::new(ErrorSubscribers::new()),
            metadata_maps: RwLock::new(BTreeMap::new()),
            txn_seq: AtomicU64::new(0),
        });

        let (queue_tx, queue_rx) = unbounded();
        let worker_core = core.clone();
        let worker = std::thread::Builder::new()
            .name("kvsched-worker".into())
            .spawn(move || run_worker(worker_core, queue_rx))
            .expect("failed to spawn scheduler worker");

        Scheduler {
            core,
            queue_tx: Some(queue_tx),
            worker: Some(worker),
        }
    }

    /// Register a descriptor. Must happen before values from its prefix
    /// are configured.
    pub fn register_kv_descriptor(
        &self,
        descriptor: KVDescriptor,
    ) -> Result<(), SchedulerError> {
        let with_metadata = descriptor.with_metadata;
        let name = descriptor.name.clone();
        write_lock(&self.core.registry).register(descriptor)?;
        if with_metadata {
            write_lock(&self.core.metadata_maps).insert(name.clone(), MetadataMap::new());
        }
        info!(descriptor = %name, "descriptor registered");
        Ok(())
    }

    /// Open a new northbound transaction.
    pub fn start_nb_transaction(&self) -> SchedulerTxn<'_> {
        SchedulerTxn {
            scheduler: self,
            values: BTreeMap::new(),
        }
    }

    /// Report a southbound-originated change of a single key
    /// (upstream resync). Blocks until the notification is processed.
    pub fn push_sb_notification(
        &self,
        key: impl Into<String>,
        value: Option<ValueRef>,
        metadata: Option<Metadata>,
    ) -> Result<(), SchedulerError> {
        let change = KVChange {
            key: key.into(),
            value,
            origin: ValueOrigin::FromSB,
            metadata,
        };
        let (reply_tx, reply_rx) = bounded(1);
        self.enqueue(QueuedTxn {
            txn_type: TxnType::SbNotification,
            values: vec![change],
            options: CommitOptions::new(),
            reply: Some(reply_tx),
            attempt: 0,
        })?;
        let outcome = reply_rx
            .recv()
            .map_err(|_| SchedulerError::QueueClosed)?;
        match outcome.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Values desired but not realized in the southbound.
    pub fn get_pending_values(&self, filter: Option<&KeySelector>) -> Vec<KeyValuePair> {
        let snapshot = self.core.graph.read();
        snapshot
            .get_nodes(|n| n.is_pending() && filter.map_or(true, |f| f(&n.key)))
            .into_iter()
            .filter_map(|n| {
                n.value.clone().map(|value| KeyValuePair {
                    key: n.key.clone(),
                    value,
                })
            })
            .collect()
    }

    /// Values whose last operation failed.
    pub fn get_values_with_error(&self, filter: Option<&KeySelector>) -> Vec<KeyWithError> {
        let snapshot = self.core.graph.read();
        snapshot
            .get_nodes(|n| n.error().is_some() && filter.map_or(true, |f| f(&n.key)))
            .into_iter()
            .map(|n| KeyWithError {
                key: n.key.clone(),
                error: n.error(),
            })
            .collect()
    }

    /// Subscribe for error-state changes of keys matched by the selector.
    pub fn subscribe_for_errors(
        &self,
        sender: crossbeam::channel::Sender<KeyWithError>,
        selector: KeySelector,
    ) {
        lock(&self.core.subscribers).subscribe(sender, selector);
    }

    /// Metadata map maintained for the given descriptor, if any.
    pub fn get_metadata_map(&self, descriptor: &str) -> Option<MetadataMap> {
        read_lock(&self.core.metadata_maps).get(descriptor).cloned()
    }

    /// Recorded transactions whose execution started inside the window.
    pub fn get_transaction_history(
        &self,
        since_ms: Option<u64>,
        until_ms: Option<u64>,
    ) -> Vec<RecordedTxn> {
        lock(&self.core.history).get_history(since_ms, until_ms)
    }

    pub fn get_recorded_transaction(&self, seq_num: u64) -> Option<RecordedTxn> {
        lock(&self.core.history).get(seq_num)
    }

    /// Ordered history of value/flag changes for one key.
    pub fn get_node_timeline(&self, key: &str) -> Vec<RecordedNode> {
        self.core.graph.read().get_node_timeline(key)
    }

    /// Graph state as of the given time (current time when None).
    pub fn get_graph_snapshot(&self, time_ms: Option<u64>) -> Vec<RecordedNode> {
        self.core
            .graph
            .read()
            .get_snapshot_at(time_ms.unwrap_or_else(now_ms))
    }

    pub fn get_flag_stats(
        &self,
        kind: FlagKind,
        key_filter: impl Fn(&str) -> bool,
    ) -> FlagStats {
        self.core.graph.read().get_flag_stats(kind, key_filter)
    }

    /// Dump the key-value pairs under one descriptor: the scheduler's
    /// internal view, or the southbound state obtained via the
    /// descriptor's dump callback (correlated with the internal view).
    pub fn dump_values(
        &self,
        descriptor: &str,
        internal: bool,
    ) -> Result<Vec<KVWithMetadata>, SchedulerError> {
        let registry = read_lock(&self.core.registry);
        let Some(desc) = registry.get(descriptor) else {
            return Err(SchedulerError::UnknownDescriptor {
                name: descriptor.to_string(),
            });
        };

        let snapshot = self.core.graph.read();
        let in_mem: Vec<KVWithMetadata> = snapshot
            .get_nodes(|n| {
                n.descriptor() == Some(descriptor) && !n.is_pending() && !n.is_derived()
            })
            .into_iter()
            .filter_map(|n| {
                n.value.clone().map(|value| KVWithMetadata {
                    key: n.key.clone(),
                    value,
                    metadata: n.metadata.clone(),
                    origin: n.origin(),
                })
            })
            .collect();

        if internal {
            return Ok(in_mem);
        }

        let handler = handler::DescriptorHandler::new(desc);
        match handler.dump(&in_mem) {
            Some(Ok(dumped)) => Ok(dumped),
            Some(Err(err)) => Err(SchedulerError::DumpFailed {
                name: descriptor.to_string(),
                reason: err.to_string(),
            }),
            None => Err(SchedulerError::DumpNotSupported {
                name: descriptor.to_string(),
            }),
        }
    }

    fn enqueue(&self, txn: QueuedTxn) -> Result<(), SchedulerError> {
        self.queue_tx
            .as_ref()
            .ok_or(SchedulerError::QueueClosed)?
            .send(txn)
            .map_err(|_| SchedulerError::QueueClosed)
    }

    fn commit_values(
        &self,
        values: Vec<KVChange>,
        options: CommitOptions,
    ) -> Result<CommitResult, SchedulerError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.enqueue(QueuedTxn {
            txn_type: TxnType::NbTransaction,
            values,
            options,
            reply: Some(reply_tx),
            attempt: 0,
        })?;
        let outcome = reply_rx
            .recv()
            .map_err(|_| SchedulerError::QueueClosed)?;
        match outcome.error {
            Some(err) => Err(err),
            None => Ok(CommitResult {
                seq_num: outcome.seq_num,
                kv_errors: outcome.kv_errors,
            }),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.queue_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// A northbound transaction under construction.
pub struct SchedulerTxn<'a> {
    scheduler: &'a Scheduler,
    values: BTreeMap<String, Option<ValueRef>>,
}

impl SchedulerTxn<'_> {
    /// Stage a value; the last request per key wins.
    pub fn set_value(&mut self, key: impl Into<String>, value: ValueRef) -> &mut Self {
        self.values.insert(key.into(), Some(value));
        self
    }

    /// Stage a deletion.
    pub fn delete_value(&mut self, key: impl Into<String>) -> &mut Self {
        self.values.insert(key.into(), None);
        self
    }

    /// Commit the staged values and block until the transaction is
    /// finalized. Per-operation errors come back in the result; `Err` is
    /// reserved for planning-phase failures.
    pub fn commit(self, options: CommitOptions) -> Result<CommitResult, SchedulerError> {
        let values = self
            .values
            .into_iter()
            .map(|(key, value)| KVChange {
                key,
                value,
                origin: ValueOrigin::FromNB,
                metadata: None,
            })
            .collect();
        self.scheduler.commit_values(values, options)
    }
}

fn run_worker(core: Arc<SchedulerCore>, queue_rx: Receiver<QueuedTxn>) {
    let mut retries = RetrySchedule::new(Duration::from_millis(
        core.config.retry.max_backoff_ms,
    ));
    debug!("scheduler worker started");

    loop {
        let message = match retries.next_due_ms() {
            Some(due) => {
                let wait = Duration::from_millis(due.saturating_sub(now_ms()));
                queue_rx.recv_timeout(wait)
            }
            None => queue_rx
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };

        match message {
            Ok(txn) => process_txn(&core, txn, &mut retries),
            Err(RecvTimeoutError::Timeout) => {
                let now = now_ms();
                for ticket in retries.pop_due(now) {
                    if let Some(txn) = build_retry_txn(&core, &ticket, &retries) {
                        process_txn(&core, txn, &mut retries);
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("scheduler worker stopped");
}

/// Re-request the still-failed keys of a due retry ticket with their last
/// intended state.
fn build_retry_txn(
    core: &SchedulerCore,
    ticket: &RetryTicket,
    retries: &RetrySchedule,
) -> Option<QueuedTxn> {
    let snapshot = core.graph.read();
    let mut values = Vec::new();
    for key in &ticket.keys {
        let Some(node) = snapshot.get_node(key) else {
            continue;
        };
        if node.error().is_none() {
            continue;
        }
        // a touch that targeted deletion is retried as a deletion
        let intent_delete = node.last_update().is_some_and(|f| f.value.is_none());
        let value = if intent_delete {
            None
        } else {
            node.value.clone()
        };
        values.push(KVChange {
            key: key.clone(),
            value,
            origin: ValueOrigin::FromNB,
            metadata: None,
        });
    }
    if values.is_empty() {
        return None;
    }
    debug!(attempt = ticket.attempt, keys = values.len(), "retrying failed operations");
    Some(QueuedTxn {
        txn_type: TxnType::RetryFailedOps,
        values,
        options: CommitOptions::new().with_retry(
            retries.next_interval(ticket),
            ticket.exp_backoff,
        ),
        reply: None,
        attempt: ticket.attempt,
    })
}

fn process_txn(core: &SchedulerCore, txn: QueuedTxn, retries: &mut RetrySchedule) {
    let seq = core.txn_seq.fetch_add(1, Ordering::SeqCst);
    let start_ms = now_ms();
    let registry = read_lock(&core.registry);

    // planning-phase resolution: every NB value needs an owner
    let pre_errors = match txn.txn_type {
        TxnType::NbTransaction => planner::resolve_changes(&registry, &txn.values),
        _ => Vec::new(),
    };
    if !pre_errors.is_empty() {
        let stop_ms = now_ms();
        let kv_errors = pre_errors
            .iter()
            .map(|e| KeyWithError {
                key: e.key.clone(),
                error: Some(Arc::new(SchedulerError::UnknownKey {
                    key: e.key.clone(),
                }) as SbError),
            })
            .collect();
        let first = pre_errors[0].key.clone();
        record_txn(core, &txn, seq, start_ms, stop_ms, Vec::new(), pre_errors, Vec::new(), Vec::new());
        reply(txn.reply, CommitOutcome {
            seq_num: seq,
            kv_errors,
            error: Some(SchedulerError::UnknownKey { key: first }),
        });
        return;
    }

    // resync: refresh the graph from southbound dumps, then reconcile
    let mut effective = txn.values.clone();
    if txn.options.resync != ResyncType::None {
        let mut writer = core.graph.write();
        let nb_intent = resync::capture_nb_intent(&writer);
        let maps = read_lock(&core.metadata_maps).clone();
        resync::refresh_graph(&registry, &maps, &mut writer);
        match txn.options.resync {
            ResyncType::Full => {
                let desired: KeySet = effective
                    .iter()
                    .filter(|c| c.value.is_some())
                    .map(|c| c.key.clone())
                    .collect();
                effective.extend(resync::resync_deletes(&writer, &desired));
            }
            ResyncType::Downstream => {
                effective = nb_intent
                    .iter()
                    .map(|(key, value)| KVChange {
                        key: key.clone(),
                        value: Some(value.clone()),
                        origin: ValueOrigin::FromNB,
                        metadata: None,
                    })
                    .collect();
                let desired: KeySet = nb_intent.keys().cloned().collect();
                effective.extend(resync::resync_deletes(&writer, &desired));
            }
            ResyncType::None => {}
        }
        writer.save(now_ms());
    }

    // plan on a scratch copy, remember pre-execution error states
    let snapshot = core.graph.read();
    let ordered = planner::order_changes(&registry, &snapshot, &effective);
    let planned = planner::plan(&registry, &core.graph, &ordered, txn.txn_type, seq, start_ms);
    let before_errors: BTreeMap<String, String> = snapshot
        .nodes()
        .filter_map(|n| n.error().map(|e| (n.key.clone(), e.to_string())))
        .collect();
    drop(snapshot);

    // execute for real
    let maps = read_lock(&core.metadata_maps).clone();
    let writer = core.graph.write();
    let mut engine = ExecEngine::new(&registry, maps, writer, seq, start_ms, false);
    let reverted = execute_ordered(&mut engine, &ordered, &txn.options, txn.txn_type);
    let (writer, applied) = engine.finish();
    writer.save(now_ms());

    // per-key errors and retry tickets
    let mut kv_errors = Vec::new();
    let mut retriable_keys = KeySet::new();
    for op in &applied {
        if let Some(err) = &op.error {
            if !op.rec.is_revert {
                kv_errors.push(KeyWithError {
                    key: op.rec.key.clone(),
                    error: Some(err.clone()),
                });
            }
            if op.retriable {
                retriable_keys.insert(op.rec.key.clone());
            }
        }
    }
    if !reverted && !retriable_keys.is_empty() {
        if let Some(retry) = txn.options.retry {
            let period_ms = retry.period.as_millis() as u64;
            retries.schedule(RetryTicket {
                keys: retriable_keys,
                due_ms: now_ms() + period_ms,
                attempt: txn.attempt + 1,
                interval: retry.period,
                exp_backoff: retry.exp_backoff,
            });
        }
    }
    if !kv_errors.is_empty() {
        warn!(seq, errors = kv_errors.len(), "transaction finished with errors");
    }

    // notify subscribers about error-state changes
    let after = core.graph.read();
    let after_errors: BTreeMap<String, String> = after
        .nodes()
        .filter_map(|n| n.error().map(|e| (n.key.clone(), e.to_string())))
        .collect();
    {
        let mut subscribers = lock(&core.subscribers);
        let keys: KeySet = before_errors
            .keys()
            .chain(after_errors.keys())
            .cloned()
            .collect();
        for key in keys {
            if before_errors.get(&key) != after_errors.get(&key) {
                subscribers.notify(&key, after.get_node(&key).and_then(Node::error));
            }
        }
    }
    drop(after);

    let stop_ms = now_ms();
    let executed: Vec<RecordedOp> = applied.iter().map(|op| op.rec.clone()).collect();
    record_txn(core, &txn, seq, start_ms, stop_ms, effective, Vec::new(), planned, executed);

    reply(txn.reply, CommitOutcome {
        seq_num: seq,
        kv_errors,
        error: None,
    });
}

#[allow(clippy::too_many_arguments)]
fn record_txn(
    core: &SchedulerCore,
    txn: &QueuedTxn,
    seq: u64,
    start_ms: u64,
    stop_ms: u64,
    values: Vec<KVChange>,
    pre_errors: Vec<RecordedKeyError>,
    planned: Vec<RecordedOp>,
    executed: Vec<RecordedOp>,
) {
    let recorded_values = values
        .iter()
        .map(|c| RecordedKVPair {
            key: c.key.clone(),
            value: c.value.as_ref().map(crate::api::render_value),
            origin: c.origin,
        })
        .collect();
    let record = RecordedTxn {
        seq_num: seq,
        txn_type: txn.txn_type,
        resync: txn.options.resync,
        with_revert: txn.options.revert_on_failure,
        start_ms,
        stop_ms,
        values: recorded_values,
        pre_errors,
        planned,
        executed,
    };
    lock(&core.history).record(record, stop_ms);
}

fn reply(reply: Option<Sender<CommitOutcome>>, outcome: CommitOutcome) {
    if let Some(sender) = reply {
        let _ = sender.send(outcome);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
