//! Mock southbound plane.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::api::{BoxError, KVWithMetadata, Metadata, TxnOperation, ValueOrigin, ValueRef};

use super::values::IntegerMeta;

/// Failure injected for the next operation on a key.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct MockError {
    pub message: String,
    pub retriable: bool,
}

/// One value as realized in the mock southbound.
#[derive(Clone)]
pub struct SbValue {
    pub value: ValueRef,
    pub metadata: Option<Metadata>,
    pub origin: ValueOrigin,
}

/// One operation the scheduler performed against the mock.
#[derive(Clone, Debug)]
pub struct MockOp {
    pub op: TxnOperation,
    pub descriptor: String,
    pub key: String,
    pub error: Option<String>,
}

#[derive(Default)]
struct SbState {
    values: BTreeMap<String, SbValue>,
    history: Vec<MockOp>,
    planned_errors: BTreeMap<String, VecDeque<MockError>>,
    next_meta: BTreeMap<String, i64>,
}

/// In-memory stand-in for the imperative target system.
#[derive(Default)]
pub struct MockSouthbound {
    state: Mutex<SbState>,
}

impl MockSouthbound {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Inject a one-shot failure for the next operation touching `key`.
    pub fn plan_error(&self, key: &str, message: &str, retriable: bool) {
        self.lock()
            .planned_errors
            .entry(key.to_string())
            .or_default()
            .push_back(MockError {
                message: message.to_string(),
                retriable,
            });
    }

    /// Pre-seed a realized value, as if it existed before the scheduler
    /// started (used by resync tests).
    pub fn seed(&self, key: &str, value: ValueRef, origin: ValueOrigin) {
        self.lock().values.insert(
            key.to_string(),
            SbValue {
                value,
                metadata: None,
                origin,
            },
        );
    }

    pub fn get_value(&self, key: &str) -> Option<SbValue> {
        self.lock().values.get(key).cloned()
    }

    pub fn values_count(&self) -> usize {
        self.lock().values.len()
    }

    /// Drain the recorded operation history.
    pub fn pop_history(&self) -> Vec<MockOp> {
        std::mem::take(&mut self.lock().history)
    }

    pub(super) fn handle_add(
        &self,
        descriptor: &str,
        prefix: &str,
        with_metadata: bool,
        key: &str,
        value: &ValueRef,
    ) -> Result<Option<Metadata>, BoxError> {
        let mut state = self.lock();
        if let Some(err) = take_planned(&mut state, key) {
            state.history.push(MockOp {
                op: TxnOperation::Add,
                descriptor: descriptor.to_string(),
                key: key.to_string(),
                error: Some(err.to_string()),
            });
            return Err(Box::new(err));
        }

        // metadata only for base values: no sub-path below the prefix
        let is_base = key
            .strip_prefix(prefix)
            .is_some_and(|rest| !rest.contains('/'));
        let metadata: Option<Metadata> = if with_metadata && is_base {
            let counter = state.next_meta.entry(descriptor.to_string()).or_insert(0);
            let meta = IntegerMeta(*counter);
            *counter += 1;
            Some(Arc::new(meta))
        } else {
            None
        };

        state.values.insert(
            key.to_string(),
            SbValue {
                value: value.clone(),
                metadata: metadata.clone(),
                origin: ValueOrigin::FromNB,
            },
        );
        state.history.push(MockOp {
            op: TxnOperation::Add,
            descriptor: descriptor.to_string(),
            key: key.to_string(),
            error: None,
        });
        Ok(metadata)
    }

    pub(super) fn handle_modify(
        &self,
        descriptor: &str,
        key: &str,
        new_value: &ValueRef,
        metadata: Option<Metadata>,
    ) -> Result<Option<Metadata>, BoxError> {
        let mut state = self.lock();
        if let Some(err) = take_planned(&mut state, key) {
            state.history.push(MockOp {
                op: TxnOperation::Modify,
                descriptor: descriptor.to_string(),
                key: key.to_string(),
                error: Some(err.to_string()),
            });
            return Err(Box::new(err));
        }

        match state.values.get_mut(key) {
            Some(existing) => {
                existing.value = new_value.clone();
                existing.metadata = metadata.clone();
            }
            None => {
                state.values.insert(
                    key.to_string(),
                    SbValue {
                        value: new_value.clone(),
                        metadata: metadata.clone(),
                        origin: ValueOrigin::FromNB,
                    },
                );
            }
        }
        state.history.push(MockOp {
            op: TxnOperation::Modify,
            descriptor: descriptor.to_string(),
            key: key.to_string(),
            error: None,
        });
        Ok(metadata)
    }

    pub(super) fn handle_delete(&self, descriptor: &str, key: &str) -> Result<(), BoxError> {
        let mut state = self.lock();
        if let Some(err) = take_planned(&mut state, key) {
            state.history.push(MockOp {
                op: TxnOperation::Delete,
                descriptor: descriptor.to_string(),
                key: key.to_string(),
                error: Some(err.to_string()),
            });
            return Err(Box::new(err));
        }
        state.values.remove(key);
        state.history.push(MockOp {
            op: TxnOperation::Delete,
            descriptor: descriptor.to_string(),
            key: key.to_string(),
            error: None,
        });
        Ok(())
    }

    pub(super) fn handle_update(
        &self,
        descriptor: &str,
        key: &str,
        _value: &ValueRef,
    ) -> Result<(), BoxError> {
        let mut state = self.lock();
        if let Some(err) = take_planned(&mut state, key) {
            state.history.push(MockOp {
                op: TxnOperation::Update,
                descriptor: descriptor.to_string(),
                key: key.to_string(),
                error: Some(err.to_string()),
            });
            return Err(Box::new(err));
        }
        state.history.push(MockOp {
            op: TxnOperation::Update,
            descriptor: descriptor.to_string(),
            key: key.to_string(),
            error: None,
        });
        Ok(())
    }

    /// Everything realized under the given prefix, for descriptor dumps.
    pub(super) fn dump_prefix(&self, prefix: &str) -> Vec<KVWithMetadata> {
        let state = self.lock();
        state
            .values
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, sb)| KVWithMetadata {
                key: key.clone(),
                value: sb.value.clone(),
                metadata: sb.metadata.clone(),
                origin: sb.origin,
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, SbState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn take_planned(state: &mut SbState, key: &str) -> Option<MockError> {
    let queue = state.planned_errors.get_mut(key)?;
    let err = queue.pop_front();
    if queue.is_empty() {
        state.planned_errors.remove(key);
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::values::array_value;

    #[test]
    fn planned_errors_are_one_shot() {
        let sb = MockSouthbound::new();
        sb.plan_error("a/x", "boom", true);

        let err = sb
            .handle_add("a", "a/", false, "a/x", &array_value(&["i"]))
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(sb.get_value("a/x").is_none());

        sb.handle_add("a", "a/", false, "a/x", &array_value(&["i"]))
            .expect("second attempt succeeds");
        assert!(sb.get_value("a/x").is_some());

        let history = sb.pop_history();
        assert_eq!(history.len(), 2);
        assert!(history[0].error.is_some());
        assert!(history[1].error.is_none());
    }

    #[test]
    fn metadata_counts_up_per_add() {
        let sb = MockSouthbound::new();
        let meta1 = sb
            .handle_add("c", "c/", true, "c/base", &array_value(&["i"]))
            .unwrap()
            .unwrap();
        sb.handle_delete("c", "c/base").unwrap();
        let meta2 = sb
            .handle_add("c", "c/", true, "c/base", &array_value(&["i"]))
            .unwrap()
            .unwrap();
        assert_eq!(crate::mock::integer_meta(&meta1), Some(0));
        assert_eq!(crate::mock::integer_meta(&meta2), Some(1));
    }

    #[test]
    fn derived_keys_get_no_metadata() {
        let sb = MockSouthbound::new();
        let meta = sb
            .handle_add("c", "c/", true, "c/base/item1", &array_value(&["i"]))
            .unwrap();
        assert!(meta.is_none());
    }
}
