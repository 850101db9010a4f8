//! Public API surface shared between the scheduler core and descriptors.
//!
//! Provides:
//! - Opaque value/metadata handles (`KvValue`, `ValueRef`, `Metadata`)
//! - The descriptor contract (`KVDescriptor`, `Dependency`)
//! - Commit options (`CommitOptions`, `ResyncType`, `RetryOptions`)
//! - Common pair/record types exchanged with callers

pub mod descriptor;
pub mod options;
pub mod value;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use descriptor::{Dependency, KVDescriptor};
pub use options::{CancelToken, CommitOptions, ResyncType, RetryOptions};
pub use value::{render_value, KvValue, Metadata, ValueRef};

/// Error type returned by descriptor callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared, clonable form of a southbound operation error.
pub type SbError = Arc<dyn std::error::Error + Send + Sync>;

/// Predicate selecting a subset of keys.
pub type KeySelector = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Key selector matching every key with the given prefix.
pub fn prefix_selector(prefix: &str) -> KeySelector {
    let prefix = prefix.to_string();
    Arc::new(move |key: &str| key.starts_with(&prefix))
}

/// Who asserted the current value of a key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueOrigin {
    #[default]
    Unknown,
    FromNB,
    FromSB,
}

impl fmt::Display for ValueOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueOrigin::Unknown => write!(f, "unknown"),
            ValueOrigin::FromNB => write!(f, "from-NB"),
            ValueOrigin::FromSB => write!(f, "from-SB"),
        }
    }
}

/// Operation applied to a single key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxnOperation {
    Add,
    Modify,
    Delete,
    Update,
}

impl fmt::Display for TxnOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnOperation::Add => write!(f, "add"),
            TxnOperation::Modify => write!(f, "modify"),
            TxnOperation::Delete => write!(f, "delete"),
            TxnOperation::Update => write!(f, "update"),
        }
    }
}

/// Key paired with its (intended or realized) value.
#[derive(Clone)]
pub struct KeyValuePair {
    pub key: String,
    pub value: ValueRef,
}

impl fmt::Debug for KeyValuePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyValuePair")
            .field("key", &self.key)
            .field("value", &self.value)
            .finish()
    }
}

/// Key-value pair extended with metadata and origin, as exchanged with
/// descriptor dumps.
#[derive(Clone)]
pub struct KVWithMetadata {
    pub key: String,
    pub value: ValueRef,
    pub metadata: Option<Metadata>,
    pub origin: ValueOrigin,
}

impl fmt::Debug for KVWithMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KVWithMetadata")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Key paired with the error state of its last operation.
///
/// `error == None` reports that a previous error has been cleared.
#[derive(Clone)]
pub struct KeyWithError {
    pub key: String,
    pub error: Option<SbError>,
}

impl fmt::Debug for KeyWithError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyWithError")
            .field("key", &self.key)
            .field("error", &self.error.as_ref().map(|e| e.to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_selector_matches_prefix_only() {
        let sel = prefix_selector("iface/");
        assert!(sel("iface/eth0"));
        assert!(!sel("route/10.0.0.0"));
    }

    #[test]
    fn operation_renders_lowercase() {
        assert_eq!(TxnOperation::Add.to_string(), "add");
        assert_eq!(TxnOperation::Delete.to_string(), "delete");
    }
}
