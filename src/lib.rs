//! Dependency-aware key-value scheduler.
//!
//! Mediates between a desired-state configuration source (northbound) and
//! an imperative target system (southbound) whose objects depend on each
//! other. Descriptors teach the scheduler how to realize key-value pairs;
//! the scheduler computes the minimal correctly-ordered sequence of
//! operations reconciling the target to the requested state, executes it,
//! handles partial failures with retries or revert, and keeps an
//! auditable history.

#![forbid(unsafe_code)]

pub mod api;
pub mod config;
pub mod error;
pub mod graph;
pub mod introspect;
pub mod mock;
pub mod scheduler;
pub mod telemetry;

pub use error::{Error, SchedulerError, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the primary surface at the crate root for convenience
pub use crate::api::{
    prefix_selector, CancelToken, CommitOptions, Dependency, KVDescriptor, KVWithMetadata,
    KeySelector, KeyValuePair, KeyWithError, KvValue, Metadata, ResyncType, RetryOptions,
    SbError, TxnOperation, ValueOrigin, ValueRef,
};
pub use crate::scheduler::{CommitResult, MetadataMap, RecordedOp, Scheduler, SchedulerTxn};
