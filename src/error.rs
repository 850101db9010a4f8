use thiserror::Error;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient southbound failure).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Errors produced by the scheduler core itself (as opposed to errors
/// returned by descriptor callbacks, which are opaque to the core).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SchedulerError {
    #[error("add operation is not implemented")]
    UnimplementedAdd,

    #[error("modify operation is not implemented")]
    UnimplementedModify,

    #[error("delete operation is not implemented")]
    UnimplementedDelete,

    #[error("transaction was cancelled")]
    Cancelled,

    #[error("no descriptor is registered for key {key}")]
    UnknownKey { key: String },

    #[error("descriptor {name} is already registered")]
    DescriptorExists { name: String },

    #[error("descriptor {name} is not registered")]
    UnknownDescriptor { name: String },

    #[error("descriptor {name} does not implement dump")]
    DumpNotSupported { name: String },

    #[error("dump of descriptor {name} failed: {reason}")]
    DumpFailed { name: String, reason: String },

    #[error("dependency cycle could not be resolved")]
    DependencyCycle,

    #[error("the scheduler worker is not running")]
    QueueClosed,
}

impl SchedulerError {
    pub fn transience(&self) -> Transience {
        match self {
            SchedulerError::UnimplementedAdd
            | SchedulerError::UnimplementedModify
            | SchedulerError::UnimplementedDelete
            | SchedulerError::Cancelled
            | SchedulerError::UnknownKey { .. }
            | SchedulerError::DescriptorExists { .. }
            | SchedulerError::UnknownDescriptor { .. }
            | SchedulerError::DumpNotSupported { .. }
            | SchedulerError::DependencyCycle => Transience::Permanent,
            SchedulerError::DumpFailed { .. } => Transience::Retryable,
            SchedulerError::QueueClosed => Transience::Unknown,
        }
    }

    /// True for the sentinel errors reporting an absent descriptor callback.
    pub fn is_unimplemented(&self) -> bool {
        matches!(
            self,
            SchedulerError::UnimplementedAdd
                | SchedulerError::UnimplementedModify
                | SchedulerError::UnimplementedDelete
        )
    }
}

/// Crate-level convenience error.
///
/// A thin wrapper over the subsystem errors; callers that care about the
/// distinction match on the variants.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Ipc(#[from] crate::introspect::IpcError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Scheduler(e) => e.transience(),
            Error::Config(_) => Transience::Permanent,
            Error::Ipc(_) => Transience::Unknown,
        }
    }
}
