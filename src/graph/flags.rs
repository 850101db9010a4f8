//! Node flags.
//!
//! Each node carries at most one flag per kind. Flags double as the
//! unit of accounting for `GetFlagStats`: a flag's value label is what
//! the statistics group by.

use std::fmt;
use std::str::FromStr;

use crate::api::{SbError, ValueOrigin};

/// Kinds of flags a node can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlagKind {
    Origin,
    Descriptor,
    Derived,
    Pending,
    Error,
    LastUpdate,
    LastChange,
}

impl FlagKind {
    pub fn name(self) -> &'static str {
        match self {
            FlagKind::Origin => "origin",
            FlagKind::Descriptor => "descriptor",
            FlagKind::Derived => "derived",
            FlagKind::Pending => "pending",
            FlagKind::Error => "error",
            FlagKind::LastUpdate => "last-update",
            FlagKind::LastChange => "last-change",
        }
    }
}

impl FromStr for FlagKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "origin" => Ok(FlagKind::Origin),
            "descriptor" => Ok(FlagKind::Descriptor),
            "derived" => Ok(FlagKind::Derived),
            "pending" => Ok(FlagKind::Pending),
            "error" => Ok(FlagKind::Error),
            "last-update" => Ok(FlagKind::LastUpdate),
            "last-change" => Ok(FlagKind::LastChange),
            _ => Err(()),
        }
    }
}

/// Bookkeeping for the most recent touch of a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LastUpdateFlag {
    pub txn_seq: u64,
    /// Rendered value targeted by the touch (None for deletions).
    pub value: Option<String>,
    /// The touch happened while reverting a failed transaction.
    pub revert: bool,
}

/// Bookkeeping for the most recent value change (not every touch is a
/// change). Only base values carry this flag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LastChangeFlag {
    pub txn_seq: u64,
    pub prev_value: Option<String>,
    pub new_value: Option<String>,
    pub time_ms: u64,
}

/// One node flag with its payload.
#[derive(Clone)]
pub enum Flag {
    Origin(ValueOrigin),
    Descriptor(String),
    Derived { base_key: String },
    Pending,
    Error(SbError),
    LastUpdate(LastUpdateFlag),
    LastChange(LastChangeFlag),
}

impl Flag {
    pub fn kind(&self) -> FlagKind {
        match self {
            Flag::Origin(_) => FlagKind::Origin,
            Flag::Descriptor(_) => FlagKind::Descriptor,
            Flag::Derived { .. } => FlagKind::Derived,
            Flag::Pending => FlagKind::Pending,
            Flag::Error(_) => FlagKind::Error,
            Flag::LastUpdate(_) => FlagKind::LastUpdate,
            Flag::LastChange(_) => FlagKind::LastChange,
        }
    }

    /// Label used for per-value grouping in flag statistics.
    pub fn value_label(&self) -> String {
        match self {
            Flag::Origin(origin) => origin.to_string(),
            Flag::Descriptor(name) => name.clone(),
            Flag::Derived { base_key } => base_key.clone(),
            Flag::Pending => String::new(),
            Flag::Error(err) => err.to_string(),
            Flag::LastUpdate(_) | Flag::LastChange(_) => String::new(),
        }
    }
}

impl fmt::Debug for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flag::Error(err) => f.debug_tuple("Error").field(&err.to_string()).finish(),
            Flag::Origin(o) => f.debug_tuple("Origin").field(o).finish(),
            Flag::Descriptor(d) => f.debug_tuple("Descriptor").field(d).finish(),
            Flag::Derived { base_key } => f.debug_tuple("Derived").field(base_key).finish(),
            Flag::Pending => write!(f, "Pending"),
            Flag::LastUpdate(u) => f.debug_tuple("LastUpdate").field(u).finish(),
            Flag::LastChange(c) => f.debug_tuple("LastChange").field(c).finish(),
        }
    }
}

/// Flag set of a node; at most one flag per kind.
#[derive(Clone, Debug, Default)]
pub struct Flags(Vec<Flag>);

impl Flags {
    pub fn get(&self, kind: FlagKind) -> Option<&Flag> {
        self.0.iter().find(|f| f.kind() == kind)
    }

    pub fn has(&self, kind: FlagKind) -> bool {
        self.get(kind).is_some()
    }

    /// Set or replace the flag of the same kind.
    pub fn set(&mut self, flag: Flag) {
        self.unset(flag.kind());
        self.0.push(flag);
    }

    pub fn unset(&mut self, kind: FlagKind) {
        self.0.retain(|f| f.kind() != kind);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flag> {
        self.0.iter()
    }
}
