//! Error types for the FieldSync engine.

use crate::{RecordType, Tick};
use thiserror::Error;

/// Broad classification used by callers to pick a recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fatal at startup, never retried.
    Configuration,
    /// Version or config mismatch between nodes; aborts the session.
    Protocol,
    /// A single value could not be converted; the phase aborts.
    Data,
    /// An operation was attempted in the wrong session state.
    State,
}

/// All possible errors from the FieldSync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Configuration errors
    #[error("cyclic dependency between record types: {residual:?}")]
    CyclicDependency {
        /// Types that could not be ordered, with the dependencies still blocking them.
        residual: Vec<(RecordType, Vec<RecordType>)>,
    },

    #[error("directive registered twice: {0}")]
    DuplicateDirective(RecordType),

    #[error("record type {record_type} has no association named '{relation}'")]
    UnknownRelation {
        record_type: RecordType,
        relation: String,
    },

    #[error("invalid channel route '{0}'")]
    InvalidRoute(String),

    #[error("channel route '{pattern}' registered by both {first} and {second}")]
    DuplicateRoute {
        pattern: String,
        first: RecordType,
        second: RecordType,
    },

    #[error("no channel reaches record type {0}")]
    UnreachableChannel(RecordType),

    // Protocol errors
    #[error("unknown record type: {0}")]
    UnknownRecordType(RecordType),

    #[error("no route matches channel '{0}'")]
    UnmatchedChannel(String),

    #[error("record type {record_type} cannot be {action}")]
    DirectionNotAllowed {
        record_type: RecordType,
        action: &'static str,
    },

    // Data errors
    #[error("invalid value for '{field}': {reason}")]
    InvalidFieldValue { field: String, reason: String },

    #[error("channel source failed: {0}")]
    ChannelSource(String),

    // State errors
    #[error("illegal session transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    #[error("cursor cannot move backwards from {current} to {requested}")]
    CursorRegression { current: Tick, requested: Tick },
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CyclicDependency { .. }
            | Error::DuplicateDirective(_)
            | Error::UnknownRelation { .. }
            | Error::InvalidRoute(_)
            | Error::DuplicateRoute { .. }
            | Error::UnreachableChannel(_) => ErrorKind::Configuration,
            Error::UnknownRecordType(_)
            | Error::UnmatchedChannel(_)
            | Error::DirectionNotAllowed { .. } => ErrorKind::Protocol,
            Error::InvalidFieldValue { .. } | Error::ChannelSource(_) => ErrorKind::Data,
            Error::IllegalTransition { .. } | Error::CursorRegression { .. } => ErrorKind::State,
        }
    }

    pub fn is_protocol(&self) -> bool {
        self.kind() == ErrorKind::Protocol
    }

    pub fn is_configuration(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
