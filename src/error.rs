//! Error types returned by the public API.

use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::Age;

/// This enum contains all errors this library can report. Most API functions return a
/// [`FlowResult`].
///
/// Errors fall into two classes. Contract violations (see [`FlowError::is_contract_violation`])
/// indicate a usage bug and are never retried. Everything else describes a failed or rejected
/// remote operation that leaves the reporting component consistent, so the caller may retry.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowError {
    /// A storage request was issued while another one is still outstanding.
    StorageRequestPending,
    /// The next generated age was changed while a storage request is outstanding.
    NextAgeLocked {
        /// The age that was requested.
        requested: Age,
    },
    /// An event carried a discriminant that does not name any known event kind.
    UnknownEventCode {
        /// The unrecognized discriminant.
        code: u8,
    },
    /// You made an invalid request, usually by using wrong parameters for function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// An invalid age was provided.
    InvalidAge {
        /// The age that was invalid.
        age: Age,
        /// A description of why the age was invalid.
        reason: String,
    },
    /// A remote fetch completed with an error.
    FetchFailed {
        /// What was being fetched (`"ticks"`, `"storage"`, `"start point"`).
        resource: &'static str,
        /// A description of the failure.
        context: String,
    },
    /// The simulation failed to restore from a start point.
    RestoreFailed {
        /// The age of the start point.
        age: Age,
        /// A description of the failure.
        context: String,
    },
    /// The flow permission set does not allow the operation.
    NotPermitted {
        /// The rejected operation.
        operation: &'static str,
    },
    /// Serialization or deserialization of data failed.
    Codec {
        /// A description of what failed to serialize/deserialize.
        context: String,
    },
    /// A configuration value is out of range.
    InvalidConfig {
        /// The offending field.
        field: &'static str,
        /// Why the value is rejected.
        reason: String,
    },
}

impl FlowError {
    /// Returns `true` for errors that indicate a usage bug rather than a transient condition.
    #[must_use]
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            FlowError::StorageRequestPending
                | FlowError::NextAgeLocked { .. }
                | FlowError::UnknownEventCode { .. }
                | FlowError::InvalidRequest { .. }
        )
    }
}

impl Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowError::StorageRequestPending => {
                write!(
                    f,
                    "A storage request is already outstanding; \
                     multiple storage requests are unsupported."
                )
            },
            FlowError::NextAgeLocked { requested } => {
                write!(
                    f,
                    "Cannot change the next age to {} while a storage request is outstanding.",
                    requested
                )
            },
            FlowError::UnknownEventCode { code } => {
                write!(f, "Unknown event code {}", code)
            },
            FlowError::InvalidRequest { info } => {
                write!(f, "Invalid Request: {}", info)
            },
            FlowError::InvalidAge { age, reason } => {
                write!(f, "Invalid age {}: {}", age, reason)
            },
            FlowError::FetchFailed { resource, context } => {
                write!(f, "Fetching {} failed: {}", resource, context)
            },
            FlowError::RestoreFailed { age, context } => {
                write!(f, "Restoring from start point at age {} failed: {}", age, context)
            },
            FlowError::NotPermitted { operation } => {
                write!(f, "Operation not permitted by the flow: {}", operation)
            },
            FlowError::Codec { context } => {
                write!(f, "Codec error: {}", context)
            },
            FlowError::InvalidConfig { field, reason } => {
                write!(f, "Invalid configuration for {}: {}", field, reason)
            },
        }
    }
}

impl Error for FlowError {}

/// Result alias used throughout the crate.
pub type FlowResult<T> = Result<T, FlowError>;
