//! Binary codec for flow payloads.
//!
//! The core itself never serializes anything; this module is for [`NonBlockingFlow`]
//! implementors that need a compact, deterministic byte representation of ticks, tick lists,
//! events and start points. The bincode configuration is defined once here.
//!
//! Events are framed with their one-byte [`EventCode`] ahead of the body, so an unknown
//! discriminant is rejected with [`FlowError::UnknownEventCode`] before the body is looked at.
//!
//! # Examples
//!
//! ```
//! use lockstep_flow::flow::codec::{decode_value, encode};
//! use lockstep_flow::{Age, Tick};
//!
//! let tick = Tick::new(Age::new(3));
//! let bytes = encode(&tick).expect("encoding should succeed");
//! let decoded: Tick = decode_value(&bytes).expect("decoding should succeed");
//! assert_eq!(decoded, tick);
//! ```
//!
//! [`NonBlockingFlow`]: crate::NonBlockingFlow

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

use crate::error::FlowError;
use crate::event::{Event, EventCode};

// standard() with fixed-size integers: encoded ages and flags have a stable width.
fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// What was being done when a codec error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecOperation {
    /// Encoding a framed event.
    EncodeEvent,
    /// Decoding a framed event.
    DecodeEvent,
    /// Appending to a buffer.
    AppendToBuffer,
    /// A generic encoding operation.
    Encode,
    /// A generic decoding operation.
    Decode,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeEvent => write!(f, "encoding event"),
            Self::DecodeEvent => write!(f, "decoding event"),
            Self::AppendToBuffer => write!(f, "appending to buffer"),
            Self::Encode => write!(f, "encoding"),
            Self::Decode => write!(f, "decoding"),
        }
    }
}

/// Errors that can occur during encoding or decoding.
///
/// Messages are kept as strings because bincode's errors only expose `Display`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The encoding operation failed.
    EncodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The decoding operation failed.
    DecodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
}

impl CodecError {
    /// Creates a new encode error.
    pub fn encode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::EncodeError {
            message: message.into(),
            operation,
        }
    }

    /// Creates a new decode error.
    pub fn decode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::DecodeError {
            message: message.into(),
            operation,
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError { message, operation } => {
                write!(f, "encoding failed while {operation}: {message}")
            },
            Self::DecodeError { message, operation } => {
                write!(f, "decoding failed while {operation}: {message}")
            },
        }
    }
}

impl std::error::Error for CodecError {}

impl From<CodecError> for FlowError {
    fn from(err: CodecError) -> Self {
        FlowError::Codec {
            context: err.to_string(),
        }
    }
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a value into a new `Vec<u8>`.
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config())
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::Encode))
}

/// Encodes a value by appending to an existing `Vec<u8>`. Returns the number of bytes added.
pub fn encode_append<T: Serialize>(value: &T, buffer: &mut Vec<u8>) -> CodecResult<usize> {
    let start_len = buffer.len();
    bincode::serde::encode_into_std_write(value, buffer, config())
        .map(|_| buffer.len() - start_len)
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::AppendToBuffer))
}

/// Decodes a value from a byte slice, returning it with the number of bytes consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config())
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::Decode))
}

/// Decodes a value from a byte slice, ignoring the bytes consumed.
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    decode(bytes).map(|(value, _)| value)
}

/// Encodes an event framed by its [`EventCode`].
pub fn encode_event(event: &Event) -> CodecResult<Vec<u8>> {
    let mut buffer = vec![u8::from(event.code())];
    bincode::serde::encode_into_std_write(event, &mut buffer, config())
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::EncodeEvent))?;
    Ok(buffer)
}

/// Decodes an event produced by [`encode_event`].
///
/// # Errors
///
/// - [`FlowError::UnknownEventCode`] if the leading discriminant names no event kind.
/// - [`FlowError::Codec`] if the body is malformed or disagrees with the discriminant.
pub fn decode_event(bytes: &[u8]) -> Result<Event, FlowError> {
    let Some((&code, body)) = bytes.split_first() else {
        return Err(CodecError::decode("empty input", CodecOperation::DecodeEvent).into());
    };
    let code = EventCode::try_from(code)?;
    let (event, _): (Event, _) = bincode::serde::decode_from_slice(body, config())
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::DecodeEvent))?;
    if event.code() != code {
        return Err(CodecError::decode(
            format!("frame code {:?} does not match body {:?}", code, event.code()),
            CodecOperation::DecodeEvent,
        )
        .into());
    }
    Ok(event)
}
