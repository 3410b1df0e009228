use thiserror::Error;

use crate::util::id::Id;

/// Malformed inbound data. A framing error aborts processing of the rest of the frame it was
///  found in, but never the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("truncated {opcode} command: needed {needed} more bytes, {remaining} remaining")]
    Truncated {
        opcode: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),

    #[error("invalid {what} in {opcode} command")]
    InvalidValue {
        opcode: &'static str,
        what: &'static str,
    },
}

/// Classifies why a transport went away, so that reconnect logic can apply side effects
///  (e.g. flushing the resolver cache on DNS failures)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransportFailureKind {
    Connect,
    Closed,
    Dns,
    Timeout,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("protocol framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("transport failure ({kind:?}, code {code}): {reason}")]
    TransportFailure {
        kind: TransportFailureKind,
        code: i32,
        reason: String,
    },

    /// A combinator was resolved or rejected a second time. This is a bug in the caller.
    #[error("promise was already settled")]
    AlreadySettled,

    #[error("index {idx} is outside of the buffer range [{low}:{high}]")]
    BufferRange { idx: i32, low: i32, high: i32 },

    #[error("a history fetch is already in progress")]
    AlreadyFetching,

    #[error("there is no more history to fetch")]
    NoMoreHistory,

    #[error("already connecting or connected")]
    AlreadyConnecting,

    #[error("not connected")]
    NotConnected,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("unknown chat room {0}")]
    UnknownRoom(Id),

    #[error("unknown message {0}")]
    UnknownMessage(Id),

    #[error("giving up after {attempts} attempts, last error: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("local storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    pub fn transport(kind: TransportFailureKind, code: i32, reason: impl Into<String>) -> ChatError {
        ChatError::TransportFailure {
            kind,
            code,
            reason: reason.into(),
        }
    }

    pub fn storage(e: anyhow::Error) -> ChatError {
        ChatError::Storage(format!("{:#}", e))
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
