//! Application error types.
//!
//! Two layers:
//! - [`Error`]: runtime API errors (thiserror), returned from fallible calls.
//! - [`Failure`]: the serializable error carried by `error` envelopes and by
//!   rejected [`Deferred`](crate::event_loop::Deferred)s.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration or arguments.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown actor, monitor or command.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid lifecycle transition.
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// A second arbiter was constructed in this process.
    #[error("singleton violation: {0}")]
    SingletonViolation(String),

    /// A monitor exceeded its restart budget.
    #[error("restart exhausted: {0}")]
    RestartExhausted(String),

    /// Mailbox peer went away with work outstanding.
    #[error("peer unavailable: {0}")]
    PeerUnavailable(String),

    /// No running pool member to route to.
    #[error("no available worker: {0}")]
    NoAvailableWorker(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// A panic caught by [`with_recovery`](crate::actor::with_recovery).
    #[error("panic in {operation}: {message}")]
    Panicked { operation: String, message: String },

    /// Cancellation.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A failure reported by a remote actor.
    #[error("{0}")]
    Remote(Failure),

    /// Envelope encoding errors.
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Envelope decoding errors.
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON (de)serialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Convert to a wire-level failure.
    pub fn to_failure(&self) -> Failure {
        match self {
            Error::Timeout(msg) => Failure::new(FailureKind::Timeout, msg),
            Error::Cancelled(msg) => Failure::new(FailureKind::Cancelled, msg),
            Error::PeerUnavailable(msg) => Failure::new(FailureKind::PeerUnavailable, msg),
            Error::NoAvailableWorker(msg) => Failure::new(FailureKind::NoAvailableWorker, msg),
            Error::SingletonViolation(msg) => Failure::new(FailureKind::SingletonViolation, msg),
            Error::RestartExhausted(msg) => Failure::new(FailureKind::RestartExhausted, msg),
            Error::NotFound(msg) => Failure::new(FailureKind::UnknownCommand, msg),
            Error::Validation(msg) | Error::StateTransition(msg) => {
                Failure::new(FailureKind::HandlerError, msg)
            }
            Error::Remote(failure) => failure.clone(),
            Error::Internal(msg) => Failure::new(FailureKind::Internal, msg),
            Error::Panicked { .. } => Failure::new(FailureKind::Internal, self.to_string()),
            other => Failure::new(FailureKind::Internal, other.to_string()),
        }
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn peer_unavailable(msg: impl Into<String>) -> Self {
        Self::PeerUnavailable(msg.into())
    }
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        match failure.kind {
            FailureKind::Timeout => Error::Timeout(failure.message),
            FailureKind::Cancelled => Error::Cancelled(failure.message),
            FailureKind::PeerUnavailable => Error::PeerUnavailable(failure.message),
            FailureKind::NoAvailableWorker => Error::NoAvailableWorker(failure.message),
            FailureKind::SingletonViolation => Error::SingletonViolation(failure.message),
            FailureKind::RestartExhausted => Error::RestartExhausted(failure.message),
            _ => Error::Remote(failure),
        }
    }
}

/// Error kinds that travel inside `error` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    HandlerError,
    Timeout,
    PeerUnavailable,
    NoAvailableWorker,
    SingletonViolation,
    RestartExhausted,
    UnknownCommand,
    Cancelled,
    Internal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::HandlerError => "handler-error",
            FailureKind::Timeout => "timeout",
            FailureKind::PeerUnavailable => "peer-unavailable",
            FailureKind::NoAvailableWorker => "no-available-worker",
            FailureKind::SingletonViolation => "singleton-violation",
            FailureKind::RestartExhausted => "restart-exhausted",
            FailureKind::UnknownCommand => "unknown-command",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A serializable failure: the error side of a `call` reply or a Deferred.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(FailureKind::HandlerError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn peer_unavailable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::PeerUnavailable, message)
    }

    pub fn no_available_worker(message: impl Into<String>) -> Self {
        Self::new(FailureKind::NoAvailableWorker, message)
    }

    pub fn unknown_command(message: impl Into<String>) -> Self {
        Self::new(FailureKind::UnknownCommand, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Cancelled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, message)
    }
}
