//! Core types for the runtime.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (ActorId, CorrelationId) and ActorIdentity
//! - **Errors**: Runtime error enum and the wire-level Failure
//! - **Config**: Configuration structures for arbiter, mailbox and monitors

mod config;
mod errors;
mod ids;

pub use config::{
    ArbiterConfig, Concurrency, Config, MailboxConfig, MonitorConfig, ObservabilityConfig,
};
pub use errors::{Error, Failure, FailureKind, Result};
pub use ids::{ActorId, ActorIdentity, ActorKind, CorrelationId};

/// Opaque application payload carried by envelopes.
pub type Payload = serde_json::Value;
