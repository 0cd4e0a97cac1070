//! Mailbox: ordered, length-prefixed envelope transport over Unix streams.
//!
//! - [`codec`]: `[u32 BE len][msgpack envelope]` framing
//! - [`envelope`]: `MessageEnvelope` and `ActorProxy`
//! - [`connection`]: reader/writer tasks bound to an event loop
//! - [`pending`]: correlation-id keyed table of outstanding calls

pub mod codec;
mod connection;
mod envelope;
mod pending;

pub use connection::Connection;
pub use envelope::{ActorProxy, EnvelopeKind, MessageEnvelope};
pub use pending::PendingReplies;
