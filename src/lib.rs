//! # Pulsar Core - Actor Runtime
//!
//! Cooperative actor runtime providing:
//! - A per-actor single-threaded event loop with timers and deferred results
//! - Framed, ordered mailboxes over Unix sockets with call/cast semantics
//! - Monitors that keep pools of identical actors alive under restart policies
//! - A singleton arbiter that supervises monitors and relays envelopes
//!
//! ## Architecture
//!
//! Every actor runs on its own OS thread or child process and owns exactly one
//! [`EventLoop`]. Actors never share memory; they exchange
//! [`MessageEnvelope`]s through the arbiter:
//! ```text
//!                    ┌───────────────────────────────────┐
//!   ArbiterHandle →  │             Arbiter               │
//!                    │  ┌─────────────┐ ┌─────────────┐  │
//!                    │  │  Monitor A  │ │  Monitor B  │  │
//!                    │  │ (pool of N) │ │ (top-level) │  │
//!                    │  └──────┬──────┘ └──────┬──────┘  │
//!                    └─────────┼───────────────┼─────────┘
//!                        mailbox (Unix socket, framed msgpack)
//!                    ┌─────────┴──┐ ┌──────────┴─┐
//!                    │ Actor loop │ │ Actor loop │  ...
//!                    └────────────┘ └────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use pulsar_core::{Arbiter, Config, HandlerTable, MonitorSpec, Outcome};
//! use serde_json::json;
//!
//! let mut arbiter = Arbiter::new(Config::default())?;
//! arbiter.add_monitor(
//!     MonitorSpec::new("echo", || {
//!         HandlerTable::new().command("shout", |_ctx, req| {
//!             let text = req.args.as_str().unwrap_or_default().to_uppercase();
//!             Outcome::Value(json!(text))
//!         })
//!     })
//!     .pool_size(2),
//! )?;
//! let handle = arbiter.handle();
//! std::thread::spawn(move || {
//!     handle.wait_running()?;
//!     let reply = handle.call("echo", "shout", json!("hi"))?;
//!     assert_eq!(reply, json!("HI"));
//!     handle.stop()
//! });
//! let status = arbiter.run()?;
//! assert!(status.is_graceful());
//! # Ok::<(), pulsar_core::Error>(())
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod actor;
pub mod arbiter;
pub mod event_loop;
pub mod mailbox;
pub mod monitor;
pub mod types;

// Internal utilities
pub mod observability;

pub use actor::{
    ActorContext, ActorStatus, ExitStatus, FailurePolicy, HandlerTable, Request,
};
pub use arbiter::{Arbiter, ArbiterHandle, ArbiterPhase, ArbiterSnapshot, Target};
pub use event_loop::{gather, Deferred, EventLoop, Outcome};
pub use mailbox::{ActorProxy, MessageEnvelope};
pub use monitor::{ActorSpec, MonitorSpec, RestartPolicy};
pub use types::{
    ActorId, ActorIdentity, Concurrency, Config, Error, Failure, FailureKind, Payload, Result,
};
