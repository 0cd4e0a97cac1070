//! Handler tables: the typed command dispatch surface of an actor.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use super::context::ActorContext;
use crate::event_loop::Outcome;
use crate::mailbox::{EnvelopeKind, MessageEnvelope};
use crate::types::{ActorIdentity, Error, Failure, Payload, Result};

/// A command handler.
pub type Handler = Box<dyn Fn(&ActorContext, Request) -> Outcome<Payload>>;

/// Setup hook. A deferred outcome keeps the actor in `starting` until it settles.
pub type StartHook = Box<dyn Fn(&ActorContext) -> Outcome<()>>;

/// Teardown hook, run once in-flight work has drained.
pub type StopHook = Box<dyn Fn(&ActorContext)>;

/// An inbound command as seen by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub sender: ActorIdentity,
    pub command: String,
    pub args: Payload,
    pub kind: EnvelopeKind,
}

impl Request {
    pub(crate) fn from_envelope(envelope: MessageEnvelope) -> Self {
        Self {
            sender: envelope.sender,
            command: envelope.command,
            args: envelope.args,
            kind: envelope.kind,
        }
    }

    pub fn is_call(&self) -> bool {
        self.kind == EnvelopeKind::Call
    }

    /// Deserialize `args` into `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> std::result::Result<T, Failure> {
        serde_json::from_value(self.args.clone()).map_err(|e| {
            Failure::handler(format!("invalid arguments for '{}': {}", self.command, e))
        })
    }
}

/// Commands every actor answers without a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinCommand {
    /// `{identity, status, uptime, mailbox_depth}`.
    Info,
    /// Replies `"pong"`.
    Ping,
    /// Replies with the arguments unchanged.
    Echo,
    /// Begin a graceful stop.
    Stop,
}

impl BuiltinCommand {
    pub const ALL: [BuiltinCommand; 4] = [
        BuiltinCommand::Info,
        BuiltinCommand::Ping,
        BuiltinCommand::Echo,
        BuiltinCommand::Stop,
    ];

    pub fn parse(command: &str) -> Option<Self> {
        match command {
            "info" => Some(BuiltinCommand::Info),
            "ping" => Some(BuiltinCommand::Ping),
            "echo" => Some(BuiltinCommand::Echo),
            "stop" => Some(BuiltinCommand::Stop),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuiltinCommand::Info => "info",
            BuiltinCommand::Ping => "ping",
            BuiltinCommand::Echo => "echo",
            BuiltinCommand::Stop => "stop",
        }
    }
}

impl fmt::Display for BuiltinCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a handler error does to the actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Reply with the error and keep serving.
    #[default]
    Recover,
    /// A panicking handler moves the actor to `failed`.
    FailOnPanic,
    /// Any handler error moves the actor to `failed`.
    FailOnError,
}

/// Command name to handler mapping, plus lifecycle hooks.
///
/// Built on the actor's own thread by the monitor's factory, so handlers
/// need not be `Send`.
pub struct HandlerTable {
    handlers: BTreeMap<String, Handler>,
    on_start: Option<StartHook>,
    on_stop: Option<StopHook>,
    failure_policy: FailurePolicy,
    rejected: Vec<String>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
            on_start: None,
            on_stop: None,
            failure_policy: FailurePolicy::default(),
            rejected: Vec::new(),
        }
    }

    /// Register a handler for `name`.
    ///
    /// Built-in names and duplicates are recorded and reported by
    /// [`validate`](Self::validate) when the actor starts.
    pub fn command<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&ActorContext, Request) -> Outcome<Payload> + 'static,
    {
        let name = name.into();
        if BuiltinCommand::parse(&name).is_some() || self.handlers.contains_key(&name) {
            self.rejected.push(name);
            return self;
        }
        self.handlers.insert(name, Box::new(handler));
        self
    }

    /// Register a handler with typed arguments and result.
    pub fn command_typed<A, R, F>(self, name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(&ActorContext, A) -> std::result::Result<R, Failure> + 'static,
    {
        self.command(name, move |ctx, request| {
            let result = request.parse::<A>().and_then(|args| handler(ctx, args)).and_then(|value| {
                serde_json::to_value(value)
                    .map_err(|e| Failure::internal(format!("unserializable reply: {}", e)))
            });
            Outcome::from(result)
        })
    }

    pub fn on_start<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ActorContext) -> Outcome<()> + 'static,
    {
        self.on_start = Some(Box::new(hook));
        self
    }

    pub fn on_stop<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ActorContext) + 'static,
    {
        self.on_stop = Some(Box::new(hook));
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Reject tables that shadow a built-in command or register a name twice.
    pub fn validate(&self) -> Result<()> {
        if self.rejected.is_empty() {
            return Ok(());
        }
        let mut seen = HashSet::new();
        let names: Vec<&str> = self
            .rejected
            .iter()
            .filter(|name| seen.insert(name.as_str()))
            .map(String::as_str)
            .collect();
        Err(Error::validation(format!(
            "handler names reserved or registered twice: {}",
            names.join(", ")
        )))
    }

    pub fn get(&self, name: &str) -> Option<&Handler> {
        self.handlers.get(name)
    }

    /// Registered command names, sorted.
    pub fn commands(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub(crate) fn start_hook(&self) -> Option<&StartHook> {
        self.on_start.as_ref()
    }

    pub(crate) fn stop_hook(&self) -> Option<&StopHook> {
        self.on_stop.as_ref()
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("commands", &self.commands())
            .field("on_start", &self.on_start.is_some())
            .field("on_stop", &self.on_stop.is_some())
            .field("failure_policy", &self.failure_policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActorKind, FailureKind};
    use serde_json::json;

    #[test]
    fn test_builtin_names_round_trip() {
        for builtin in BuiltinCommand::ALL {
            assert_eq!(BuiltinCommand::parse(builtin.as_str()), Some(builtin));
        }
        assert_eq!(BuiltinCommand::parse("add"), None);
    }

    #[test]
    fn test_reserved_and_duplicate_names_fail_validation() {
        let table = HandlerTable::new()
            .command("add", |_, _| Outcome::Value(json!(0)))
            .command("add", |_, _| Outcome::Value(json!(1)))
            .command("ping", |_, _| Outcome::Value(json!("mine")));
        let err = table.validate().unwrap_err().to_string();
        assert!(err.contains("add"));
        assert!(err.contains("ping"));
        assert_eq!(table.commands(), vec!["add"]);
    }

    #[test]
    fn test_valid_table() {
        let table = HandlerTable::new()
            .command("b", |_, _| Outcome::Value(json!(null)))
            .command("a", |_, _| Outcome::Value(json!(null)))
            .failure_policy(FailurePolicy::FailOnPanic);
        table.validate().unwrap();
        assert_eq!(table.commands(), vec!["a", "b"]);
        assert_eq!(table.policy(), FailurePolicy::FailOnPanic);
        assert!(table.get("a").is_some());
        assert!(table.get("c").is_none());
    }

    #[test]
    fn test_request_parse_reports_handler_error() {
        #[derive(Deserialize)]
        struct Add {
            #[allow(dead_code)]
            x: i64,
        }
        let request = Request {
            sender: ActorIdentity::new(ActorKind::Actor, "caller"),
            command: "add".into(),
            args: json!({"x": "not a number"}),
            kind: EnvelopeKind::Call,
        };
        let failure = request.parse::<Add>().err().unwrap();
        assert_eq!(failure.kind, FailureKind::HandlerError);
        assert!(failure.message.contains("add"));
    }
}
