//! Message envelopes and actor proxies.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{ActorIdentity, CorrelationId, Failure, Payload, Result};

/// Envelope kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    /// Expects exactly one `ack` or `error` with the same correlation id.
    Call,
    /// Fire-and-forget.
    Cast,
    /// Successful reply to a `call`.
    Ack,
    /// Failed reply to a `call`.
    Error,
}

impl EnvelopeKind {
    pub fn is_reply(self) -> bool {
        matches!(self, EnvelopeKind::Ack | EnvelopeKind::Error)
    }
}

/// The unit of communication between actors. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub sender: ActorIdentity,
    pub target: ActorIdentity,
    pub command: String,
    pub args: Payload,
    pub correlation_id: Option<CorrelationId>,
    pub kind: EnvelopeKind,
}

impl MessageEnvelope {
    pub fn call(
        sender: ActorIdentity,
        target: ActorIdentity,
        command: impl Into<String>,
        args: Payload,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            sender,
            target,
            command: command.into(),
            args,
            correlation_id: Some(correlation_id),
            kind: EnvelopeKind::Call,
        }
    }

    pub fn cast(
        sender: ActorIdentity,
        target: ActorIdentity,
        command: impl Into<String>,
        args: Payload,
    ) -> Self {
        Self {
            sender,
            target,
            command: command.into(),
            args,
            correlation_id: None,
            kind: EnvelopeKind::Cast,
        }
    }

    /// Build the `ack` for this call, sent by `responder`.
    pub fn ack(&self, responder: ActorIdentity, value: Payload) -> Self {
        Self {
            sender: responder,
            target: self.sender.clone(),
            command: self.command.clone(),
            args: value,
            correlation_id: self.correlation_id.clone(),
            kind: EnvelopeKind::Ack,
        }
    }

    /// Build the `error` reply for this call, sent by `responder`.
    pub fn error(&self, responder: ActorIdentity, failure: &Failure) -> Self {
        Self {
            sender: responder,
            target: self.sender.clone(),
            command: self.command.clone(),
            args: serde_json::to_value(failure).unwrap_or(Payload::Null),
            correlation_id: self.correlation_id.clone(),
            kind: EnvelopeKind::Error,
        }
    }

    /// Reply result carried by an `ack`/`error` envelope.
    pub fn into_reply(self) -> std::result::Result<Payload, Failure> {
        match self.kind {
            EnvelopeKind::Ack => Ok(self.args),
            EnvelopeKind::Error => Err(serde_json::from_value(self.args).unwrap_or_else(|e| {
                Failure::internal(format!("malformed error reply: {}", e))
            })),
            kind => Err(Failure::internal(format!(
                "envelope of kind {:?} is not a reply",
                kind
            ))),
        }
    }

    pub fn is_call(&self) -> bool {
        self.kind == EnvelopeKind::Call
    }

    /// This call without its arguments, kept to address the reply later.
    pub(crate) fn reply_header(&self) -> Option<Self> {
        self.is_call().then(|| Self {
            sender: self.sender.clone(),
            target: self.target.clone(),
            command: self.command.clone(),
            args: Payload::Null,
            correlation_id: self.correlation_id.clone(),
            kind: self.kind,
        })
    }

    /// Serialize to msgpack (field names kept).
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

impl fmt::Display for MessageEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {} {} -> {}",
            self.kind, self.command, self.sender, self.target
        )
    }
}

/// Serializable handle for addressing an actor. Never implies ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorProxy {
    pub identity: ActorIdentity,
    /// Where frames for this actor are delivered: the arbiter's socket path in
    /// process mode, `inproc://<aid>` in thread mode.
    pub mailbox_address: String,
}

impl ActorProxy {
    pub fn new(identity: ActorIdentity, mailbox_address: impl Into<String>) -> Self {
        Self {
            identity,
            mailbox_address: mailbox_address.into(),
        }
    }

    pub fn inproc(identity: ActorIdentity) -> Self {
        let address = format!("inproc://{}", identity.aid);
        Self::new(identity, address)
    }
}

impl fmt::Display for ActorProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.identity, self.mailbox_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActorKind, FailureKind};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn pair() -> (ActorIdentity, ActorIdentity) {
        (
            ActorIdentity::new(ActorKind::Actor, "client"),
            ActorIdentity::new(ActorKind::Actor, "server"),
        )
    }

    #[test]
    fn test_msgpack_preserves_envelope() {
        let (a, b) = pair();
        let env = MessageEnvelope::call(
            a,
            b,
            "add",
            json!({"x": 1, "y": [1.5, "two", null], "nested": {"ok": true}}),
            CorrelationId::new(),
        );
        let decoded = MessageEnvelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.sender.name, "client");
    }

    #[test]
    fn test_ack_targets_original_sender_with_same_correlation() {
        let (a, b) = pair();
        let call = MessageEnvelope::call(a.clone(), b.clone(), "ping", json!(null), CorrelationId::new());
        let ack = call.ack(b, json!("pong"));
        assert_eq!(ack.kind, EnvelopeKind::Ack);
        assert_eq!(ack.target, a);
        assert_eq!(ack.correlation_id, call.correlation_id);
        assert_eq!(ack.into_reply(), Ok(json!("pong")));
    }

    #[test]
    fn test_error_reply_carries_failure() {
        let (a, b) = pair();
        let call = MessageEnvelope::call(a, b.clone(), "nope", json!({}), CorrelationId::new());
        let reply = call.error(b, &Failure::unknown_command("nope"));
        let failure = reply.into_reply().unwrap_err();
        assert_eq!(failure.kind, FailureKind::UnknownCommand);
        assert_eq!(failure.message, "nope");
    }

    #[test]
    fn test_cast_is_not_a_reply() {
        let (a, b) = pair();
        let cast = MessageEnvelope::cast(a, b, "notify", json!({}));
        assert!(!cast.is_call());
        assert!(!cast.kind.is_reply());
        assert!(cast.into_reply().is_err());
    }

    #[test]
    fn test_proxy_round_trips_as_json() {
        let proxy = ActorProxy::inproc(ActorIdentity::new(ActorKind::Monitor, "echo"));
        let value = serde_json::to_value(&proxy).unwrap();
        let back: ActorProxy = serde_json::from_value(value).unwrap();
        assert_eq!(back, proxy);
        assert!(back.mailbox_address.starts_with("inproc://"));
    }
}
