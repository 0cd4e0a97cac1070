//! Strongly-typed identifiers.
//!
//! All IDs are validated at construction time and implement common traits.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to define a strongly-typed ID newtype wrapper.
///
/// Generates: struct, `new()` (UUID v4), `from_string()`, `as_str()`, Display,
/// Serialize, Deserialize and `Default`.
macro_rules! define_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn from_string(s: String) -> Result<Self, &'static str> {
                if s.is_empty() {
                    return Err(concat!(stringify!($name), " cannot be empty"));
                }
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// First 8 characters, for log lines.
            pub fn short(&self) -> &str {
                self.0.get(..8).unwrap_or(&self.0)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(ActorId);
define_id!(CorrelationId);

/// What role an actor plays in the supervision tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    Arbiter,
    Monitor,
    Actor,
}

/// Immutable identity assigned at spawn time.
///
/// Equality and hashing only look at `aid`; `name` is the monitor or top-level
/// actor name the identity was spawned under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorIdentity {
    pub aid: ActorId,
    pub kind: ActorKind,
    pub name: String,
}

impl ActorIdentity {
    pub fn new(kind: ActorKind, name: impl Into<String>) -> Self {
        Self {
            aid: ActorId::new(),
            kind,
            name: name.into(),
        }
    }

    pub fn arbiter() -> Self {
        Self::new(ActorKind::Arbiter, "arbiter")
    }
}

impl PartialEq for ActorIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.aid == other.aid
    }
}

impl Eq for ActorIdentity {}

impl std::hash::Hash for ActorIdentity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.aid.hash(state);
    }
}

impl fmt::Display for ActorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.aid.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(ActorId::new(), ActorId::new());
        assert_ne!(CorrelationId::new(), CorrelationId::new());
    }

    #[test]
    fn test_empty_id_rejected() {
        assert!(ActorId::from_string(String::new()).is_err());
        assert_eq!(ActorId::from_string("abc".into()).unwrap().as_str(), "abc");
    }

    #[test]
    fn test_identity_equality_uses_aid() {
        let a = ActorIdentity::new(ActorKind::Actor, "echo");
        let mut b = a.clone();
        b.name = "renamed".into();
        assert_eq!(a, b);
        assert_ne!(a, ActorIdentity::new(ActorKind::Actor, "echo"));
    }

    #[test]
    fn test_short_id() {
        let id = ActorId::from_string("0123456789".into()).unwrap();
        assert_eq!(id.short(), "01234567");
        let tiny = ActorId::from_string("ab".into()).unwrap();
        assert_eq!(tiny.short(), "ab");
    }
}
