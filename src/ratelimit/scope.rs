//! Scope and key handling.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier used for the single global scope.
pub const GLOBAL_IDENTIFIER: &str = "*";

/// The dimension along which a quota is tracked.
///
/// Scopes are listed in evaluation order: most protective first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Shared by every request
    Global,
    /// Keyed by client network address
    Client,
    /// Keyed by session identifier
    Session,
}

impl Scope {
    /// All scopes in evaluation order.
    pub const ALL: [Scope; 3] = [Scope::Global, Scope::Client, Scope::Session];

    /// Lowercase name used in logs and responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Client => "client",
            Scope::Session => "session",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key that uniquely identifies tracked state.
///
/// The scope tag is part of the key, so identical strings in different
/// scopes never share state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    /// The scope this identifier belongs to
    pub scope: Scope,
    /// Opaque identifier within the scope
    pub identifier: String,
}

impl ScopeKey {
    /// Create a new scope key.
    pub fn new(scope: Scope, identifier: impl Into<String>) -> Self {
        Self {
            scope,
            identifier: identifier.into(),
        }
    }

    /// The key for the global scope.
    pub fn global() -> Self {
        Self::new(Scope::Global, GLOBAL_IDENTIFIER)
    }

    /// Key for a client address.
    pub fn client(identifier: impl Into<String>) -> Self {
        Self::new(Scope::Client, identifier)
    }

    /// Key for a session identifier.
    pub fn session(identifier: impl Into<String>) -> Self {
        Self::new(Scope::Session, identifier)
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_scope_key_display() {
        assert_eq!(ScopeKey::client("10.0.0.1").to_string(), "client:10.0.0.1");
        assert_eq!(ScopeKey::global().to_string(), "global:*");
    }

    #[test]
    fn test_same_identifier_different_scopes_do_not_collide() {
        let mut keys = HashSet::new();
        keys.insert(ScopeKey::client("abc"));
        keys.insert(ScopeKey::session("abc"));

        assert_eq!(keys.len(), 2);
        assert_ne!(ScopeKey::client("abc"), ScopeKey::session("abc"));
    }

    #[test]
    fn test_scope_serde_names() {
        let json = serde_json::to_string(&Scope::Session).unwrap();
        assert_eq!(json, "\"session\"");
        let scope: Scope = serde_json::from_str("\"client\"").unwrap();
        assert_eq!(scope, Scope::Client);
    }
}
