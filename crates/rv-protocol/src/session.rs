//! Session identifier type

use std::fmt;

/// Opaque token naming a server-side evaluation session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Create a new session ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw token
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_display() {
        let id = SessionId::new("5a1f");
        assert_eq!(format!("{}", id), "session-5a1f");
        assert_eq!(id.as_str(), "5a1f");
    }

    #[test]
    fn test_session_id_equality() {
        let id1 = SessionId::from("a");
        let id2 = SessionId::new(String::from("a"));
        let id3 = SessionId::from("b");

        assert_eq!(id1, id2);
        assert_ne!(id1, id3);
    }
}
