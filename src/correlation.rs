use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier pairing an RPC request with its reply.
///
/// Correlation ids travel in the message properties and are opaque to the
/// transport layer. One id belongs to at most one outstanding call at a time;
/// the connection enforces this when the call is issued.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a new unique correlation id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the correlation id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        // ---
        let id1 = CorrelationId::generate();
        let id2 = CorrelationId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn generated_ids_use_uuid_format() {
        // ---
        let id = CorrelationId::generate();
        assert_eq!(id.to_string().len(), 36);
    }

    #[test]
    fn converts_from_borrowed_and_owned() {
        // ---
        let a = CorrelationId::from("call-1");
        let b = CorrelationId::from("call-1".to_string());
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "call-1");
    }
}
