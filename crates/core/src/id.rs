//! Upload identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for an upload: 128 random bits, rendered as 32
/// lowercase hex characters (no dashes). This is the form used in URLs,
/// on-disk file names, and the database primary key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(Uuid);

impl UploadId {
    /// Generate a new random upload ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from the 32-hex-char wire form.
    pub fn parse(s: &str) -> crate::Result<Self> {
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(crate::Error::InvalidId(format!(
                "expected 32 hex characters, got {:?}",
                s
            )));
        }
        Uuid::try_parse(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidId(e.to_string()))
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0.simple())
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_is_32_hex_chars() {
        let id = UploadId::new().to_string();
        assert_eq!(id.len(), 32);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
        assert!(!id.contains('-'));
    }

    #[test]
    fn test_id_roundtrip() {
        let id = UploadId::new();
        let parsed = UploadId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_id_rejects_bad_input() {
        assert!(UploadId::parse("not-an-id").is_err());
        assert!(UploadId::parse("abc").is_err());
        // Hyphenated UUIDs are not the wire form.
        assert!(UploadId::parse("d9428888-122b-11e1-b85c-61cd3cbb3210").is_err());
    }
}
