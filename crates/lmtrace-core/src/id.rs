//! Stable ID newtypes for tracked entities.
//!
//! All IDs are distinct newtype wrappers over `String`, providing type
//! safety so that an `InvocationId` cannot be accidentally used where an
//! `LmpId` is expected. Definition and blob identities are content-derived;
//! invocation identities are opaque random tokens.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::hash::definition_hash;

/// Content identity of an LMP definition: `lmp-{blake3 hex}` over the
/// concatenation of source text, dependency text, and qualified name.
///
/// Deterministic and immutable: the same inputs always derive the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LmpId(pub String);

impl LmpId {
    /// Derives the content identity for a definition.
    pub fn derive(source: &str, dependencies: &str, name: &str) -> Self {
        LmpId(format!("lmp-{}", definition_hash(source, dependencies, name)))
    }
}

/// Opaque unique token identifying one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationId(pub String);

impl InvocationId {
    /// Mints a fresh invocation token.
    pub fn new() -> Self {
        InvocationId(format!("invocation-{}", uuid::Uuid::new_v4()))
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        InvocationId::new()
    }
}

/// Content identity of an out-of-line blob: `{type}-{blake3 hex}`.
///
/// The hex part determines the on-disk nesting path, so parsing validates
/// that it is long enough and actually hexadecimal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobId(pub String);

impl BlobId {
    /// Derives a blob identity from its type tag and payload bytes.
    pub fn derive(kind: &str, payload: &[u8]) -> Self {
        BlobId(format!("{}-{}", kind, blake3::hash(payload).to_hex()))
    }

    /// Splits the id into its `(type, hex)` parts, validating the shape.
    pub fn parts(&self) -> Result<(&str, &str), CoreError> {
        let (kind, hex) = self
            .0
            .rsplit_once('-')
            .ok_or_else(|| CoreError::MalformedBlobId(self.0.clone()))?;
        if kind.is_empty() || hex.len() < 4 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CoreError::MalformedBlobId(self.0.clone()));
        }
        Ok((kind, hex))
    }
}

// Display implementations -- just print the inner value.

impl fmt::Display for LmpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lmp_id_is_deterministic() {
        let a = LmpId::derive("def hello():", "import os", "mod.hello");
        let b = LmpId::derive("def hello():", "import os", "mod.hello");
        assert_eq!(a, b);
        assert!(a.0.starts_with("lmp-"));
    }

    #[test]
    fn lmp_id_changes_with_any_input() {
        let base = LmpId::derive("src", "deps", "name");
        assert_ne!(base, LmpId::derive("src2", "deps", "name"));
        assert_ne!(base, LmpId::derive("src", "deps2", "name"));
        assert_ne!(base, LmpId::derive("src", "deps", "name2"));
    }

    #[test]
    fn invocation_ids_are_unique() {
        assert_ne!(InvocationId::new(), InvocationId::new());
    }

    #[test]
    fn blob_id_parts_roundtrip() {
        let id = BlobId::derive("invocation-contents", b"payload");
        let (kind, hex) = id.parts().unwrap();
        assert_eq!(kind, "invocation-contents");
        assert_eq!(hex.len(), 64);
    }

    #[test]
    fn malformed_blob_id_is_rejected() {
        assert!(BlobId("nodash".to_string()).parts().is_err());
        assert!(BlobId("kind-zz!!".to_string()).parts().is_err());
        assert!(BlobId("kind-ab".to_string()).parts().is_err());
    }
}
