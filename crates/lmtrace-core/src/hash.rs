//! Deterministic content hashing using blake3.
//!
//! Definition identity hashes source text, dependency text, and qualified
//! name with length framing so that moving bytes between fields cannot
//! collide. The state cache key hashes the captured runtime variables via
//! canonical `serde_json::to_vec` bytes; `IndexMap` preserves insertion
//! order, so identical capture walks produce identical keys.

use crate::model::CapturedState;

/// Computes the content hash underlying an [`LmpId`](crate::id::LmpId).
///
/// Deterministic: same inputs always produce the same hex digest.
pub fn definition_hash(source: &str, dependencies: &str, name: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in [source, dependencies, name] {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Computes the reserved state-cache key for an invocation from its
/// captured global and free variables.
pub fn state_cache_key(state: &CapturedState) -> String {
    let mut hasher = blake3::Hasher::new();
    let globals = serde_json::to_vec(&state.globals).unwrap_or_default();
    let frees = serde_json::to_vec(&state.frees).unwrap_or_default();
    hasher.update(&(globals.len() as u64).to_le_bytes());
    hasher.update(&globals);
    hasher.update(&frees);
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CapturedValue;
    use serde_json::json;

    #[test]
    fn definition_hash_deterministic() {
        let h1 = definition_hash("src", "deps", "mod.f");
        let h2 = definition_hash("src", "deps", "mod.f");
        assert_eq!(h1, h2);
    }

    #[test]
    fn definition_hash_field_boundaries_matter() {
        // "ab" + "c" must not collide with "a" + "bc".
        assert_ne!(
            definition_hash("ab", "c", "n"),
            definition_hash("a", "bc", "n")
        );
    }

    #[test]
    fn state_cache_key_tracks_captured_values() {
        let empty = CapturedState::default();
        let mut with_var = CapturedState::default();
        with_var
            .frees
            .insert("x".to_string(), CapturedValue::Primitive(json!(1)));
        assert_ne!(state_cache_key(&empty), state_cache_key(&with_var));
        assert_eq!(state_cache_key(&with_var), state_cache_key(&with_var));
    }
}
