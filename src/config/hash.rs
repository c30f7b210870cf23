//! Declaration fingerprints.
//!
//! A saved plan records the fingerprint of the declarations it was computed
//! from; applying it later is refused when the declarations changed.

use sha2::{Digest, Sha256};

use crate::declaration::DeclarationSet;
use crate::error::ConfigError;

/// Hasher for computing declaration fingerprints.
#[derive(Debug, Default)]
pub struct DeclarationHasher;

impl DeclarationHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the fingerprint of a declaration set.
    ///
    /// Maps in the declaration model are ordered, so the canonical JSON
    /// encoding is deterministic.
    ///
    /// # Errors
    ///
    /// Returns an error if the declarations cannot be encoded.
    pub fn fingerprint(&self, declarations: &DeclarationSet) -> Result<String, ConfigError> {
        let encoded = serde_json::to_vec(declarations).map_err(|e| ConfigError::ParseError {
            message: format!("Failed to encode declarations: {e}"),
            location: None,
        })?;

        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two fingerprints.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::{Expr, ResourceDeclaration};

    fn declarations(name: &str) -> DeclarationSet {
        DeclarationSet {
            resources: vec![ResourceDeclaration::new("bucket", "b").with_argument("name", Expr::string(name))],
            ..DeclarationSet::default()
        }
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let hasher = DeclarationHasher::new();
        let first = hasher.fingerprint(&declarations("logs")).expect("hash");
        let second = hasher.fingerprint(&declarations("logs")).expect("hash");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn test_fingerprint_changes() {
        let hasher = DeclarationHasher::new();
        let first = hasher.fingerprint(&declarations("logs")).expect("hash");
        let second = hasher.fingerprint(&declarations("audit")).expect("hash");
        assert!(!DeclarationHasher::hashes_match(&first, &second));
        assert_eq!(hasher.short_hash(&first).len(), 8);
    }
}
