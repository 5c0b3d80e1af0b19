//! Sealed-state model: vaults, registries and encrypted entries.
//!
//! A `SealedVault` is mutable until its `secure` statement runs, then
//! frozen. Registries and entries are kept in `BTreeMap`s so iteration is
//! always lexicographic, which is exactly the canonical archive order.

use std::collections::BTreeMap;

/// One encrypted entry at `registry:key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedEntry {
    /// Keyed digest of the base64 cipher under the vault's master key.
    pub digest: String,
    /// `base64(iv ‖ tag ‖ ciphertext)`.
    pub cipher: String,
}

/// A keyed sub-namespace inside a vault.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SealedRegistry {
    pub entries: BTreeMap<String, SealedEntry>,
}

/// A named collection of registries evaluated as a unit.
///
/// The master key is carried in memory only; it is injected from
/// configuration and never serialized into the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedVault {
    pub name: String,
    pub optional: bool,
    pub sealed: bool,
    pub master_key_hex: String,
    pub registries: BTreeMap<String, SealedRegistry>,
}

impl SealedVault {
    /// A fresh, unsealed vault with no registries.
    pub fn new(name: String, optional: bool, master_key_hex: String) -> Self {
        Self {
            name,
            optional,
            sealed: false,
            master_key_hex,
            registries: BTreeMap::new(),
        }
    }

    /// Whether `registry` holds `key`. A nonexistent registry counts as
    /// "key absent".
    pub fn contains(&self, registry: &str, key: &str) -> bool {
        self.registries
            .get(registry)
            .is_some_and(|reg| reg.entries.contains_key(key))
    }
}

/// AAD salt binding an entry's ciphertext to its slot.
pub fn entry_salt(registry: &str, key: &str) -> String {
    format!("{}:{}", registry, key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_missing_registry_is_absent() {
        let vault = SealedVault::new("a".into(), false, "00".repeat(32));
        assert!(!vault.contains("nope", "k"));
    }

    #[test]
    fn test_contains() {
        let mut vault = SealedVault::new("a".into(), false, "00".repeat(32));
        vault.registries.entry("r".into()).or_default().entries.insert(
            "k".into(),
            SealedEntry {
                digest: "d".into(),
                cipher: "c".into(),
            },
        );
        assert!(vault.contains("r", "k"));
        assert!(!vault.contains("r", "other"));
    }

    #[test]
    fn test_entry_salt() {
        assert_eq!(entry_salt("R", "k"), "R:k");
    }
}
