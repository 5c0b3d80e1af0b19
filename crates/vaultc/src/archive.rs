//! Canonical `.svau` serialization, parsing and the archive MAC.
//!
//! The MAC preimage and the on-disk body share one canonicalizer so they
//! cannot drift: the preimage starts with a `token <TOKEN>` line (the
//! shared secret, never written to disk) and omits the header comment and
//! the trailing `hmac` line; the disk form starts with the header comment
//! and is followed by exactly one `hmac <HEX>` line appended after the
//! body is written.
//!
//! Canonical order: vaults as emitted this run, registries and entries
//! lexicographic, dependencies sorted and deduplicated.

use std::path::Path;

use thiserror::Error;

use crate::crypto::{self, CryptoError};
use crate::vault::{entry_salt, SealedEntry, SealedRegistry, SealedVault};

/// Fixed first line of every on-disk archive.
pub const HEADER: &str = "# Vault Secure Archive";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Unable to read: {path}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed archive (line {0})")]
    Malformed(usize),

    #[error("Token mismatch for archive")]
    TokenMismatch,

    #[error("Archive HMAC verification failed")]
    MacMismatch,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// A parsed archive: sealed vaults, their dependency set and whatever
/// `hmac` / legacy `token` lines the file carried.
#[derive(Debug, Clone, Default)]
pub struct Archive {
    pub token: String,
    pub hmac: String,
    pub dependencies: Vec<String>,
    pub vaults: Vec<SealedVault>,
}

/// Sort and deduplicate a dependency list.
pub fn sorted_unique(mut deps: Vec<String>) -> Vec<String> {
    deps.sort();
    deps.dedup();
    deps
}

/// The shared canonical body: `depends` lines, then each vault with its
/// registries and entries, each vault closed by `---`.
fn push_body(out: &mut String, vaults: &[SealedVault], dependencies: &[String]) {
    for dep in sorted_unique(dependencies.to_vec()) {
        out.push_str("depends ");
        out.push_str(&dep);
        out.push('\n');
    }
    for vault in vaults {
        let kind = if vault.optional { "optional" } else { "required" };
        out.push_str(&format!("vault {} ({})\n", vault.name, kind));
        out.push_str(&format!("sealed {}\n", vault.sealed));
        for (name, registry) in &vault.registries {
            out.push_str(&format!("  registry {}\n", name));
            for (key, entry) in &registry.entries {
                out.push_str(&format!("    entry {}\n", key));
                out.push_str(&format!("      digest {}\n", entry.digest));
                out.push_str(&format!("      cipher {}\n", entry.cipher));
            }
        }
        out.push_str("---\n");
    }
}

/// On-disk form without the trailing `hmac` line.
pub fn disk_form(vaults: &[SealedVault], dependencies: &[String]) -> String {
    let mut out = String::new();
    out.push_str(HEADER);
    out.push('\n');
    push_body(&mut out, vaults, dependencies);
    out
}

/// MAC preimage: the configured token followed by the canonical body.
/// Not identical to the disk form; the token never reaches disk.
pub fn mac_preimage(vaults: &[SealedVault], dependencies: &[String], token: &str) -> String {
    let mut out = String::new();
    out.push_str("token ");
    out.push_str(token);
    out.push('\n');
    push_body(&mut out, vaults, dependencies);
    out
}

/// The archive MAC: keyed digest of the preimage under the master key.
pub fn archive_hmac(
    vaults: &[SealedVault],
    dependencies: &[String],
    token: &str,
    master_key_hex: &str,
) -> Result<String, CryptoError> {
    crypto::digest(
        mac_preimage(vaults, dependencies, token).as_bytes(),
        master_key_hex,
    )
}

/// Parse archive text. Master keys are not stored in archives, so every
/// parsed vault comes back with an empty key; callers inject the
/// configured one.
pub fn parse(text: &str) -> Result<Archive, ArchiveError> {
    let mut archive = Archive::default();
    let mut current: Option<SealedVault> = None;
    let mut current_registry: Option<String> = None;
    let mut current_entry: Option<String> = None;

    for (idx, line) in text.lines().enumerate() {
        let number = idx + 1;
        if line == "---" {
            if let Some(vault) = current.take() {
                archive.vaults.push(vault);
            }
            current_registry = None;
            current_entry = None;
            continue;
        }
        if line.is_empty() || line == HEADER {
            continue;
        }
        if let Some(rest) = line.strip_prefix("hmac ") {
            archive.hmac = rest.to_string();
            continue;
        }
        if let Some(rest) = line.strip_prefix("depends ") {
            archive.dependencies.push(rest.to_string());
            continue;
        }
        if let Some(rest) = line.strip_prefix("token ") {
            archive.token = rest.to_string();
            continue;
        }
        if let Some(rest) = line.strip_prefix("vault ") {
            if let Some(vault) = current.take() {
                archive.vaults.push(vault);
            }
            current_registry = None;
            current_entry = None;
            let name = rest
                .split_whitespace()
                .next()
                .ok_or(ArchiveError::Malformed(number))?;
            let optional = rest.contains("(optional)");
            current = Some(SealedVault::new(name.to_string(), optional, String::new()));
            continue;
        }
        if let Some(rest) = line.strip_prefix("sealed ") {
            let vault = current.as_mut().ok_or(ArchiveError::Malformed(number))?;
            vault.sealed = rest == "true";
            continue;
        }
        if let Some(rest) = line.strip_prefix("  registry ") {
            let vault = current.as_mut().ok_or(ArchiveError::Malformed(number))?;
            vault
                .registries
                .insert(rest.to_string(), SealedRegistry::default());
            current_registry = Some(rest.to_string());
            current_entry = None;
            continue;
        }
        if let Some(rest) = line.strip_prefix("    entry ") {
            let vault = current.as_mut().ok_or(ArchiveError::Malformed(number))?;
            let registry = current_registry
                .as_ref()
                .ok_or(ArchiveError::Malformed(number))?;
            vault
                .registries
                .get_mut(registry)
                .ok_or(ArchiveError::Malformed(number))?
                .entries
                .insert(
                    rest.to_string(),
                    SealedEntry {
                        digest: String::new(),
                        cipher: String::new(),
                    },
                );
            current_entry = Some(rest.to_string());
            continue;
        }
        if let Some(rest) = line.strip_prefix("      digest ") {
            entry_mut(&mut current, &current_registry, &current_entry, number)?.digest =
                rest.to_string();
            continue;
        }
        if let Some(rest) = line.strip_prefix("      cipher ") {
            entry_mut(&mut current, &current_registry, &current_entry, number)?.cipher =
                rest.to_string();
            continue;
        }
        return Err(ArchiveError::Malformed(number));
    }

    if let Some(vault) = current.take() {
        archive.vaults.push(vault);
    }
    Ok(archive)
}

fn entry_mut<'a>(
    current: &'a mut Option<SealedVault>,
    registry: &Option<String>,
    entry: &Option<String>,
    number: usize,
) -> Result<&'a mut SealedEntry, ArchiveError> {
    let vault = current.as_mut().ok_or(ArchiveError::Malformed(number))?;
    let registry = registry.as_ref().ok_or(ArchiveError::Malformed(number))?;
    let entry = entry.as_ref().ok_or(ArchiveError::Malformed(number))?;
    vault
        .registries
        .get_mut(registry)
        .and_then(|reg| reg.entries.get_mut(entry))
        .ok_or(ArchiveError::Malformed(number))
}

/// Read and parse an archive file.
pub fn read_file(path: &Path) -> Result<Archive, ArchiveError> {
    let text = std::fs::read_to_string(path).map_err(|source| ArchiveError::Unreadable {
        path: path.display().to_string(),
        source,
    })?;
    parse(&text)
}

/// Full load protocol: parse, check any stored token against the
/// configured one, inject the configured master key into every vault,
/// recompute the MAC with the configured token and compare. A missing or
/// empty `hmac` line is tolerated for legacy archives.
pub fn load_verified(
    path: &Path,
    config_token: &str,
    master_key_hex: &str,
) -> Result<Archive, ArchiveError> {
    let mut archive = read_file(path)?;
    if !archive.token.is_empty() && archive.token != config_token {
        return Err(ArchiveError::TokenMismatch);
    }
    for vault in &mut archive.vaults {
        vault.master_key_hex = master_key_hex.to_string();
    }
    let want = archive_hmac(
        &archive.vaults,
        &archive.dependencies,
        config_token,
        master_key_hex,
    )?;
    if !archive.hmac.is_empty() && archive.hmac != want {
        return Err(ArchiveError::MacMismatch);
    }
    Ok(archive)
}

/// Human-readable decrypted view of a verified archive.
///
/// Sealed entries decrypt under their slot salt; entries of an unsealed
/// vault print their raw cipher text. `hide_mac` drops the per-entry mac
/// suffix.
pub fn decrypted_view(archive: &Archive, hide_mac: bool) -> Result<String, CryptoError> {
    let mut out = String::new();
    out.push_str("# Vault Archive (decrypted view)\n");
    if !archive.dependencies.is_empty() {
        out.push_str("depends");
        for dep in &archive.dependencies {
            out.push(' ');
            out.push_str(dep);
        }
        out.push('\n');
    }
    for vault in &archive.vaults {
        out.push_str(&format!("vault {}\n", vault.name));
        for (name, registry) in &vault.registries {
            out.push_str(&format!("  registry {}\n", name));
            for (key, entry) in &registry.entries {
                let plain = if vault.sealed {
                    crypto::decrypt(&entry.cipher, &vault.master_key_hex, &entry_salt(name, key))?
                } else {
                    entry.cipher.clone()
                };
                if hide_mac || !vault.sealed {
                    out.push_str(&format!("    {} = \"{}\"\n", key, plain));
                } else {
                    out.push_str(&format!("    {} = \"{}\" (mac={})\n", key, plain, entry.digest));
                }
            }
        }
        out.push_str("---\n");
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::testing::FixedRandom;
    use std::collections::BTreeMap;

    const KEY: &str = "0000000000000000000000000000000000000000000000000000000000000000";

    fn sample_vault() -> SealedVault {
        let mut registries = BTreeMap::new();
        for (reg, key, value, fill) in [
            ("zeta", "b", "v1", 1u8),
            ("zeta", "a", "v2", 2),
            ("alpha", "k", "v3", 3),
        ] {
            let salt = entry_salt(reg, key);
            let cipher = crypto::encrypt(value, KEY, &salt, &FixedRandom(fill)).unwrap();
            let digest = crypto::digest(cipher.as_bytes(), KEY).unwrap();
            registries
                .entry(reg.to_string())
                .or_insert_with(SealedRegistry::default)
                .entries
                .insert(key.to_string(), SealedEntry { digest, cipher });
        }
        SealedVault {
            name: "A".into(),
            optional: false,
            sealed: true,
            master_key_hex: KEY.into(),
            registries,
        }
    }

    #[test]
    fn test_disk_form_is_canonical() {
        let vault = sample_vault();
        let deps = vec!["b.svau".to_string(), "a.svau".to_string(), "b.svau".to_string()];
        let text = disk_form(&[vault], &deps);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], HEADER);
        // Dependencies sorted and deduplicated.
        assert_eq!(lines[1], "depends a.svau");
        assert_eq!(lines[2], "depends b.svau");
        assert_eq!(lines[3], "vault A (required)");
        assert_eq!(lines[4], "sealed true");
        // Registries lexicographic, entries lexicographic within each.
        assert_eq!(lines[5], "  registry alpha");
        assert_eq!(lines[6], "    entry k");
        assert_eq!(lines[9], "  registry zeta");
        assert_eq!(lines[10], "    entry a");
        assert_eq!(lines[13], "    entry b");
        assert_eq!(*lines.last().unwrap(), "---");
    }

    #[test]
    fn test_preimage_carries_token_disk_does_not() {
        let vault = sample_vault();
        let preimage = mac_preimage(&[vault.clone()], &[], "secret-token");
        assert!(preimage.starts_with("token secret-token\n"));
        assert!(!preimage.contains(HEADER));
        let disk = disk_form(&[vault], &[]);
        assert!(!disk.contains("token "));
        assert!(!disk.contains(KEY));
    }

    #[test]
    fn test_parse_round_trips_disk_form() {
        let vault = sample_vault();
        let deps = vec!["seed.svau".to_string()];
        let hmac = archive_hmac(&[vault.clone()], &deps, "t", KEY).unwrap();
        let mut text = disk_form(&[vault.clone()], &deps);
        text.push_str(&format!("hmac {}\n", hmac));

        let parsed = parse(&text).unwrap();
        assert_eq!(parsed.hmac, hmac);
        assert_eq!(parsed.dependencies, deps);
        assert_eq!(parsed.token, "");
        assert_eq!(parsed.vaults.len(), 1);
        let round = &parsed.vaults[0];
        assert_eq!(round.name, vault.name);
        assert_eq!(round.sealed, vault.sealed);
        assert_eq!(round.registries, vault.registries);
        // Master keys never travel in the archive.
        assert_eq!(round.master_key_hex, "");
    }

    #[test]
    fn test_mac_round_trip_and_tamper_detection() {
        let vault = sample_vault();
        let deps: Vec<String> = vec![];
        let hmac = archive_hmac(&[vault.clone()], &deps, "t", KEY).unwrap();
        let mut text = disk_form(&[vault], &deps);
        text.push_str(&format!("hmac {}\n", hmac));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.svau");
        std::fs::write(&path, &text).unwrap();
        assert!(load_verified(&path, "t", KEY).is_ok());

        // Flip the last hex digit of the hmac line.
        let tampered = if text.ends_with("0\n") {
            format!("{}1\n", &text[..text.len() - 2])
        } else {
            format!("{}0\n", &text[..text.len() - 2])
        };
        std::fs::write(&path, &tampered).unwrap();
        assert!(matches!(
            load_verified(&path, "t", KEY).unwrap_err(),
            ArchiveError::MacMismatch
        ));

        // Corrupt one cipher line instead.
        let corrupted = text.replace("      cipher ", "      cipher X");
        std::fs::write(&path, &corrupted).unwrap();
        assert!(matches!(
            load_verified(&path, "t", KEY).unwrap_err(),
            ArchiveError::MacMismatch
        ));
    }

    #[test]
    fn test_token_binds_the_mac() {
        let vault = sample_vault();
        let a = archive_hmac(&[vault.clone()], &[], "t1", KEY).unwrap();
        let b = archive_hmac(&[vault.clone()], &[], "t2", KEY).unwrap();
        assert_ne!(a, b);

        // An archive written under t1 fails verification under t2.
        let mut text = disk_form(&[vault], &[]);
        text.push_str(&format!("hmac {}\n", a));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.svau");
        std::fs::write(&path, &text).unwrap();
        assert!(matches!(
            load_verified(&path, "t2", KEY).unwrap_err(),
            ArchiveError::MacMismatch
        ));
    }

    #[test]
    fn test_legacy_archive_without_hmac_tolerated() {
        let text = disk_form(&[sample_vault()], &[]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.svau");
        std::fs::write(&path, &text).unwrap();
        assert!(load_verified(&path, "t", KEY).is_ok());
    }

    #[test]
    fn test_stored_token_mismatch() {
        let mut text = String::from("token other\n");
        text.push_str(&disk_form(&[sample_vault()], &[]));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tok.svau");
        std::fs::write(&path, &text).unwrap();
        assert!(matches!(
            load_verified(&path, "t", KEY).unwrap_err(),
            ArchiveError::TokenMismatch
        ));
    }

    #[test]
    fn test_malformed_lines_rejected() {
        assert!(matches!(
            parse("garbage here\n").unwrap_err(),
            ArchiveError::Malformed(1)
        ));
        assert!(matches!(
            parse("    entry k\n").unwrap_err(),
            ArchiveError::Malformed(1)
        ));
        assert!(matches!(
            parse("vault A (required)\n      digest d\n").unwrap_err(),
            ArchiveError::Malformed(2)
        ));
    }

    #[test]
    fn test_canonical_bodies_identical_for_same_logical_content() {
        // Two emission paths producing the same vault set and dependency
        // set serialize byte-identically.
        let v1 = sample_vault();
        let v2 = sample_vault();
        let a = disk_form(&[v1], &["x.svau".into(), "y.svau".into()]);
        let b = disk_form(&[v2], &["y.svau".into(), "x.svau".into(), "x.svau".into()]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_decrypted_view() {
        let archive = Archive {
            token: String::new(),
            hmac: String::new(),
            dependencies: vec!["seed.svau".into()],
            vaults: vec![sample_vault()],
        };
        let view = decrypted_view(&archive, false).unwrap();
        assert!(view.starts_with("# Vault Archive (decrypted view)\n"));
        assert!(view.contains("depends seed.svau\n"));
        assert!(view.contains("vault A\n"));
        assert!(view.contains("  registry alpha\n"));
        assert!(view.contains("    k = \"v3\" (mac="));

        let hidden = decrypted_view(&archive, true).unwrap();
        assert!(hidden.contains("    k = \"v3\"\n"));
        assert!(!hidden.contains("(mac="));
    }

    #[test]
    fn test_decrypted_view_unsealed_prints_cipher() {
        let mut vault = sample_vault();
        vault.sealed = false;
        let cipher = vault.registries["alpha"].entries["k"].cipher.clone();
        let archive = Archive {
            vaults: vec![vault],
            ..Default::default()
        };
        let view = decrypted_view(&archive, false).unwrap();
        assert!(view.contains(&format!("    k = \"{}\"\n", cipher)));
    }
}
