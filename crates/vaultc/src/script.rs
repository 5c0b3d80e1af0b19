//! The tiny `.vsc` query sub-language.
//!
//! One fixed loop form over decrypted entries:
//!
//! ```text
//! for <IDX>, <DOC> in document:find::matching("<substr>"):
//!     log(<DOC>.value)
//!     log(<DOC>.<field>)
//!     log(<IDX>)
//! ```
//!
//! Entries whose key contains the substring are visited in archive
//! order; the index counts matching entries only. Field extraction on
//! document values is best-effort regex over `field: number` and
//! `field: "string"` forms; anything that does not match prints nothing.

use std::path::Path;

use regex::Regex;
use thiserror::Error;

use crate::archive::Archive;
use crate::crypto::{self, CryptoError};
use crate::vault::entry_salt;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Unable to read script: {path}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported script header")]
    BadHeader,

    #[error("Need two loop vars")]
    NeedTwoVars,

    #[error("Bad matching() syntax")]
    BadMatching,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// A decrypted entry, ready for querying.
#[derive(Debug, Clone)]
pub struct PlainEntry {
    pub registry: String,
    pub key: String,
    pub value: String,
    pub mac: String,
}

/// Decrypt every entry of a verified archive, in archive order. Entries
/// of an unsealed vault carry their raw cipher text as the value.
pub fn decrypt_entries(archive: &Archive) -> Result<Vec<PlainEntry>, CryptoError> {
    let mut out = Vec::new();
    for vault in &archive.vaults {
        for (name, registry) in &vault.registries {
            for (key, entry) in &registry.entries {
                let value = if vault.sealed {
                    crypto::decrypt(&entry.cipher, &vault.master_key_hex, &entry_salt(name, key))?
                } else {
                    entry.cipher.clone()
                };
                out.push(PlainEntry {
                    registry: name.clone(),
                    key: key.clone(),
                    value,
                    mac: entry.digest.clone(),
                });
            }
        }
    }
    Ok(out)
}

/// Run a query script over decrypted entries; returns the logged lines.
pub fn run_source(source: &str, entries: &[PlainEntry]) -> Result<Vec<String>, ScriptError> {
    let lines: Vec<&str> = source.lines().filter(|l| !l.is_empty()).collect();
    let Some(header) = lines.first() else {
        return Ok(Vec::new());
    };

    let (idx_var, doc_var, needle) = parse_header(header)?;
    let body = &lines[1..];

    let mut logged = Vec::new();
    let mut idx = 0usize;
    for entry in entries {
        if !entry.key.contains(&needle) {
            continue;
        }
        for line in body {
            let trimmed = line.trim();
            let Some(inside) = trimmed
                .strip_prefix("log(")
                .and_then(|rest| rest.strip_suffix(')'))
            else {
                continue;
            };
            if inside == format!("{}.value", doc_var) {
                logged.push(entry.value.clone());
            } else if let Some(field) = inside.strip_prefix(&format!("{}.", doc_var)) {
                if let Some(value) = extract_field(&entry.value, field) {
                    logged.push(value);
                }
            } else if inside == idx_var {
                logged.push(idx.to_string());
            }
        }
        idx += 1;
    }
    Ok(logged)
}

/// Run a query script file.
pub fn run_file(path: &Path, entries: &[PlainEntry]) -> Result<Vec<String>, ScriptError> {
    let source = std::fs::read_to_string(path).map_err(|source| ScriptError::Unreadable {
        path: path.display().to_string(),
        source,
    })?;
    run_source(&source, entries)
}

/// `for <IDX>, <DOC> in document:find::matching("<substr>"):`
fn parse_header(header: &str) -> Result<(String, String, String), ScriptError> {
    const MATCHING: &str = ":find::matching(";

    let vars = header.strip_prefix("for ").ok_or(ScriptError::BadHeader)?;
    let matching = header.find(MATCHING).ok_or(ScriptError::BadHeader)?;
    let in_pos = header.find(" in ").ok_or(ScriptError::BadHeader)?;
    let vars = &vars[..in_pos.saturating_sub(4)];

    let (idx_var, doc_var) = vars.split_once(',').ok_or(ScriptError::NeedTwoVars)?;

    let needle_start = matching + MATCHING.len();
    let needle_end = header[needle_start..]
        .find(')')
        .ok_or(ScriptError::BadMatching)?
        + needle_start;
    let mut needle = &header[needle_start..needle_end];
    if needle.len() >= 2 && needle.starts_with('"') && needle.ends_with('"') {
        needle = &needle[1..needle.len() - 1];
    }

    Ok((
        idx_var.trim().to_string(),
        doc_var.trim().to_string(),
        needle.to_string(),
    ))
}

/// Pull `field: 123` or `field: "text"` out of a document value. The
/// number form wins when both are present.
fn extract_field(doc: &str, field: &str) -> Option<String> {
    let escaped = regex::escape(field);
    let num = Regex::new(&format!(r"{}\s*:\s*([-+]?[0-9]+(?:\.[0-9]+)?)", escaped)).ok()?;
    if let Some(captures) = num.captures(doc) {
        return Some(captures[1].to_string());
    }
    let text = Regex::new(&format!(r#"{}\s*:\s*"([^"]*)""#, escaped)).ok()?;
    text.captures(doc).map(|captures| captures[1].to_string())
}
