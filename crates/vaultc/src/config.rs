//! The `.vault/var.vc` configuration file.
//!
//! Plain `KEY=VALUE` lines; anything without `=` is ignored. Holds the
//! two secrets every invocation needs (`MASTER_KEY`, `TOKEN`) plus the
//! optional security question/answer material used by lost-mode
//! recovery. Answers are never compared in the clear: a stored
//! `SECURITY_An_DIGEST` must equal the keyed digest of the corresponding
//! `SECURITY_An` under the master key.

use std::path::Path;

use thiserror::Error;

use crate::crypto::{self, CryptoError};

/// Default location, relative to the working directory.
pub const CONFIG_PATH: &str = ".vault/var.vc";

/// Security slots beyond this count are ignored with a warning.
const MAX_SECURITY_SLOTS: usize = 4;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing config: {0}")]
    Missing(String),

    #[error("Unable to read config: {path}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Config incomplete: require MASTER_KEY and TOKEN in {0}")]
    Incomplete(String),

    #[error("Security questions/answers required in lost mode")]
    SecurityRequired,

    #[error("Security answer digest mismatch for slot {0}")]
    SecurityDigestMismatch(usize),

    #[error("Missing security answer/digest for slot {0}")]
    SecuritySlotMissing(usize),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Clone, Default)]
pub struct VaultConfig {
    pub master_key: String,
    pub token: String,
    pub security_questions: Vec<String>,
    pub security_answers: Vec<String>,
    pub security_digests: Vec<String>,
}

impl VaultConfig {
    /// Load from the default `./.vault/var.vc` location.
    pub fn load(require_security: bool) -> Result<Self, ConfigError> {
        Self::load_from(Path::new(CONFIG_PATH), require_security)
    }

    /// Load from an explicit path. With `require_security` (lost-mode
    /// recovery) the security answers/digests are validated too.
    pub fn load_from(path: &Path, require_security: bool) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::Missing(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;

        let config = Self::parse(&content);
        if config.master_key.is_empty() || config.token.is_empty() {
            return Err(ConfigError::Incomplete(path.display().to_string()));
        }
        if require_security {
            config.verify_security()?;
        }
        Ok(config)
    }

    fn parse(content: &str) -> Self {
        let mut config = Self::default();
        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "MASTER_KEY" => config.master_key = value.to_string(),
                "TOKEN" => config.token = value.to_string(),
                "SECURITY_Q1" | "SECURITY_Q2" | "SECURITY_Q3" => {
                    config.security_questions.push(value.to_string());
                }
                "SECURITY_Q4" => {
                    config.security_questions.push(value.to_string());
                    eprintln!("Warning: SECURITY_Q4 present; only 3 are recommended");
                }
                "SECURITY_A1" | "SECURITY_A2" | "SECURITY_A3" | "SECURITY_A4" => {
                    config.security_answers.push(value.to_string());
                }
                "SECURITY_A1_DIGEST" | "SECURITY_A2_DIGEST" | "SECURITY_A3_DIGEST"
                | "SECURITY_A4_DIGEST" => {
                    config.security_digests.push(value.to_string());
                }
                _ => {}
            }
        }
        config
    }

    /// Lost-mode validation: every populated slot must yield a digest,
    /// and an answer given alongside a stored digest must reproduce it.
    pub fn verify_security(&self) -> Result<(), ConfigError> {
        if self.security_questions.len() > 3 {
            eprintln!("Warning: more than 3 security questions; only first 3 are recommended");
        }
        let mut count = self.security_digests.len().max(self.security_answers.len());
        if count == 0 {
            return Err(ConfigError::SecurityRequired);
        }
        if count > MAX_SECURITY_SLOTS {
            eprintln!("Warning: more than 4 security entries found; extra will be ignored");
            count = MAX_SECURITY_SLOTS;
        }
        for slot in 0..count {
            let mut digest = self.security_digests.get(slot).cloned().unwrap_or_default();
            if let Some(answer) = self.security_answers.get(slot) {
                let computed = crypto::digest(answer.as_bytes(), &self.master_key)?;
                if !digest.is_empty() && digest != computed {
                    return Err(ConfigError::SecurityDigestMismatch(slot + 1));
                }
                digest = computed;
            }
            if digest.is_empty() {
                return Err(ConfigError::SecuritySlotMissing(slot + 1));
            }
        }
        Ok(())
    }
}
