//! Statement execution against the sealed-state model.
//!
//! The interpreter owns the live vault map for a run: vaults loaded from
//! a seed archive plus vaults created by the program. Each vault block is
//! evaluated in source order and appended to the run's output once its
//! body completes; the parser guarantees the body ends with `secure`, so
//! emitted vaults are sealed.
//!
//! Randomness and the wall clock are the only non-deterministic inputs,
//! both injected so tests can pin them.

use std::collections::BTreeMap;

use chrono::{Local, NaiveDateTime};
use thiserror::Error;

use crate::ast::{Statement, Target, ValueExpr, VaultBlock};
use crate::crypto::{self, CryptoError, RandomSource, SystemRandomSource};
use crate::vault::{entry_salt, SealedEntry, SealedVault};

/// Number of random bytes behind the `generate` builtin (32 hex chars).
const GENERATE_BYTES: usize = 16;

/// Timestamp format of the `now` builtin. Local time, no zone suffix.
const NOW_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("Cannot {action} after secure (line {line})")]
    SealedVaultWrite { action: &'static str, line: usize },

    #[error("store would overwrite existing key on line {0}")]
    Overwrite(usize),

    #[error("No active registry for target on line {0}")]
    NoActiveRegistry(usize),

    #[error("Unknown builtin: {0}")]
    UnknownBuiltin(String),

    #[error("Master key mismatch for vault '{0}'")]
    MasterKeyMismatch(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Clock behind the `now` builtin.
pub trait Clock {
    fn now(&self) -> NaiveDateTime;
}

/// System local time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

#[derive(Default)]
pub struct InterpreterOptions {
    /// Trace evaluation on stderr.
    pub verbose: bool,
    /// Create optional vaults even when absent from the seed.
    pub materialize_optional: bool,
    /// Master key every vault must use. A seeded vault whose key differs
    /// is a hard error.
    pub forced_master_key: Option<String>,
}

pub struct Interpreter {
    opts: InterpreterOptions,
    rng: Box<dyn RandomSource>,
    clock: Box<dyn Clock>,
    by_name: BTreeMap<String, SealedVault>,
    output: Vec<SealedVault>,
    current_registry: Option<String>,
}

impl Interpreter {
    pub fn new(opts: InterpreterOptions) -> Self {
        Self::with_sources(opts, Box::new(SystemRandomSource::new()), Box::new(SystemClock))
    }

    /// Interpreter with injected randomness and clock.
    pub fn with_sources(
        opts: InterpreterOptions,
        rng: Box<dyn RandomSource>,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            opts,
            rng,
            clock,
            by_name: BTreeMap::new(),
            output: Vec::new(),
            current_registry: None,
        }
    }

    /// Load vaults from a prior archive. Same-name collisions keep the
    /// later vault.
    pub fn seed(&mut self, existing: Vec<SealedVault>) {
        self.by_name.clear();
        self.output.clear();
        for vault in existing {
            self.by_name.insert(vault.name.clone(), vault);
        }
    }

    /// Evaluate a program and return the vaults emitted this run, in
    /// emission order.
    pub fn run(&mut self, program: &[VaultBlock]) -> Result<Vec<SealedVault>, EvalError> {
        self.output.clear();
        for block in program {
            self.evaluate_vault(block)?;
        }
        Ok(std::mem::take(&mut self.output))
    }

    fn evaluate_vault(&mut self, block: &VaultBlock) -> Result<(), EvalError> {
        self.current_registry = None;

        let exists = self.by_name.contains_key(&block.name);
        if block.optional && !exists && !self.opts.materialize_optional {
            if self.opts.verbose {
                eprintln!("[skip] optional vault '{}' not present", block.name);
            }
            return Ok(());
        }

        let mut vault = match self.by_name.remove(&block.name) {
            Some(mut seeded) => {
                if let Some(forced) = &self.opts.forced_master_key {
                    if seeded.master_key_hex != *forced {
                        return Err(EvalError::MasterKeyMismatch(block.name.clone()));
                    }
                }
                // Re-running a script against an existing sealed vault
                // unseals it for this run; the trailing secure re-seals.
                seeded.optional = block.optional;
                seeded.sealed = false;
                seeded
            }
            None => {
                let master_key = match &self.opts.forced_master_key {
                    Some(key) => key.clone(),
                    None => crypto::random_key_hex(self.rng.as_ref())?,
                };
                SealedVault::new(block.name.clone(), block.optional, master_key)
            }
        };

        if self.opts.verbose {
            let kind = if block.optional { "optional" } else { "required" };
            eprintln!("[vault] {} {}", kind, block.name);
        }

        for stmt in &block.body {
            self.execute(&mut vault, stmt)?;
        }

        self.output.push(vault.clone());
        self.by_name.insert(block.name.clone(), vault);
        Ok(())
    }

    fn execute(&mut self, vault: &mut SealedVault, stmt: &Statement) -> Result<(), EvalError> {
        match stmt {
            Statement::Registry { line, name } => {
                if vault.sealed {
                    return Err(EvalError::SealedVaultWrite {
                        action: "select registry",
                        line: *line,
                    });
                }
                self.current_registry = Some(name.clone());
                if self.opts.verbose {
                    eprintln!("  [registry] {}", name);
                }
            }
            Statement::If {
                line,
                missing,
                target,
                body,
            } => {
                let present = self.is_present(vault, target, *line)?;
                let cond = if *missing { !present } else { present };
                if self.opts.verbose {
                    let mode = if *missing { "missing" } else { "present" };
                    eprintln!("  [if] {} '{}' => {}", mode, target.key, cond);
                }
                if cond {
                    for inner in body {
                        self.execute(vault, inner)?;
                    }
                }
            }
            Statement::Store {
                line,
                target,
                value,
            } => {
                if vault.sealed {
                    return Err(EvalError::SealedVaultWrite {
                        action: "store",
                        line: *line,
                    });
                }
                let registry = self.resolve_registry(target, *line)?;
                if vault.contains(&registry, &target.key) {
                    return Err(EvalError::Overwrite(*line));
                }
                self.write_entry(vault, &registry, &target.key, value)?;
                if self.opts.verbose {
                    eprintln!("  [store] {} (sealed)", target.key);
                }
            }
            Statement::Replace {
                line,
                target,
                value,
            } => {
                if vault.sealed {
                    return Err(EvalError::SealedVaultWrite {
                        action: "replace",
                        line: *line,
                    });
                }
                let registry = self.resolve_registry(target, *line)?;
                self.write_entry(vault, &registry, &target.key, value)?;
                if self.opts.verbose {
                    eprintln!("  [replace] {} (sealed)", target.key);
                }
            }
            Statement::Note { text, .. } => {
                if self.opts.verbose {
                    eprintln!("  [note] {}", text);
                }
            }
            Statement::Secure { .. } => {
                vault.sealed = true;
                if self.opts.verbose {
                    eprintln!("  [secure] vault sealed");
                }
            }
        }
        Ok(())
    }

    /// Encrypt and insert one entry, creating the registry on demand.
    fn write_entry(
        &mut self,
        vault: &mut SealedVault,
        registry: &str,
        key: &str,
        value: &ValueExpr,
    ) -> Result<(), EvalError> {
        let plain = self.evaluate_value(value)?;
        let salt = entry_salt(registry, key);
        let cipher = crypto::encrypt(&plain, &vault.master_key_hex, &salt, self.rng.as_ref())?;
        let digest = crypto::digest(cipher.as_bytes(), &vault.master_key_hex)?;
        vault
            .registries
            .entry(registry.to_string())
            .or_default()
            .entries
            .insert(key.to_string(), SealedEntry { digest, cipher });
        Ok(())
    }

    fn is_present(
        &self,
        vault: &SealedVault,
        target: &Target,
        line: usize,
    ) -> Result<bool, EvalError> {
        let registry = self.resolve_registry(target, line)?;
        Ok(vault.contains(&registry, &target.key))
    }

    fn resolve_registry(&self, target: &Target, line: usize) -> Result<String, EvalError> {
        if let Some(registry) = &target.registry {
            return Ok(registry.clone());
        }
        self.current_registry
            .clone()
            .ok_or(EvalError::NoActiveRegistry(line))
    }

    fn evaluate_value(&self, value: &ValueExpr) -> Result<String, EvalError> {
        match value {
            ValueExpr::Literal(text) | ValueExpr::Document(text) => Ok(text.clone()),
            ValueExpr::Builtin(name) => match name.as_str() {
                "generate" => Ok(crypto::random_hex(self.rng.as_ref(), GENERATE_BYTES)?),
                "now" => Ok(self.clock.now().format(NOW_FORMAT).to_string()),
                other => Err(EvalError::UnknownBuiltin(other.to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::testing::FixedRandom;
    use crate::lexer::lex;
    use crate::parser::Parser;
    use chrono::NaiveDate;

    const KEY: &str = "0000000000000000000000000000000000000000000000000000000000000000";

    struct FixedClock;

    impl Clock for FixedClock {
        fn now(&self) -> NaiveDateTime {
            NaiveDate::from_ymd_opt(2024, 1, 2)
                .unwrap()
                .and_hms_opt(3, 4, 5)
                .unwrap()
        }
    }

    fn program(source: &str) -> Vec<VaultBlock> {
        Parser::new(lex(source).unwrap()).parse().unwrap()
    }

    fn interpreter(opts: InterpreterOptions) -> Interpreter {
        Interpreter::with_sources(opts, Box::new(FixedRandom(9)), Box::new(FixedClock))
    }

    fn forced() -> InterpreterOptions {
        InterpreterOptions {
            forced_master_key: Some(KEY.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_store_encrypts_under_slot_salt() {
        let sealed = interpreter(forced())
            .run(&program(
                "vault A\n  registry R\n  store -> \"k\" = \"v\"\n  secure\n",
            ))
            .unwrap();
        assert_eq!(sealed.len(), 1);
        let vault = &sealed[0];
        assert!(vault.sealed);
        let entry = &vault.registries["R"].entries["k"];
        assert_eq!(crypto::decrypt(&entry.cipher, KEY, "R:k").unwrap(), "v");
        assert_eq!(
            entry.digest,
            crypto::digest(entry.cipher.as_bytes(), KEY).unwrap()
        );
    }

    #[test]
    fn test_duplicate_store_fails() {
        let err = interpreter(forced())
            .run(&program(
                "vault A\n  registry R\n  store -> \"k\" = \"v\"\n  store -> \"k\" = \"w\"\n  secure\n",
            ))
            .unwrap_err();
        assert!(matches!(err, EvalError::Overwrite(4)));
    }

    #[test]
    fn test_replace_overwrites() {
        let sealed = interpreter(forced())
            .run(&program(
                "vault A\n  registry R\n  store -> \"k\" = \"v\"\n  replace -> \"k\" = \"w\"\n  secure\n",
            ))
            .unwrap();
        let entry = &sealed[0].registries["R"].entries["k"];
        assert_eq!(crypto::decrypt(&entry.cipher, KEY, "R:k").unwrap(), "w");
    }

    #[test]
    fn test_no_active_registry() {
        let err = interpreter(forced())
            .run(&program("vault A\n  store -> \"k\" = \"v\"\n  secure\n"))
            .unwrap_err();
        assert!(matches!(err, EvalError::NoActiveRegistry(2)));
    }

    #[test]
    fn test_explicit_registry_without_current() {
        let sealed = interpreter(forced())
            .run(&program("vault A\n  store R -> \"k\" = \"v\"\n  secure\n"))
            .unwrap();
        assert!(sealed[0].contains("R", "k"));
    }

    #[test]
    fn test_if_missing_without_registry_fails() {
        let err = interpreter(forced())
            .run(&program(
                "vault A\n  if missing -> \"k\"\n    note \"x\"\n  secure\n",
            ))
            .unwrap_err();
        assert!(matches!(err, EvalError::NoActiveRegistry(2)));
    }

    #[test]
    fn test_if_missing_guards_store() {
        let source = "vault A\n  registry R\n  if missing -> \"k\"\n    store -> \"k\" = \"v\"\n  secure\n";
        let mut interp = interpreter(forced());
        let first = interp.run(&program(source)).unwrap();
        let entry = first[0].registries["R"].entries["k"].clone();

        // Re-seed with the first run's output: the guard is now false and
        // the entry must come through byte-identical.
        let mut interp = interpreter(forced());
        interp.seed(first);
        let second = interp.run(&program(source)).unwrap();
        assert_eq!(second[0].registries["R"].entries["k"], entry);
    }

    #[test]
    fn test_if_present() {
        let source = "vault A\n  registry R\n  store -> \"k\" = \"v\"\n  if present -> \"k\"\n    store -> \"seen\" = \"yes\"\n  if present -> \"nope\"\n    store -> \"unseen\" = \"no\"\n  secure\n";
        let sealed = interpreter(forced()).run(&program(source)).unwrap();
        assert!(sealed[0].contains("R", "seen"));
        assert!(!sealed[0].contains("R", "unseen"));
    }

    #[test]
    fn test_write_after_seal_fails() {
        // `secure` mid-body seals; the next write must fail. The parser
        // only requires the *last* statement to be secure.
        let source = "vault A\n  registry R\n  secure\n  store -> \"k\" = \"v\"\n  secure\n";
        let err = interpreter(forced()).run(&program(source)).unwrap_err();
        assert!(matches!(
            err,
            EvalError::SealedVaultWrite { action: "store", line: 4 }
        ));
    }

    #[test]
    fn test_registry_select_after_seal_fails() {
        let source = "vault A\n  secure\n  registry R\n  secure\n";
        let err = interpreter(forced()).run(&program(source)).unwrap_err();
        assert!(matches!(
            err,
            EvalError::SealedVaultWrite { action: "select registry", line: 3 }
        ));
    }

    #[test]
    fn test_generate_and_now_deterministic_under_mocks() {
        let source = "vault A\n  registry R\n  store -> \"g\" = generate()\n  store -> \"t\" = now()\n  secure\n";
        let sealed = interpreter(forced()).run(&program(source)).unwrap();
        let reg = &sealed[0].registries["R"];
        let generated = crypto::decrypt(&reg.entries["g"].cipher, KEY, "R:g").unwrap();
        assert_eq!(generated, "09".repeat(16));
        let stamped = crypto::decrypt(&reg.entries["t"].cipher, KEY, "R:t").unwrap();
        assert_eq!(stamped, "2024-01-02T03:04:05");
    }

    #[test]
    fn test_unknown_builtin() {
        let err = interpreter(forced())
            .run(&program(
                "vault A\n  registry R\n  store -> \"k\" = bogus()\n  secure\n",
            ))
            .unwrap_err();
        assert!(matches!(err, EvalError::UnknownBuiltin(ref name) if name == "bogus"));
    }

    #[test]
    fn test_optional_vault_skipped_without_seed() {
        let sealed = interpreter(forced())
            .run(&program("vault? B\n  registry R\n  secure\n"))
            .unwrap();
        assert!(sealed.is_empty());
    }

    #[test]
    fn test_optional_vault_materialized_with_flag() {
        let opts = InterpreterOptions {
            materialize_optional: true,
            forced_master_key: Some(KEY.to_string()),
            ..Default::default()
        };
        let sealed = interpreter(opts)
            .run(&program("vault? B\n  registry R\n  secure\n"))
            .unwrap();
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].name, "B");
        assert!(sealed[0].sealed);
    }

    #[test]
    fn test_optional_vault_revived_from_seed() {
        let mut interp = interpreter(forced());
        let seeded = interp
            .run(&program("vault B\n  registry R\n  store -> \"k\" = \"v\"\n  secure\n"))
            .unwrap();

        let mut interp = interpreter(forced());
        interp.seed(seeded);
        let sealed = interp
            .run(&program("vault? B\n  registry R\n  secure\n"))
            .unwrap();
        assert_eq!(sealed.len(), 1);
        assert!(sealed[0].contains("R", "k"));
    }

    #[test]
    fn test_master_key_mismatch_on_seed() {
        let mut seeded = SealedVault::new("A".into(), false, "11".repeat(32));
        seeded.sealed = true;
        let mut interp = interpreter(forced());
        interp.seed(vec![seeded]);
        let err = interp
            .run(&program("vault A\n  registry R\n  secure\n"))
            .unwrap_err();
        assert!(matches!(err, EvalError::MasterKeyMismatch(ref name) if name == "A"));
    }

    #[test]
    fn test_current_registry_resets_per_vault() {
        let source = "vault A\n  registry R\n  secure\nvault B\n  store -> \"k\" = \"v\"\n  secure\n";
        let err = interpreter(forced()).run(&program(source)).unwrap_err();
        assert!(matches!(err, EvalError::NoActiveRegistry(5)));
    }

    #[test]
    fn test_fresh_master_key_without_force() {
        let sealed = interpreter(InterpreterOptions::default())
            .run(&program("vault A\n  secure\n"))
            .unwrap();
        assert_eq!(sealed[0].master_key_hex, "09".repeat(32));
    }
}
