//! vaultc - Compiler and runtime for the vault secret-archive language
//!
//! A `.vau` source program declares named vaults of credential-like
//! entries, organized into registries, encrypted entry-by-entry under a
//! master key and sealed into a portable `.svau` archive protected by a
//! keyed archive MAC.
//!
//! Pipeline:
//! - `lexer`: line-oriented tokenization (indent counting, tab rejection)
//! - `parser`: indent-structured recursive descent into the AST
//! - `interp`: statement execution against the sealed-state model
//! - `archive`: canonical serialization and the archive MAC
//!
//! Supporting modules:
//! - `crypto`: AES-256-GCM with AAD, keyed SHA-256 digests, CSPRNG
//! - `config`: the `.vault/var.vc` key=value configuration file
//! - `script`: the tiny `.vsc` query sub-language over decrypted entries

pub mod archive;
pub mod ast;
pub mod config;
pub mod crypto;
pub mod interp;
pub mod lexer;
pub mod parser;
pub mod script;
pub mod vault;

pub use config::VaultConfig;
pub use interp::{Interpreter, InterpreterOptions};
pub use parser::Parser;
pub use vault::SealedVault;
