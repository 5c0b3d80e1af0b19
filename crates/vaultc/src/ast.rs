//! AST for the vault language.
//!
//! Produced by the parser, consumed by the interpreter. Every statement
//! carries its 1-based source line so evaluation errors can point back at
//! the offending statement.

/// A top-level `vault` / `vault?` block and its body.
#[derive(Debug, Clone)]
pub struct VaultBlock {
    /// Declared with `vault?`: may be skipped when absent from the seed.
    pub optional: bool,
    pub name: String,
    pub line: usize,
    pub body: Vec<Statement>,
}

/// Where a value is stored or looked up: `[registry] -> "key"`.
///
/// A missing registry means "the current registry" selected by the most
/// recent `registry` statement in the enclosing vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub registry: Option<String>,
    pub key: String,
}

/// Right-hand side of `store` / `replace`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueExpr {
    /// `"already unquoted text"`
    Literal(String),
    /// `name()`, evaluated by the interpreter (`generate`, `now`).
    Builtin(String),
    /// A document literal: the raw rest of the line, including its
    /// leading `{` or `[`.
    Document(String),
}

#[derive(Debug, Clone)]
pub enum Statement {
    /// `registry NAME`: select the current registry.
    Registry { line: usize, name: String },
    /// `if missing|present TARGET` with a nested block.
    If {
        line: usize,
        missing: bool,
        target: Target,
        body: Vec<Statement>,
    },
    /// `store TARGET = VALUE`: insert, refusing to overwrite.
    Store {
        line: usize,
        target: Target,
        value: ValueExpr,
    },
    /// `replace TARGET = VALUE`: create or overwrite.
    Replace {
        line: usize,
        target: Target,
        value: ValueExpr,
    },
    /// `note "text"`: no state change, logged when verbose.
    Note { line: usize, text: String },
    /// `secure`: seal the vault; must terminate every vault body.
    Secure { line: usize },
}
