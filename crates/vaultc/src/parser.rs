//! Indent-structured recursive-descent parser.
//!
//! Works over the lexer's `Line` stream with an explicit cursor. Blank
//! lines are skipped freely. Within a block every statement must sit at
//! the exact expected indent; a smaller indent ends the block and any
//! other indent is an error. Nesting steps by 2 spaces. The parser is
//! single-pass and does not attempt recovery: the first malformed line
//! aborts with its line number.

use thiserror::Error;

use crate::ast::{Statement, Target, ValueExpr, VaultBlock};
use crate::lexer::Line;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Top-level statements must start at indent 0 (line {0})")]
    TopLevelIndent(usize),

    #[error("Unexpected indent on line {0}")]
    UnexpectedIndent(usize),

    #[error("Expected 'vault' declaration on line {0}")]
    ExpectedVault(usize),

    #[error("Vault name missing on line {0}")]
    VaultNameMissing(usize),

    #[error("Registry name missing on line {0}")]
    RegistryNameMissing(usize),

    #[error("Vault '{name}' missing terminating 'secure' (line {line})")]
    MissingSecure { name: String, line: usize },

    #[error("Expected 'missing' or 'present' on line {0}")]
    ExpectedCondition(usize),

    #[error("Expected '->' in target on line {0}")]
    MissingArrow(usize),

    #[error("Missing '=' on line {0}")]
    MissingEquals(usize),

    #[error("Expected quoted string on line {0}")]
    ExpectedQuoted(usize),

    #[error("Missing value on line {0}")]
    MissingValue(usize),

    #[error("Bad builtin on line {0}")]
    BadBuiltin(usize),

    #[error("Unrecognized value expression on line {0}")]
    UnrecognizedValue(usize),

    #[error("Unknown statement on line {line}: {text}")]
    UnknownStatement { line: usize, text: String },
}

pub struct Parser {
    lines: Vec<Line>,
    pos: usize,
}

impl Parser {
    pub fn new(lines: Vec<Line>) -> Self {
        Self { lines, pos: 0 }
    }

    /// Parse the whole program: a sequence of vault blocks at indent 0.
    pub fn parse(mut self) -> Result<Vec<VaultBlock>, ParseError> {
        let mut program = Vec::new();
        while let Some(line) = self.peek() {
            if line.text.trim().is_empty() {
                self.pos += 1;
                continue;
            }
            if line.indent != 0 {
                return Err(ParseError::TopLevelIndent(line.number));
            }
            program.push(self.parse_vault()?);
        }
        Ok(program)
    }

    fn peek(&self) -> Option<&Line> {
        self.lines.get(self.pos)
    }

    fn parse_vault(&mut self) -> Result<VaultBlock, ParseError> {
        let line = &self.lines[self.pos];
        let number = line.number;
        let indent = line.indent;
        let text = line.text.trim();

        let (optional, name) = if let Some(rest) = text.strip_prefix("vault? ") {
            (true, rest.trim().to_string())
        } else if let Some(rest) = text.strip_prefix("vault ") {
            (false, rest.trim().to_string())
        } else {
            return Err(ParseError::ExpectedVault(number));
        };
        if name.is_empty() {
            return Err(ParseError::VaultNameMissing(number));
        }
        self.pos += 1;

        let body = self.parse_block(indent + 2)?;
        let ends_secure = matches!(body.last(), Some(Statement::Secure { .. }));
        if !ends_secure {
            return Err(ParseError::MissingSecure { name, line: number });
        }

        Ok(VaultBlock {
            optional,
            name,
            line: number,
            body,
        })
    }

    /// Parse statements sharing one exact indent. A smaller indent ends
    /// the block; a larger (or otherwise off) indent is an error.
    fn parse_block(&mut self, indent: usize) -> Result<Vec<Statement>, ParseError> {
        let mut stmts = Vec::new();
        while let Some(line) = self.peek() {
            if line.text.trim().is_empty() {
                self.pos += 1;
                continue;
            }
            if line.indent < indent {
                break;
            }
            if line.indent != indent {
                return Err(ParseError::UnexpectedIndent(line.number));
            }
            stmts.push(self.parse_statement()?);
        }
        Ok(stmts)
    }

    fn parse_statement(&mut self) -> Result<Statement, ParseError> {
        let line = &self.lines[self.pos];
        let number = line.number;
        let indent = line.indent;
        let text = line.text.trim().to_string();

        if let Some(rest) = text.strip_prefix("registry ") {
            let name = rest.trim().to_string();
            if name.is_empty() {
                return Err(ParseError::RegistryNameMissing(number));
            }
            self.pos += 1;
            return Ok(Statement::Registry { line: number, name });
        }

        if let Some(rest) = text.strip_prefix("if ") {
            let rest = rest.trim();
            let (missing, rest) = if let Some(r) = rest.strip_prefix("missing ") {
                (true, r.trim())
            } else if let Some(r) = rest.strip_prefix("present ") {
                (false, r.trim())
            } else {
                return Err(ParseError::ExpectedCondition(number));
            };
            let target = parse_target(rest, number)?;
            self.pos += 1;
            let body = self.parse_block(indent + 2)?;
            return Ok(Statement::If {
                line: number,
                missing,
                target,
                body,
            });
        }

        if let Some(rest) = text.strip_prefix("store ") {
            let (target, value) = parse_assignment(rest, number)?;
            self.pos += 1;
            return Ok(Statement::Store {
                line: number,
                target,
                value,
            });
        }

        if let Some(rest) = text.strip_prefix("replace ") {
            let (target, value) = parse_assignment(rest, number)?;
            self.pos += 1;
            return Ok(Statement::Replace {
                line: number,
                target,
                value,
            });
        }

        if let Some(rest) = text.strip_prefix("note ") {
            let note = expect_quoted(rest, number)?;
            self.pos += 1;
            return Ok(Statement::Note {
                line: number,
                text: note,
            });
        }

        if text == "secure" {
            self.pos += 1;
            return Ok(Statement::Secure { line: number });
        }

        Err(ParseError::UnknownStatement { line: number, text })
    }
}

/// `TARGET = VALUE`, split at the first `=`.
fn parse_assignment(rest: &str, line: usize) -> Result<(Target, ValueExpr), ParseError> {
    let rest = rest.trim();
    let eq = rest.find('=').ok_or(ParseError::MissingEquals(line))?;
    let target = parse_target(rest[..eq].trim(), line)?;
    let value = parse_value_expr(rest[eq + 1..].trim(), line)?;
    Ok((target, value))
}

/// `[registry] -> "key"`; an empty left side targets the current registry.
fn parse_target(expr: &str, line: usize) -> Result<Target, ParseError> {
    let arrow = expr.find("->").ok_or(ParseError::MissingArrow(line))?;
    let left = expr[..arrow].trim();
    let right = expr[arrow + 2..].trim();
    Ok(Target {
        registry: if left.is_empty() {
            None
        } else {
            Some(left.to_string())
        },
        key: expect_quoted(right, line)?,
    })
}

fn parse_value_expr(text: &str, line: usize) -> Result<ValueExpr, ParseError> {
    if text.is_empty() {
        return Err(ParseError::MissingValue(line));
    }
    if text.starts_with('"') {
        return Ok(ValueExpr::Literal(expect_quoted(text, line)?));
    }
    // A document literal starts with { or [ and consumes the rest of the
    // line as opaque text.
    if text.starts_with('{') || text.starts_with('[') {
        return Ok(ValueExpr::Document(text.to_string()));
    }
    if let Some(name) = text.strip_suffix("()") {
        if name.is_empty() || name.contains('(') || name.contains(')') {
            return Err(ParseError::BadBuiltin(line));
        }
        return Ok(ValueExpr::Builtin(name.to_string()));
    }
    Err(ParseError::UnrecognizedValue(line))
}

fn expect_quoted(text: &str, line: usize) -> Result<String, ParseError> {
    let t = text.trim();
    if t.len() < 2 || !t.starts_with('"') || !t.ends_with('"') {
        return Err(ParseError::ExpectedQuoted(line));
    }
    Ok(t[1..t.len() - 1].to_string())
}
