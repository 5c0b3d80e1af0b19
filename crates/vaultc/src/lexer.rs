//! Line-oriented lexer for `.vau` sources.
//!
//! The language is indentation-sensitive, so the lexer does not tokenize
//! past the line level: it records each line's 1-based number, its indent
//! (the count of leading spaces) and the remaining text. Tabs anywhere in
//! the input are a hard failure. Blank and whitespace-only lines are kept
//! with empty text so the parser can skip them without losing line
//! numbering.

use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LexError {
    #[error("Tabs are not allowed (line {0})")]
    TabForbidden(usize),

    #[error("Unable to open file: {path}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// One source line after lexing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub number: usize,
    pub indent: usize,
    pub text: String,
}

/// Lex a whole source string.
pub fn lex(source: &str) -> Result<Vec<Line>, LexError> {
    let mut lines = Vec::new();
    for (idx, raw) in source.lines().enumerate() {
        let number = idx + 1;
        if raw.contains('\t') {
            return Err(LexError::TabForbidden(number));
        }
        let indent = raw.chars().take_while(|&c| c == ' ').count();
        lines.push(Line {
            number,
            indent,
            text: raw[indent..].to_string(),
        });
    }
    Ok(lines)
}

/// Lex a source file from disk.
pub fn lex_file(path: &Path) -> Result<Vec<Line>, LexError> {
    let source = std::fs::read_to_string(path).map_err(|source| LexError::Unreadable {
        path: path.display().to_string(),
        source,
    })?;
    lex(&source)
}
