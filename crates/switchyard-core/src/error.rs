//! Error types for Switchyard Core

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// One or more lines of a route program failed to parse
    #[error("Invalid route program:\n{0}")]
    Parse(ParseErrors),

    // Registry errors
    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    #[error("Manual entry not found: {0}")]
    ManualNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A single failed line of a route program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// 1-based line number within the program
    pub line: usize,
    /// 1-based character column where the offending token starts
    pub column: usize,
    /// The full text of the offending line
    pub text: String,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "line {}:{}: {} in {:?}",
            self.line, self.column, self.message, self.text
        )
    }
}

impl std::error::Error for ParseError {}

/// All errors collected while parsing one program
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseErrors(pub Vec<ParseError>);

impl ParseErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParseError> {
        self.0.iter()
    }
}

impl fmt::Display for ParseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl From<ParseErrors> for Error {
    fn from(errors: ParseErrors) -> Self {
        Error::Parse(errors)
    }
}
