//! Evaluation error representation.
//!
//! - **`EvalErrorKind`** : the closed set of non-fatal evaluation failures
//! - **`EvalError`**     : kind plus an optional human explanation
//!
//! Evaluation errors are never fatal. The (field, record) pair that produced
//! one materializes to an empty value and keeps the error next to it so the
//! UI can show why.

use std::{error::Error, fmt};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// All recognised evaluation error codes.
///
/// `Display` renders them the way a grid cell shows them (`#DIV/0!`, …).
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EvalErrorKind {
    /// An operand or the final result could not be coerced to the required kind.
    Value,
    /// Division by zero.
    Div,
    /// A numeric result that is not finite.
    Num,
}

impl fmt::Display for EvalErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Value => "#VALUE!",
            Self::Div => "#DIV/0!",
            Self::Num => "#NUM!",
        })
    }
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EvalError {
    pub kind: EvalErrorKind,
    pub message: Option<String>,
}

impl From<EvalErrorKind> for EvalError {
    fn from(kind: EvalErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }
}

impl EvalError {
    /// Basic constructor (no message).
    pub fn new(kind: EvalErrorKind) -> Self {
        kind.into()
    }

    /// Attach a human-readable explanation.
    pub fn with_message<S: Into<String>>(mut self, msg: S) -> Self {
        self.message = Some(msg.into());
        self
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(ref msg) = self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl Error for EvalError {}

impl PartialEq<EvalErrorKind> for EvalError {
    fn eq(&self, other: &EvalErrorKind) -> bool {
        self.kind == *other
    }
}
