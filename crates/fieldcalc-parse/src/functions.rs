//! The closed set of formula functions.
//!
//! Names resolve at parse time, so an unknown function or a wrong argument
//! count is a definition error rather than an evaluation error.

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Builtin {
    Concat,
    Upper,
    Lower,
    If,
    And,
    Or,
    Sum,
    Today,
}

/// Argument count bounds; `max == None` means variadic.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Arity {
    pub min: usize,
    pub max: Option<usize>,
}

impl Arity {
    const fn exactly(n: usize) -> Self {
        Arity {
            min: n,
            max: Some(n),
        }
    }

    const fn between(min: usize, max: usize) -> Self {
        Arity {
            min,
            max: Some(max),
        }
    }

    const fn at_least(min: usize) -> Self {
        Arity { min, max: None }
    }

    pub fn accepts(&self, n: usize) -> bool {
        n >= self.min && self.max.is_none_or(|max| n <= max)
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) if max == self.min => write!(f, "exactly {max}"),
            Some(max) => write!(f, "{} to {max}", self.min),
            None => write!(f, "at least {}", self.min),
        }
    }
}

pub const ALL_BUILTINS: [Builtin; 8] = [
    Builtin::Concat,
    Builtin::Upper,
    Builtin::Lower,
    Builtin::If,
    Builtin::And,
    Builtin::Or,
    Builtin::Sum,
    Builtin::Today,
];

static BY_NAME: Lazy<FxHashMap<&'static str, Builtin>> =
    Lazy::new(|| ALL_BUILTINS.iter().map(|b| (b.name(), *b)).collect());

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Concat => "CONCAT",
            Builtin::Upper => "UPPER",
            Builtin::Lower => "LOWER",
            Builtin::If => "IF",
            Builtin::And => "AND",
            Builtin::Or => "OR",
            Builtin::Sum => "SUM",
            Builtin::Today => "TODAY",
        }
    }

    pub fn arity(self) -> Arity {
        match self {
            Builtin::Concat | Builtin::And | Builtin::Or | Builtin::Sum => Arity::at_least(1),
            Builtin::Upper | Builtin::Lower => Arity::exactly(1),
            Builtin::If => Arity::between(2, 3),
            Builtin::Today => Arity::exactly(0),
        }
    }

    /// Case-insensitive lookup.
    pub fn from_name(name: &str) -> Option<Self> {
        BY_NAME.get(name.to_ascii_uppercase().as_str()).copied()
    }
}

impl fmt::Display for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
