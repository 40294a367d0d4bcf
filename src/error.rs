//! Error taxonomy for the compiler (see spec §7).
//!
//! Mirrors the teacher crate's convention of a single crate-wide `Result`
//! alias backed by a `thiserror`-derived enum, with `bail_*!` macros for
//! terse early returns from deep in the expression/statement compilers.

use std::fmt;

/// A source location, when the originating token carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Status codes surfaced to callers, matching sqlite's small fixed result-code space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    Error,
    Internal,
    Misuse,
    Constraint,
    NotFound,
    IoErr,
}

/// Compilation error kinds (spec §7). A compilation aborts on the first of
/// these; partially-built compiler state is discarded by the caller.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// Surfaced from the external SQL parser, preserved verbatim.
    #[error("parse error{}: {message}", loc_suffix(*.location))]
    Parse {
        message: String,
        location: Option<Location>,
    },

    /// General compilation failure: unknown table/column/function, unsupported
    /// construct, ambiguous reference, etc.
    #[error("syntax error{}: {message}", loc_suffix(*.location))]
    Syntax {
        message: String,
        location: Option<Location>,
    },

    /// A statically-detectable NOT NULL / CHECK / foreign-key violation.
    #[error("constraint violation: {message}")]
    Constraint { message: String },

    /// Programmatic misuse, e.g. compiling in a state the dispatcher disallows.
    #[error("misuse: {message}")]
    Misuse { message: String },

    /// A broken compiler invariant. These are bugs, not bad user input.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl CompileError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            CompileError::Parse { .. } => StatusCode::Error,
            CompileError::Syntax { .. } => StatusCode::Error,
            CompileError::Constraint { .. } => StatusCode::Constraint,
            CompileError::Misuse { .. } => StatusCode::Misuse,
            CompileError::Internal { .. } => StatusCode::Internal,
        }
    }

    pub fn location(&self) -> Option<Location> {
        match self {
            CompileError::Parse { location, .. } | CompileError::Syntax { location, .. } => {
                *location
            }
            _ => None,
        }
    }
}

fn loc_suffix(loc: Option<Location>) -> String {
    match loc {
        Some(l) => format!(" at {l}"),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, CompileError>;

/// A raw sqlite-style status tuple for user-visible surfaces (§6).
pub fn sqlite_error(err: &CompileError) -> (StatusCode, String, Option<Location>) {
    (err.status_code(), err.to_string(), err.location())
}

#[macro_export]
macro_rules! bail_parse_error {
    ($($arg:tt)*) => {
        return Err($crate::error::CompileError::Syntax {
            message: format!($($arg)*),
            location: None,
        })
    };
}

#[macro_export]
macro_rules! bail_constraint_error {
    ($($arg:tt)*) => {
        return Err($crate::error::CompileError::Constraint {
            message: format!($($arg)*),
        })
    };
}

#[macro_export]
macro_rules! bail_internal_error {
    ($($arg:tt)*) => {
        return Err($crate::error::CompileError::Internal {
            message: format!($($arg)*),
        })
    };
}
