//! Error types for compilation passes.
//!
//! Failures fall into two tiers:
//! - **Unsupported**: an analysis or transformation met a construct outside
//!   the pattern set it handles. This is expected and frequent. The caller
//!   skips the optimization and the unmodified IR stays correct.
//! - **Internal**: a table or state combination that cannot occur in a
//!   correct compiler was reached. It aborts the current compilation unit
//!   and names the pass and the offending instruction.

use std::fmt;
use thiserror::Error;

/// Result type used by every pass.
pub type CompileResult<T> = Result<T, CompileError>;

/// Where an internal error was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    /// No specific IR entity.
    Method,
    /// A HIR instruction, by arena index.
    Inst(u32),
    /// A basic block or machine CFG node, by arena index.
    Block(u32),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Method => write!(f, "method"),
            Location::Inst(i) => write!(f, "inst #{i}"),
            Location::Block(b) => write!(f, "block #{b}"),
        }
    }
}

/// A compilation failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// The input is outside what the pass handles. Non-fatal.
    #[error("{pass}: unsupported: {reason}")]
    Unsupported {
        /// Pass that gave up.
        pass: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// An internal invariant was violated. Fatal to the compilation unit.
    #[error("{pass}: internal compiler error at {location}: {message}")]
    Internal {
        /// Pass that detected the violation.
        pass: &'static str,
        /// Offending IR entity.
        location: Location,
        /// Description of the violated invariant.
        message: String,
    },
}

impl CompileError {
    /// Build a give-up result.
    pub fn unsupported(pass: &'static str, reason: impl Into<String>) -> Self {
        CompileError::Unsupported {
            pass,
            reason: reason.into(),
        }
    }

    /// Build an internal error.
    pub fn internal(pass: &'static str, location: Location, message: impl Into<String>) -> Self {
        CompileError::Internal {
            pass,
            location,
            message: message.into(),
        }
    }

    /// Is this a compiler bug rather than an unsupported input?
    #[inline]
    pub fn is_internal(&self) -> bool {
        matches!(self, CompileError::Internal { .. })
    }

    /// Name of the pass that produced the error.
    pub fn pass(&self) -> &'static str {
        match self {
            CompileError::Unsupported { pass, .. } | CompileError::Internal { pass, .. } => pass,
        }
    }
}

/// Return early with [`CompileError::Unsupported`].
#[macro_export]
macro_rules! unsupported {
    ($pass:expr, $($arg:tt)+) => {
        return Err($crate::CompileError::unsupported($pass, format!($($arg)+)))
    };
}

/// Return early with [`CompileError::Internal`].
#[macro_export]
macro_rules! ice {
    ($pass:expr, $loc:expr, $($arg:tt)+) => {
        return Err($crate::CompileError::internal($pass, $loc, format!($($arg)+)))
    };
}
