use std::fmt;

use serde::Serialize;

/// Every failure class is fatal to the whole compile; there is no local
/// recovery and no retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// An identifier's inferred kind changed incompatibly.
    TypeConflict,
    /// A field, stream, or state was referenced before any definition.
    UseBeforeDefine,
    /// Division by something other than a constant power of two.
    Divisor,
    /// No feasible switch placement for an operator.
    Placement,
    /// A stage reads fields its operands do not produce.
    Schema,
    /// The history fixed point did not converge within the iteration cap.
    NonConvergent,
    /// Internal consistency violation; always a compiler bug.
    Internal,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::TypeConflict => "type conflict",
            ErrorKind::UseBeforeDefine => "use before definition",
            ErrorKind::Divisor => "bad divisor",
            ErrorKind::Placement => "infeasible placement",
            ErrorKind::Schema => "schema mismatch",
            ErrorKind::NonConvergent => "non-convergent analysis",
            ErrorKind::Internal => "internal error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
