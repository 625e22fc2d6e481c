//! Compiler error types for the bytecode compiler.
//!
//! Only capacity limits of the bytecode encoding are reported here. Malformed
//! IR (undefined labels, undeclared registers, out-of-range variadic indices)
//! is a defect in the IR producer and panics instead.

use std::fmt;

/// What went wrong
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileErrorKind {
    /// A body needs more simultaneously-live registers than an operand can address
    TooManyRegisters { function: String, limit: u32 },
    /// A body captures more locals than an operand can address
    TooManyCells { function: String, limit: u32 },
    /// A body declares more upvalues than an operand can address
    TooManyUpvalues { function: String, limit: u32 },
    /// The unit needs more pool slots than a pool index can address
    TooManyConstants { limit: usize },
    /// A resolved jump offset does not fit its operand
    JumpOutOfRange { from: usize, to: usize },
    /// The entry index does not name a function body
    EntryNotCode { index: u32 },
}

impl fmt::Display for CompileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyRegisters { function, limit } => {
                write!(f, "Too many registers in {} (max {})", function, limit)
            }
            Self::TooManyCells { function, limit } => {
                write!(f, "Too many captured variables in {} (max {})", function, limit)
            }
            Self::TooManyUpvalues { function, limit } => {
                write!(f, "Too many upvalues in {} (max {})", function, limit)
            }
            Self::TooManyConstants { limit } => write!(f, "Too many constants (max {})", limit),
            Self::JumpOutOfRange { from, to } => {
                write!(f, "Jump from {:#x} to {:#x} is out of range", from, to)
            }
            Self::EntryNotCode { index } => {
                write!(f, "Entry constant {} is not a function body", index)
            }
        }
    }
}

/// A recoverable compile error with a best-effort source line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub line: Option<u32>,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind) -> Self {
        Self { kind, line: None }
    }

    /// Attach a line unless one is already known
    pub fn or_line(mut self, line: Option<u32>) -> Self {
        if self.line.is_none() {
            self.line = line;
        }
        self
    }
}

impl From<CompileErrorKind> for CompileError {
    fn from(kind: CompileErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{} (line {})", self.kind, line),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for CompileError {}

/// Result type for compilation
pub type CompileResult<T> = Result<T, CompileError>;
