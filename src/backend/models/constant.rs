//! Constant table shared by every body of a compilation unit.

use super::ir::{ConstIndex, Program};

/// A source-level constant
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// A nested function body
    Code(Program),
}

impl Constant {
    /// Short type name for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::Code(_) => "code",
        }
    }
}

/// A finished IR program: the constant table plus the entry body
///
/// The entry body is itself a `Code` constant, so the top-level chunk is
/// compiled exactly like any nested function and lands in pool slot 0.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IrModule {
    /// Constants addressed by [`ConstIndex`]
    pub constants: Vec<Constant>,
    /// Index of the entry body in `constants`
    pub entry: ConstIndex,
}

impl IrModule {
    /// Create an empty module
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a constant, returns its index
    pub fn add_constant(&mut self, constant: Constant) -> ConstIndex {
        let index = self.constants.len() as ConstIndex;
        self.constants.push(constant);
        index
    }

    /// Append a function body, returns its index
    pub fn add_function(&mut self, program: Program) -> ConstIndex {
        self.add_constant(Constant::Code(program))
    }

    /// Append `program` and make it the entry body
    pub fn set_entry(&mut self, program: Program) -> ConstIndex {
        let index = self.add_function(program);
        self.entry = index;
        index
    }

    /// Look up a constant
    #[inline]
    pub fn get(&self, index: ConstIndex) -> Option<&Constant> {
        self.constants.get(index as usize)
    }
}
