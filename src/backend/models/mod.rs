//! IR data model handed to the backend by the lowering pass.

pub mod constant;
pub mod ir;

pub use constant::{Constant, IrModule};
pub use ir::{BinaryOp, ConstIndex, Instruction, Label, Program, UnaryOp, UnknownOperator, VReg};
