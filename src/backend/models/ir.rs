//! Instruction-level IR consumed by the bytecode compiler.
//!
//! A [`Program`] is one function body: an ordered list of [`Instruction`]s over
//! virtual registers, a parallel list of source lines, and the metadata needed
//! to lay out its closure captures. The IR is produced by the lowering pass and
//! is assumed to be well-formed; the compiler treats malformed IR as a bug in
//! its producer.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use smallvec::SmallVec;

/// Index into an [`IrModule`](super::IrModule)'s constant table
pub type ConstIndex = u32;

/// Virtual register identifier
///
/// Non-negative ids are ordinary locals of the current body. Negative ids
/// refer to the enclosing closure's upvalue array at index `-1 - id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(pub i32);

impl VReg {
    /// Reference to upvalue `index` of the enclosing closure
    ///
    /// Panics if `index` exceeds `i32::MAX`, which has no negative id.
    #[inline]
    pub fn upvalue(index: u32) -> Self {
        match i32::try_from(index) {
            Ok(index) => VReg(-1 - index),
            Err(_) => panic!("upvalue index {} has no register id", index),
        }
    }

    /// Check if this id names an upvalue rather than a local
    #[inline]
    pub fn is_upvalue(self) -> bool {
        self.0 < 0
    }

    /// Upvalue index for negative ids
    #[inline]
    pub fn upvalue_index(self) -> Option<u32> {
        if self.0 < 0 {
            Some((-1 - self.0) as u32)
        } else {
            None
        }
    }
}

impl fmt::Display for VReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upvalue_index() {
            Some(idx) => write!(f, "u{}", idx),
            None => write!(f, "v{}", self.0),
        }
    }
}

/// Jump label, scoped to the body it appears in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

/// Binary operators understood by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    IntDiv,
    Mod,
    Pow,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

/// Unary operators understood by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
    Len,
    BitNot,
}

/// Error returned when an operator name has no backend counterpart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownOperator(pub String);

impl fmt::Display for UnknownOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unknown operator: {}", self.0)
    }
}

impl std::error::Error for UnknownOperator {}

impl FromStr for BinaryOp {
    type Err = UnknownOperator;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "add" | "+" => Self::Add,
            "sub" | "-" => Self::Sub,
            "mul" | "*" => Self::Mul,
            "div" | "/" => Self::Div,
            "idiv" | "//" => Self::IntDiv,
            "mod" | "%" => Self::Mod,
            "pow" | "^" => Self::Pow,
            "concat" | ".." => Self::Concat,
            "eq" | "==" => Self::Eq,
            "ne" | "!=" => Self::Ne,
            "lt" | "<" => Self::Lt,
            "le" | "<=" => Self::Le,
            "gt" | ">" => Self::Gt,
            "ge" | ">=" => Self::Ge,
            "band" | "&" => Self::BitAnd,
            "bor" | "|" => Self::BitOr,
            "bxor" | "~" => Self::BitXor,
            "shl" | "<<" => Self::Shl,
            "shr" | ">>" => Self::Shr,
            other => return Err(UnknownOperator(other.to_string())),
        })
    }
}

impl FromStr for UnaryOp {
    type Err = UnknownOperator;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "neg" => Self::Neg,
            "not" => Self::Not,
            "len" | "#" => Self::Len,
            "bnot" => Self::BitNot,
            other => return Err(UnknownOperator(other.to_string())),
        })
    }
}

/// A single IR instruction
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// `dst = src`
    Move { dst: VReg, src: VReg },
    /// `dst = constants[constant]`
    LoadConst { dst: VReg, constant: ConstIndex },
    /// `dst = lhs <op> rhs`
    Combine { op: BinaryOp, dst: VReg, lhs: VReg, rhs: VReg },
    /// `dst = <op> src`
    Unary { op: UnaryOp, dst: VReg, src: VReg },
    /// Push a call argument or list element; `spread` expands a variadic tail
    Push { src: VReg, spread: bool },
    /// Unconditional jump
    Jump { target: Label },
    /// Jump when `cond` is truthy (or falsy when `negate` is set)
    JumpIf { cond: VReg, target: Label, negate: bool },
    /// Bind a label at the current position
    Label(Label),
    /// Call the callable or continuation held in `callee`
    Call { callee: VReg },
    /// Call in tail position
    TailCall { callee: VReg },
    /// Instantiate the nested function `function` capturing `captures` in order
    MakeClosure {
        dst: VReg,
        function: ConstIndex,
        captures: SmallVec<[VReg; 4]>,
    },
    /// Capture the current continuation
    MakeContinuation { dst: VReg },
    /// Capture the current continuation in tail position
    MakeTailContinuation { dst: VReg },
    /// Drop the value held in `reg`
    Clear { reg: VReg },
    /// `dst = {}`
    NewTable { dst: VReg },
    /// `dst = table[key]`
    GetIndex { dst: VReg, table: VReg, key: VReg },
    /// `table[key] = value`
    SetIndex { table: VReg, key: VReg, value: VReg },
    /// Bind call results positionally
    Receive { dsts: SmallVec<[VReg; 4]> },
    /// Bind call results positionally, collecting the remainder into `etc`
    ReceiveEtc { dsts: SmallVec<[VReg; 4]>, etc: VReg },
    /// `dst = etc[index]`
    EtcLookup { dst: VReg, etc: VReg, index: u32 },
    /// Append the values of `etc` into `table` starting at `start`
    FillTable { table: VReg, etc: VReg, start: u32 },
}

impl Instruction {
    /// All registers this instruction reads or writes, in operand order
    pub fn registers(&self) -> SmallVec<[VReg; 4]> {
        let mut regs = SmallVec::new();
        match self {
            Self::Move { dst, src } | Self::Unary { dst, src, .. } => {
                regs.push(*dst);
                regs.push(*src);
            }
            Self::LoadConst { dst, .. }
            | Self::MakeContinuation { dst }
            | Self::MakeTailContinuation { dst }
            | Self::NewTable { dst } => regs.push(*dst),
            Self::Combine { dst, lhs, rhs, .. } => regs.extend([*dst, *lhs, *rhs]),
            Self::Push { src, .. } => regs.push(*src),
            Self::Jump { .. } | Self::Label(_) => {}
            Self::JumpIf { cond, .. } => regs.push(*cond),
            Self::Call { callee } | Self::TailCall { callee } => regs.push(*callee),
            Self::MakeClosure { dst, captures, .. } => {
                regs.push(*dst);
                regs.extend(captures.iter().copied());
            }
            Self::Clear { reg } => regs.push(*reg),
            Self::GetIndex { dst, table, key } => regs.extend([*dst, *table, *key]),
            Self::SetIndex { table, key, value } => regs.extend([*table, *key, *value]),
            Self::Receive { dsts } => regs.extend(dsts.iter().copied()),
            Self::ReceiveEtc { dsts, etc } => {
                regs.extend(dsts.iter().copied());
                regs.push(*etc);
            }
            Self::EtcLookup { dst, etc, .. } => regs.extend([*dst, *etc]),
            Self::FillTable { table, etc, .. } => regs.extend([*table, *etc]),
        }
        regs
    }
}

/// One function body (or the top-level chunk)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    /// Name used in descriptors and diagnostics
    pub name: String,
    /// Instructions in program order
    pub instructions: Vec<Instruction>,
    /// Source line per instruction (0 = unknown)
    pub lines: Vec<u32>,
    /// Locals captured by at least one nested closure
    pub upvalue_dests: BTreeSet<VReg>,
    /// Names of this body's own upvalue slots
    pub upvalue_names: BTreeMap<u32, String>,
}

impl Program {
    /// Create an empty program
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Append an instruction attributed to `line`
    pub fn push(&mut self, line: u32, instruction: Instruction) -> &mut Self {
        self.instructions.push(instruction);
        self.lines.push(line);
        self
    }

    /// Mark `reg` as captured by a nested closure
    pub fn capture(&mut self, reg: VReg) -> &mut Self {
        self.upvalue_dests.insert(reg);
        self
    }

    /// Name upvalue slot `index`
    pub fn name_upvalue(&mut self, index: u32, name: impl Into<String>) -> &mut Self {
        self.upvalue_names.insert(index, name.into());
        self
    }

    /// Source line of instruction `index` (0 when unknown)
    #[inline]
    pub fn line(&self, index: usize) -> u32 {
        self.lines.get(index).copied().unwrap_or(0)
    }

    /// Number of instructions
    #[inline]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Check if the body has no instructions
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}
