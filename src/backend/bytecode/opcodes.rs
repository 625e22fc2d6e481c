//! Bytecode opcodes for the register VM
//!
//! Every instruction is a one-byte opcode followed by fixed-width operands.
//! Register operands are 16-bit tagged references (see
//! [`Operand`](super::compiler::Operand)), pool indices are 16-bit, jump
//! offsets are signed 32-bit relative to the end of the jump instruction.
//! All multi-byte operands are big-endian.
//!
//! Opcodes are grouped by category and assigned contiguous ranges so that
//! the VM can dispatch through a dense table.

use std::fmt;

/// Width of a register operand in bytes
pub const REG: usize = 2;
/// Width of a constant-pool index in bytes
pub const POOL: usize = 2;
/// Width of a jump offset in bytes
pub const OFFSET: usize = 4;

/// Bytecode opcode enumeration
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // === Moves and Literals (0x00-0x1F) ===
    /// No operation; pads a label bound at the end of a body
    Nop = 0x00,
    /// dst:reg src:reg
    Move = 0x01,
    /// dst:reg value:i32, integer carried inline
    LoadInt = 0x10,
    /// dst:reg len:u8 bytes[len], short string carried inline
    LoadStr = 0x11,
    /// dst:reg index:u16, load literal from the constant pool
    LoadConst = 0x12,
    /// dst:reg index:u16, instantiate the function descriptor at index
    LoadClosure = 0x13,
    /// closure:reg src:reg, append src to the closure's upvalues
    BindUpvalue = 0x14,
    /// dst:reg
    NewTable = 0x15,
    /// reg:reg, invalidate the register's value
    Clear = 0x16,

    // === Arithmetic (0x20-0x2F), dst:reg lhs:reg rhs:reg ===
    Add = 0x20,
    Sub = 0x21,
    Mul = 0x22,
    Div = 0x23,
    IntDiv = 0x24,
    Mod = 0x25,
    Pow = 0x26,
    Concat = 0x27,

    // === Comparison (0x30-0x37), dst:reg lhs:reg rhs:reg ===
    Eq = 0x30,
    Ne = 0x31,
    Lt = 0x32,
    Le = 0x33,
    Gt = 0x34,
    Ge = 0x35,

    // === Bitwise (0x38-0x3F), dst:reg lhs:reg rhs:reg ===
    BitAnd = 0x38,
    BitOr = 0x39,
    BitXor = 0x3A,
    Shl = 0x3B,
    Shr = 0x3C,

    // === Unary (0x40-0x47), dst:reg src:reg ===
    Neg = 0x40,
    Not = 0x41,
    Len = 0x42,
    BitNot = 0x43,

    // === Tables (0x48-0x4F) ===
    /// dst:reg table:reg key:reg
    GetIndex = 0x48,
    /// table:reg key:reg value:reg
    SetIndex = 0x49,

    // === Control Flow (0x50-0x5F) ===
    /// offset:i32
    Jump = 0x50,
    /// cond:reg offset:i32, jump when cond is truthy
    JumpIf = 0x51,
    /// cond:reg offset:i32, jump when cond is falsy
    JumpIfNot = 0x52,

    // === Calls (0x60-0x6F) ===
    /// src:reg spread:u8
    Push = 0x60,
    /// callee:reg
    Call = 0x61,
    /// callee:reg
    TailCall = 0x62,
    /// dst:reg
    MakeContinuation = 0x63,
    /// dst:reg
    MakeTailContinuation = 0x64,
    /// dst:reg, bind the next call result
    Receive = 0x65,
    /// etc:reg, bind all remaining call results
    ReceiveEtc = 0x66,

    // === Variadic Tail (0x70-0x7F) ===
    /// dst:reg etc:reg index:u8
    EtcLookup = 0x70,
    /// table:reg etc:reg start:u8
    FillTable = 0x71,
}

impl Opcode {
    /// Convert a byte to an opcode
    #[inline]
    pub fn from_byte(byte: u8) -> Option<Self> {
        OPCODE_TABLE[byte as usize]
    }

    /// Convert opcode to byte
    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Size of the fixed operand bytes following the opcode
    ///
    /// `LoadStr` additionally carries `len` string bytes after its fixed part.
    pub fn immediate_size(self) -> usize {
        match self {
            Self::Nop => 0,

            Self::NewTable
            | Self::Clear
            | Self::Call
            | Self::TailCall
            | Self::MakeContinuation
            | Self::MakeTailContinuation
            | Self::Receive
            | Self::ReceiveEtc => REG,

            Self::Push => REG + 1,
            Self::LoadStr => REG + 1,

            Self::Move
            | Self::BindUpvalue
            | Self::Neg
            | Self::Not
            | Self::Len
            | Self::BitNot => REG * 2,

            Self::LoadConst | Self::LoadClosure => REG + POOL,

            Self::EtcLookup | Self::FillTable => REG * 2 + 1,

            Self::LoadInt => REG + 4,

            Self::Add
            | Self::Sub
            | Self::Mul
            | Self::Div
            | Self::IntDiv
            | Self::Mod
            | Self::Pow
            | Self::Concat
            | Self::Eq
            | Self::Ne
            | Self::Lt
            | Self::Le
            | Self::Gt
            | Self::Ge
            | Self::BitAnd
            | Self::BitOr
            | Self::BitXor
            | Self::Shl
            | Self::Shr
            | Self::GetIndex
            | Self::SetIndex => REG * 3,

            Self::Jump => OFFSET,
            Self::JumpIf | Self::JumpIfNot => REG + OFFSET,
        }
    }

    /// Get the mnemonic name for this opcode
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Nop => "nop",
            Self::Move => "move",
            Self::LoadInt => "load_int",
            Self::LoadStr => "load_str",
            Self::LoadConst => "load_const",
            Self::LoadClosure => "load_closure",
            Self::BindUpvalue => "bind_upvalue",
            Self::NewTable => "new_table",
            Self::Clear => "clear",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::IntDiv => "int_div",
            Self::Mod => "mod",
            Self::Pow => "pow",
            Self::Concat => "concat",
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Lt => "lt",
            Self::Le => "le",
            Self::Gt => "gt",
            Self::Ge => "ge",
            Self::BitAnd => "bit_and",
            Self::BitOr => "bit_or",
            Self::BitXor => "bit_xor",
            Self::Shl => "shl",
            Self::Shr => "shr",
            Self::Neg => "neg",
            Self::Not => "not",
            Self::Len => "len",
            Self::BitNot => "bit_not",
            Self::GetIndex => "get_index",
            Self::SetIndex => "set_index",
            Self::Jump => "jump",
            Self::JumpIf => "jump_if",
            Self::JumpIfNot => "jump_if_not",
            Self::Push => "push",
            Self::Call => "call",
            Self::TailCall => "tail_call",
            Self::MakeContinuation => "make_continuation",
            Self::MakeTailContinuation => "make_tail_continuation",
            Self::Receive => "receive",
            Self::ReceiveEtc => "receive_etc",
            Self::EtcLookup => "etc_lookup",
            Self::FillTable => "fill_table",
        }
    }

    /// Check if this opcode is a jump instruction
    #[inline]
    pub fn is_jump(self) -> bool {
        matches!(self, Self::Jump | Self::JumpIf | Self::JumpIfNot)
    }

    /// Check if this opcode is a call instruction
    #[inline]
    pub fn is_call(self) -> bool {
        matches!(self, Self::Call | Self::TailCall)
    }

    /// Check if this opcode takes three register operands (dst, lhs, rhs)
    #[inline]
    pub fn is_binary(self) -> bool {
        matches!(self.to_byte(), 0x20..=0x3F)
    }

    /// Check if this opcode takes two register operands (dst, src)
    #[inline]
    pub fn is_unary(self) -> bool {
        matches!(self.to_byte(), 0x40..=0x47)
    }

    /// Offset of the jump operand within the instruction, relative to the opcode byte
    #[inline]
    pub fn jump_operand_offset(self) -> Option<usize> {
        match self {
            Self::Jump => Some(1),
            Self::JumpIf | Self::JumpIfNot => Some(1 + REG),
            _ => None,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

/// Lookup table for byte -> Opcode conversion
static OPCODE_TABLE: [Option<Opcode>; 256] = {
    let mut table = [None; 256];

    // Moves and literals
    table[0x00] = Some(Opcode::Nop);
    table[0x01] = Some(Opcode::Move);
    table[0x10] = Some(Opcode::LoadInt);
    table[0x11] = Some(Opcode::LoadStr);
    table[0x12] = Some(Opcode::LoadConst);
    table[0x13] = Some(Opcode::LoadClosure);
    table[0x14] = Some(Opcode::BindUpvalue);
    table[0x15] = Some(Opcode::NewTable);
    table[0x16] = Some(Opcode::Clear);

    // Arithmetic
    table[0x20] = Some(Opcode::Add);
    table[0x21] = Some(Opcode::Sub);
    table[0x22] = Some(Opcode::Mul);
    table[0x23] = Some(Opcode::Div);
    table[0x24] = Some(Opcode::IntDiv);
    table[0x25] = Some(Opcode::Mod);
    table[0x26] = Some(Opcode::Pow);
    table[0x27] = Some(Opcode::Concat);

    // Comparison
    table[0x30] = Some(Opcode::Eq);
    table[0x31] = Some(Opcode::Ne);
    table[0x32] = Some(Opcode::Lt);
    table[0x33] = Some(Opcode::Le);
    table[0x34] = Some(Opcode::Gt);
    table[0x35] = Some(Opcode::Ge);

    // Bitwise
    table[0x38] = Some(Opcode::BitAnd);
    table[0x39] = Some(Opcode::BitOr);
    table[0x3A] = Some(Opcode::BitXor);
    table[0x3B] = Some(Opcode::Shl);
    table[0x3C] = Some(Opcode::Shr);

    // Unary
    table[0x40] = Some(Opcode::Neg);
    table[0x41] = Some(Opcode::Not);
    table[0x42] = Some(Opcode::Len);
    table[0x43] = Some(Opcode::BitNot);

    // Tables
    table[0x48] = Some(Opcode::GetIndex);
    table[0x49] = Some(Opcode::SetIndex);

    // Control flow
    table[0x50] = Some(Opcode::Jump);
    table[0x51] = Some(Opcode::JumpIf);
    table[0x52] = Some(Opcode::JumpIfNot);

    // Calls
    table[0x60] = Some(Opcode::Push);
    table[0x61] = Some(Opcode::Call);
    table[0x62] = Some(Opcode::TailCall);
    table[0x63] = Some(Opcode::MakeContinuation);
    table[0x64] = Some(Opcode::MakeTailContinuation);
    table[0x65] = Some(Opcode::Receive);
    table[0x66] = Some(Opcode::ReceiveEtc);

    // Variadic tail
    table[0x70] = Some(Opcode::EtcLookup);
    table[0x71] = Some(Opcode::FillTable);

    table
};
