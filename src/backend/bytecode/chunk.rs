//! Bytecode unit representation
//!
//! A [`BytecodeUnit`] holds the flat instruction stream shared by every
//! function body of one compilation, the constant pool (literals and function
//! descriptors), and the source line mapping. The [`StreamBuilder`] is the
//! append-only writer the compiler emits into; it also owns jump labels and
//! resolves them once every body has been emitted.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Range;

use itertools::Itertools;
use tracing::trace;

use crate::backend::models::Label;

use super::compiler::{CompileError, CompileErrorKind, CompileResult, Operand};
use super::opcodes::{Opcode, REG};

/// Descriptor of one compiled function body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDescriptor {
    /// Body name
    pub name: String,
    /// Half-open range occupied in the shared instruction stream
    pub range: Range<usize>,
    /// Number of upvalues the closure must be given
    pub upvalue_count: u16,
    /// Number of cells the frame must allocate
    pub cell_count: u16,
    /// Number of physical registers the frame must allocate
    pub register_count: u16,
    /// Names of upvalue slots, for diagnostics
    pub upvalue_names: BTreeMap<u32, String>,
}

/// A compiled constant-pool entry
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEntry {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Function(FunctionDescriptor),
}

impl fmt::Display for PoolEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => write!(f, "nil"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(n) => write!(f, "{}", n),
            Self::Float(x) => write!(f, "{:?}", x),
            Self::Str(s) => write!(f, "{:?}", s),
            Self::Function(desc) => write!(f, "<fn {}>", desc.name),
        }
    }
}

/// A compiled bytecode unit
///
/// Units are immutable after compilation and can be shared across threads.
#[derive(Debug, Clone, PartialEq)]
pub struct BytecodeUnit {
    /// The instruction stream of every function body
    code: Vec<u8>,
    /// Compiled constants in first-requested order
    pool: Vec<PoolEntry>,
    /// Source line information: (byte_offset, line_number), sorted by offset
    line_info: Vec<(usize, u32)>,
}

impl BytecodeUnit {
    pub(crate) fn new(code: Vec<u8>, pool: Vec<PoolEntry>, line_info: Vec<(usize, u32)>) -> Self {
        Self { code, pool, line_info }
    }

    /// Get the instruction stream
    #[inline]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Get the constant pool
    #[inline]
    pub fn pool(&self) -> &[PoolEntry] {
        &self.pool
    }

    /// Get a pool entry
    #[inline]
    pub fn get_constant(&self, index: u16) -> Option<&PoolEntry> {
        self.pool.get(index as usize)
    }

    /// Iterate over function descriptors in compilation order
    pub fn functions(&self) -> impl Iterator<Item = &FunctionDescriptor> {
        self.pool.iter().filter_map(|entry| match entry {
            PoolEntry::Function(desc) => Some(desc),
            _ => None,
        })
    }

    /// Descriptor of the entry body (always pool slot 0)
    pub fn entry(&self) -> Option<&FunctionDescriptor> {
        match self.pool.first() {
            Some(PoolEntry::Function(desc)) => Some(desc),
            _ => None,
        }
    }

    /// Length of the instruction stream in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Check if the instruction stream is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    #[inline]
    pub fn read_byte(&self, offset: usize) -> Option<u8> {
        self.code.get(offset).copied()
    }

    #[inline]
    pub fn read_opcode(&self, offset: usize) -> Option<Opcode> {
        self.code.get(offset).and_then(|&b| Opcode::from_byte(b))
    }

    /// Read a u16 from the stream (big-endian)
    #[inline]
    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        let bytes = self.code.get(offset..offset + 2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Read an i32 from the stream (big-endian)
    #[inline]
    pub fn read_i32(&self, offset: usize) -> Option<i32> {
        let bytes = self.code.get(offset..offset + 4)?;
        Some(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a register operand
    #[inline]
    pub fn read_operand(&self, offset: usize) -> Option<Operand> {
        self.read_u16(offset).and_then(Operand::decode)
    }

    /// Total length of the instruction at `offset`, operands included
    pub fn instruction_len(&self, offset: usize) -> Option<usize> {
        let opcode = self.read_opcode(offset)?;
        let mut len = 1 + opcode.immediate_size();
        if opcode == Opcode::LoadStr {
            len += self.read_byte(offset + 1 + REG)? as usize;
        }
        Some(len)
    }

    /// Resolved absolute target of the jump at `offset`
    pub fn jump_target(&self, offset: usize) -> Option<usize> {
        let opcode = self.read_opcode(offset)?;
        let operand = opcode.jump_operand_offset()?;
        let rel = self.read_i32(offset + operand)?;
        let next = offset + 1 + opcode.immediate_size();
        usize::try_from(next as i64 + rel as i64).ok()
    }

    /// Offsets of every instruction within `range`, in order
    pub fn instruction_offsets(&self, range: Range<usize>) -> Vec<usize> {
        let mut offsets = Vec::new();
        let mut offset = range.start;
        while offset < range.end {
            offsets.push(offset);
            match self.instruction_len(offset) {
                Some(len) => offset += len,
                None => break,
            }
        }
        offsets
    }

    /// Get the source line for a stream offset
    pub fn get_line(&self, offset: usize) -> Option<u32> {
        match self.line_info.binary_search_by_key(&offset, |&(o, _)| o) {
            Ok(idx) => Some(self.line_info[idx].1),
            Err(idx) if idx > 0 => Some(self.line_info[idx - 1].1),
            _ => None,
        }
    }

    /// Disassemble every function body and the constant pool
    pub fn disassemble(&self) -> String {
        let mut output = String::new();
        for desc in self.functions() {
            output.push_str(&format!("=== {} [{:04x}..{:04x}) ===\n", desc.name, desc.range.start, desc.range.end));
            output.push_str(&format!(
                "registers: {}, cells: {}, upvalues: {}\n",
                desc.register_count, desc.cell_count, desc.upvalue_count
            ));
            for offset in self.instruction_offsets(desc.range.clone()) {
                let line = self.get_line(offset).map_or(String::new(), |l| format!("{:4} ", l));
                let (disasm, _) = self.disassemble_instruction(offset);
                output.push_str(&format!("{:04x} {} {}\n", offset, line, disasm));
            }
        }
        output.push_str(&format!("constants: {}\n", self.pool.len()));
        for (i, entry) in self.pool.iter().enumerate() {
            output.push_str(&format!("  #{} {}\n", i, entry));
        }
        output
    }

    /// Disassemble a single instruction, returns (string, next_offset)
    pub fn disassemble_instruction(&self, offset: usize) -> (String, usize) {
        let Some(opcode) = self.read_opcode(offset) else {
            return (format!("??? (0x{:02x})", self.code.get(offset).unwrap_or(&0)), offset + 1);
        };
        let next_offset = offset + self.instruction_len(offset).unwrap_or(1);
        let reg = |n: usize| {
            self.read_operand(offset + 1 + n * REG)
                .map_or_else(|| "???".to_string(), |r| r.to_string())
        };
        let pool_ref = |at: usize| {
            let index = self.read_u16(at).unwrap_or(0);
            let entry = self
                .get_constant(index)
                .map_or_else(|| "???".to_string(), |e| e.to_string());
            format!("#{} ({})", index, entry)
        };

        let operands = match opcode {
            Opcode::Nop => String::new(),
            Opcode::LoadInt => {
                let value = self.read_i32(offset + 1 + REG).unwrap_or(0);
                format!("{}, {}", reg(0), value)
            }
            Opcode::LoadStr => {
                let start = offset + 2 + REG;
                let bytes = self.code.get(start..next_offset).unwrap_or(&[]);
                format!("{}, {:?}", reg(0), String::from_utf8_lossy(bytes))
            }
            Opcode::LoadConst | Opcode::LoadClosure => {
                format!("{}, {}", reg(0), pool_ref(offset + 1 + REG))
            }
            Opcode::Push => {
                let spread = self.read_byte(offset + 1 + REG).unwrap_or(0) != 0;
                if spread {
                    format!("{}...", reg(0))
                } else {
                    reg(0)
                }
            }
            Opcode::Jump => {
                let target = self.jump_target(offset).unwrap_or(0);
                format!("-> {:04x}", target)
            }
            Opcode::JumpIf | Opcode::JumpIfNot => {
                let target = self.jump_target(offset).unwrap_or(0);
                format!("{} -> {:04x}", reg(0), target)
            }
            Opcode::EtcLookup | Opcode::FillTable => {
                let index = self.read_byte(offset + 1 + 2 * REG).unwrap_or(0);
                format!("{}, {}, {}", reg(0), reg(1), index)
            }
            _ => {
                let count = opcode.immediate_size() / REG;
                (0..count).map(reg).join(", ")
            }
        };

        if operands.is_empty() {
            (opcode.mnemonic().to_string(), next_offset)
        } else {
            (format!("{} {}", opcode.mnemonic(), operands), next_offset)
        }
    }
}

/// A jump whose offset is patched once labels are known
#[derive(Debug, Clone, Copy)]
struct JumpPatch {
    /// Body the jump belongs to
    body: usize,
    /// Label being jumped to
    label: Label,
    /// Offset of the 4-byte operand
    operand: usize,
    /// Offset just past the jump instruction
    from: usize,
}

/// Append-only writer for the shared instruction stream
#[derive(Debug)]
pub struct StreamBuilder {
    code: Vec<u8>,
    line_info: Vec<(usize, u32)>,
    current_line: u32,
    record_lines: bool,
    /// (body, label) -> bound offset
    labels: HashMap<(usize, Label), usize>,
    patches: Vec<JumpPatch>,
    last_label_offset: Option<usize>,
}

impl StreamBuilder {
    /// Create an empty stream
    pub fn new(record_lines: bool) -> Self {
        Self {
            code: Vec::with_capacity(256),
            line_info: Vec::new(),
            current_line: 0,
            record_lines,
            labels: HashMap::new(),
            patches: Vec::new(),
            last_label_offset: None,
        }
    }

    /// Set the current source line for subsequent instructions
    pub fn set_line(&mut self, line: u32) {
        self.current_line = line;
    }

    /// Get the current stream offset
    #[inline]
    pub fn current_offset(&self) -> usize {
        self.code.len()
    }

    /// Emit a bare opcode
    pub fn emit(&mut self, opcode: Opcode) {
        self.emit_line_info();
        self.code.push(opcode.to_byte());
    }

    /// Emit an opcode followed by register operands
    pub fn emit_regs(&mut self, opcode: Opcode, operands: &[Operand]) {
        self.emit(opcode);
        for &operand in operands {
            self.push_operand(operand);
        }
    }

    #[inline]
    pub fn push_operand(&mut self, operand: Operand) {
        self.push_u16(operand.encode());
    }

    #[inline]
    pub fn push_u8(&mut self, value: u8) {
        self.code.push(value);
    }

    #[inline]
    pub fn push_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_be_bytes());
    }

    #[inline]
    pub fn push_i32(&mut self, value: i32) {
        self.code.extend_from_slice(&value.to_be_bytes());
    }

    #[inline]
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Emit a jump to `label` of `body`, with an optional condition register
    ///
    /// The offset is left as a placeholder until [`resolve_labels`](Self::resolve_labels).
    pub fn emit_jump(&mut self, opcode: Opcode, cond: Option<Operand>, body: usize, label: Label) {
        debug_assert!(opcode.is_jump());
        self.emit(opcode);
        if let Some(cond) = cond {
            self.push_operand(cond);
        }
        let operand = self.code.len();
        self.code.extend_from_slice(&[0xFF; 4]);
        self.patches.push(JumpPatch {
            body,
            label,
            operand,
            from: self.code.len(),
        });
    }

    /// Bind `label` of `body` to the current offset
    pub fn bind_label(&mut self, body: usize, label: Label) {
        let offset = self.code.len();
        if self.labels.insert((body, label), offset).is_some() {
            panic!("internal compiler error: label {:?} bound twice in body {}", label, body);
        }
        self.last_label_offset = Some(offset);
    }

    /// Check if a label is bound at the current end of the stream
    #[inline]
    pub fn label_at_end(&self) -> bool {
        self.last_label_offset == Some(self.code.len())
    }

    /// Patch every jump with its resolved relative offset
    ///
    /// `ranges[body]` is the stream range of each body; a jump may only land
    /// inside its own body.
    pub fn resolve_labels(&mut self, ranges: &[Range<usize>]) -> CompileResult<()> {
        for patch in std::mem::take(&mut self.patches) {
            let Some(&target) = self.labels.get(&(patch.body, patch.label)) else {
                panic!(
                    "internal compiler error: jump to undefined label {:?} in body {}",
                    patch.label, patch.body
                );
            };
            if !ranges.get(patch.body).is_some_and(|range| range.contains(&target)) {
                panic!(
                    "internal compiler error: label {:?} resolves to {:#x}, outside body {}",
                    patch.label, target, patch.body
                );
            }
            let rel = i32::try_from(target as i64 - patch.from as i64).map_err(|_| {
                self.line_error(CompileErrorKind::JumpOutOfRange { from: patch.from, to: target }, patch.operand)
            })?;
            self.code[patch.operand..patch.operand + 4].copy_from_slice(&rel.to_be_bytes());
            trace!(target: "vmcodegen::stream", body = patch.body, label = patch.label.0, from = patch.from, to = target);
        }
        Ok(())
    }

    /// Most recent positive source line recorded in the stream
    pub fn last_line(&self) -> Option<u32> {
        self.line_info.iter().rev().map(|&(_, line)| line).find(|&line| line > 0)
    }

    /// Finish the stream, returning the code and line table
    pub fn finish(self) -> (Vec<u8>, Vec<(usize, u32)>) {
        (self.code, self.line_info)
    }

    /// Build an error attributed to the line recorded at or before `offset`
    fn line_error(&self, kind: CompileErrorKind, offset: usize) -> CompileError {
        let line = self
            .line_info
            .iter()
            .rev()
            .find(|&&(o, line)| o <= offset && line > 0)
            .map(|&(_, line)| line);
        CompileError { kind, line }
    }

    /// Record line info for current position
    fn emit_line_info(&mut self) {
        if !self.record_lines {
            return;
        }
        let offset = self.code.len();
        let line = self.current_line;
        if let Some(last) = self.line_info.last_mut() {
            // Only add if line changed from previous entry
            if last.1 == line {
                return;
            }
            // One entry per offset
            if last.0 == offset {
                last.1 = line;
                return;
            }
        }
        self.line_info.push((offset, line));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_from(builder: StreamBuilder, pool: Vec<PoolEntry>) -> BytecodeUnit {
        let (code, lines) = builder.finish();
        BytecodeUnit::new(code, pool, lines)
    }

    #[test]
    fn test_stream_builder_basic() {
        let mut builder = StreamBuilder::new(true);
        builder.emit_regs(Opcode::NewTable, &[Operand::Register(0)]);
        builder.emit_regs(Opcode::Move, &[Operand::Register(1), Operand::Register(0)]);
        builder.emit(Opcode::Nop);

        let unit = unit_from(builder, vec![]);
        assert_eq!(unit.len(), 3 + 5 + 1);
        assert_eq!(unit.read_opcode(0), Some(Opcode::NewTable));
        assert_eq!(unit.read_opcode(3), Some(Opcode::Move));
        assert_eq!(unit.read_operand(6), Some(Operand::Register(0)));
        assert_eq!(unit.read_opcode(8), Some(Opcode::Nop));
        assert_eq!(unit.instruction_offsets(0..unit.len()), vec![0, 3, 8]);
    }

    #[test]
    fn test_forward_and_backward_jumps() {
        let mut builder = StreamBuilder::new(true);
        builder.bind_label(0, Label(0));
        builder.emit_regs(Opcode::Clear, &[Operand::Register(0)]);
        builder.emit_jump(Opcode::JumpIfNot, Some(Operand::Register(0)), 0, Label(1));
        builder.emit_jump(Opcode::Jump, None, 0, Label(0));
        builder.bind_label(0, Label(1));
        builder.emit(Opcode::Nop);
        let end = builder.current_offset();
        builder.resolve_labels(&[0..end]).unwrap();

        let unit = unit_from(builder, vec![]);
        // clear(3) + jump_if_not(7) + jump(5)
        assert_eq!(unit.jump_target(3), Some(15));
        assert_eq!(unit.jump_target(10), Some(0));
        assert!(unit.disassemble_instruction(10).0.contains("-> 0000"));
    }

    #[test]
    #[should_panic(expected = "undefined label")]
    fn test_undefined_label_is_fatal() {
        let mut builder = StreamBuilder::new(true);
        builder.emit_jump(Opcode::Jump, None, 0, Label(7));
        let end = builder.current_offset();
        let _ = builder.resolve_labels(&[0..end]);
    }

    #[test]
    #[should_panic(expected = "outside body")]
    fn test_label_in_other_body_is_fatal() {
        let mut builder = StreamBuilder::new(true);
        builder.emit_jump(Opcode::Jump, None, 0, Label(0));
        let first_end = builder.current_offset();
        builder.emit(Opcode::Nop);
        // body 0 claims a label whose position lies in body 1
        builder.bind_label(0, Label(0));
        builder.emit(Opcode::Nop);
        let end = builder.current_offset();
        let _ = builder.resolve_labels(&[0..first_end, first_end..end]);
    }

    #[test]
    fn test_line_info() {
        let mut builder = StreamBuilder::new(true);
        builder.set_line(1);
        builder.emit(Opcode::Nop);
        builder.set_line(2);
        builder.emit(Opcode::Nop);
        builder.emit(Opcode::Nop);
        builder.set_line(5);
        builder.emit(Opcode::Nop);
        builder.set_line(0);
        builder.emit(Opcode::Nop);
        assert_eq!(builder.last_line(), Some(5));

        let unit = unit_from(builder, vec![]);
        assert_eq!(unit.get_line(0), Some(1));
        assert_eq!(unit.get_line(1), Some(2));
        assert_eq!(unit.get_line(2), Some(2));
        assert_eq!(unit.get_line(3), Some(5));
        assert_eq!(unit.get_line(4), Some(0));
    }

    #[test]
    fn test_label_does_not_claim_line() {
        let mut builder = StreamBuilder::new(true);
        builder.set_line(1);
        builder.emit(Opcode::Nop);
        builder.set_line(2);
        builder.bind_label(0, Label(0));
        builder.set_line(8);
        builder.emit(Opcode::Nop);

        let (_, lines) = builder.finish();
        assert_eq!(lines, vec![(0, 1), (1, 8)]);
    }

    #[test]
    fn test_line_info_one_entry_per_offset() {
        let mut builder = StreamBuilder::new(true);
        builder.set_line(3);
        builder.emit_line_info();
        builder.set_line(4);
        builder.emit(Opcode::Nop);

        let unit = unit_from(builder, vec![]);
        assert_eq!(unit.get_line(0), Some(4));
        assert_eq!(unit.line_info, vec![(0, 4)]);
    }

    #[test]
    fn test_line_info_disabled() {
        let mut builder = StreamBuilder::new(false);
        builder.set_line(9);
        builder.emit(Opcode::Nop);
        assert_eq!(builder.last_line(), None);
    }

    #[test]
    fn test_disassemble() {
        let mut builder = StreamBuilder::new(true);
        builder.set_line(1);
        builder.emit_regs(Opcode::LoadStr, &[Operand::Register(0)]);
        builder.push_u8(2);
        builder.push_bytes(b"ok");
        builder.emit_regs(Opcode::LoadConst, &[Operand::Cell(0)]);
        builder.push_u16(1);
        builder.emit_regs(Opcode::Add, &[Operand::Register(1), Operand::Cell(0), Operand::Upvalue(2)]);
        let end = builder.current_offset();

        let desc = FunctionDescriptor {
            name: "example".to_string(),
            range: 0..end,
            upvalue_count: 3,
            cell_count: 1,
            register_count: 2,
            upvalue_names: BTreeMap::new(),
        };
        let unit = unit_from(builder, vec![PoolEntry::Function(desc), PoolEntry::Int(1 << 40)]);
        assert_eq!(unit.instruction_len(0), Some(1 + 3 + 2));

        let disasm = unit.disassemble();
        assert!(disasm.contains("=== example"));
        assert!(disasm.contains("load_str r0, \"ok\""));
        assert!(disasm.contains("load_const c0, #1 (1099511627776)"));
        assert!(disasm.contains("add r1, c0, u2"));
        assert!(disasm.contains("#0 <fn example>"));
    }
}
