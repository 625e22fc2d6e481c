//! Per-instruction code generation.
//!
//! An [`InstructionCompiler`] is bound to one function body: it borrows the
//! unit-wide [`ConstantCompiler`] for the shared stream and pool, and the
//! body's [`RegisterAllocator`] for operand encoding.

use tracing::trace;

use crate::backend::bytecode::config::MAX_ETC_INDEX;
use crate::backend::bytecode::opcodes::Opcode;
use crate::backend::bytecode::operators::{binary_opcode, unary_opcode};
use crate::backend::models::{ConstIndex, Constant, Instruction, VReg};

use super::error::CompileResult;
use super::registers::{Operand, RegisterAllocator};
use super::ConstantCompiler;

pub(super) struct InstructionCompiler<'c, 'a> {
    unit: &'c mut ConstantCompiler<'a>,
    regs: &'c RegisterAllocator,
    /// Ordinal of the body being compiled, scopes its labels
    body: usize,
}

impl<'c, 'a> InstructionCompiler<'c, 'a> {
    pub(super) fn new(unit: &'c mut ConstantCompiler<'a>, regs: &'c RegisterAllocator, body: usize) -> Self {
        Self { unit, regs, body }
    }

    #[inline]
    fn reg(&self, reg: VReg) -> Operand {
        self.regs.operand(reg)
    }

    /// Compile one instruction attributed to source `line`
    pub(super) fn compile(&mut self, line: u32, instruction: &Instruction) -> CompileResult<()> {
        self.unit.stream.set_line(line);
        trace!(
            target: "vmcodegen::compiler",
            body = self.body,
            offset = self.unit.stream.current_offset(),
            ?instruction
        );

        match instruction {
            Instruction::Move { dst, src } => {
                let ops = [self.reg(*dst), self.reg(*src)];
                self.unit.stream.emit_regs(Opcode::Move, &ops);
            }
            Instruction::LoadConst { dst, constant } => {
                self.compile_load(*dst, *constant)?;
            }
            Instruction::Combine { op, dst, lhs, rhs } => {
                let ops = [self.reg(*dst), self.reg(*lhs), self.reg(*rhs)];
                self.unit.stream.emit_regs(binary_opcode(*op), &ops);
            }
            Instruction::Unary { op, dst, src } => {
                let ops = [self.reg(*dst), self.reg(*src)];
                self.unit.stream.emit_regs(unary_opcode(*op), &ops);
            }
            Instruction::Push { src, spread } => {
                let src = self.reg(*src);
                self.unit.stream.emit_regs(Opcode::Push, &[src]);
                self.unit.stream.push_u8(*spread as u8);
            }
            Instruction::Jump { target } => {
                self.unit.stream.emit_jump(Opcode::Jump, None, self.body, *target);
            }
            Instruction::JumpIf { cond, target, negate } => {
                let opcode = if *negate { Opcode::JumpIfNot } else { Opcode::JumpIf };
                let cond = self.reg(*cond);
                self.unit.stream.emit_jump(opcode, Some(cond), self.body, *target);
            }
            Instruction::Label(label) => {
                self.unit.stream.bind_label(self.body, *label);
            }
            Instruction::Call { callee } => {
                let callee = self.reg(*callee);
                self.unit.stream.emit_regs(Opcode::Call, &[callee]);
            }
            Instruction::TailCall { callee } => {
                let callee = self.reg(*callee);
                self.unit.stream.emit_regs(Opcode::TailCall, &[callee]);
            }
            Instruction::MakeClosure { dst, function, captures } => {
                self.compile_closure(*dst, *function, captures)?;
            }
            Instruction::MakeContinuation { dst } => {
                let dst = self.reg(*dst);
                self.unit.stream.emit_regs(Opcode::MakeContinuation, &[dst]);
            }
            Instruction::MakeTailContinuation { dst } => {
                let dst = self.reg(*dst);
                self.unit.stream.emit_regs(Opcode::MakeTailContinuation, &[dst]);
            }
            Instruction::Clear { reg } => {
                let reg = self.reg(*reg);
                self.unit.stream.emit_regs(Opcode::Clear, &[reg]);
            }
            Instruction::NewTable { dst } => {
                let dst = self.reg(*dst);
                self.unit.stream.emit_regs(Opcode::NewTable, &[dst]);
            }
            Instruction::GetIndex { dst, table, key } => {
                let ops = [self.reg(*dst), self.reg(*table), self.reg(*key)];
                self.unit.stream.emit_regs(Opcode::GetIndex, &ops);
            }
            Instruction::SetIndex { table, key, value } => {
                let ops = [self.reg(*table), self.reg(*key), self.reg(*value)];
                self.unit.stream.emit_regs(Opcode::SetIndex, &ops);
            }
            Instruction::Receive { dsts } => {
                self.compile_receive(dsts);
            }
            Instruction::ReceiveEtc { dsts, etc } => {
                self.compile_receive(dsts);
                let etc = self.reg(*etc);
                self.unit.stream.emit_regs(Opcode::ReceiveEtc, &[etc]);
            }
            Instruction::EtcLookup { dst, etc, index } => {
                let index = etc_index(*index);
                let ops = [self.reg(*dst), self.reg(*etc)];
                self.unit.stream.emit_regs(Opcode::EtcLookup, &ops);
                self.unit.stream.push_u8(index);
            }
            Instruction::FillTable { table, etc, start } => {
                let start = etc_index(*start);
                let ops = [self.reg(*table), self.reg(*etc)];
                self.unit.stream.emit_regs(Opcode::FillTable, &ops);
                self.unit.stream.push_u8(start);
            }
        }
        Ok(())
    }

    /// Load a literal, inline when the encoding allows it
    fn compile_load(&mut self, dst: VReg, index: ConstIndex) -> CompileResult<()> {
        let dst = self.reg(dst);
        let module = self.unit.module;
        let inline = self.unit.config.inline_literals;
        let max_inline_len = self.unit.config.max_inline_string_len;
        let Some(constant) = module.get(index) else {
            panic!("internal compiler error: constant {} is not in the constant table", index);
        };

        if inline {
            match constant {
                Constant::Int(n) => {
                    if let Ok(value) = i32::try_from(*n) {
                        self.unit.stream.emit_regs(Opcode::LoadInt, &[dst]);
                        self.unit.stream.push_i32(value);
                        return Ok(());
                    }
                }
                Constant::Str(s) if s.len() <= max_inline_len => {
                    self.unit.stream.emit_regs(Opcode::LoadStr, &[dst]);
                    self.unit.stream.push_u8(s.len() as u8);
                    self.unit.stream.push_bytes(s.as_bytes());
                    return Ok(());
                }
                _ => {}
            }
        }

        let slot = self.unit.request(index)?;
        self.unit.stream.emit_regs(Opcode::LoadConst, &[dst]);
        self.unit.stream.push_u16(slot);
        Ok(())
    }

    /// Instantiate a nested function and bind its captures in order
    fn compile_closure(&mut self, dst: VReg, function: ConstIndex, captures: &[VReg]) -> CompileResult<()> {
        match self.unit.module.get(function) {
            Some(Constant::Code(_)) => {}
            Some(other) => panic!(
                "internal compiler error: closure over constant {} which is a {}, not a function body",
                function,
                other.type_name()
            ),
            None => panic!("internal compiler error: constant {} is not in the constant table", function),
        }
        let dst = self.reg(dst);
        let slot = self.unit.request(function)?;
        self.unit.stream.emit_regs(Opcode::LoadClosure, &[dst]);
        self.unit.stream.push_u16(slot);

        for &capture in captures {
            let src = self.reg(capture);
            self.unit.stream.emit_regs(Opcode::BindUpvalue, &[dst, src]);
        }
        Ok(())
    }

    fn compile_receive(&mut self, dsts: &[VReg]) {
        for &dst in dsts {
            let dst = self.reg(dst);
            self.unit.stream.emit_regs(Opcode::Receive, &[dst]);
        }
    }
}

/// Validate a variadic-tail index
fn etc_index(index: u32) -> u8 {
    if index >= MAX_ETC_INDEX {
        panic!(
            "internal compiler error: variadic index {} out of range [0, {})",
            index, MAX_ETC_INDEX
        );
    }
    index as u8
}
