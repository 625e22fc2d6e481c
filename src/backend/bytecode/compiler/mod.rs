//! Bytecode compiler for IR modules
//!
//! The [`ConstantCompiler`] owns the shared instruction stream and constant
//! pool of one compilation unit. Constants are compiled on demand: a request
//! reserves the next pool slot immediately and queues the constant; queued
//! constants are compiled breadth-first by [`ConstantCompiler::drain`]. A
//! function body is just a `Code` constant, so the entry chunk and every
//! nested closure share one stream and one pool, and recursion depth stays
//! bounded however deeply closures nest.
//!
//! Compilation order is part of the output contract: the entry body is
//! emitted first, then queued constants in the order they were first
//! requested. Identical input always yields an identical unit.

mod error;
mod instructions;
mod registers;


use std::collections::HashMap;
use std::ops::Range;

use tracing::{debug, trace};

use crate::backend::models::{ConstIndex, Constant, IrModule, Program};

use super::chunk::{BytecodeUnit, FunctionDescriptor, PoolEntry, StreamBuilder};
use super::config::CompilerConfig;
use super::opcodes::Opcode;
use instructions::InstructionCompiler;

pub use error::{CompileError, CompileErrorKind, CompileResult};
pub use registers::{Operand, RegisterAllocator};

/// Compiler for one compilation unit
pub struct ConstantCompiler<'a> {
    module: &'a IrModule,
    config: CompilerConfig,
    stream: StreamBuilder,
    /// Compiled constants, in reservation order
    pool: Vec<PoolEntry>,
    /// Source constant index -> reserved pool slot
    requested: HashMap<ConstIndex, u16>,
    /// Constants reserved but not yet compiled
    pending: Vec<ConstIndex>,
    /// Stream range of each compiled body, by body ordinal
    bodies: Vec<Range<usize>>,
}

impl<'a> ConstantCompiler<'a> {
    /// Create a compiler over `module`
    pub fn new(module: &'a IrModule, config: CompilerConfig) -> Self {
        let record_lines = config.record_line_info;
        Self {
            module,
            config: config.clamped(),
            stream: StreamBuilder::new(record_lines),
            pool: Vec::new(),
            requested: HashMap::new(),
            pending: Vec::new(),
            bodies: Vec::new(),
        }
    }

    /// Get the pool slot of constant `index`, reserving and queueing it on first request
    pub fn request(&mut self, index: ConstIndex) -> CompileResult<u16> {
        if let Some(&slot) = self.requested.get(&index) {
            return Ok(slot);
        }
        let reserved = self.requested.len();
        if reserved >= self.config.max_constants {
            return Err(CompileErrorKind::TooManyConstants {
                limit: self.config.max_constants,
            }
            .into());
        }
        let slot = reserved as u16;
        self.requested.insert(index, slot);
        self.pending.push(index);
        trace!(target: "vmcodegen::compiler", constant = index, slot, "queued constant");
        Ok(slot)
    }

    /// Compile queued constants until the queue stays empty
    pub fn drain(&mut self) -> CompileResult<()> {
        loop {
            let batch = std::mem::take(&mut self.pending);
            if batch.is_empty() {
                return Ok(());
            }
            for index in batch {
                let slot = self.requested.get(&index).copied();
                let entry = self.compile_constant(index)?;
                if slot != Some(self.pool.len() as u16) {
                    panic!(
                        "internal compiler error: constant {} reserved pool slot {:?} but compiled into {}",
                        index,
                        slot,
                        self.pool.len()
                    );
                }
                self.pool.push(entry);
            }
        }
    }

    /// Run the whole unit: entry body, every queued constant, then labels
    pub fn run(&mut self) -> CompileResult<()> {
        let entry = self.module.entry;
        if !matches!(self.module.get(entry), Some(Constant::Code(_))) {
            return Err(CompileErrorKind::EntryNotCode { index: entry }.into());
        }
        self.request(entry)?;
        self.drain()?;
        self.stream.resolve_labels(&self.bodies)
    }

    /// Finish compilation and build the unit
    pub fn finish(self) -> BytecodeUnit {
        let (code, line_info) = self.stream.finish();
        debug!(
            target: "vmcodegen::compiler",
            bytes = code.len(),
            constants = self.pool.len(),
            functions = self.bodies.len(),
            "compiled unit"
        );
        BytecodeUnit::new(code, self.pool, line_info)
    }

    /// Most recent positive line recorded so far
    pub fn last_line(&self) -> Option<u32> {
        self.stream.last_line()
    }

    fn compile_constant(&mut self, index: ConstIndex) -> CompileResult<PoolEntry> {
        let module = self.module;
        let Some(constant) = module.get(index) else {
            panic!("internal compiler error: constant {} is not in the constant table", index);
        };
        Ok(match constant {
            Constant::Nil => PoolEntry::Nil,
            Constant::Bool(b) => PoolEntry::Bool(*b),
            Constant::Int(n) => PoolEntry::Int(*n),
            Constant::Float(x) => PoolEntry::Float(*x),
            Constant::Str(s) => PoolEntry::Str(s.clone()),
            Constant::Code(program) => PoolEntry::Function(self.compile_function(program)?),
        })
    }

    fn compile_function(&mut self, program: &'a Program) -> CompileResult<FunctionDescriptor> {
        let regs = RegisterAllocator::allocate(program)?;
        let body = self.bodies.len();
        let start = self.stream.current_offset();
        self.bodies.push(start..start);

        let mut compiler = InstructionCompiler::new(self, &regs, body);
        for (i, instruction) in program.instructions.iter().enumerate() {
            compiler.compile(program.line(i), instruction)?;
        }

        // A label after the last instruction still needs a target inside the body
        if self.stream.label_at_end() {
            self.stream.emit(Opcode::Nop);
        }

        let end = self.stream.current_offset();
        self.bodies[body] = start..end;
        debug!(
            target: "vmcodegen::compiler",
            function = %program.name,
            start,
            end,
            registers = regs.register_count(),
            cells = regs.cell_count(),
            upvalues = regs.upvalue_count(),
            "compiled function body"
        );

        Ok(FunctionDescriptor {
            name: program.name.clone(),
            range: start..end,
            upvalue_count: regs.upvalue_count(),
            cell_count: regs.cell_count(),
            register_count: regs.register_count(),
            upvalue_names: program.upvalue_names.clone(),
        })
    }
}

/// Compile an IR module with the default configuration
pub fn compile(module: &IrModule) -> CompileResult<BytecodeUnit> {
    compile_with_config(module, CompilerConfig::default())
}

/// Compile an IR module
///
/// Capacity errors are returned with the last source line reached. Malformed
/// IR panics.
pub fn compile_with_config(module: &IrModule, config: CompilerConfig) -> CompileResult<BytecodeUnit> {
    let mut compiler = ConstantCompiler::new(module, config);
    match compiler.run() {
        Ok(()) => Ok(compiler.finish()),
        Err(err) => {
            let line = compiler.last_line();
            debug!(target: "vmcodegen::compiler", error = %err.kind, ?line, "compilation failed");
            Err(err.or_line(line))
        }
    }
}
