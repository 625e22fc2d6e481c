//! Bytecode backend for the register VM
//!
//! This module lowers an [`IrModule`](crate::backend::models::IrModule) into
//! one flat [`BytecodeUnit`]: every function body shares a single
//! instruction stream and a single constant pool.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                         IrModule                                  │
//! │        constants (literals + function bodies), entry index        │
//! └───────────────────────────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                    ConstantCompiler                               │
//! │   request → reserve pool slot → pending queue → drain (BFS)       │
//! │                                                                   │
//! │  ┌──────────────────────┐   ┌──────────────────────────────────┐  │
//! │  │ RegisterAllocator    │   │ InstructionCompiler              │  │
//! │  │ cells, linear scan   │──▶│ opcodes, inline literals, jumps  │  │
//! │  └──────────────────────┘   └──────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │   StreamBuilder: shared stream, line table, label resolution      │
//! └───────────────────────────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//!                           BytecodeUnit
//! ```
//!
//! # Modules
//!
//! - [`opcodes`]: Instruction set and operand widths
//! - [`operators`]: IR operator to opcode mapping
//! - [`chunk`]: Bytecode unit, pool entries and the stream builder
//! - [`config`]: Compiler configuration and encoding limits
//! - [`compiler`]: Register allocation and code generation
//!
//! # Example
//!
//! ```
//! use vmcodegen::backend::bytecode::{compile, Opcode};
//! use vmcodegen::backend::models::{BinaryOp, Instruction, IrModule, Program, VReg};
//!
//! let mut main = Program::new("main");
//! main.push(1, Instruction::Combine { op: BinaryOp::Add, dst: VReg(0), lhs: VReg(1), rhs: VReg(2) });
//! let mut module = IrModule::new();
//! module.set_entry(main);
//!
//! let unit = compile(&module).unwrap();
//! assert_eq!(unit.read_opcode(0), Some(Opcode::Add));
//! println!("{}", unit.disassemble());
//! ```

pub mod chunk;
pub mod compiler;
pub mod config;
pub mod opcodes;
pub mod operators;

pub use chunk::{BytecodeUnit, FunctionDescriptor, PoolEntry, StreamBuilder};
pub use compiler::{
    compile, compile_with_config, CompileError, CompileErrorKind, CompileResult, ConstantCompiler, Operand,
    RegisterAllocator,
};
pub use config::CompilerConfig;
pub use opcodes::Opcode;
