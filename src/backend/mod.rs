// Backend of the toolchain
//
// - `models`: the IR handed over by the front end
// - `bytecode`: lowering of that IR into a register-VM bytecode unit

pub mod bytecode;
pub mod models;

pub use bytecode::{compile, compile_with_config, BytecodeUnit, CompileError, CompileErrorKind, CompilerConfig};
pub use models::*;
