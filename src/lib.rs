/// vmcodegen - register VM bytecode generator
///
/// This library is the final stage of a scripting-language toolchain. It takes
/// an IR of a chunk and its nested function bodies (virtual registers,
/// symbolic constants, jump labels) and produces one flat bytecode unit for a
/// register-based VM.
///
/// # Architecture
///
/// 1. **IR** (`backend::models`)
///    - `Program`: one function body with per-instruction source lines
///    - `IrModule`: the constant table shared by every body, plus the entry
///
/// 2. **Bytecode backend** (`backend::bytecode`)
///    - Allocates physical registers, and heap cells for captured locals
///    - Compiles the constant pool, nested function bodies included
///    - Resolves jump labels to relative offsets
///    - Inlines small integer and short string loads
///
/// # Example
///
/// ```rust
/// use vmcodegen::backend::*;
///
/// let mut module = IrModule::new();
/// let greeting = module.add_constant(Constant::Str("hello".to_string()));
/// let mut main = Program::new("main");
/// main.push(1, Instruction::LoadConst { dst: VReg(0), constant: greeting })
///     .push(2, Instruction::Call { callee: VReg(0) });
/// module.set_entry(main);
///
/// let unit = compile(&module).unwrap();
/// assert_eq!(unit.functions().count(), 1);
/// print!("{}", unit.disassemble());
/// ```
///
/// # Output Layout
///
/// The entry body is always pool slot 0 and starts at stream offset 0. Nested
/// bodies follow in breadth-first order of first reference. The same input
/// always produces the same bytes.
pub mod backend;

pub use backend::bytecode::{compile, compile_with_config, BytecodeUnit, CompileError, CompilerConfig};
pub use backend::models::{Constant, Instruction, IrModule, Program, VReg};
