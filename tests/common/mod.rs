//! Shared IR fixtures for integration tests
//!
//! Each builder returns a complete `IrModule` exercising one area of the
//! backend: loops, closures capturing locals, variadic receives, and large
//! constant tables.

use smallvec::smallvec;
use vmcodegen::backend::bytecode::{BytecodeUnit, Opcode};
use vmcodegen::backend::models::{BinaryOp, Constant, Instruction as I, IrModule, Label, Program, VReg};

/// Install a test-writer subscriber once; later calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A counting loop followed by a tail call into a closure over the counter
pub fn counter_module() -> IrModule {
    let mut module = IrModule::new();
    let zero = module.add_constant(Constant::Int(0));
    let ten = module.add_constant(Constant::Int(10));
    let one = module.add_constant(Constant::Int(1));
    let label = module.add_constant(Constant::Str("a fairly long label string".to_string()));

    let mut counter = Program::new("counter");
    counter
        .push(10, I::ReceiveEtc { dsts: smallvec![VReg(0)], etc: VReg(1) })
        .push(11, I::EtcLookup { dst: VReg(2), etc: VReg(1), index: 0 })
        .push(12, I::Combine { op: BinaryOp::Add, dst: VReg(3), lhs: VReg::upvalue(0), rhs: VReg(2) })
        .push(12, I::NewTable { dst: VReg(4) })
        .push(12, I::FillTable { table: VReg(4), etc: VReg(1), start: 1 })
        .push(13, I::Push { src: VReg(3), spread: false })
        .push(13, I::Push { src: VReg(4), spread: true })
        .push(13, I::MakeContinuation { dst: VReg(5) })
        .push(13, I::Call { callee: VReg(5) })
        .name_upvalue(0, "count");
    let counter = module.add_function(counter);

    let mut main = Program::new("main");
    main.push(1, I::LoadConst { dst: VReg(0), constant: zero })
        .push(1, I::LoadConst { dst: VReg(1), constant: ten })
        .push(2, I::Label(Label(0)))
        .push(3, I::Combine { op: BinaryOp::Lt, dst: VReg(2), lhs: VReg(0), rhs: VReg(1) })
        .push(3, I::JumpIf { cond: VReg(2), target: Label(1), negate: true })
        .push(4, I::LoadConst { dst: VReg(3), constant: one })
        .push(4, I::Combine { op: BinaryOp::Add, dst: VReg(0), lhs: VReg(0), rhs: VReg(3) })
        .push(5, I::Jump { target: Label(0) })
        .push(6, I::Label(Label(1)))
        .push(7, I::MakeClosure { dst: VReg(4), function: counter, captures: smallvec![VReg(0)] })
        .push(8, I::LoadConst { dst: VReg(5), constant: label })
        .push(8, I::Push { src: VReg(5), spread: false })
        .push(8, I::TailCall { callee: VReg(4) })
        .capture(VReg(0));
    module.set_entry(main);
    module
}

/// A chain of `depth` closures, each capturing a table of its parent
///
/// Bodies are named `level0` (the entry) through `level{depth}`.
pub fn nested_closures(depth: usize) -> IrModule {
    let mut module = IrModule::new();

    let mut innermost = Program::new(format!("level{}", depth));
    innermost
        .push(depth as u32 + 1, I::Push { src: VReg::upvalue(0), spread: false })
        .name_upvalue(0, "table");
    let mut child = module.add_function(innermost);

    for level in (0..depth).rev() {
        let line = level as u32 + 1;
        let mut body = Program::new(format!("level{}", level));
        body.push(line, I::NewTable { dst: VReg(0) });
        if level > 0 {
            body.push(line, I::SetIndex { table: VReg(0), key: VReg(0), value: VReg::upvalue(0) })
                .name_upvalue(0, "table");
        }
        body.push(line, I::MakeClosure { dst: VReg(1), function: child, captures: smallvec![VReg(0)] })
            .push(line, I::Call { callee: VReg(1) })
            .capture(VReg(0));
        if level == 0 {
            module.set_entry(body);
        } else {
            child = module.add_function(body);
        }
    }
    module
}

/// A single body loading `count` constants drawn from `distinct` values
///
/// Even values are integers too wide to inline, odd values short strings.
pub fn literal_heavy(count: usize, distinct: usize) -> IrModule {
    let mut module = IrModule::new();
    let constants: Vec<_> = (0..distinct)
        .map(|i| {
            let constant = if i % 2 == 0 {
                Constant::Int((i as i64 + 1) << 33)
            } else {
                Constant::Str(format!("s{}", i))
            };
            module.add_constant(constant)
        })
        .collect();

    let mut main = Program::new("main");
    for i in 0..count {
        let dst = VReg(i as i32);
        main.push(i as u32 + 1, I::LoadConst { dst, constant: constants[i % distinct] })
            .push(i as u32 + 1, I::Push { src: dst, spread: false });
    }
    module.set_entry(main);
    module
}

/// Check that every jump of every body lands inside that body
pub fn assert_jumps_contained(unit: &BytecodeUnit) {
    for desc in unit.functions() {
        for offset in unit.instruction_offsets(desc.range.clone()) {
            let Some(opcode) = unit.read_opcode(offset) else {
                panic!("invalid opcode at {:#x} in {}", offset, desc.name);
            };
            if opcode.is_jump() {
                let target = unit.jump_target(offset).expect("jump target should decode");
                assert!(
                    desc.range.contains(&target),
                    "{} at {:#x} jumps to {:#x}, outside {:?}",
                    opcode,
                    offset,
                    target,
                    desc.range
                );
            }
        }
    }
}

/// Count occurrences of `opcode` inside the body at function index `function`
pub fn count_opcode(unit: &BytecodeUnit, function: usize, opcode: Opcode) -> usize {
    let desc = unit.functions().nth(function).expect("function should exist");
    unit.instruction_offsets(desc.range.clone())
        .into_iter()
        .filter(|&offset| unit.read_opcode(offset) == Some(opcode))
        .count()
}
