//! Register and cell allocation for one function body.
//!
//! Locals captured by a nested closure live in heap cells so that the closure
//! keeps seeing the same storage after the enclosing frame is gone. Every
//! other local is packed into physical register slots by a linear scan over
//! static live intervals.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::fmt;

use crate::backend::bytecode::config::MAX_OPERAND_INDEX;
use crate::backend::models::{Instruction, Label, Program, VReg};

use super::error::{CompileErrorKind, CompileResult};

const TAG_MASK: u16 = 0b11;
const TAG_REGISTER: u16 = 0b00;
const TAG_CELL: u16 = 0b01;
const TAG_UPVALUE: u16 = 0b10;

/// A register reference as embedded in an instruction operand
///
/// Encoded as a 16-bit value: the low two bits are the tag, the remaining
/// fourteen bits the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    /// Physical register slot of the current frame
    Register(u16),
    /// Cell slot of the current frame
    Cell(u16),
    /// Index into the running closure's upvalue array
    Upvalue(u16),
}

impl Operand {
    /// Pure tag transform of a negative (upvalue) register id
    ///
    /// Returns `None` for locals, which need an allocation decision.
    #[inline]
    pub fn from_upvalue_id(reg: VReg) -> Option<Self> {
        reg.upvalue_index().map(|index| Operand::Upvalue(index as u16))
    }

    /// Encode to the 16-bit operand representation
    #[inline]
    pub fn encode(self) -> u16 {
        let (index, tag) = match self {
            Self::Register(i) => (i, TAG_REGISTER),
            Self::Cell(i) => (i, TAG_CELL),
            Self::Upvalue(i) => (i, TAG_UPVALUE),
        };
        debug_assert!(index as u32 <= MAX_OPERAND_INDEX);
        (index << 2) | tag
    }

    /// Decode a 16-bit operand
    #[inline]
    pub fn decode(raw: u16) -> Option<Self> {
        let index = raw >> 2;
        match raw & TAG_MASK {
            TAG_REGISTER => Some(Self::Register(index)),
            TAG_CELL => Some(Self::Cell(index)),
            TAG_UPVALUE => Some(Self::Upvalue(index)),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register(i) => write!(f, "r{}", i),
            Self::Cell(i) => write!(f, "c{}", i),
            Self::Upvalue(i) => write!(f, "u{}", i),
        }
    }
}

/// Inclusive range of instruction positions a local must stay intact over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LiveInterval {
    start: usize,
    end: usize,
}

impl LiveInterval {
    fn overlaps(self, other: LiveInterval) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Storage assigned to every register of one body
#[derive(Debug, Clone)]
pub struct RegisterAllocator {
    /// Locals (id >= 0) to their storage
    slots: HashMap<VReg, Operand>,
    register_count: u16,
    cell_count: u16,
    upvalue_count: u16,
}

impl RegisterAllocator {
    /// Allocate storage for every register referenced by `program`
    ///
    /// Cells for the upvalue-destination set are assigned first, in
    /// ascending id order, regardless of where the registers appear.
    pub fn allocate(program: &Program) -> CompileResult<Self> {
        let limit = MAX_OPERAND_INDEX + 1;
        let mut slots = HashMap::new();

        let mut cell_count: u32 = 0;
        for &reg in &program.upvalue_dests {
            if reg.is_upvalue() {
                panic!(
                    "internal compiler error: upvalue reference {} declared as captured local in {}",
                    reg, program.name
                );
            }
            if cell_count >= limit {
                return Err(CompileErrorKind::TooManyCells {
                    function: program.name.clone(),
                    limit,
                }
                .into());
            }
            slots.insert(reg, Operand::Cell(cell_count as u16));
            cell_count += 1;
        }

        let mut upvalue_count: u64 = program
            .upvalue_names
            .keys()
            .next_back()
            .map_or(0, |&index| index as u64 + 1);
        for instruction in &program.instructions {
            for reg in instruction.registers() {
                if let Some(index) = reg.upvalue_index() {
                    upvalue_count = upvalue_count.max(index as u64 + 1);
                }
            }
        }
        if upvalue_count > limit as u64 {
            return Err(CompileErrorKind::TooManyUpvalues {
                function: program.name.clone(),
                limit,
            }
            .into());
        }

        let intervals = live_intervals(program, &slots);
        let register_count = linear_scan(&intervals, &mut slots).ok_or_else(|| {
            CompileErrorKind::TooManyRegisters {
                function: program.name.clone(),
                limit,
            }
        })?;

        Ok(Self {
            slots,
            register_count,
            cell_count: cell_count as u16,
            upvalue_count: upvalue_count as u16,
        })
    }

    /// Operand encoding of `reg`
    ///
    /// Panics if `reg` is a local that never appeared in the body.
    pub fn operand(&self, reg: VReg) -> Operand {
        if let Some(operand) = Operand::from_upvalue_id(reg) {
            return operand;
        }
        match self.slots.get(&reg) {
            Some(&operand) => operand,
            None => panic!("internal compiler error: register {} was never declared", reg),
        }
    }

    /// Physical registers used by the body
    #[inline]
    pub fn register_count(&self) -> u16 {
        self.register_count
    }

    /// Cells allocated for captured locals
    #[inline]
    pub fn cell_count(&self) -> u16 {
        self.cell_count
    }

    /// Upvalues the body's closure must provide
    #[inline]
    pub fn upvalue_count(&self) -> u16 {
        self.upvalue_count
    }
}

/// Compute live intervals of every local that still needs a register
///
/// An interval spans the first to the last reference. Intervals overlapping a
/// loop (a backward jump and its target label) are widened to the whole loop,
/// since values may flow around the back edge.
fn live_intervals(program: &Program, cells: &HashMap<VReg, Operand>) -> BTreeMap<VReg, LiveInterval> {
    let mut intervals: BTreeMap<VReg, LiveInterval> = BTreeMap::new();
    let mut labels: HashMap<Label, usize> = HashMap::new();

    for (pos, instruction) in program.instructions.iter().enumerate() {
        if let Instruction::Label(label) = instruction {
            labels.insert(*label, pos);
        }
        for reg in instruction.registers() {
            if reg.is_upvalue() || cells.contains_key(&reg) {
                continue;
            }
            intervals
                .entry(reg)
                .and_modify(|iv| iv.end = pos)
                .or_insert(LiveInterval { start: pos, end: pos });
        }
    }

    let loops: Vec<LiveInterval> = program
        .instructions
        .iter()
        .enumerate()
        .filter_map(|(pos, instruction)| match instruction {
            Instruction::Jump { target } | Instruction::JumpIf { target, .. } => labels
                .get(target)
                .filter(|&&start| start <= pos)
                .map(|&start| LiveInterval { start, end: pos }),
            _ => None,
        })
        .collect();

    if !loops.is_empty() {
        loop {
            let mut changed = false;
            for iv in intervals.values_mut() {
                for &region in &loops {
                    if iv.overlaps(region) && (iv.start > region.start || iv.end < region.end) {
                        iv.start = iv.start.min(region.start);
                        iv.end = iv.end.max(region.end);
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    intervals
}

/// Assign register slots, reusing the lowest free slot first
///
/// Returns the number of slots used, or `None` when it exceeds the operand range.
fn linear_scan(intervals: &BTreeMap<VReg, LiveInterval>, slots: &mut HashMap<VReg, Operand>) -> Option<u16> {
    let mut order: Vec<(VReg, LiveInterval)> = intervals.iter().map(|(&r, &iv)| (r, iv)).collect();
    order.sort_by_key(|&(reg, iv)| (iv.start, reg));

    let mut active: BinaryHeap<Reverse<(usize, u16)>> = BinaryHeap::new();
    let mut free: BinaryHeap<Reverse<u16>> = BinaryHeap::new();
    let mut next: u32 = 0;

    for (reg, iv) in order {
        while let Some(&Reverse((end, slot))) = active.peek() {
            if end >= iv.start {
                break;
            }
            active.pop();
            free.push(Reverse(slot));
        }
        let slot = match free.pop() {
            Some(Reverse(slot)) => slot,
            None => {
                if next > MAX_OPERAND_INDEX {
                    return None;
                }
                next += 1;
                (next - 1) as u16
            }
        };
        slots.insert(reg, Operand::Register(slot));
        active.push(Reverse((iv.end, slot)));
    }

    Some(next as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::bytecode::compiler::error::CompileErrorKind;
    use crate::backend::models::{BinaryOp, Instruction as I};
    use smallvec::smallvec;

    fn add(dst: i32, lhs: i32, rhs: i32) -> I {
        I::Combine { op: BinaryOp::Add, dst: VReg(dst), lhs: VReg(lhs), rhs: VReg(rhs) }
    }

    #[test]
    fn test_operand_roundtrip_all_indices() {
        for index in 0..=MAX_OPERAND_INDEX as u16 {
            for operand in [Operand::Register(index), Operand::Cell(index), Operand::Upvalue(index)] {
                assert_eq!(Operand::decode(operand.encode()), Some(operand));
            }
        }
        assert_eq!(Operand::decode(0b11), None);
    }

    #[test]
    fn test_negative_ids_encode_as_upvalues() {
        for id in -(MAX_OPERAND_INDEX as i32 + 1)..0 {
            let operand = Operand::from_upvalue_id(VReg(id)).unwrap();
            assert_eq!(Operand::decode(operand.encode()), Some(Operand::Upvalue((-1 - id) as u16)));
        }
        assert_eq!(Operand::from_upvalue_id(VReg(0)), None);
    }

    #[test]
    fn test_captured_register_gets_cell_regardless_of_position() {
        let mut program = Program::new("f");
        program.push(1, add(0, 1, 2)).push(2, add(3, 0, 0)).capture(VReg(3)).capture(VReg(1));

        let regs = RegisterAllocator::allocate(&program).unwrap();
        assert_eq!(regs.operand(VReg(1)), Operand::Cell(0));
        assert_eq!(regs.operand(VReg(3)), Operand::Cell(1));
        assert!(matches!(regs.operand(VReg(0)), Operand::Register(_)));
        assert!(matches!(regs.operand(VReg(2)), Operand::Register(_)));
        assert_eq!(regs.cell_count(), 2);
    }

    #[test]
    fn test_unreferenced_capture_still_gets_cell() {
        let mut program = Program::new("f");
        program.capture(VReg(5));
        let regs = RegisterAllocator::allocate(&program).unwrap();
        assert_eq!(regs.operand(VReg(5)), Operand::Cell(0));
        assert_eq!(regs.register_count(), 0);
    }

    #[test]
    fn test_disjoint_ranges_share_slot() {
        let mut program = Program::new("f");
        program
            .push(1, I::NewTable { dst: VReg(0) })
            .push(1, I::Push { src: VReg(0), spread: false })
            .push(2, I::NewTable { dst: VReg(1) })
            .push(2, I::Push { src: VReg(1), spread: false });

        let regs = RegisterAllocator::allocate(&program).unwrap();
        assert_eq!(regs.operand(VReg(0)), Operand::Register(0));
        assert_eq!(regs.operand(VReg(1)), Operand::Register(0));
        assert_eq!(regs.register_count(), 1);
    }

    #[test]
    fn test_overlapping_ranges_do_not_share() {
        let mut program = Program::new("f");
        program
            .push(1, I::NewTable { dst: VReg(0) })
            .push(1, I::NewTable { dst: VReg(1) })
            .push(2, add(2, 0, 1));

        let regs = RegisterAllocator::allocate(&program).unwrap();
        assert_eq!(regs.operand(VReg(0)), Operand::Register(0));
        assert_eq!(regs.operand(VReg(1)), Operand::Register(1));
        assert_eq!(regs.operand(VReg(2)), Operand::Register(2));
        assert_eq!(regs.register_count(), 3);
    }

    #[test]
    fn test_loop_keeps_outer_value_alive() {
        // v0 is last referenced inside the loop, v1 is created later in the
        // loop body; without widening they would share a slot.
        let mut program = Program::new("loop");
        program
            .push(1, I::NewTable { dst: VReg(0) })
            .push(2, I::Label(Label(0)))
            .push(3, I::Push { src: VReg(0), spread: false })
            .push(4, I::NewTable { dst: VReg(1) })
            .push(5, I::Push { src: VReg(1), spread: false })
            .push(6, I::Jump { target: Label(0) });

        let regs = RegisterAllocator::allocate(&program).unwrap();
        assert_ne!(regs.operand(VReg(0)), regs.operand(VReg(1)));
        assert_eq!(regs.register_count(), 2);
    }

    #[test]
    fn test_upvalue_count_from_names_and_references() {
        let mut program = Program::new("f");
        program.push(1, add(0, -3, -1)).name_upvalue(0, "a");
        let regs = RegisterAllocator::allocate(&program).unwrap();
        assert_eq!(regs.upvalue_count(), 3);
        assert_eq!(regs.operand(VReg(-3)), Operand::Upvalue(2));

        let mut named = Program::new("g");
        named.name_upvalue(4, "e");
        assert_eq!(RegisterAllocator::allocate(&named).unwrap().upvalue_count(), 5);
    }

    #[test]
    fn test_too_many_registers() {
        let mut program = Program::new("wide");
        let dsts = (0..=MAX_OPERAND_INDEX as i32 + 1).map(VReg).collect();
        program.push(7, I::Receive { dsts });
        let err = RegisterAllocator::allocate(&program).unwrap_err();
        assert_eq!(
            err.kind,
            CompileErrorKind::TooManyRegisters { function: "wide".to_string(), limit: MAX_OPERAND_INDEX + 1 }
        );
    }

    #[test]
    fn test_register_limit_is_inclusive() {
        let mut program = Program::new("exact");
        let dsts = (0..=MAX_OPERAND_INDEX as i32).map(VReg).collect();
        program.push(1, I::Receive { dsts });
        let regs = RegisterAllocator::allocate(&program).unwrap();
        assert_eq!(regs.register_count() as u32, MAX_OPERAND_INDEX + 1);
    }

    #[test]
    fn test_too_many_upvalues() {
        let mut program = Program::new("deep");
        program.name_upvalue(MAX_OPERAND_INDEX + 1, "overflow");
        let err = RegisterAllocator::allocate(&program).unwrap_err();
        assert!(matches!(err.kind, CompileErrorKind::TooManyUpvalues { .. }));
    }

    #[test]
    #[should_panic(expected = "never declared")]
    fn test_undeclared_register_is_fatal() {
        let program = Program::new("empty");
        let regs = RegisterAllocator::allocate(&program).unwrap();
        regs.operand(VReg(0));
    }

    #[test]
    #[should_panic(expected = "declared as captured local")]
    fn test_captured_upvalue_id_is_fatal() {
        let mut program = Program::new("bad");
        program.capture(VReg(-1));
        let _ = RegisterAllocator::allocate(&program);
    }

    #[test]
    fn test_allocation_is_deterministic() {
        let mut program = Program::new("f");
        program
            .push(1, I::MakeClosure { dst: VReg(4), function: 1, captures: smallvec![VReg(2), VReg(-1)] })
            .push(2, add(1, 4, 2))
            .push(3, add(0, 1, 1))
            .capture(VReg(2));
        let a = RegisterAllocator::allocate(&program).unwrap();
        let b = RegisterAllocator::allocate(&program).unwrap();
        for id in [0, 1, 2, 4, -1] {
            assert_eq!(a.operand(VReg(id)), b.operand(VReg(id)));
        }
    }
}
