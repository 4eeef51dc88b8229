// This module performs physical register assignment. The machine model is
// RISC-V-like: 32 integer registers of which x0 (zero), x1 (link), and x2
// (stack pointer) are reserved, and 32 float registers of which f31 is
// permanently reserved as the scratch for float exchanges during phi
// resolution. Occupancy is tracked with per-bank u64 bit masks; allocation
// always picks the lowest-numbered free register of the needed class. The
// walk order is the dominance tree, pre-order: any register live into a
// block was defined in a dominator, so it already has its assignment by the
// time the block is visited. Within a block, an instruction first frees the
// registers of arguments that are not in its liveout, then assigns a
// register to each result, keeping it occupied only if the result is in the
// instruction's own liveout. Exhaustion is fatal here; the float class is
// kept under budget by the spiller, and the integer class is assumed to
// never overflow for the supported program shapes.

//! Greedy dominance-ordered register allocation.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{CompileError, CompileResult};
use crate::ir::{BlockId, Function, RegClass, RegId, TypeTable};

/// Register bank index.
pub type RegBank = u8;

pub const BANK_INT: RegBank = 0;
pub const BANK_FLOAT: RegBank = 1;

/// Allocatable integer registers: x3..x31 (x0 is hardwired zero, x1 holds
/// the return address, x2 is the stack pointer).
pub const INT_POOL: u64 = 0xFFFF_FFF8;

/// Allocatable float registers: f0..f30. f31 is the parallel-copy scratch
/// and must never be handed out.
pub const FLOAT_POOL: u64 = 0x7FFF_FFFF;

/// Scratch float register used to lower float exchanges into moves.
pub const FLOAT_SCRATCH: PhysReg = PhysReg::new(BANK_FLOAT, 31);

/// Number of float registers the allocator may actually use; the spiller
/// keeps simultaneous float liveness at or below this.
pub const FLOAT_BUDGET: usize = FLOAT_POOL.count_ones() as usize;

/// One physical register of the target machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysReg {
    pub bank: RegBank,
    pub id: u8,
}

impl PhysReg {
    pub const fn new(bank: RegBank, id: u8) -> Self {
        Self { bank, id }
    }

    pub fn is_float(&self) -> bool {
        self.bank == BANK_FLOAT
    }
}

impl fmt::Display for PhysReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = if self.is_float() { 'f' } else { 'x' };
        write!(f, "{prefix}{}", self.id)
    }
}

/// Bit set over both register banks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegMask {
    banks: [u64; 2],
}

impl RegMask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, reg: PhysReg) -> bool {
        (self.banks[reg.bank as usize] & (1u64 << reg.id)) != 0
    }

    pub fn set(&mut self, reg: PhysReg) {
        self.banks[reg.bank as usize] |= 1u64 << reg.id;
    }

    pub fn clear(&mut self, reg: PhysReg) {
        self.banks[reg.bank as usize] &= !(1u64 << reg.id);
    }

    /// Lowest-numbered register of `bank` that is inside `pool` and not in
    /// this mask.
    pub fn lowest_free(&self, bank: RegBank, pool: u64) -> Option<PhysReg> {
        let free = pool & !self.banks[bank as usize];
        if free == 0 {
            None
        } else {
            Some(PhysReg::new(bank, free.trailing_zeros() as u8))
        }
    }

    pub fn count(&self, bank: RegBank) -> u32 {
        self.banks[bank as usize].count_ones()
    }
}

fn bank_of(class: RegClass) -> RegBank {
    match class {
        RegClass::Int => BANK_INT,
        RegClass::Float => BANK_FLOAT,
    }
}

fn pool_of(class: RegClass) -> u64 {
    match class {
        RegClass::Int => INT_POOL,
        RegClass::Float => FLOAT_POOL,
    }
}

/// Allocation record for one virtual register.
#[derive(Debug, Clone)]
pub struct CompilerReg {
    pub class: RegClass,
    /// Element count. Vectors are scalarized before this stage, so this is
    /// one except for legacy multi-element records.
    pub count: usize,
    /// Physical registers, one per element; empty until the defining
    /// instruction (or the constant prologue) is visited.
    pub phys: Vec<PhysReg>,
}

/// The allocator's output: a physical register for every virtual register.
#[derive(Debug, Clone, Default)]
pub struct Allocation {
    pub registers: BTreeMap<RegId, CompilerReg>,
}

impl Allocation {
    /// Physical register of a scalar virtual register.
    pub fn phys_of(&self, reg: RegId) -> CompileResult<PhysReg> {
        self.registers
            .get(&reg)
            .and_then(|r| r.phys.first().copied())
            .ok_or(CompileError::Unassigned { reg })
    }

    /// Whether two virtual registers landed in the same physical register.
    pub fn same_phys(&self, a: RegId, b: RegId) -> bool {
        match (self.phys_of(a), self.phys_of(b)) {
            (Ok(pa), Ok(pb)) => pa == pb,
            _ => false,
        }
    }
}

/// Assign physical registers for every virtual register of `func`.
///
/// Requires stable liveness (the spiller has run to fixpoint) and a computed
/// dominance tree.
pub fn allocate(func: &Function, types: &TypeTable) -> CompileResult<Allocation> {
    let mut alloc = Allocation::default();

    // Set up a record per defined virtual register.
    for block in func.blocks.values() {
        for &id in &block.insts {
            for res in func.inst(id).op.results() {
                alloc.registers.insert(
                    res,
                    CompilerReg {
                        class: types.class_of(res)?,
                        count: 1,
                        phys: Vec::new(),
                    },
                );
            }
        }
    }

    // Everything live into the entry block is a compile-time constant;
    // give each one a distinct register before touching ordinary code.
    let entry_head = func.block(func.entry).first_inst();
    let mut const_taken = RegMask::new();
    for reg in func.inst(entry_head).livein_all() {
        if alloc.registers.contains_key(&reg) || !types.is_constant(reg) {
            return Err(CompileError::ConstantExpected { reg });
        }
        let class = types.class_of(reg)?;
        let phy = const_taken
            .lowest_free(bank_of(class), pool_of(class))
            .ok_or(CompileError::RegisterExhausted {
                class,
                reg,
                inst: entry_head,
            })?;
        const_taken.set(phy);
        log::trace!("constant {reg} -> {phy}");
        alloc.registers.insert(
            reg,
            CompilerReg {
                class,
                count: 1,
                phys: vec![phy],
            },
        );
    }

    assign_block(func, func.entry, &mut alloc)?;
    Ok(alloc)
}

fn assign_block(func: &Function, label: BlockId, alloc: &mut Allocation) -> CompileResult<()> {
    let block = func.block(label);

    // Registers live into this block were assigned in a dominator; they
    // seed the occupied set. The generic livein is used here, not the
    // per-edge union: phi operands are consumed on the incoming edge by the
    // parallel copy, not inside this block.
    let mut assigned = RegMask::new();
    for reg in &func.inst(block.first_inst()).livein_any {
        match alloc.registers.get(reg) {
            Some(record) if !record.phys.is_empty() => {
                for &phy in &record.phys {
                    assigned.set(phy);
                }
            }
            _ => {
                log::warn!("register {reg} live into block {label} has no assignment yet");
            }
        }
    }
    log::trace!(
        "assigning registers in block {label}: {} int / {} float occupied on entry",
        assigned.count(BANK_INT),
        assigned.count(BANK_FLOAT)
    );

    for &id in &block.insts {
        let inst = func.inst(id);

        // Arguments that do not survive this instruction release their
        // physical registers first, so a result may reuse one.
        for arg in inst.op.args() {
            if !inst.liveout.contains(&arg) {
                if let Some(record) = alloc.registers.get(&arg) {
                    for &phy in &record.phys {
                        assigned.clear(phy);
                    }
                }
            }
        }

        for res in inst.op.results() {
            let record = alloc
                .registers
                .get_mut(&res)
                .ok_or(CompileError::Unassigned { reg: res })?;
            let live_past = inst.liveout.contains(&res);
            for _ in 0..record.count {
                let phy = assigned
                    .lowest_free(bank_of(record.class), pool_of(record.class))
                    .ok_or(CompileError::RegisterExhausted {
                        class: record.class,
                        reg: res,
                        inst: id,
                    })?;
                record.phys.push(phy);
                // A result absent from its own liveout is dead on arrival
                // and its register stays free.
                if live_past {
                    assigned.set(phy);
                }
                log::trace!("  {} {res} -> {phy}", inst.op.name());
            }
        }
    }

    for &child in &block.children {
        assign_block(func, child, alloc)?;
    }
    Ok(())
}
