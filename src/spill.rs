// This module lowers float register pressure under the hardware budget. The
// target has 31 allocatable float registers (f31 is the parallel-copy
// scratch); any instruction whose live-in set holds more floats than that
// cannot be allocated, so one of them has to live in memory instead. Each
// run() picks the first over-budget program point, spills the lowest-
// numbered not-yet-spilled float live there, and rewrites the function: a
// store after the definition (or at the top of the entry block for a
// constant), and a fresh single-use reload register in front of every use.
// A reload feeding a phi operand is placed in front of the terminator of
// the edge's predecessor block, since that is where the parallel copy will
// read it. The caller reruns liveness and calls run() again until it
// returns false; the spilled set only grows and reload temporaries are
// never re-spilled, so the loop terminates.

//! Spill-and-retry float pressure reduction.

use std::collections::BTreeSet;

use crate::cfg::relink;
use crate::error::{CompileError, CompileResult};
use crate::ir::{
    BlockId, Function, InstId, Instruction, NameAllocator, Op, RegClass, RegId, TypeTable,
    NO_BLOCK,
};
use crate::regalloc::FLOAT_BUDGET;

/// Spill state carried across liveness/spill iterations.
#[derive(Debug, Default)]
pub struct Spiller {
    /// Registers already rewritten to memory; never picked again.
    spilled: BTreeSet<RegId>,
    /// Reload and store temporaries minted here. Their live ranges span a
    /// single instruction, so spilling one can never reduce pressure.
    pinned: BTreeSet<RegId>,
}

impl Spiller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spilled(&self) -> &BTreeSet<RegId> {
        &self.spilled
    }

    /// Spill one register if any program point is over the float budget.
    ///
    /// Returns true if the function was rewritten; the caller must then
    /// recompute liveness before allocating or calling this again. Requires
    /// liveness to be current on entry.
    pub fn run(
        &mut self,
        func: &mut Function,
        types: &mut TypeTable,
        names: &mut NameAllocator,
    ) -> CompileResult<bool> {
        let Some((inst, victim)) = self.find_victim(func, types)? else {
            return Ok(false);
        };
        log::debug!(
            "float pressure over {FLOAT_BUDGET} at instruction {inst}; spilling register {victim}"
        );
        self.spill(func, types, names, victim);
        Ok(true)
    }

    /// The register to evict at the instruction with the highest float
    /// pressure, if any instruction is over budget.
    fn find_victim(
        &self,
        func: &Function,
        types: &TypeTable,
    ) -> CompileResult<Option<(InstId, RegId)>> {
        let mut peak: Option<(InstId, Vec<RegId>)> = None;
        for (id, inst) in func.insts.iter().enumerate() {
            if inst.block == NO_BLOCK {
                continue;
            }
            let floats: Vec<RegId> = inst
                .livein_any
                .iter()
                .copied()
                .filter(|&r| types.is_float(r))
                .collect();
            if floats.len() > peak.as_ref().map_or(0, |(_, f)| f.len()) {
                peak = Some((id, floats));
            }
        }
        let Some((id, floats)) = peak else {
            return Ok(None);
        };
        if floats.len() <= FLOAT_BUDGET {
            return Ok(None);
        }
        // Lowest-numbered register not already handled. Low ids come from
        // the front end and tend to have the long, loop-spanning ranges
        // worth evicting.
        match floats
            .iter()
            .copied()
            .find(|r| !self.spilled.contains(r) && !self.pinned.contains(r))
        {
            Some(victim) => Ok(Some((id, victim))),
            None => Err(CompileError::NoSpillCandidate { inst: id }),
        }
    }

    /// Rewrite every definition and use of `victim` through a fresh memory
    /// slot.
    fn spill(
        &mut self,
        func: &mut Function,
        types: &mut TypeTable,
        names: &mut NameAllocator,
        victim: RegId,
    ) {
        let slot = names.fresh();
        types.define_memory_var(slot);
        func.spill_slots.push(slot);
        self.spilled.insert(victim);

        // Store after the definition. A constant has no defining
        // instruction; its store goes at the top of the entry block, where
        // the allocator materializes constants.
        match find_def(func, victim) {
            Some(def) => {
                let block = func.inst(def).block;
                insert_after(func, block, def, Op::Store { ptr: slot, value: victim });
            }
            None => {
                let entry = func.entry;
                let head = func.block(entry).first_inst();
                insert_before(func, entry, head, Op::Store { ptr: slot, value: victim });
            }
        }

        // Reload in front of every use, one fresh register per use so the
        // reloads stay single-instruction ranges.
        let use_sites: Vec<InstId> = (0..func.insts.len())
            .filter(|&id| {
                func.insts[id].block != NO_BLOCK
                    && !matches!(func.insts[id].op, Op::Store { ptr, value }
                        if ptr == slot && value == victim)
                    && func.insts[id].op.args().contains(&victim)
            })
            .collect();
        for site in use_sites {
            match func.inst(site).op.clone() {
                Op::Phi(mut phi) => {
                    // Each incoming edge that carries the victim gets its
                    // own reload in the predecessor, in front of the
                    // terminator that hands control to the phi.
                    for row in &mut phi.operands {
                        for (col, operand) in row.iter_mut().enumerate() {
                            if *operand != victim {
                                continue;
                            }
                            let tmp = names.fresh();
                            types.define(tmp, RegClass::Float);
                            self.pinned.insert(tmp);
                            let pred = phi.labels[col];
                            let term = func.block(pred).terminator();
                            insert_before(func, pred, term, Op::Load { result: tmp, ptr: slot });
                            *operand = tmp;
                        }
                    }
                    func.inst_mut(site).op = Op::Phi(phi);
                }
                _ => {
                    let tmp = names.fresh();
                    types.define(tmp, RegClass::Float);
                    self.pinned.insert(tmp);
                    let block = func.inst(site).block;
                    insert_before(func, block, site, Op::Load { result: tmp, ptr: slot });
                    func.inst_mut(site).op.rewrite_arg(victim, tmp);
                }
            }
        }

        relink(func);
    }
}

fn find_def(func: &Function, reg: RegId) -> Option<InstId> {
    (0..func.insts.len()).find(|&id| {
        func.insts[id].block != NO_BLOCK && func.insts[id].op.results().contains(&reg)
    })
}

fn insert_before(func: &mut Function, label: BlockId, anchor: InstId, op: Op) -> InstId {
    splice(func, label, anchor, op, 0)
}

fn insert_after(func: &mut Function, label: BlockId, anchor: InstId, op: Op) -> InstId {
    splice(func, label, anchor, op, 1)
}

fn splice(func: &mut Function, label: BlockId, anchor: InstId, op: Op, offset: usize) -> InstId {
    let mut inst = Instruction::new(op);
    inst.block = label;
    let id = func.push_inst(inst);
    let block = func.blocks.get_mut(&label).expect("unknown block label");
    let at = block
        .insts
        .iter()
        .position(|&i| i == anchor)
        .expect("anchor not in block");
    block.insts.insert(at + offset, id);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{block_phi, FunctionBuilder};
    use crate::ir::{BinaryKind, Phi};
    use crate::liveness;

    fn fadd(result: u32, lhs: u32, rhs: u32) -> Op {
        Op::Binary {
            kind: BinaryKind::FAdd,
            result,
            lhs,
            rhs,
        }
    }

    /// `n` float defs all live down to a final reduction chain.
    fn wide_function(n: u32) -> (Function, TypeTable) {
        let mut b = FunctionBuilder::new(1, "wide");
        let mut types = TypeTable::new();
        types.define_constant(1, RegClass::Float);
        b.label(10);
        for i in 0..n {
            b.inst(fadd(100 + i, 1, 1));
            types.define(100 + i, RegClass::Float);
        }
        let mut acc = 100;
        for i in 1..n {
            b.inst(fadd(200 + i, acc, 100 + i));
            types.define(200 + i, RegClass::Float);
            acc = 200 + i;
        }
        b.inst(Op::ReturnValue { value: acc });
        (b.build().unwrap(), types)
    }

    #[test]
    fn under_budget_function_is_untouched() {
        let (mut func, mut types) = wide_function(4);
        liveness::compute(&mut func, &types);
        let before = func.insts.len();

        let mut names = NameAllocator::new(1000);
        let mut spiller = Spiller::new();
        assert!(!spiller.run(&mut func, &mut types, &mut names).unwrap());
        assert_eq!(func.insts.len(), before);
        assert!(func.spill_slots.is_empty());
    }

    #[test]
    fn over_budget_function_reaches_fixpoint_under_budget() {
        let (mut func, mut types) = wide_function(34);
        let mut names = NameAllocator::new(1000);
        let mut spiller = Spiller::new();

        loop {
            liveness::compute(&mut func, &types);
            if !spiller.run(&mut func, &mut types, &mut names).unwrap() {
                break;
            }
        }

        assert!(!func.spill_slots.is_empty());
        for inst in &func.insts {
            if inst.block == NO_BLOCK {
                continue;
            }
            let floats = inst.livein_any.iter().filter(|&&r| types.is_float(r)).count();
            assert!(floats <= FLOAT_BUDGET, "pressure {floats} over budget");
        }
    }

    #[test]
    fn spill_rewrites_def_and_uses_through_one_slot() {
        // 100 is defined once and used twice; force-spill it.
        let mut b = FunctionBuilder::new(1, "f");
        b.label(10);
        b.inst(fadd(100, 1, 1));
        b.inst(fadd(101, 100, 100));
        b.inst(fadd(102, 101, 100));
        b.inst(Op::ReturnValue { value: 102 });
        let mut func = b.build().unwrap();
        let mut types = TypeTable::new();
        types.define_constant(1, RegClass::Float);
        for r in [100, 101, 102] {
            types.define(r, RegClass::Float);
        }
        liveness::compute(&mut func, &types);

        let mut names = NameAllocator::new(1000);
        let mut spiller = Spiller::new();
        spiller.spill(&mut func, &mut types, &mut names, 100);
        liveness::compute(&mut func, &types);

        assert_eq!(func.spill_slots.len(), 1);
        let slot = func.spill_slots[0];
        assert!(types.is_memory_var(slot));

        // def, store, load, use, load, use, return
        let insts = &func.block(10).insts;
        assert!(matches!(
            func.inst(insts[1]).op,
            Op::Store { ptr, value } if ptr == slot && value == 100
        ));
        assert!(matches!(func.inst(insts[2]).op, Op::Load { ptr, .. } if ptr == slot));
        assert!(matches!(func.inst(insts[4]).op, Op::Load { ptr, .. } if ptr == slot));
        // The spill store is the victim's only remaining reader.
        for &id in insts.iter() {
            let reads_victim = func.inst(id).op.args().contains(&100);
            assert_eq!(
                reads_victim,
                matches!(func.inst(id).op, Op::Store { .. }),
                "unexpected read of the spilled register"
            );
        }
        // Its live range now ends at the store.
        assert!(!func.inst(insts[2]).livein_any.contains(&100));
    }

    #[test]
    fn phi_operand_reload_lands_before_predecessor_terminator() {
        // 10: 100 = 1 + 1; br 20 / 20: 200 = phi [10: 100]; return 200
        let mut b = FunctionBuilder::new(1, "f");
        b.label(10);
        b.inst(fadd(100, 1, 1));
        b.inst(Op::Branch { target: 20 });
        b.label(20);
        b.inst(Op::Phi(Phi {
            results: vec![200],
            labels: vec![10],
            operands: vec![vec![100]],
        }));
        b.inst(Op::ReturnValue { value: 200 });
        let mut func = b.build().unwrap();
        let mut types = TypeTable::new();
        types.define_constant(1, RegClass::Float);
        types.define(100, RegClass::Float);
        types.define(200, RegClass::Float);
        liveness::compute(&mut func, &types);

        let mut names = NameAllocator::new(1000);
        let mut spiller = Spiller::new();
        spiller.spill(&mut func, &mut types, &mut names, 100);

        // Block 10 is now def, store, load, branch.
        let insts = &func.block(10).insts;
        assert_eq!(insts.len(), 4);
        let reload = match func.inst(insts[2]).op {
            Op::Load { result, .. } => result,
            ref op => panic!("expected reload before terminator, found {}", op.name()),
        };
        assert!(matches!(func.inst(insts[3]).op, Op::Branch { .. }));

        // The phi column was rewritten to the reload register.
        let (_, phi) = block_phi(&func, 20).unwrap();
        assert_eq!(phi.operands, vec![vec![reload]]);
    }

    #[test]
    fn spilled_constant_is_stored_at_entry() {
        let mut b = FunctionBuilder::new(1, "f");
        b.label(10);
        b.inst(fadd(100, 1, 1));
        b.inst(fadd(101, 100, 1));
        b.inst(Op::ReturnValue { value: 101 });
        let mut func = b.build().unwrap();
        let mut types = TypeTable::new();
        types.define_constant(1, RegClass::Float);
        types.define(100, RegClass::Float);
        types.define(101, RegClass::Float);
        liveness::compute(&mut func, &types);

        let mut names = NameAllocator::new(1000);
        let mut spiller = Spiller::new();
        spiller.spill(&mut func, &mut types, &mut names, 1);

        let insts = &func.block(10).insts;
        assert!(matches!(
            func.inst(insts[0]).op,
            Op::Store { value: 1, .. }
        ));
        // Both reads of the constant reload separately.
        let loads = insts
            .iter()
            .filter(|&&id| matches!(func.inst(id).op, Op::Load { .. }))
            .count();
        assert_eq!(loads, 2);
    }
}
