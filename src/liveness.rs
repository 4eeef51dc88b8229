// This module computes per-instruction liveness as a backward dataflow
// fixpoint. The worklist holds individual instructions, not blocks, because
// phi semantics are per predecessor edge: a phi's operands are recorded
// under the label they flow in from, so a predecessor's liveout picks up
// only its own column of the phi instead of every operand. An instruction's
// liveout is the union over successors of their generic livein plus their
// per-edge livein keyed by this instruction's block; its generic livein is
// the liveout minus its results plus (for non-phis) its register-resident
// arguments. Whenever a set changes, the instruction's predecessors are
// requeued. Sets are cleared up front so a rerun after spilling cannot
// inherit stale facts.

//! Backward liveness fixpoint over instructions.

use std::collections::{BTreeMap, BTreeSet};

use crate::ir::{Function, InstId, Op, RegId, TypeTable, NO_BLOCK};

/// Recompute `livein_any`, `livein_from`, and `liveout` for every
/// instruction of `func`. Memory-resident ids never appear in any set.
pub fn compute(func: &mut Function, types: &TypeTable) {
    for inst in &mut func.insts {
        inst.livein_any.clear();
        inst.livein_from.clear();
        inst.liveout.clear();
    }

    // Seed with every placed instruction; popping from the stack end means
    // we start near the end of the function, where liveness originates.
    let mut worklist: Vec<InstId> = (0..func.insts.len())
        .filter(|&id| func.insts[id].block != NO_BLOCK)
        .collect();
    let mut queued = vec![false; func.insts.len()];
    for &id in &worklist {
        queued[id] = true;
    }

    let mut passes = 0usize;
    while let Some(id) = worklist.pop() {
        queued[id] = false;
        passes += 1;

        let block = func.insts[id].block;

        // Liveout is everything any successor demands on the edge from us.
        let mut liveout: BTreeSet<RegId> = BTreeSet::new();
        for &succ in &func.insts[id].succ {
            let s = &func.insts[succ];
            liveout.extend(s.livein_any.iter().copied());
            if let Some(per_edge) = s.livein_from.get(&block) {
                liveout.extend(per_edge.iter().copied());
            }
        }

        // Generic livein: liveout minus what we define...
        let mut livein_any = liveout.clone();
        for res in func.insts[id].op.results() {
            livein_any.remove(&res);
        }

        // ...plus what we read. Phi reads are attributed to the edge they
        // arrive on; everything else reads on every path in.
        let mut livein_from: BTreeMap<u32, BTreeSet<RegId>> = BTreeMap::new();
        match &func.insts[id].op {
            Op::Phi(phi) => {
                for row in &phi.operands {
                    for (col, &operand) in row.iter().enumerate() {
                        livein_from
                            .entry(phi.labels[col])
                            .or_default()
                            .insert(operand);
                    }
                }
            }
            op => {
                for arg in op.args() {
                    if !types.is_memory_var(arg) {
                        livein_any.insert(arg);
                    }
                }
            }
        }

        let inst = &mut func.insts[id];
        let changed = inst.livein_any != livein_any
            || inst.livein_from != livein_from
            || inst.liveout != liveout;
        if changed {
            inst.livein_any = livein_any;
            inst.livein_from = livein_from;
            inst.liveout = liveout;

            // Our predecessors depend on our livein.
            let preds = func.insts[id].pred.clone();
            for pred in preds {
                if !queued[pred] {
                    queued[pred] = true;
                    worklist.push(pred);
                }
            }
        }
    }

    log::debug!(
        "liveness for {} reached fixpoint after {passes} instruction visits",
        func.name
    );
}
