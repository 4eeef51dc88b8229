// This module handles phi resolution around register allocation. Before
// liveness, lift_phis gives every phi operand a private copy in the
// predecessor block, so each incoming value reaches the edge in a register
// that dies there and the parallel copy never reads a long-lived range.
// After allocation, edge_copies projects the phi of a join block onto one
// incoming edge: each result's physical register receives the physical
// register of that edge's operand column, and the resulting parallel copy
// is sequentialized into moves and exchanges. The emitter materializes
// those on the edge (in the predecessor when the edge is not critical).
// Float exchanges have no machine instruction, so lower_float_exchanges
// expands each one into three moves through the reserved f31 scratch.

//! Phi lifting and post-allocation edge copy emission.

use crate::cfg::{block_phi, relink};
use crate::error::{CompileError, CompileResult};
use crate::ir::{BlockId, Function, NameAllocator, Op, TypeTable};
use crate::pcopy::{sequentialize, CopyInst, CopyPair};
use crate::regalloc::{Allocation, PhysReg, FLOAT_SCRATCH};

/// Insert a copy of every phi operand in front of its predecessor's
/// terminator and rewrite the phi to read the copies. Must run before
/// liveness; calls `relink` itself.
pub fn lift_phis(
    func: &mut Function,
    types: &mut TypeTable,
    names: &mut NameAllocator,
) -> CompileResult<()> {
    let labels: Vec<BlockId> = func.blocks.keys().copied().collect();
    let mut lifted = 0usize;
    for label in labels {
        let Some((head, phi)) = block_phi(func, label) else {
            continue;
        };
        let mut phi = phi.clone();

        for (row_idx, row) in phi.operands.clone().iter().enumerate() {
            let class = types.class_of(phi.results[row_idx])?;
            for (col, &operand) in row.iter().enumerate() {
                let fresh = names.fresh();
                types.define(fresh, class);
                let pred = phi.labels[col];
                let term = func.block(pred).terminator();
                let mut copy = crate::ir::Instruction::new(Op::Copy {
                    result: fresh,
                    source: operand,
                });
                copy.block = pred;
                let id = func.push_inst(copy);
                let block = func.blocks.get_mut(&pred).expect("unknown block label");
                let at = block
                    .insts
                    .iter()
                    .position(|&i| i == term)
                    .expect("terminator not in its block");
                block.insts.insert(at, id);
                phi.operands[row_idx][col] = fresh;
                lifted += 1;
            }
        }
        func.inst_mut(head).op = Op::Phi(phi);
    }

    if lifted > 0 {
        relink(func);
        log::debug!("lifted {lifted} phi operands in {}", func.name);
    }
    Ok(())
}

/// The sequential copies that realize the phi of `to` on the edge from
/// `from`, in physical registers. Empty when `to` has no phi.
pub fn edge_copies(
    func: &Function,
    alloc: &Allocation,
    from: BlockId,
    to: BlockId,
) -> CompileResult<Vec<CopyInst<PhysReg>>> {
    let Some((_, phi)) = block_phi(func, to) else {
        return Ok(Vec::new());
    };
    let col = phi
        .label_index(from)
        .ok_or(CompileError::UnknownPredecessor {
            block: to,
            pred: from,
        })?;

    let mut pairs = Vec::with_capacity(phi.results.len());
    for (row, &result) in phi.results.iter().enumerate() {
        pairs.push(CopyPair {
            dst: alloc.phys_of(result)?,
            src: alloc.phys_of(phi.operands[row][col])?,
        });
    }
    Ok(sequentialize(&pairs))
}

/// Expand float exchanges into three moves through the f31 scratch. Integer
/// exchanges pass through untouched; the emitter has a real swap for those.
pub fn lower_float_exchanges(seq: Vec<CopyInst<PhysReg>>) -> Vec<CopyInst<PhysReg>> {
    let mut out = Vec::with_capacity(seq.len());
    for inst in seq {
        match inst {
            CopyInst::Exchange { a, b } if a.is_float() => {
                out.push(CopyInst::Move {
                    dst: FLOAT_SCRATCH,
                    src: a,
                });
                out.push(CopyInst::Move { dst: a, src: b });
                out.push(CopyInst::Move {
                    dst: b,
                    src: FLOAT_SCRATCH,
                });
            }
            other => out.push(other),
        }
    }
    out
}
