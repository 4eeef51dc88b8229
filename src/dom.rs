// This module computes block dominance. A worklist fixpoint seeded at the
// entry block recomputes each popped block's dominator set as itself plus
// the intersection of its predecessors' sets, pushing successors whenever a
// set shrinks. Blocks never popped are unreachable from the entry and get
// their dominator set cleared. The immediate dominator of each reachable
// block is then the unique proper dominator that dominates no other proper
// dominator, and the dominance tree is recorded through per-block children
// lists. Every later pass (spill pressure, allocation order) walks this
// tree.

//! Dominator sets, immediate dominators, and the dominance tree.

use std::collections::BTreeSet;

use crate::error::{CompileError, CompileResult};
use crate::ir::{BlockId, Function};

/// Compute dominator sets, immediate dominators, and the dominance tree for
/// every block of `func`.
///
/// Invariant on exit: a block has an immediate dominator if and only if it
/// has at least one predecessor. A violation means the CFG itself is broken
/// and is reported as fatal.
pub fn compute_dom_tree(func: &mut Function) -> CompileResult<()> {
    let all_blocks: BTreeSet<BlockId> = func.blocks.keys().copied().collect();
    let mut unreached = all_blocks.clone();

    for block in func.blocks.values_mut() {
        block.dom = all_blocks.clone();
        block.idom = None;
        block.children.clear();
    }

    let mut worklist = vec![func.entry];
    while let Some(label) = worklist.pop() {
        unreached.remove(&label);

        // {self} plus the intersection of all predecessors' dominator sets.
        // A block with no predecessors keeps only itself.
        let preds: Vec<BlockId> = func.block(label).preds.iter().copied().collect();
        let mut dom: BTreeSet<BlockId> = BTreeSet::new();
        for (i, pred) in preds.iter().enumerate() {
            let pred_dom = &func.block(*pred).dom;
            if i == 0 {
                dom = pred_dom.clone();
            } else {
                dom = dom.intersection(pred_dom).copied().collect();
            }
        }
        dom.insert(label);

        let block = func.blocks.get_mut(&label).unwrap();
        if dom != block.dom {
            block.dom = dom;
            worklist.extend(block.succs.iter().copied());
        }
    }

    // Blocks we never reached are dead code; they dominate nothing and have
    // no dominators.
    for label in &unreached {
        log::debug!("block {label} is unreachable from entry {}", func.entry);
        func.blocks.get_mut(label).unwrap().dom.clear();
    }

    compute_idoms(func)?;

    // The invariant check from the original construction: only the entry
    // (and dead blocks, which have no predecessors recorded as reachable)
    // may lack an immediate dominator.
    for (label, block) in &func.blocks {
        if unreached.contains(label) {
            continue;
        }
        if block.idom.is_none() != block.preds.is_empty() {
            return Err(CompileError::MissingIdom { block: *label });
        }
    }

    Ok(())
}

/// Pick each block's immediate dominator: the proper dominator that is not
/// itself a dominator of any other proper dominator, i.e. the closest one.
fn compute_idoms(func: &mut Function) -> CompileResult<()> {
    let labels: Vec<BlockId> = func.blocks.keys().copied().collect();
    for label in labels {
        let dom = func.block(label).dom.clone();
        let mut idom = None;

        'candidates: for &candidate in &dom {
            if candidate == label {
                continue;
            }
            for &other in &dom {
                if other != candidate
                    && other != label
                    && func.block(other).is_dominated_by(candidate)
                {
                    // The candidate dominates another proper dominator, so
                    // something closer exists.
                    continue 'candidates;
                }
            }
            idom = Some(candidate);
            break;
        }

        func.blocks.get_mut(&label).unwrap().idom = idom;
        if let Some(parent) = idom {
            func.blocks.get_mut(&parent).unwrap().children.push(label);
        }
    }
    Ok(())
}
