// This module builds the control-flow graph. FunctionBuilder accepts the
// front end's flat instruction list together with label markers, partitions
// it into basic blocks (each label's range ends at the first terminator),
// merges consecutive phis at a block head into one combined Phi, derives
// block successor sets from terminator targets and predecessor sets by
// transposition, and wires up the instruction-level pred/succ links the
// liveness worklist runs over. relink() rebuilds those instruction links
// from the block lists; the spiller calls it after splicing in loads and
// stores.

//! Control-flow-graph construction from the flat front-end instruction list.

use std::collections::BTreeMap;

use crate::error::{CompileError, CompileResult};
use crate::ir::{Block, BlockId, Function, InstId, Instruction, Op, Phi, NO_BLOCK};

/// Builds a `Function` from a flat instruction sequence with label markers.
///
/// The front end appends instructions in program order and marks block
/// starts with `label()`; the first label is the function entry.
pub struct FunctionBuilder {
    id: u32,
    name: String,
    insts: Vec<Instruction>,
    /// Label id to index of its first instruction, in insertion order.
    labels: Vec<(BlockId, InstId)>,
}

impl FunctionBuilder {
    pub fn new(id: u32, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            insts: Vec::new(),
            labels: Vec::new(),
        }
    }

    /// Mark the start of the block with the given label.
    pub fn label(&mut self, label: BlockId) -> &mut Self {
        self.labels.push((label, self.insts.len()));
        self
    }

    /// Append an instruction to the current block.
    pub fn inst(&mut self, op: Op) -> &mut Self {
        self.insts.push(Instruction::new(op));
        self
    }

    /// Partition into blocks, combine phis, and compute all CFG links.
    pub fn build(self) -> CompileResult<Function> {
        let entry = match self.labels.first() {
            Some(&(label, _)) => label,
            None => return Err(CompileError::EmptyFunction { name: self.name }),
        };

        let mut func = Function {
            id: self.id,
            name: self.name,
            entry,
            blocks: BTreeMap::new(),
            insts: self.insts,
            spill_slots: Vec::new(),
        };

        // Which indices start a labeled block, for terminator-scan bounds.
        let starts: BTreeMap<InstId, BlockId> = self.labels.iter().map(|&(l, i)| (i, l)).collect();

        for &(label, start) in &self.labels {
            let mut insts = Vec::new();
            let mut pc = start;
            loop {
                if pc >= func.insts.len() || (pc != start && starts.contains_key(&pc)) {
                    // Ran into the end of the function or the next label
                    // without seeing a terminator.
                    return Err(CompileError::MissingTerminator { block: label });
                }
                func.insts[pc].block = label;
                insts.push(pc);
                if func.insts[pc].op.is_terminator() {
                    break;
                }
                pc += 1;
            }

            func.blocks.insert(
                label,
                Block {
                    label,
                    insts,
                    ..Block::default()
                },
            );
        }

        combine_phis(&mut func)?;

        // Successors from terminator targets, predecessors by transposition.
        let labels: Vec<BlockId> = func.blocks.keys().copied().collect();
        for label in labels {
            let term = func.block(label).terminator();
            for target in func.inst(term).op.targets() {
                if !func.blocks.contains_key(&target) {
                    return Err(CompileError::UnknownLabel {
                        block: label,
                        label: target,
                    });
                }
                func.blocks.get_mut(&label).unwrap().succs.insert(target);
                func.blocks.get_mut(&target).unwrap().preds.insert(label);
            }
        }

        relink(&mut func);
        log::trace!("built CFG for {}: {} blocks", func.name, func.blocks.len());
        Ok(func)
    }
}

/// Merge runs of phis at each block head into one combined Phi so each join
/// point is a single parallel-copy problem. Later phis may list their labels
/// in a different order; operands are slotted into the first phi's label
/// order.
fn combine_phis(func: &mut Function) -> CompileResult<()> {
    let labels: Vec<BlockId> = func.blocks.keys().copied().collect();
    for label in labels {
        let insts = func.block(label).insts.clone();
        let mut run = Vec::new();
        for &id in &insts {
            if matches!(func.inst(id).op, Op::Phi(_)) {
                run.push(id);
            } else {
                break;
            }
        }
        if run.len() < 2 {
            continue;
        }

        let first = run[0];
        let mut combined = match &func.inst(first).op {
            Op::Phi(phi) => phi.clone(),
            _ => unreachable!(),
        };
        for &other in &run[1..] {
            let phi = match &func.inst(other).op {
                Op::Phi(phi) => phi.clone(),
                _ => unreachable!(),
            };
            // Every edge the combined phi covers needs a column here too;
            // a missing one would leave a hole in the operand table.
            for &edge in &combined.labels {
                if phi.label_index(edge).is_none() {
                    return Err(CompileError::UnknownPredecessor {
                        block: label,
                        pred: edge,
                    });
                }
            }
            for (res_idx, &result) in phi.results.iter().enumerate() {
                combined.results.push(result);
                let mut row = vec![0; combined.labels.len()];
                for (col, &phi_label) in phi.labels.iter().enumerate() {
                    let slot = combined.label_index(phi_label).ok_or(
                        CompileError::UnknownPredecessor {
                            block: label,
                            pred: phi_label,
                        },
                    )?;
                    row[slot] = phi.operands[res_idx][col];
                }
                combined.operands.push(row);
            }
            // The merged-away phi stays in the arena but leaves the block.
            func.inst_mut(other).block = NO_BLOCK;
        }

        func.inst_mut(first).op = Op::Phi(combined);
        let block = func.blocks.get_mut(&label).unwrap();
        block.insts.retain(|id| *id == first || !run.contains(id));
    }
    Ok(())
}

/// Rebuild instruction-level predecessor/successor links from the block
/// instruction lists. Within a block the links are simply program order; at
/// block boundaries the terminator links to the first instruction of each
/// successor block.
pub fn relink(func: &mut Function) {
    for inst in &mut func.insts {
        inst.pred.clear();
        inst.succ.clear();
    }

    let labels: Vec<BlockId> = func.blocks.keys().copied().collect();
    for &label in &labels {
        let insts = func.block(label).insts.clone();
        for pair in insts.windows(2) {
            func.insts[pair[0]].succ.push(pair[1]);
            func.insts[pair[1]].pred.push(pair[0]);
        }

        let term = *insts.last().expect("block has no instructions");
        for succ_label in func.block(label).succs.clone() {
            let head = func.block(succ_label).first_inst();
            func.insts[term].succ.push(head);
            func.insts[head].pred.push(term);
        }
    }
}

/// Extract the combined phi at the head of a block, if it starts with one.
pub fn block_phi(func: &Function, label: BlockId) -> Option<(InstId, &Phi)> {
    let head = func.block(label).first_inst();
    match &func.inst(head).op {
        Op::Phi(phi) => Some((head, phi)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::BinaryKind;

    fn fadd(result: u32, lhs: u32, rhs: u32) -> Op {
        Op::Binary {
            kind: BinaryKind::FAdd,
            result,
            lhs,
            rhs,
        }
    }

    #[test]
    fn straight_line_block() {
        let mut b = FunctionBuilder::new(1, "f");
        b.label(10);
        b.inst(fadd(100, 1, 2));
        b.inst(Op::Return);
        let func = b.build().unwrap();

        assert_eq!(func.entry, 10);
        let block = func.block(10);
        assert_eq!(block.insts.len(), 2);
        assert!(block.preds.is_empty());
        assert!(block.succs.is_empty());
        // In-block instruction chain.
        assert_eq!(func.inst(block.insts[0]).succ, vec![block.insts[1]]);
        assert_eq!(func.inst(block.insts[1]).pred, vec![block.insts[0]]);
    }

    #[test]
    fn diamond_edges_are_transposed() {
        let mut b = FunctionBuilder::new(1, "f");
        b.label(10);
        b.inst(Op::BranchCond {
            cond: 1,
            if_true: 20,
            if_false: 30,
        });
        b.label(20);
        b.inst(Op::Branch { target: 40 });
        b.label(30);
        b.inst(Op::Branch { target: 40 });
        b.label(40);
        b.inst(Op::Return);
        let func = b.build().unwrap();

        assert_eq!(
            func.block(10).succs.iter().copied().collect::<Vec<_>>(),
            vec![20, 30]
        );
        assert_eq!(
            func.block(40).preds.iter().copied().collect::<Vec<_>>(),
            vec![20, 30]
        );

        // Terminator of 10 links to the heads of 20 and 30.
        let term = func.block(10).terminator();
        let heads = [func.block(20).first_inst(), func.block(30).first_inst()];
        assert_eq!(func.inst(term).succ.len(), 2);
        for head in heads {
            assert!(func.inst(term).succ.contains(&head));
            assert!(func.inst(head).pred.contains(&term));
        }
    }

    #[test]
    fn missing_terminator_is_fatal() {
        let mut b = FunctionBuilder::new(1, "f");
        b.label(10);
        b.inst(fadd(100, 1, 2));
        assert_eq!(
            b.build().unwrap_err(),
            CompileError::MissingTerminator { block: 10 }
        );
    }

    #[test]
    fn fallthrough_into_next_label_is_fatal() {
        let mut b = FunctionBuilder::new(1, "f");
        b.label(10);
        b.inst(fadd(100, 1, 2));
        b.label(20);
        b.inst(Op::Return);
        assert_eq!(
            b.build().unwrap_err(),
            CompileError::MissingTerminator { block: 10 }
        );
    }

    #[test]
    fn unknown_branch_target_is_fatal() {
        let mut b = FunctionBuilder::new(1, "f");
        b.label(10);
        b.inst(Op::Branch { target: 99 });
        assert_eq!(
            b.build().unwrap_err(),
            CompileError::UnknownLabel {
                block: 10,
                label: 99
            }
        );
    }

    #[test]
    fn consecutive_phis_are_combined() {
        let mut b = FunctionBuilder::new(1, "f");
        b.label(10);
        b.inst(Op::Branch { target: 20 });
        b.label(20);
        b.inst(Op::Phi(Phi {
            results: vec![100],
            labels: vec![10, 20],
            operands: vec![vec![1, 2]],
        }));
        // Same edge set, opposite label order.
        b.inst(Op::Phi(Phi {
            results: vec![101],
            labels: vec![20, 10],
            operands: vec![vec![4, 3]],
        }));
        b.inst(Op::Branch { target: 20 });
        let func = b.build().unwrap();

        let (_, phi) = block_phi(&func, 20).expect("combined phi at head");
        assert_eq!(phi.results, vec![100, 101]);
        assert_eq!(phi.labels, vec![10, 20]);
        assert_eq!(phi.operands, vec![vec![1, 2], vec![3, 4]]);
        assert_eq!(func.block(20).insts.len(), 2);
    }

    #[test]
    fn phi_missing_an_edge_column_is_fatal() {
        let mut b = FunctionBuilder::new(1, "f");
        b.label(10);
        b.inst(Op::Branch { target: 20 });
        b.label(20);
        b.inst(Op::Phi(Phi {
            results: vec![100],
            labels: vec![10, 20],
            operands: vec![vec![1, 2]],
        }));
        // No column for the back edge from 20.
        b.inst(Op::Phi(Phi {
            results: vec![101],
            labels: vec![10],
            operands: vec![vec![3]],
        }));
        b.inst(Op::Branch { target: 20 });
        assert_eq!(
            b.build().unwrap_err(),
            CompileError::UnknownPredecessor {
                block: 20,
                pred: 20
            }
        );
    }
}
