// This module defines the in-memory IR the backend passes operate on. The
// front end hands us a flat, ordered instruction list whose operands are
// virtual-register ids; the cfg module partitions it into blocks. Ownership
// follows an arena discipline: a Function owns a Vec<Instruction> addressed
// by InstId, blocks refer to instructions by index, and instructions refer to
// their owning block by label id. There are no pointer links anywhere, so
// there are no reference cycles; passes that need to cross a block boundary
// take the Function by reference. Opcode-specific payloads live in the Op
// tagged union and are dispatched by pattern matching. The module also
// carries the two front-end-facing tables: TypeTable (register class,
// memory-variable set, constant set) and NameAllocator (fresh-id minting,
// owned by the caller rather than a global counter).

//! IR data model: instructions, blocks, functions, and register tables.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Virtual-register id, assigned by the front end (SSA: one definition each).
pub type RegId = u32;

/// Block label id.
pub type BlockId = u32;

/// Index into a function's instruction arena.
pub type InstId = usize;

/// Sentinel for an instruction not yet placed in any block.
pub const NO_BLOCK: BlockId = u32::MAX;

/// Storage class of a virtual register. Only used to pick the physical
/// register pool; the backend has no other notion of type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RegClass {
    Int,
    Float,
}

/// Combined multi-result phi. Consecutive single-result phis at a block head
/// are merged into one of these so the join point is a single parallel-copy
/// problem: `operands[result_index][label_index]` names the register that
/// flows into `results[result_index]` when control arrives from
/// `labels[label_index]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phi {
    pub results: Vec<RegId>,
    pub labels: Vec<BlockId>,
    pub operands: Vec<Vec<RegId>>,
}

impl Phi {
    /// Index of `label` in the label list, if the phi has that edge.
    pub fn label_index(&self, label: BlockId) -> Option<usize> {
        self.labels.iter().position(|&l| l == label)
    }
}

/// One-operand ALU operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryKind {
    FNeg,
    FAbs,
    FFloor,
    FFract,
    FSqrt,
    ConvertSToF,
    ConvertFToS,
    LogicalNot,
}

/// Two-operand ALU operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryKind {
    IAdd,
    ISub,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FMin,
    FMax,
    SLessThan,
    FLessThan,
    LogicalAnd,
    LogicalOr,
}

/// Instruction opcode with its operands. A closed set: the backend never
/// sees anything else, and adding a variant is a compile-time event at every
/// match site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Phi(Phi),
    Copy {
        result: RegId,
        source: RegId,
    },
    Unary {
        kind: UnaryKind,
        result: RegId,
        operand: RegId,
    },
    Binary {
        kind: BinaryKind,
        result: RegId,
        lhs: RegId,
        rhs: RegId,
    },
    /// Load a scalar through a memory-resident pointer. Inserted by the
    /// spiller (and emitted by the front end for variable reads).
    Load {
        result: RegId,
        ptr: RegId,
    },
    /// Store a scalar through a memory-resident pointer.
    Store {
        ptr: RegId,
        value: RegId,
    },
    Branch {
        target: BlockId,
    },
    BranchCond {
        cond: RegId,
        if_true: BlockId,
        if_false: BlockId,
    },
    Return,
    ReturnValue {
        value: RegId,
    },
    /// Terminates the invocation without a value (shader kill / unreachable).
    Kill,
}

impl Op {
    /// Result virtual registers, in declaration order.
    pub fn results(&self) -> Vec<RegId> {
        match self {
            Op::Phi(phi) => phi.results.clone(),
            Op::Copy { result, .. }
            | Op::Unary { result, .. }
            | Op::Binary { result, .. }
            | Op::Load { result, .. } => vec![*result],
            _ => Vec::new(),
        }
    }

    /// Argument virtual registers, in use order. Phi operands are included
    /// here even though their liveness is tracked per predecessor edge.
    pub fn args(&self) -> Vec<RegId> {
        match self {
            Op::Phi(phi) => phi.operands.iter().flatten().copied().collect(),
            Op::Copy { source, .. } => vec![*source],
            Op::Unary { operand, .. } => vec![*operand],
            Op::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            Op::Load { ptr, .. } => vec![*ptr],
            Op::Store { ptr, value } => vec![*ptr, *value],
            Op::BranchCond { cond, .. } => vec![*cond],
            Op::ReturnValue { value } => vec![*value],
            _ => Vec::new(),
        }
    }

    /// Block labels this instruction may branch to.
    pub fn targets(&self) -> Vec<BlockId> {
        match self {
            Op::Branch { target } => vec![*target],
            Op::BranchCond {
                if_true, if_false, ..
            } => {
                if if_true == if_false {
                    vec![*if_true]
                } else {
                    vec![*if_true, *if_false]
                }
            }
            _ => Vec::new(),
        }
    }

    /// Whether this instruction ends a basic block.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Op::Branch { .. }
                | Op::BranchCond { .. }
                | Op::Return
                | Op::ReturnValue { .. }
                | Op::Kill
        )
    }

    /// Rewrite every argument use of `from` to `to`. Results are never
    /// rewritten; SSA definitions keep their name.
    pub fn rewrite_arg(&mut self, from: RegId, to: RegId) {
        let rw = |r: &mut RegId| {
            if *r == from {
                *r = to;
            }
        };
        match self {
            Op::Phi(phi) => {
                for row in &mut phi.operands {
                    row.iter_mut().for_each(rw);
                }
            }
            Op::Copy { source, .. } => rw(source),
            Op::Unary { operand, .. } => rw(operand),
            Op::Binary { lhs, rhs, .. } => {
                rw(lhs);
                rw(rhs);
            }
            Op::Load { ptr, .. } => rw(ptr),
            Op::Store { ptr, value } => {
                rw(ptr);
                rw(value);
            }
            Op::BranchCond { cond, .. } => rw(cond),
            Op::ReturnValue { value } => rw(value),
            _ => {}
        }
    }

    /// Opcode name for dumps and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Phi(_) => "phi",
            Op::Copy { .. } => "copy",
            Op::Unary { kind, .. } => match kind {
                UnaryKind::FNeg => "fneg",
                UnaryKind::FAbs => "fabs",
                UnaryKind::FFloor => "ffloor",
                UnaryKind::FFract => "ffract",
                UnaryKind::FSqrt => "fsqrt",
                UnaryKind::ConvertSToF => "cvt.s.f",
                UnaryKind::ConvertFToS => "cvt.f.s",
                UnaryKind::LogicalNot => "not",
            },
            Op::Binary { kind, .. } => match kind {
                BinaryKind::IAdd => "iadd",
                BinaryKind::ISub => "isub",
                BinaryKind::FAdd => "fadd",
                BinaryKind::FSub => "fsub",
                BinaryKind::FMul => "fmul",
                BinaryKind::FDiv => "fdiv",
                BinaryKind::FMin => "fmin",
                BinaryKind::FMax => "fmax",
                BinaryKind::SLessThan => "slt",
                BinaryKind::FLessThan => "flt",
                BinaryKind::LogicalAnd => "and",
                BinaryKind::LogicalOr => "or",
            },
            Op::Load { .. } => "load",
            Op::Store { .. } => "store",
            Op::Branch { .. } => "branch",
            Op::BranchCond { .. } => "branch.cond",
            Op::Return => "return",
            Op::ReturnValue { .. } => "return.value",
            Op::Kill => "kill",
        }
    }
}

/// One instruction in a function's arena: the opcode plus the shared fields
/// every pass reads (placement, instruction-level CFG links, liveness sets).
#[derive(Debug, Clone)]
pub struct Instruction {
    pub op: Op,

    /// Label of the owning block, or NO_BLOCK before CFG construction.
    pub block: BlockId,

    /// Predecessor instructions. Within a block this is the previous
    /// instruction; the first instruction's predecessors are the terminators
    /// of predecessor blocks. Empty only for the function's first instruction.
    pub pred: Vec<InstId>,

    /// Successor instructions; the terminator's successors are the first
    /// instructions of successor blocks.
    pub succ: Vec<InstId>,

    /// Registers live on entry regardless of which edge control came from.
    pub livein_any: BTreeSet<RegId>,

    /// For a phi: registers live on entry only when control arrives from the
    /// keyed predecessor block. Empty for everything else.
    pub livein_from: BTreeMap<BlockId, BTreeSet<RegId>>,

    /// Registers live on exit.
    pub liveout: BTreeSet<RegId>,
}

impl Instruction {
    pub fn new(op: Op) -> Self {
        Self {
            op,
            block: NO_BLOCK,
            pred: Vec::new(),
            succ: Vec::new(),
            livein_any: BTreeSet::new(),
            livein_from: BTreeMap::new(),
            liveout: BTreeSet::new(),
        }
    }

    /// Union of the generic livein and every per-edge livein.
    pub fn livein_all(&self) -> BTreeSet<RegId> {
        let mut all = self.livein_any.clone();
        for set in self.livein_from.values() {
            all.extend(set.iter().copied());
        }
        all
    }
}

/// A basic block: one entry (the first instruction), one exit (the
/// terminator), identified by its label id.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub label: BlockId,

    /// Instruction arena indices, in program order. Non-empty; the last
    /// entry is always a terminator.
    pub insts: Vec<InstId>,

    /// Predecessor blocks. Empty only for the function entry block.
    pub preds: BTreeSet<BlockId>,

    /// Successor blocks: exactly the terminator's target labels.
    pub succs: BTreeSet<BlockId>,

    /// Blocks that dominate this block (including itself). Empty for blocks
    /// unreachable from the entry.
    pub dom: BTreeSet<BlockId>,

    /// Immediate dominator, or None for the entry block (and dead blocks).
    pub idom: Option<BlockId>,

    /// Children in the dominance tree.
    pub children: Vec<BlockId>,
}

impl Block {
    pub fn is_dominated_by(&self, other: BlockId) -> bool {
        self.dom.contains(&other)
    }

    /// Arena index of the first instruction.
    pub fn first_inst(&self) -> InstId {
        self.insts[0]
    }

    /// Arena index of the terminator.
    pub fn terminator(&self) -> InstId {
        *self.insts.last().expect("block has no instructions")
    }
}

/// A function: its blocks plus the instruction arena they index into.
#[derive(Debug, Clone)]
pub struct Function {
    pub id: u32,
    pub name: String,

    /// Label of the entry block.
    pub entry: BlockId,

    pub blocks: BTreeMap<BlockId, Block>,

    /// Instruction arena. Instructions are never removed; the spiller only
    /// appends and splices new indices into block instruction lists.
    pub insts: Vec<Instruction>,

    /// Memory slots minted by the spiller, one per spilled register. The
    /// downstream emitter allocates one scalar of function-local storage for
    /// each.
    pub spill_slots: Vec<RegId>,
}

impl Function {
    pub fn inst(&self, id: InstId) -> &Instruction {
        &self.insts[id]
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut Instruction {
        &mut self.insts[id]
    }

    pub fn block(&self, label: BlockId) -> &Block {
        &self.blocks[&label]
    }

    /// Append an instruction to the arena (not yet in any block).
    pub fn push_inst(&mut self, inst: Instruction) -> InstId {
        self.insts.push(inst);
        self.insts.len() - 1
    }
}

impl fmt::Display for Function {
    /// Block-by-block textual dump, intended for trace logging. Includes
    /// whatever analysis results are populated at the time: dominator sets
    /// and idoms after the dominance pass, liveness sets after liveness.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "function {} (entry {})", self.name, self.entry)?;
        for block in self.blocks.values() {
            write!(f, "  block {}:", block.label)?;
            if !block.preds.is_empty() {
                write!(f, " preds {:?}", block.preds)?;
            }
            if let Some(idom) = block.idom {
                write!(f, " idom {idom}")?;
            }
            if !block.dom.is_empty() {
                write!(f, " dom {:?}", block.dom)?;
            }
            writeln!(f)?;
            for &id in &block.insts {
                let inst = &self.insts[id];
                write!(f, "    [{id}] {}", inst.op.name())?;
                let results = inst.op.results();
                if !results.is_empty() {
                    write!(f, " {results:?} <-")?;
                }
                let args = inst.op.args();
                if !args.is_empty() {
                    write!(f, " {args:?}")?;
                }
                let targets = inst.op.targets();
                if !targets.is_empty() {
                    write!(f, " -> {targets:?}")?;
                }
                writeln!(f)?;
                if !inst.livein_any.is_empty()
                    || !inst.livein_from.is_empty()
                    || !inst.liveout.is_empty()
                {
                    write!(f, "      live in {:?}", inst.livein_any)?;
                    for (pred, set) in &inst.livein_from {
                        write!(f, " from {pred} {set:?}")?;
                    }
                    writeln!(f, " out {:?}", inst.liveout)?;
                }
            }
        }
        Ok(())
    }
}

/// Register-class and storage information supplied by the front end.
///
/// Every virtual register the backend touches must be classified here;
/// memory variables are ids that never live in registers (they are excluded
/// from liveness and allocation), constants are ids with a compile-time
/// value and no defining instruction.
#[derive(Debug, Clone, Default)]
pub struct TypeTable {
    classes: BTreeMap<RegId, RegClass>,
    memory_vars: BTreeSet<RegId>,
    constants: BTreeSet<RegId>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the class of a register-resident id.
    pub fn define(&mut self, reg: RegId, class: RegClass) {
        self.classes.insert(reg, class);
    }

    /// Record a memory-resident id (variable or spill slot).
    pub fn define_memory_var(&mut self, reg: RegId) {
        self.memory_vars.insert(reg);
    }

    /// Record a compile-time constant of the given class.
    pub fn define_constant(&mut self, reg: RegId, class: RegClass) {
        self.classes.insert(reg, class);
        self.constants.insert(reg);
    }

    pub fn class_of(&self, reg: RegId) -> Result<RegClass, crate::error::CompileError> {
        self.classes
            .get(&reg)
            .copied()
            .ok_or(crate::error::CompileError::UnknownRegister { reg })
    }

    pub fn is_float(&self, reg: RegId) -> bool {
        matches!(self.classes.get(&reg), Some(RegClass::Float))
    }

    pub fn is_memory_var(&self, reg: RegId) -> bool {
        self.memory_vars.contains(&reg)
    }

    pub fn is_constant(&self, reg: RegId) -> bool {
        self.constants.contains(&reg)
    }
}

/// Mints fresh virtual-register ids for passes that create registers (phi
/// lifting, spilling). Owned by the compilation context and passed by
/// mutable reference; there is no global counter.
#[derive(Debug, Clone)]
pub struct NameAllocator {
    next: RegId,
}

impl NameAllocator {
    /// `first` must be above every id the front end handed out.
    pub fn new(first: RegId) -> Self {
        Self { next: first }
    }

    pub fn fresh(&mut self) -> RegId {
        let id = self.next;
        self.next += 1;
        id
    }
}
