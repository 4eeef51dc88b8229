// This module defines error types for the ssarv backend using the thiserror
// crate for idiomatic Rust error handling. CompileError is the single error
// enum covering the three failure families of the backend: malformed input
// from the front end (blocks without terminators, branches to unknown labels,
// registers with no recorded type, phis missing a predecessor edge),
// resource exhaustion (no physical register free, no spill candidate left
// under pressure), and internal invariant violations (a block with
// predecessors but no immediate dominator, a virtual register consulted
// before allocation). Each variant carries the identifying ids needed to
// locate the problem. CompileResult<T> is the crate-wide Result alias.

//! Error types for the backend passes.
//!
//! Using thiserror for more idiomatic error handling. Every error here is
//! fatal to the enclosing compilation; the only controlled retry in the
//! backend is the liveness/spill fixpoint, which is not an error path.

use thiserror::Error;

use crate::ir::{BlockId, InstId, RegClass, RegId};

/// Main error type for the backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("function {name} has no blocks")]
    EmptyFunction { name: String },

    #[error("block {block} has no terminator")]
    MissingTerminator { block: BlockId },

    #[error("block {block} branches to {label}, which is not a block label")]
    UnknownLabel { block: BlockId, label: BlockId },

    #[error("no type recorded for virtual register {reg}")]
    UnknownRegister { reg: RegId },

    #[error("virtual register {reg} live at function entry is not a constant")]
    ConstantExpected { reg: RegId },

    #[error("block {block} has predecessors but no immediate dominator")]
    MissingIdom { block: BlockId },

    #[error("phi in block {block} has no operand column for predecessor {pred}")]
    UnknownPredecessor { block: BlockId, pred: BlockId },

    #[error("no free {class:?} register for {reg} at instruction {inst}")]
    RegisterExhausted {
        class: RegClass,
        reg: RegId,
        inst: InstId,
    },

    #[error("float pressure exceeds budget at instruction {inst} but every live register is already spilled")]
    NoSpillCandidate { inst: InstId },

    #[error("virtual register {reg} was never assigned a physical register")]
    Unassigned { reg: RegId },
}

/// Result type alias for backend operations.
pub type CompileResult<T> = Result<T, CompileError>;
