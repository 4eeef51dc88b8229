// ssarv: an SSA-to-register backend for a RISC-V-like target. The front end
// hands over a flat instruction list in SSA form plus a type table; the
// backend builds the CFG, computes dominance, lifts phi operands, iterates
// liveness and spilling until float pressure fits the 31-register budget,
// and assigns physical registers in dominance order. Phi semantics are
// realized after allocation as per-edge parallel copies, which the emitter
// asks for through phi::edge_copies.

//! SSA register allocation backend.
//!
//! The typical driver is [`compile_function`], which runs the whole pass
//! pipeline on one function and returns the final [`Allocation`]. Emitters
//! that need the per-edge phi copies call [`phi::edge_copies`] (and
//! [`phi::lower_float_exchanges`]) per CFG edge afterwards.

pub mod cfg;
pub mod dom;
pub mod error;
pub mod ir;
pub mod liveness;
pub mod pcopy;
pub mod phi;
pub mod regalloc;
pub mod spill;

pub use cfg::FunctionBuilder;
pub use error::{CompileError, CompileResult};
pub use ir::{Function, NameAllocator, RegClass, TypeTable};
pub use regalloc::{Allocation, PhysReg};

use spill::Spiller;

/// Run the backend pipeline on one function: dominance, phi lifting, the
/// liveness/spill fixpoint, and register assignment.
///
/// `names` must mint ids above everything the front end used; the spiller
/// and phi lifting draw fresh registers and memory slots from it, extending
/// `types` as they go.
pub fn compile_function(
    func: &mut Function,
    types: &mut TypeTable,
    names: &mut NameAllocator,
) -> CompileResult<Allocation> {
    dom::compute_dom_tree(func)?;
    phi::lift_phis(func, types, names)?;

    let mut spiller = Spiller::new();
    loop {
        liveness::compute(func, types);
        if !spiller.run(func, types, names)? {
            break;
        }
    }
    log::trace!("{func}");
    if !spiller.spilled().is_empty() {
        log::info!(
            "{}: spilled {} registers to {} slots",
            func.name,
            spiller.spilled().len(),
            func.spill_slots.len()
        );
    }

    regalloc::allocate(func, types)
}
