// This module turns a parallel copy (a set of location-to-location copies
// that notionally happen at once) into a sequence of machine operations.
// Plain moves are emitted greedily: a pair whose destination no other
// pending pair still reads can run immediately. When no such pair exists,
// the remaining pairs form disjoint permutation cycles (every pending
// destination is also a pending source, so sources and destinations
// coincide), and one exchange breaks a cycle: after swapping, the pending
// sources that lived in the swapped locations are renamed to where their
// values moved, which shortens the cycle by one. Locations are an opaque
// type parameter so the phi-resolution pass can run this over physical
// registers while tests run it over small integers.

//! Parallel-copy sequentialization into moves and exchanges.

/// One copy of a parallel-copy set. Destinations are unique within a set;
/// sources may repeat (fan-out).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyPair<L> {
    pub dst: L,
    pub src: L,
}

/// One step of the sequentialized copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyInst<L> {
    Move { dst: L, src: L },
    /// Swap the contents of two locations. Only emitted for locations that
    /// are destinations of the copy set.
    Exchange { a: L, b: L },
}

/// Order a parallel copy into moves and exchanges that respect every
/// read-before-overwrite dependency. Self-copies are dropped.
pub fn sequentialize<L: PartialEq + Copy>(pairs: &[CopyPair<L>]) -> Vec<CopyInst<L>> {
    let mut pending: Vec<CopyPair<L>> = pairs
        .iter()
        .copied()
        .filter(|p| p.dst != p.src)
        .collect();
    let mut out = Vec::new();

    while !pending.is_empty() {
        let movable = (0..pending.len()).find(|&i| {
            let dst = pending[i].dst;
            pending
                .iter()
                .enumerate()
                .all(|(j, q)| j == i || q.src != dst)
        });

        match movable {
            Some(i) => {
                let p = pending.remove(i);
                out.push(CopyInst::Move {
                    dst: p.dst,
                    src: p.src,
                });
            }
            None => {
                // Pure cycles remain. Swap one edge; the two old values
                // trade places, so rename pending reads accordingly.
                let p = pending.remove(0);
                out.push(CopyInst::Exchange { a: p.dst, b: p.src });
                for q in &mut pending {
                    if q.src == p.dst {
                        q.src = p.src;
                    } else if q.src == p.src {
                        q.src = p.dst;
                    }
                }
                pending.retain(|q| q.dst != q.src);
            }
        }
    }
    out
}
