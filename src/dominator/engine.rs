//! Immediate dominators and retained sizes over the whole object graph.
//!
//! Uses the iterative algorithm of Cooper, Harvey and Kennedy ("A Simple,
//! Fast Dominance Algorithm"): number the reachable nodes in DFS postorder
//! from a synthetic root wired to every GC root, then sweep in reverse
//! postorder intersecting predecessor dominators until nothing changes.
//! The sweep does not need a reducible graph, so object cycles are fine.

use crate::error::{HeapError, Result};
use crate::index::{HeapIndex, NodeIdx};
use crate::util::progress::{ProgressSink, ProgressTracker};
use fixedbitset::FixedBitSet;
use smallvec::SmallVec;
use std::time::Instant;

/// No dominator: the node is unreachable from the root set
pub(crate) const UNREACHABLE: u32 = u32::MAX;
/// Dominated only by the synthetic root
pub(crate) const SUPER_ROOT: u32 = u32::MAX - 1;

const UNDEFINED: u32 = u32::MAX;

/// A fully converged dominator tree, indexed by node
pub(crate) struct DominatorTree {
    pub(crate) idom: Vec<u32>,
    pub(crate) retained: Vec<u64>,
    pub(crate) reachable: usize,
    pub(crate) iterations: u32,
}

impl DominatorTree {
    pub(crate) fn is_reachable(&self, node: NodeIdx) -> bool {
        self.idom[node as usize] != UNREACHABLE
    }
}

/// Depth-first numbering of everything reachable from `roots`.
///
/// Returns the nodes in postorder and the predecessor lists (in postorder
/// numbers) of each of them. The synthetic root is the last postorder number.
struct Numbering {
    postorder: Vec<NodeIdx>,
    preds: Vec<SmallVec<[u32; 2]>>,
}

fn number_reachable(
    index: &HeapIndex,
    data: &[u8],
    roots: &[NodeIdx],
    progress: &mut ProgressTracker<'_>,
    cancelled: &dyn Fn() -> bool,
) -> Result<Numbering> {
    let n = index.node_count();
    let mut visited = FixedBitSet::with_capacity(n);
    let mut postorder: Vec<NodeIdx> = vec![];
    let mut edges: Vec<(u32, u32)> = vec![];
    // (node, successors, next successor)
    let mut stack: Vec<(NodeIdx, SmallVec<[NodeIdx; 8]>, usize)> = vec![];
    let super_root = n as u32;

    for &root in roots {
        edges.push((super_root, root));
        if visited.put(root as usize) {
            continue;
        }
        stack.push((root, index.successors(data, root)?, 0));
        while let Some((node, succs, pos)) = stack.last_mut() {
            if *pos < succs.len() {
                let next = succs[*pos];
                *pos += 1;
                edges.push((*node, next));
                if !visited.put(next as usize) {
                    if cancelled() {
                        return Err(HeapError::Cancelled);
                    }
                    let succs = index.successors(data, next)?;
                    stack.push((next, succs, 0));
                }
            } else {
                postorder.push(*node);
                stack.pop();
                progress.advance(1);
            }
        }
    }

    let mut number = vec![UNDEFINED; n + 1];
    for (i, node) in postorder.iter().enumerate() {
        number[*node as usize] = i as u32;
    }
    number[n] = postorder.len() as u32;
    let mut preds: Vec<SmallVec<[u32; 2]>> = vec![SmallVec::new(); postorder.len() + 1];
    for (from, to) in edges {
        preds[number[to as usize] as usize].push(number[from as usize]);
    }
    Ok(Numbering { postorder, preds })
}

fn intersect(doms: &[u32], mut a: u32, mut b: u32) -> u32 {
    while a != b {
        while a < b {
            a = doms[a as usize];
        }
        while b < a {
            b = doms[b as usize];
        }
    }
    a
}

/// Compute the dominator tree of everything reachable from `roots`.
///
/// Cancellation is polled once per node in every phase. Nothing is
/// returned unless the sweep converged.
pub(crate) fn compute(
    index: &HeapIndex,
    data: &[u8],
    roots: &[NodeIdx],
    max_iterations: Option<u32>,
    sink: &dyn ProgressSink,
    cancelled: &dyn Fn() -> bool,
) -> Result<DominatorTree> {
    let start = Instant::now();
    let n = index.node_count();
    let mut progress = ProgressTracker::new(sink, n as u64);
    let numbering = number_reachable(index, data, roots, &mut progress, cancelled)?;
    let count = numbering.postorder.len();
    let root = count as u32;
    debug!(
        "Numbered {} reachable nodes of {} in {} ms",
        count,
        n,
        start.elapsed().as_micros() as f64 / 1000f64
    );
    // One sweep to find the dominators, one to confirm, one to sum sizes
    progress.set_total(progress.current() + 3 * count as u64);

    let mut doms = vec![UNDEFINED; count + 1];
    doms[count] = root;
    let mut iterations = 0u32;
    loop {
        if let Some(cap) = max_iterations {
            if iterations >= cap {
                return Err(HeapError::NotConverged { iterations });
            }
        }
        iterations += 1;
        let mut changed = false;
        for b in (0..count).rev() {
            if cancelled() {
                return Err(HeapError::Cancelled);
            }
            let mut new_idom = UNDEFINED;
            for &p in &numbering.preds[b] {
                if doms[p as usize] == UNDEFINED {
                    continue;
                }
                new_idom = if new_idom == UNDEFINED {
                    p
                } else {
                    intersect(&doms, p, new_idom)
                };
            }
            if doms[b] != new_idom {
                doms[b] = new_idom;
                changed = true;
            }
            progress.advance(1);
        }
        if !changed {
            break;
        }
        if iterations >= 2 {
            progress.set_total(progress.total() + count as u64);
        }
    }
    debug!("Dominators converged after {} sweeps", iterations);

    // Dominators finish after the nodes they dominate, so an ascending
    // postorder walk sees every child before its parent
    let mut retained_po: Vec<u64> = numbering
        .postorder
        .iter()
        .map(|node| index.nodes.sizes[*node as usize])
        .collect();
    retained_po.push(0);
    for b in 0..count {
        if cancelled() {
            return Err(HeapError::Cancelled);
        }
        let parent = doms[b] as usize;
        retained_po[parent] += retained_po[b];
        progress.advance(1);
    }

    let mut idom = vec![UNREACHABLE; n];
    let mut retained = vec![0u64; n];
    for (b, node) in numbering.postorder.iter().enumerate() {
        let parent = doms[b];
        idom[*node as usize] = if parent == root {
            SUPER_ROOT
        } else {
            numbering.postorder[parent as usize]
        };
        retained[*node as usize] = retained_po[b];
    }
    progress.finish();
    info!(
        "Computed retained sizes of {} objects in {} ms ({} sweeps)",
        count,
        start.elapsed().as_micros() as f64 / 1000f64,
        iterations
    );
    Ok(DominatorTree {
        idom,
        retained,
        reachable: count,
        iterations,
    })
}
