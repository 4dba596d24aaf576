use crate::error::{HeapError, Result};
use crate::heapdump::HeapDump;
use fixedbitset::FixedBitSet;

/// Count the objects reachable from `roots` with a plain mark stack.
///
/// Independent of the dominator engine, so the two can check each other.
pub fn sanity_trace(heap: &HeapDump, roots: &[u64]) -> Result<usize> {
    let index = heap.index();
    let mut reachable_objects = FixedBitSet::with_capacity(index.node_count());
    let mut mark_stack: Vec<u32> = vec![];
    for root in roots {
        let node = index
            .nodes
            .lookup(*root)
            .ok_or(HeapError::NoSuchInstance(*root))?;
        mark_stack.push(node);
    }
    let mut marked = 0;
    while let Some(o) = mark_stack.pop() {
        if reachable_objects.put(o as usize) {
            continue;
        }
        marked += 1;
        index.for_each_edge(heap.data(), o, |target, _| mark_stack.push(target))?;
    }
    Ok(marked)
}
