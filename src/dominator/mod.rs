//! Retained sizes: dominator tree computation and the jobs that share it.

mod engine;
mod job;

pub(crate) use engine::compute;
pub(crate) use engine::DominatorTree;
pub use job::RetainedSizeJob;
pub(crate) use job::{start, Flight};

use crate::error::{HeapError, Result};
use crate::heapdump::HeapDump;
use crate::index::NodeIdx;
use engine::{SUPER_ROOT, UNREACHABLE};
use std::sync::Arc;

/// Objects that anchor reachability for a retained size run
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RootSet {
    /// Every GC root in the dump
    GcRoots,
    /// Explicit object ids, sorted and unique
    Objects(Vec<u64>),
}

impl RootSet {
    pub fn objects(ids: impl IntoIterator<Item = u64>) -> RootSet {
        let mut ids: Vec<u64> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        RootSet::Objects(ids)
    }

    pub(crate) fn resolve(&self, heap: &HeapDump) -> Result<Vec<NodeIdx>> {
        let index = heap.index();
        let mut nodes: Vec<NodeIdx> = match self {
            RootSet::GcRoots => index.roots.iter().map(|r| r.node).collect(),
            RootSet::Objects(ids) => ids
                .iter()
                .map(|id| index.nodes.lookup(*id).ok_or(HeapError::NoSuchInstance(*id)))
                .collect::<Result<_>>()?,
        };
        nodes.sort_unstable();
        nodes.dedup();
        Ok(nodes)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetainedSizeRecord {
    pub id: u64,
    pub shallow_size: u64,
    pub retained_size: u64,
    /// Immediate dominator, `None` when only the root set dominates it
    pub dominator: Option<u64>,
}

/// Converged retained sizes of one root set
#[derive(Clone)]
pub struct RetainedSizes {
    heap: HeapDump,
    tree: Arc<DominatorTree>,
}

impl RetainedSizes {
    pub(crate) fn new(heap: HeapDump, tree: Arc<DominatorTree>) -> Self {
        RetainedSizes { heap, tree }
    }

    fn record_of(&self, node: NodeIdx) -> Option<RetainedSizeRecord> {
        let index = self.heap.index();
        let idom = self.tree.idom[node as usize];
        if idom == UNREACHABLE {
            return None;
        }
        Some(RetainedSizeRecord {
            id: index.nodes.ids[node as usize],
            shallow_size: index.nodes.sizes[node as usize],
            retained_size: self.tree.retained[node as usize],
            dominator: (idom != SUPER_ROOT).then(|| index.nodes.ids[idom as usize]),
        })
    }

    fn node(&self, id: u64) -> Result<NodeIdx> {
        self.heap
            .index()
            .nodes
            .lookup(id)
            .ok_or(HeapError::NoSuchInstance(id))
    }

    /// `None` when the instance is not reachable from the root set
    pub fn record(&self, id: u64) -> Result<Option<RetainedSizeRecord>> {
        Ok(self.record_of(self.node(id)?))
    }

    pub fn retained_size(&self, id: u64) -> Result<Option<u64>> {
        Ok(self.record(id)?.map(|r| r.retained_size))
    }

    pub(crate) fn retained_of_node(&self, node: NodeIdx) -> Option<u64> {
        self.tree
            .is_reachable(node)
            .then(|| self.tree.retained[node as usize])
    }

    /// Every reachable instance, in id order
    pub fn records(&self) -> impl Iterator<Item = RetainedSizeRecord> + '_ {
        (0..self.tree.idom.len()).filter_map(|n| self.record_of(n as NodeIdx))
    }

    /// Children of `id` in the dominator tree, in id order. Walks the whole
    /// tree.
    pub fn dominated_by(&self, id: u64) -> Result<Vec<u64>> {
        let node = self.node(id)?;
        Ok(self.children(node))
    }

    /// Instances dominated only by the root set
    pub fn top_level(&self) -> Vec<u64> {
        self.children(SUPER_ROOT)
    }

    fn children(&self, parent: u32) -> Vec<u64> {
        let ids = &self.heap.index().nodes.ids;
        self.tree
            .idom
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == parent)
            .map(|(n, _)| ids[n])
            .collect()
    }

    pub fn reachable_count(&self) -> usize {
        self.tree.reachable
    }

    /// Fixed-point sweeps it took to converge
    pub fn iterations(&self) -> u32 {
        self.tree.iterations
    }

    pub fn heap(&self) -> &HeapDump {
        &self.heap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hprof::writer::TestHeap;
    use crate::hprof::{BasicType, Value};
    use crate::sanity::sanity_trace;
    use crate::util::progress::{CancelToken, NoProgress};
    use crate::{load_heap, ByteSource, HeapConfig};

    /// Three classes and ten instances: a root at A, A ↔ B, and a fan of
    /// children below B
    fn scenario() -> HeapDump {
        let mut h = TestHeap::new();
        h.class(
            0x20,
            "s/A",
            TestHeap::OBJECT,
            &[("b", BasicType::Object), ("extra", BasicType::Object)],
        );
        h.class(
            0x30,
            "s/B",
            TestHeap::OBJECT,
            &[("a", BasicType::Object), ("items", BasicType::Object)],
        );
        h.class(0x40, "[Ls/A;", TestHeap::OBJECT, &[]);
        h.object(0x100, 0x20, &[Value::Object(0x101), Value::Object(0x104)]);
        h.object(0x101, 0x30, &[Value::Object(0x100), Value::Object(0x102)]);
        h.object_array(0x102, 0x40, &[0x103, 0x104, 0x105]);
        h.object(0x103, 0x20, &[Value::Object(0), Value::Object(0)]);
        h.object(0x104, 0x20, &[Value::Object(0), Value::Object(0)]);
        h.object(0x105, 0x20, &[Value::Object(0x106), Value::Object(0)]);
        h.object(0x106, 0x30, &[Value::Object(0), Value::Object(0)]);
        h.object(0x107, 0x30, &[Value::Object(0x100), Value::Object(0)]);
        h.object(0x108, 0x30, &[Value::Object(0), Value::Object(0)]);
        h.object(0x109, 0x20, &[Value::Object(0x108), Value::Object(0)]);
        h.root(0x100);
        load_heap(ByteSource::Bytes(h.bytes()), HeapConfig::default()).unwrap()
    }

    fn converged(heap: &HeapDump, roots: RootSet) -> RetainedSizes {
        heap.retained_sizes(roots, Arc::new(NoProgress), CancelToken::new())
            .unwrap()
            .wait()
            .unwrap()
    }

    #[test]
    fn test_cycle_counted_once() {
        let heap = scenario();
        let sizes = converged(&heap, RootSet::GcRoots);
        let object = 16 + 16;
        let array = 16 + 4 + 3 * 8;
        let a = sizes.record(0x100).unwrap().unwrap();
        assert_eq!(a.dominator, None);
        // A keeps B, the array and the four objects below it alive, B once
        assert_eq!(a.retained_size, object + object + array + 4 * object);
        let b = sizes.record(0x101).unwrap().unwrap();
        assert_eq!(b.dominator, Some(0x100));
        // 0x104 is also held directly by A
        assert_eq!(b.retained_size, object + array + 3 * object);
        assert_eq!(sizes.record(0x104).unwrap().unwrap().dominator, Some(0x100));
        assert_eq!(sizes.record(0x107).unwrap(), None);
        assert!(matches!(sizes.record(0x999), Err(HeapError::NoSuchInstance(0x999))));
        assert_eq!(sizes.top_level(), vec![0x100]);
        let mut below_a = sizes.dominated_by(0x100).unwrap();
        below_a.sort();
        assert_eq!(below_a, vec![0x101, 0x104]);
    }

    #[test]
    fn test_monotonicity_and_lower_bound() {
        let heap = scenario();
        let sizes = converged(&heap, RootSet::objects([0x100, 0x109, 0x107]));
        for record in sizes.records() {
            assert!(record.retained_size >= record.shallow_size);
            let children: u64 = sizes
                .dominated_by(record.id)
                .unwrap()
                .iter()
                .map(|c| sizes.retained_size(*c).unwrap().unwrap())
                .sum();
            assert_eq!(record.retained_size, record.shallow_size + children);
        }
        let reachable = sanity_trace(&heap, &[0x100, 0x109, 0x107]).unwrap();
        assert_eq!(sizes.reachable_count(), reachable);
        assert_eq!(sizes.records().count(), reachable);
        // 0x107 also holds A, so only the root set dominates it
        assert_eq!(sizes.record(0x100).unwrap().unwrap().dominator, None);
        assert_eq!(sizes.record(0x100).unwrap().unwrap().id, 0x100);
    }

    #[test]
    fn test_unknown_root_object() {
        let heap = scenario();
        assert!(matches!(
            heap.retained_sizes(
                RootSet::objects([0x12345]),
                Arc::new(NoProgress),
                CancelToken::new()
            ),
            Err(HeapError::NoSuchInstance(0x12345))
        ));
    }
}
