use crate::error::Result;
use crate::heapdump::HeapDump;
use crate::index::{EdgeSlot, HeapIndex, LazyReferrers, NodeIdx};
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Fields and array items of the instance
    Outgoing,
    /// Instances whose fields or items hold the instance
    Incoming,
}

/// Where the reference is held in the referrer
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    Field(Arc<str>),
    ArrayItem(u32),
    Static(Arc<str>),
}

/// A directed edge `referrer → referent`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Reference {
    pub referrer: u64,
    pub referent: u64,
    pub kind: ReferenceKind,
}

impl Reference {
    /// The end of the edge that is not the instance it was queried from
    pub fn other(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Outgoing => self.referent,
            Direction::Incoming => self.referrer,
        }
    }
}

fn slot_kind(index: &HeapIndex, referrer: NodeIdx, slot: EdgeSlot) -> ReferenceKind {
    let class = index.class(index.nodes.classes[referrer as usize]);
    match slot {
        EdgeSlot::Field(i) => ReferenceKind::Field(class.layout[i as usize].name.clone()),
        EdgeSlot::Static(i) => ReferenceKind::Static(class.statics[i as usize].name.clone()),
        EdgeSlot::ArrayItem(i) => ReferenceKind::ArrayItem(i),
    }
}

enum Referrers<'h> {
    Indexed(std::slice::Iter<'h, u32>),
    Scan(LazyReferrers<'h>),
}

impl Iterator for Referrers<'_> {
    type Item = Result<NodeIdx>;

    fn next(&mut self) -> Option<Result<NodeIdx>> {
        match self {
            Referrers::Indexed(it) => it.next().map(|n| Ok(*n)),
            Referrers::Scan(scan) => scan.next(),
        }
    }
}

/// Lazy sequence of the references of one instance.
///
/// Outgoing references are read from the instance's own record on the
/// first call. Incoming references walk the referrer index (or scan the
/// dump when it is built lazily) one referrer at a time. A referrer that
/// holds the instance in several slots yields one reference per slot.
pub struct References<'h> {
    heap: &'h HeapDump,
    node: NodeIdx,
    direction: Direction,
    buffered: VecDeque<Reference>,
    referrers: Option<Referrers<'h>>,
    done: bool,
}

impl<'h> References<'h> {
    pub(crate) fn new(heap: &'h HeapDump, node: NodeIdx, direction: Direction) -> Self {
        References {
            heap,
            node,
            direction,
            buffered: VecDeque::new(),
            referrers: None,
            done: false,
        }
    }

    fn fill_outgoing(&mut self) -> Result<()> {
        let index = self.heap.index();
        let referrer = index.nodes.ids[self.node as usize];
        let mut out = VecDeque::new();
        index.for_each_edge(self.heap.data(), self.node, |target, slot| {
            out.push_back(Reference {
                referrer,
                referent: index.nodes.ids[target as usize],
                kind: slot_kind(index, self.node, slot),
            })
        })?;
        self.buffered = out;
        Ok(())
    }

    fn start_incoming(&self) -> Referrers<'h> {
        let heap = self.heap;
        let index = heap.index();
        match &index.reverse {
            Some(reverse) => Referrers::Indexed(reverse.get(self.node as usize).iter()),
            None => Referrers::Scan(LazyReferrers::new(
                index,
                heap.data(),
                self.node,
                heap.config().lazy_window(),
            )),
        }
    }

    /// Queue the slots of `referrer` that point at this instance
    fn fill_from(&mut self, referrer: NodeIdx) -> Result<()> {
        let index = self.heap.index();
        let referrer_id = index.nodes.ids[referrer as usize];
        let referent = index.nodes.ids[self.node as usize];
        let target = self.node;
        let buffered = &mut self.buffered;
        index.for_each_edge(self.heap.data(), referrer, |t, slot| {
            if t == target {
                buffered.push_back(Reference {
                    referrer: referrer_id,
                    referent,
                    kind: slot_kind(index, referrer, slot),
                })
            }
        })
    }
}

impl Iterator for References<'_> {
    type Item = Result<Reference>;

    fn next(&mut self) -> Option<Result<Reference>> {
        loop {
            if let Some(r) = self.buffered.pop_front() {
                return Some(Ok(r));
            }
            if self.done {
                return None;
            }
            match self.direction {
                Direction::Outgoing => {
                    self.done = true;
                    if let Err(e) = self.fill_outgoing() {
                        return Some(Err(e));
                    }
                }
                Direction::Incoming => {
                    if self.referrers.is_none() {
                        self.referrers = Some(self.start_incoming());
                    }
                    let next = self.referrers.as_mut().and_then(|r| r.next());
                    match next {
                        None => self.done = true,
                        Some(Err(e)) => {
                            self.done = true;
                            return Some(Err(e));
                        }
                        Some(Ok(referrer)) => {
                            if let Err(e) = self.fill_from(referrer) {
                                self.done = true;
                                return Some(Err(e));
                            }
                        }
                    }
                }
            }
        }
    }
}
