//! Dense tables built once per dump.
//!
//! Every object in the dump, including class objects, gets a node number:
//! its position in the id-sorted node table. All graph algorithms work on
//! node numbers; ids only appear at the API boundary.

mod builder;
mod reverse;

pub(crate) use builder::build;
pub(crate) use reverse::{Csr, LazyReferrers};

use crate::error::{Corruption, HeapError, Result};
use crate::hprof::{read_heap_record_at, BasicType, DumpHeader, HeapRecord, RootKind, Value};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) type NodeIdx = u32;
pub(crate) type ClassIdx = u32;

#[repr(u8)]
#[derive(Hash, PartialEq, Eq, Clone, Copy, Debug)]
pub enum NodeKind {
    Object = 0,
    ObjectArray = 1,
    PrimitiveArray = 2,
    Class = 3,
}

/// Struct-of-arrays table of every node, sorted by id
#[derive(Default)]
pub(crate) struct NodeTable {
    pub(crate) ids: Vec<u64>,
    pub(crate) offsets: Vec<u64>,
    pub(crate) classes: Vec<ClassIdx>,
    pub(crate) sizes: Vec<u64>,
    pub(crate) kinds: Vec<NodeKind>,
}

impl NodeTable {
    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }

    pub(crate) fn lookup(&self, id: u64) -> Option<NodeIdx> {
        self.ids.binary_search(&id).ok().map(|i| i as NodeIdx)
    }
}

/// One slot of a class's instance layout, inherited fields included
#[derive(Clone, Debug, PartialEq)]
pub struct FieldDescriptor {
    pub name: Arc<str>,
    pub ty: BasicType,
    /// Byte offset into the instance field data
    pub offset: u32,
}

#[derive(Clone, Debug)]
pub(crate) struct StaticValue {
    pub(crate) name: Arc<str>,
    pub(crate) value: Value,
}

pub(crate) struct ClassData {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) super_idx: Option<ClassIdx>,
    pub(crate) super_id: Option<u64>,
    pub(crate) loader_id: u64,
    /// Number of layout slots declared by this class itself
    pub(crate) declared: usize,
    /// Own fields first, then the superclass's, matching instance data order
    pub(crate) layout: Arc<[FieldDescriptor]>,
    pub(crate) layout_size: u32,
    pub(crate) statics: Vec<StaticValue>,
    pub(crate) node: Option<NodeIdx>,
    pub(crate) synthetic: bool,
    pub(crate) instance_count: u64,
    pub(crate) total_shallow: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RootEntry {
    pub(crate) kind: RootKind,
    pub(crate) node: NodeIdx,
}

#[derive(Clone, Debug)]
pub(crate) struct ThreadEntry {
    pub(crate) serial: u32,
    pub(crate) object_id: u64,
    pub(crate) stack_serial: u32,
    pub(crate) name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackFrame {
    pub method: String,
    pub signature: String,
    pub source_file: String,
    pub class_name: Option<String>,
    pub line: i32,
}

/// Where an outgoing reference lives inside its referrer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum EdgeSlot {
    /// Index into the referrer class layout
    Field(u32),
    ArrayItem(u32),
    /// Index into the class's static values
    Static(u32),
}

pub(crate) struct HeapIndex {
    pub(crate) header: DumpHeader,
    pub(crate) nodes: NodeTable,
    pub(crate) classes: Vec<ClassData>,
    pub(crate) class_by_id: HashMap<u64, ClassIdx>,
    pub(crate) class_instances: Csr,
    pub(crate) roots: Vec<RootEntry>,
    pub(crate) reverse: Option<Csr>,
    pub(crate) threads: Vec<ThreadEntry>,
    pub(crate) stack_traces: HashMap<u32, Vec<StackFrame>>,
    pub(crate) java_lang_class: Option<ClassIdx>,
}

impl HeapIndex {
    pub(crate) fn id_size(&self) -> u8 {
        self.header.id_size
    }

    pub(crate) fn object_header_size(&self) -> u64 {
        2 * self.id_size() as u64
    }

    pub(crate) fn array_header_size(&self) -> u64 {
        self.object_header_size() + 4
    }

    pub(crate) fn class(&self, idx: ClassIdx) -> &ClassData {
        &self.classes[idx as usize]
    }

    pub(crate) fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn record<'a>(&self, data: &'a [u8], node: NodeIdx) -> Result<HeapRecord<'a>> {
        read_heap_record_at(data, self.nodes.offsets[node as usize], self.id_size())
    }

    /// Visit every outgoing reference of `node` whose target is in the dump.
    ///
    /// Null slots and references to objects missing from the dump are
    /// skipped.
    pub(crate) fn for_each_edge<F>(&self, data: &[u8], node: NodeIdx, mut f: F) -> Result<()>
    where
        F: FnMut(NodeIdx, EdgeSlot),
    {
        let n = node as usize;
        match self.nodes.kinds[n] {
            NodeKind::PrimitiveArray => Ok(()),
            NodeKind::Class => {
                let class = self.class(self.nodes.classes[n]);
                for (i, s) in class.statics.iter().enumerate() {
                    if let Some(target) = s.value.as_object().and_then(|id| self.resolve(id)) {
                        f(target, EdgeSlot::Static(i as u32));
                    }
                }
                Ok(())
            }
            NodeKind::Object => {
                let HeapRecord::Instance { data: fields, id, .. } = self.record(data, node)? else {
                    return Err(self.mismatch(node));
                };
                let class = self.class(self.nodes.classes[n]);
                let id_size = self.id_size() as usize;
                for (i, slot) in class.layout.iter().enumerate() {
                    if slot.ty != BasicType::Object {
                        continue;
                    }
                    let at = slot.offset as usize;
                    let Some(raw) = fields.get(at..at + id_size) else {
                        return Err(HeapError::corrupt(
                            self.nodes.offsets[n],
                            Corruption::FieldOverrun { instance: id },
                        ));
                    };
                    if let Some(target) = self.resolve(read_id(raw)) {
                        f(target, EdgeSlot::Field(i as u32));
                    }
                }
                Ok(())
            }
            NodeKind::ObjectArray => {
                let HeapRecord::ObjectArray { elements, .. } = self.record(data, node)? else {
                    return Err(self.mismatch(node));
                };
                for (i, raw) in elements.chunks_exact(self.id_size() as usize).enumerate() {
                    if let Some(target) = self.resolve(read_id(raw)) {
                        f(target, EdgeSlot::ArrayItem(i as u32));
                    }
                }
                Ok(())
            }
        }
    }

    /// Outgoing targets of a node, collected
    pub(crate) fn successors(&self, data: &[u8], node: NodeIdx) -> Result<SmallVec<[NodeIdx; 8]>> {
        let mut out = SmallVec::new();
        self.for_each_edge(data, node, |t, _| out.push(t))?;
        Ok(out)
    }

    fn resolve(&self, id: u64) -> Option<NodeIdx> {
        if id == 0 {
            return None;
        }
        let found = self.nodes.lookup(id);
        if found.is_none() {
            trace!("Dangling reference to 0x{:x}", id);
        }
        found
    }

    fn mismatch(&self, node: NodeIdx) -> HeapError {
        HeapError::corrupt(
            self.nodes.offsets[node as usize],
            Corruption::UnexpectedRecord,
        )
    }
}

pub(crate) fn read_id(raw: &[u8]) -> u64 {
    raw.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_id() {
        assert_eq!(read_id(&[0, 0, 1, 2]), 0x102);
        assert_eq!(read_id(&[1, 0, 0, 0, 0, 0, 0, 2]), 0x0100_0000_0000_0002);
    }
}
