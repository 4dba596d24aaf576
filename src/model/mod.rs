//! Flyweight class and instance views.
//!
//! Views are a heap reference plus a table position. They hold no data of
//! their own, so they are cheap to create and can be thrown away after each
//! query.

mod details;
mod reference;

pub(crate) use details::compute_details;
pub use reference::{Direction, Reference, ReferenceKind, References};

use crate::error::Result;
use crate::heapdump::HeapDump;
use crate::hprof::{BasicType, Cursor, HeapRecord, Value};
use crate::index::{ClassData, ClassIdx, FieldDescriptor, NodeIdx, NodeKind};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A decoded instance or static field
#[derive(Clone, Debug, PartialEq)]
pub struct FieldValue {
    pub name: Arc<str>,
    pub value: Value,
}

/// One slot of an object array
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArrayItem {
    pub index: u32,
    /// `None` for a null slot
    pub target: Option<u64>,
}

#[derive(Clone, Copy)]
pub struct ClassInfo<'h> {
    heap: &'h HeapDump,
    idx: ClassIdx,
}

impl<'h> ClassInfo<'h> {
    pub(crate) fn new(heap: &'h HeapDump, idx: ClassIdx) -> Self {
        ClassInfo { heap, idx }
    }

    pub(crate) fn idx(&self) -> ClassIdx {
        self.idx
    }

    fn data(&self) -> &'h ClassData {
        self.heap.index().class(self.idx)
    }

    pub fn id(&self) -> u64 {
        self.data().id
    }

    pub fn name(&self) -> &'h str {
        &self.data().name
    }

    pub fn super_id(&self) -> Option<u64> {
        self.data().super_id
    }

    pub fn superclass(&self) -> Option<ClassInfo<'h>> {
        self.data()
            .super_idx
            .map(|idx| ClassInfo::new(self.heap, idx))
    }

    pub fn subclasses(&self) -> Vec<ClassInfo<'h>> {
        let heap = self.heap;
        heap.index()
            .classes
            .iter()
            .enumerate()
            .filter(|(_, c)| c.super_idx == Some(self.idx))
            .map(|(i, _)| ClassInfo::new(heap, i as ClassIdx))
            .collect()
    }

    pub fn loader_id(&self) -> u64 {
        self.data().loader_id
    }

    /// Fields declared by this class, without inherited ones
    pub fn declared_fields(&self) -> &'h [FieldDescriptor] {
        let data = self.data();
        &data.layout[..data.declared]
    }

    /// Every instance field in instance data order, inherited ones last
    pub fn field_layout(&self) -> &'h [FieldDescriptor] {
        &self.data().layout
    }

    /// Bytes of field data each instance carries
    pub fn instance_data_size(&self) -> u32 {
        self.data().layout_size
    }

    pub fn static_fields(&self) -> impl Iterator<Item = FieldValue> + 'h {
        self.data().statics.iter().map(|s| FieldValue {
            name: s.name.clone(),
            value: s.value,
        })
    }

    pub fn static_field(&self, name: &str) -> Option<Value> {
        self.data()
            .statics
            .iter()
            .find(|s| &*s.name == name)
            .map(|s| s.value)
    }

    pub fn instance_count(&self) -> u64 {
        self.data().instance_count
    }

    pub fn total_shallow_size(&self) -> u64 {
        self.data().total_shallow
    }

    pub fn is_array(&self) -> bool {
        self.name().ends_with("[]")
    }

    /// Made up by the index for primitive arrays whose class was not dumped
    pub fn is_synthetic(&self) -> bool {
        self.data().synthetic
    }

    /// Instances of exactly this class, in id order
    pub fn instances(&self) -> Instances<'h> {
        Instances {
            heap: self.heap,
            nodes: self.heap.index().class_instances.get(self.idx as usize),
            pos: 0,
        }
    }

    /// The class object itself, when the dump has it
    pub fn object(&self) -> Option<Instance<'h>> {
        self.data().node.map(|n| Instance::new(self.heap, n))
    }
}

impl PartialEq for ClassInfo<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for ClassInfo<'_> {}

impl Hash for ClassInfo<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state)
    }
}

impl fmt::Debug for ClassInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@0x{:x}", self.name(), self.id())
    }
}

/// Restartable walk over the instances of one class
#[derive(Clone)]
pub struct Instances<'h> {
    heap: &'h HeapDump,
    nodes: &'h [u32],
    pos: usize,
}

impl<'h> Iterator for Instances<'h> {
    type Item = Instance<'h>;

    fn next(&mut self) -> Option<Instance<'h>> {
        let node = *self.nodes.get(self.pos)?;
        self.pos += 1;
        Some(Instance::new(self.heap, node))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.nodes.len() - self.pos;
        (left, Some(left))
    }

    fn nth(&mut self, n: usize) -> Option<Instance<'h>> {
        self.pos = self.pos.saturating_add(n).min(self.nodes.len());
        self.next()
    }
}

impl ExactSizeIterator for Instances<'_> {}

#[derive(Clone, Copy)]
pub struct Instance<'h> {
    heap: &'h HeapDump,
    node: NodeIdx,
}

impl<'h> Instance<'h> {
    pub(crate) fn new(heap: &'h HeapDump, node: NodeIdx) -> Self {
        Instance { heap, node }
    }

    pub(crate) fn node(&self) -> NodeIdx {
        self.node
    }

    pub fn heap(&self) -> &'h HeapDump {
        self.heap
    }

    pub fn id(&self) -> u64 {
        self.heap.index().nodes.ids[self.node as usize]
    }

    pub fn kind(&self) -> NodeKind {
        self.heap.index().nodes.kinds[self.node as usize]
    }

    /// Offset of the instance's sub-record in the dump
    pub fn offset(&self) -> u64 {
        self.heap.index().nodes.offsets[self.node as usize]
    }

    pub fn shallow_size(&self) -> u64 {
        self.heap.index().nodes.sizes[self.node as usize]
    }

    fn own_class(&self) -> ClassIdx {
        self.heap.index().nodes.classes[self.node as usize]
    }

    /// The instance's class. Class objects report `java.lang.Class` when
    /// the dump has it, or else the class they describe.
    pub fn class(&self) -> ClassInfo<'h> {
        let index = self.heap.index();
        let idx = match (self.kind(), index.java_lang_class) {
            (NodeKind::Class, Some(c)) => c,
            _ => self.own_class(),
        };
        ClassInfo::new(self.heap, idx)
    }

    /// The class this class object describes
    pub fn as_class(&self) -> Option<ClassInfo<'h>> {
        (self.kind() == NodeKind::Class).then(|| ClassInfo::new(self.heap, self.own_class()))
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind(), NodeKind::ObjectArray | NodeKind::PrimitiveArray)
    }

    /// Re-read this instance's record from the dump
    pub fn record(&self) -> Result<HeapRecord<'h>> {
        self.heap.index().record(self.heap.data(), self.node)
    }

    pub fn array_length(&self) -> Result<Option<u32>> {
        Ok(match self.record()? {
            HeapRecord::ObjectArray { length, .. } | HeapRecord::PrimitiveArray { length, .. } => {
                Some(length)
            }
            _ => None,
        })
    }

    /// Decoded field values. Class objects report their static fields,
    /// arrays have none.
    pub fn fields(&self) -> Result<Vec<FieldValue>> {
        match self.kind() {
            NodeKind::Class => Ok(ClassInfo::new(self.heap, self.own_class())
                .static_fields()
                .collect()),
            NodeKind::Object => {
                let HeapRecord::Instance { data, .. } = self.record()? else {
                    return Ok(vec![]);
                };
                let layout = ClassInfo::new(self.heap, self.own_class()).field_layout();
                let mut c = Cursor::new(data, 0, self.heap.id_size());
                layout
                    .iter()
                    .map(|f| {
                        Ok(FieldValue {
                            name: f.name.clone(),
                            value: c.value(f.ty)?,
                        })
                    })
                    .collect()
            }
            NodeKind::ObjectArray | NodeKind::PrimitiveArray => Ok(vec![]),
        }
    }

    /// Value of the first field called `name`. Subclass fields shadow
    /// superclass fields of the same name.
    pub fn field(&self, name: &str) -> Result<Option<Value>> {
        if self.kind() == NodeKind::Class {
            return Ok(ClassInfo::new(self.heap, self.own_class()).static_field(name));
        }
        let layout = ClassInfo::new(self.heap, self.own_class()).field_layout();
        let Some(slot) = layout.iter().find(|f| &*f.name == name) else {
            return Ok(None);
        };
        let HeapRecord::Instance { data, .. } = self.record()? else {
            return Ok(None);
        };
        let mut c = Cursor::new(data, slot.offset as usize, self.heap.id_size());
        Ok(Some(c.value(slot.ty)?))
    }

    /// Referenced instance of an object field
    pub fn field_instance(&self, name: &str) -> Result<Option<Instance<'h>>> {
        Ok(self
            .field(name)?
            .and_then(|v| v.as_object())
            .and_then(|id| self.heap.instance(id).ok()))
    }

    /// Slots of an object array; empty for anything else
    pub fn items(&self) -> Result<Vec<ArrayItem>> {
        let HeapRecord::ObjectArray { elements, .. } = self.record()? else {
            return Ok(vec![]);
        };
        let mut c = Cursor::new(elements, 0, self.heap.id_size());
        let mut items = Vec::with_capacity(elements.len() / self.heap.id_size() as usize);
        let mut index = 0;
        while !c.is_empty() {
            let id = c.id()?;
            items.push(ArrayItem {
                index,
                target: (id != 0).then_some(id),
            });
            index += 1;
        }
        Ok(items)
    }

    /// Elements of a primitive array; empty for anything else
    pub fn primitive_values(&self) -> Result<Vec<Value>> {
        let HeapRecord::PrimitiveArray { element, data, .. } = self.record()? else {
            return Ok(vec![]);
        };
        let mut c = Cursor::new(data, 0, self.heap.id_size());
        let mut values = Vec::with_capacity(data.len() / element.size(self.heap.id_size()));
        while !c.is_empty() {
            values.push(c.value(element)?);
        }
        Ok(values)
    }

    /// Element type of a primitive array
    pub fn element_type(&self) -> Option<BasicType> {
        match self.record() {
            Ok(HeapRecord::PrimitiveArray { element, .. }) => Some(element),
            _ => None,
        }
    }

    pub fn references(&self, direction: Direction) -> References<'h> {
        References::new(self.heap, self.node, direction)
    }

    pub fn outgoing(&self) -> References<'h> {
        self.references(Direction::Outgoing)
    }

    pub fn incoming(&self) -> References<'h> {
        self.references(Direction::Incoming)
    }

    pub fn details(&self) -> Result<Option<String>> {
        self.heap.details(self.id())
    }
}

impl PartialEq for Instance<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Instance<'_> {}

impl Hash for Instance<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state)
    }
}

impl fmt::Debug for Instance<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#0x{:x}", self.class().name(), self.id())
    }
}
