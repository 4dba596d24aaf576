use super::reverse::build_reverse;
use super::*;
use crate::config::{HeapConfig, ReverseIndexMode};
use crate::hprof::{java_class_name, ClassDump, DumpReader, Record, StackFrameRecord};
use std::time::Instant;

/// Id given to a primitive array class the dump never declared
const SYNTHETIC_CLASS_BASE: u64 = u64::MAX - 0xff;

#[derive(Clone, Copy)]
enum RawClass {
    Id(u64),
    Primitive(BasicType),
    /// A class object; its own dump
    Itself,
}

struct RawNode {
    id: u64,
    offset: u64,
    class: RawClass,
    size: u64,
    kind: NodeKind,
}

struct RawThread {
    serial: u32,
    object_id: u64,
    stack_serial: u32,
    name_id: u64,
}

/// Everything gathered by the sequential first pass
#[derive(Default)]
struct Pass1<'a> {
    id_size: u8,
    strings: HashMap<u64, &'a [u8]>,
    class_names: HashMap<u64, u64>,
    class_serials: HashMap<u32, u64>,
    class_dumps: Vec<ClassDump>,
    nodes: Vec<RawNode>,
    roots: Vec<(RootKind, u64)>,
    threads: Vec<RawThread>,
    traces: HashMap<u32, (u32, Vec<u64>)>,
    frames: HashMap<u64, StackFrameRecord>,
    primitives_seen: Vec<BasicType>,
}

impl<'a> Pass1<'a> {
    fn object_header(&self) -> u64 {
        2 * self.id_size as u64
    }

    fn on_record(&mut self, record: Record<'a>) -> Result<()> {
        match record {
            Record::Utf8 { id, text } => {
                self.strings.insert(id, text);
            }
            Record::LoadClass {
                serial,
                class_id,
                name_id,
            } => {
                self.class_names.insert(class_id, name_id);
                self.class_serials.insert(serial, class_id);
            }
            Record::StackFrame(frame) => {
                self.frames.insert(frame.id, frame);
            }
            Record::StackTrace {
                serial,
                thread_serial,
                frames,
            } => {
                self.traces.insert(serial, (thread_serial, frames));
            }
            Record::StartThread {
                serial,
                object_id,
                stack_serial,
                name_id,
            } => self.threads.push(RawThread {
                serial,
                object_id,
                stack_serial,
                name_id,
            }),
            Record::Heap(h) => self.on_heap_record(h),
            Record::HeapDumpEnd => {}
        }
        Ok(())
    }

    fn on_heap_record(&mut self, record: HeapRecord<'a>) {
        let header = self.object_header();
        let id_size = self.id_size as u64;
        match record {
            HeapRecord::GcRoot { kind, object_id } => self.roots.push((kind, object_id)),
            HeapRecord::Class(dump) => {
                let statics: u64 = dump
                    .statics
                    .iter()
                    .map(|s| s.value.basic_type().size(self.id_size) as u64)
                    .sum();
                self.nodes.push(RawNode {
                    id: dump.id,
                    offset: dump.offset,
                    class: RawClass::Itself,
                    size: header + statics,
                    kind: NodeKind::Class,
                });
                self.class_dumps.push(dump);
            }
            HeapRecord::Instance {
                offset,
                id,
                class_id,
                data,
            } => self.nodes.push(RawNode {
                id,
                offset,
                class: RawClass::Id(class_id),
                size: header + data.len() as u64,
                kind: NodeKind::Object,
            }),
            HeapRecord::ObjectArray {
                offset,
                id,
                class_id,
                length,
                ..
            } => self.nodes.push(RawNode {
                id,
                offset,
                class: RawClass::Id(class_id),
                size: header + 4 + length as u64 * id_size,
                kind: NodeKind::ObjectArray,
            }),
            HeapRecord::PrimitiveArray {
                offset,
                id,
                element,
                data,
                ..
            } => {
                if !self.primitives_seen.contains(&element) {
                    self.primitives_seen.push(element);
                }
                self.nodes.push(RawNode {
                    id,
                    offset,
                    class: RawClass::Primitive(element),
                    size: header + 4 + data.len() as u64,
                    kind: NodeKind::PrimitiveArray,
                })
            }
        }
    }

    fn string(&self, id: u64) -> Option<String> {
        self.strings
            .get(&id)
            .map(|s| String::from_utf8_lossy(s).into_owned())
    }
}

struct Interner<'p, 'a> {
    pass: &'p Pass1<'a>,
    names: HashMap<u64, Arc<str>>,
}

impl<'p, 'a> Interner<'p, 'a> {
    fn get(&mut self, id: u64) -> Arc<str> {
        let pass = self.pass;
        self.names
            .entry(id)
            .or_insert_with(|| match pass.string(id) {
                Some(s) => Arc::from(s),
                None => Arc::from(format!("<field 0x{:x}>", id)),
            })
            .clone()
    }
}

/// Read the whole dump once and build every table.
///
/// Not cancellable: a partial index is useless.
pub(crate) fn build<'a>(reader: &DumpReader<'a>, config: &HeapConfig) -> Result<HeapIndex> {
    let start = Instant::now();
    let mut pass = Pass1 {
        id_size: reader.id_size(),
        ..Default::default()
    };
    reader.read_records(&mut |r: Record<'a>| pass.on_record(r))?;
    info!(
        "Read {} heap objects and {} classes in {} ms",
        pass.nodes.len(),
        pass.class_dumps.len(),
        start.elapsed().as_micros() as f64 / 1000f64
    );

    let start = Instant::now();
    let mut index = assemble(reader, pass)?;
    info!(
        "Indexed {} nodes in {} ms",
        index.node_count(),
        start.elapsed().as_micros() as f64 / 1000f64
    );

    if config.reverse_index == ReverseIndexMode::Eager {
        let start = Instant::now();
        let reverse = build_reverse(&index, reader.data(), config.index_threads)?;
        info!(
            "Built reverse index ({} referrers) with {} threads in {} ms",
            reverse.total(),
            config.index_threads,
            start.elapsed().as_micros() as f64 / 1000f64
        );
        index.reverse = Some(reverse);
    }
    Ok(index)
}

fn assemble(reader: &DumpReader<'_>, mut pass: Pass1<'_>) -> Result<HeapIndex> {
    let id_size = pass.id_size;
    let object_header = pass.object_header();
    let mut class_dumps = std::mem::take(&mut pass.class_dumps);
    class_dumps.sort_by_key(|c| c.id);
    class_dumps.dedup_by_key(|c| c.id);
    let mut raw_nodes = std::mem::take(&mut pass.nodes);

    let mut interner = Interner {
        pass: &pass,
        names: HashMap::new(),
    };

    let mut classes: Vec<ClassData> = Vec::with_capacity(class_dumps.len());
    let mut own_fields: Vec<Vec<(Arc<str>, BasicType)>> = Vec::with_capacity(class_dumps.len());
    for dump in &class_dumps {
        let name = pass
            .class_names
            .get(&dump.id)
            .and_then(|n| pass.string(*n))
            .map(|n| java_class_name(&n))
            .unwrap_or_else(|| format!("<class 0x{:x}>", dump.id));
        let statics = dump
            .statics
            .iter()
            .map(|s| StaticValue {
                name: interner.get(s.name_id),
                value: s.value,
            })
            .collect();
        own_fields.push(
            dump.fields
                .iter()
                .map(|f| (interner.get(f.name_id), f.ty))
                .collect(),
        );
        classes.push(ClassData {
            id: dump.id,
            name,
            super_idx: None,
            super_id: (dump.super_id != 0).then_some(dump.super_id),
            loader_id: dump.loader_id,
            declared: dump.fields.len(),
            layout: Arc::from(Vec::new()),
            layout_size: 0,
            statics,
            node: None,
            synthetic: false,
            instance_count: 0,
            total_shallow: 0,
        });
    }

    // Primitive arrays name no class in the dump, find or invent one
    let object_class = classes.iter().position(|c| c.name == "java.lang.Object");
    let mut primitive_classes: HashMap<BasicType, ClassIdx> = HashMap::new();
    for ty in pass.primitives_seen.clone() {
        let name = format!("{}[]", ty.java_name());
        let idx = match classes.iter().position(|c| c.name == name) {
            Some(i) => i,
            None => {
                debug!("Synthesising class {} for primitive arrays", name);
                classes.push(ClassData {
                    id: SYNTHETIC_CLASS_BASE + ty as u64,
                    name,
                    super_idx: None,
                    super_id: object_class.map(|o| class_dumps[o].id),
                    loader_id: 0,
                    declared: 0,
                    layout: Arc::from(Vec::new()),
                    layout_size: 0,
                    statics: vec![],
                    node: None,
                    synthetic: true,
                    instance_count: 0,
                    total_shallow: 0,
                });
                own_fields.push(vec![]);
                classes.len() - 1
            }
        };
        primitive_classes.insert(ty, idx as ClassIdx);
    }

    let class_by_id: HashMap<u64, ClassIdx> = classes
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id, i as ClassIdx))
        .collect();
    for c in classes.iter_mut() {
        if let Some(s) = c.super_id {
            c.super_idx = class_by_id.get(&s).copied();
            if c.super_idx.is_none() {
                warn!("Superclass 0x{:x} of {} is not in the dump", s, c.name);
            }
        }
    }
    compute_layouts(&mut classes, &own_fields, id_size);

    // Node table, sorted by id
    if !raw_nodes.windows(2).all(|w| w[0].id < w[1].id) {
        debug!("Object ids are not in dump order, sorting");
        raw_nodes.sort_by_key(|n| n.id);
        let before = raw_nodes.len();
        raw_nodes.dedup_by_key(|n| n.id);
        if raw_nodes.len() != before {
            warn!("Dropped {} duplicate object ids", before - raw_nodes.len());
        }
    }
    let mut nodes = NodeTable::default();
    let n = raw_nodes.len();
    nodes.ids.reserve_exact(n);
    nodes.offsets.reserve_exact(n);
    nodes.classes.reserve_exact(n);
    nodes.sizes.reserve_exact(n);
    nodes.kinds.reserve_exact(n);
    for (i, raw) in raw_nodes.iter().enumerate() {
        let class = match raw.class {
            RawClass::Itself => class_by_id[&raw.id],
            RawClass::Primitive(ty) => primitive_classes[&ty],
            RawClass::Id(id) => match class_by_id.get(&id) {
                Some(c) => *c,
                None => {
                    return Err(HeapError::corrupt(raw.offset, Corruption::MissingClass(id)))
                }
            },
        };
        let data = &mut classes[class as usize];
        match raw.kind {
            NodeKind::Class => data.node = Some(i as NodeIdx),
            NodeKind::Object => {
                if raw.size - object_header < data.layout_size as u64 {
                    return Err(HeapError::corrupt(
                        raw.offset,
                        Corruption::FieldOverrun { instance: raw.id },
                    ));
                }
                data.instance_count += 1;
                data.total_shallow += raw.size;
            }
            NodeKind::ObjectArray | NodeKind::PrimitiveArray => {
                data.instance_count += 1;
                data.total_shallow += raw.size;
            }
        }
        nodes.ids.push(raw.id);
        nodes.offsets.push(raw.offset);
        nodes.classes.push(class);
        nodes.sizes.push(raw.size);
        nodes.kinds.push(raw.kind);
    }
    drop(raw_nodes);

    let counts: Vec<u64> = classes.iter().map(|c| c.instance_count).collect();
    let class_instances = Csr::from_counts(&counts, |push| {
        for i in 0..n {
            if nodes.kinds[i] != NodeKind::Class {
                push(nodes.classes[i] as usize, i as u32);
            }
        }
    });

    let mut roots = Vec::with_capacity(pass.roots.len());
    let mut unresolved_roots = 0;
    for (kind, id) in &pass.roots {
        match nodes.lookup(*id) {
            Some(node) => roots.push(RootEntry { kind: *kind, node }),
            None => unresolved_roots += 1,
        }
    }
    if unresolved_roots > 0 {
        debug!("{} GC roots point outside the dump", unresolved_roots);
    }

    let threads = pass
        .threads
        .iter()
        .map(|t| ThreadEntry {
            serial: t.serial,
            object_id: t.object_id,
            stack_serial: t.stack_serial,
            name: pass.string(t.name_id),
        })
        .collect();

    let mut stack_traces = HashMap::new();
    for (serial, (_thread, frame_ids)) in &pass.traces {
        let frames = frame_ids
            .iter()
            .filter_map(|f| pass.frames.get(f))
            .map(|f| StackFrame {
                method: pass.string(f.method_name_id).unwrap_or_default(),
                signature: pass.string(f.signature_id).unwrap_or_default(),
                source_file: pass.string(f.source_file_id).unwrap_or_default(),
                class_name: pass
                    .class_serials
                    .get(&f.class_serial)
                    .and_then(|id| class_by_id.get(id))
                    .map(|c| classes[*c as usize].name.clone()),
                line: f.line,
            })
            .collect();
        stack_traces.insert(*serial, frames);
    }

    let java_lang_class = classes
        .iter()
        .position(|c| c.name == "java.lang.Class")
        .map(|i| i as ClassIdx);

    Ok(HeapIndex {
        header: reader.header().clone(),
        nodes,
        classes,
        class_by_id,
        class_instances,
        roots,
        reverse: None,
        threads,
        stack_traces,
        java_lang_class,
    })
}

/// Flatten each class's fields with its superclasses' into one layout
fn compute_layouts(classes: &mut [ClassData], own: &[Vec<(Arc<str>, BasicType)>], id_size: u8) {
    for i in 0..classes.len() {
        let mut layout = vec![];
        let mut offset = 0u32;
        let mut cursor = Some(i);
        let mut depth = 0;
        while let Some(c) = cursor {
            depth += 1;
            if depth > classes.len() {
                warn!("Superclass cycle through {}", classes[i].name);
                break;
            }
            for (name, ty) in &own[c] {
                layout.push(FieldDescriptor {
                    name: name.clone(),
                    ty: *ty,
                    offset,
                });
                offset += ty.size(id_size) as u32;
            }
            cursor = classes[c].super_idx.map(|s| s as usize);
        }
        classes[i].layout = Arc::from(layout);
        classes[i].layout_size = offset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hprof::writer::TestHeap;
    use crate::hprof::Value;

    fn index_of(bytes: &[u8]) -> Result<HeapIndex> {
        let reader = DumpReader::open(bytes)?;
        build(&reader, &HeapConfig::default().index_threads(2))
    }

    #[test]
    fn test_layout_includes_superclass_fields() {
        let mut h = TestHeap::new();
        h.class(0x20, "a/Base", TestHeap::OBJECT, &[("x", BasicType::Int)]);
        h.class(0x30, "a/Derived", 0x20, &[("next", BasicType::Object), ("b", BasicType::Byte)]);
        h.object(0x100, 0x30, &[Value::Object(0), Value::Byte(1), Value::Int(5)]);
        let index = index_of(&h.bytes()).unwrap();
        let derived = index.class(index.class_by_id[&0x30]);
        assert_eq!(derived.name, "a.Derived");
        let names: Vec<&str> = derived.layout.iter().map(|f| &*f.name).collect();
        assert_eq!(names, vec!["next", "b", "x"]);
        let offsets: Vec<u32> = derived.layout.iter().map(|f| f.offset).collect();
        assert_eq!(offsets, vec![0, 8, 9]);
        assert_eq!(derived.layout_size, 13);
        assert_eq!(derived.instance_count, 1);
        assert_eq!(derived.total_shallow, 16 + 13);
    }

    #[test]
    fn test_nodes_sorted_and_classes_are_nodes() {
        let mut h = TestHeap::new();
        h.class(0x20, "a/A", TestHeap::OBJECT, &[]);
        h.object(0x300, 0x20, &[]);
        h.object(0x200, 0x20, &[]);
        let index = index_of(&h.bytes()).unwrap();
        assert_eq!(index.nodes.ids, vec![0x10, 0x20, 0x200, 0x300]);
        let a = index.class_by_id[&0x20];
        let instances: Vec<u64> = index
            .class_instances
            .get(a as usize)
            .iter()
            .map(|n| index.nodes.ids[*n as usize])
            .collect();
        assert_eq!(instances, vec![0x200, 0x300]);
        assert_eq!(index.class(a).node, Some(1));
    }

    #[test]
    fn test_primitive_array_class_is_synthesised() {
        let mut h = TestHeap::new();
        h.prim_array(0x100, BasicType::Int, &[Value::Int(1), Value::Int(2)]);
        let index = index_of(&h.bytes()).unwrap();
        let node = index.nodes.lookup(0x100).unwrap();
        let class = index.class(index.nodes.classes[node as usize]);
        assert_eq!(class.name, "int[]");
        assert!(class.synthetic);
        assert_eq!(index.nodes.sizes[node as usize], 16 + 4 + 8);
    }

    #[test]
    fn test_missing_class_is_corrupt() {
        let mut h = TestHeap::new();
        h.object(0x100, 0x999, &[]);
        assert!(matches!(
            index_of(&h.bytes()),
            Err(HeapError::CorruptDump {
                kind: Corruption::MissingClass(0x999),
                ..
            })
        ));
    }

    #[test]
    fn test_short_instance_is_corrupt() {
        let mut h = TestHeap::new();
        h.class(0x20, "a/A", TestHeap::OBJECT, &[("x", BasicType::Long)]);
        h.object(0x100, 0x20, &[Value::Int(1)]);
        assert!(matches!(
            index_of(&h.bytes()),
            Err(HeapError::CorruptDump {
                kind: Corruption::FieldOverrun { instance: 0x100 },
                ..
            })
        ));
    }

    #[test]
    fn test_reverse_index_dedups_referrers() {
        let mut h = TestHeap::new();
        h.class(
            0x20,
            "a/Pair",
            TestHeap::OBJECT,
            &[("l", BasicType::Object), ("r", BasicType::Object)],
        );
        h.class(0x30, "a/Leaf", TestHeap::OBJECT, &[]);
        h.object(0x100, 0x20, &[Value::Object(0x200), Value::Object(0x200)]);
        h.object(0x200, 0x30, &[]);
        h.object(0x300, 0x20, &[Value::Object(0x200), Value::Object(0xdead)]);
        let index = index_of(&h.bytes()).unwrap();
        let reverse = index.reverse.as_ref().unwrap();
        let leaf = index.nodes.lookup(0x200).unwrap();
        let referrers: Vec<u64> = reverse
            .get(leaf as usize)
            .iter()
            .map(|n| index.nodes.ids[*n as usize])
            .collect();
        assert_eq!(referrers, vec![0x100, 0x300]);
    }
}
