use crate::cache::{Cache, MemoryPressure};
use crate::config::HeapConfig;
use crate::dominator::{self, DominatorTree, Flight, RetainedSizeJob, RetainedSizes, RootSet};
use crate::error::{HeapError, Result};
use crate::hprof::{DumpHeader, DumpReader, RootKind};
use crate::index::{self, ClassIdx, HeapIndex, StackFrame};
use crate::model::{compute_details, ClassInfo, Direction, Instance, Instances, References};
use crate::util::progress::{CancelToken, ProgressSink};
use crate::util::{read_zst, DumpBytes, MappedFile};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Where the dump bytes come from
pub enum ByteSource {
    /// Memory-mapped, or decompressed into memory when the name ends in `.zst`
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl From<Vec<u8>> for ByteSource {
    fn from(bytes: Vec<u8>) -> Self {
        ByteSource::Bytes(bytes)
    }
}

impl From<&Path> for ByteSource {
    fn from(p: &Path) -> Self {
        ByteSource::Path(p.to_path_buf())
    }
}

impl From<PathBuf> for ByteSource {
    fn from(p: PathBuf) -> Self {
        ByteSource::Path(p)
    }
}

fn io_error(e: anyhow::Error) -> HeapError {
    match e.downcast::<std::io::Error>() {
        Ok(io) => HeapError::Io(io),
        Err(e) => HeapError::Io(std::io::Error::new(std::io::ErrorKind::Other, format!("{:#}", e))),
    }
}

impl ByteSource {
    fn open(self) -> Result<DumpBytes> {
        match self {
            ByteSource::Path(p) => {
                if p.extension().map_or(false, |e| e == "zst") {
                    info!("Decompressing {}", p.display());
                    Ok(DumpBytes::Owned(read_zst(&p).map_err(io_error)?))
                } else {
                    info!("Mapping {}", p.display());
                    Ok(DumpBytes::Mapped(MappedFile::open(&p).map_err(io_error)?))
                }
            }
            ByteSource::Bytes(v) => Ok(DumpBytes::Owned(v)),
        }
    }
}

/// A GC root and the object it anchors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GcRoot {
    pub kind: RootKind,
    pub object_id: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadInfo {
    pub serial: u32,
    pub object_id: u64,
    pub name: Option<String>,
    /// Innermost frame first
    pub frames: Vec<StackFrame>,
}

pub(crate) struct HeapInner {
    pub(crate) index: HeapIndex,
    pub(crate) data: DumpBytes,
    pub(crate) config: HeapConfig,
    class_names: Cache<String, Option<ClassIdx>>,
    details: Cache<u64, Option<Arc<str>>>,
    pub(crate) retained: Cache<RootSet, Arc<DominatorTree>>,
    pub(crate) flights: Mutex<HashMap<RootSet, Arc<Flight>>>,
}

/// A loaded, immutable heap dump. Clones share the same tables.
#[derive(Clone)]
pub struct HeapDump {
    pub(crate) inner: Arc<HeapInner>,
}

/// Parse and index a whole dump.
///
/// Blocks until the index is complete. Nothing is returned unless every
/// record parsed.
pub fn load_heap(source: impl Into<ByteSource>, config: HeapConfig) -> Result<HeapDump> {
    let start = Instant::now();
    let data = source.into().open()?;
    let index = {
        let reader = DumpReader::open(&data)?;
        info!(
            "Loading {} byte heap dump, version {}, {} byte ids",
            data.len(),
            reader.header().version,
            reader.id_size()
        );
        index::build(&reader, &config)?
    };
    info!(
        "Loaded {} objects of {} classes in {} ms",
        index.node_count(),
        index.classes.len(),
        start.elapsed().as_micros() as f64 / 1000f64
    );
    Ok(HeapDump {
        inner: Arc::new(HeapInner {
            class_names: Cache::soft(config.class_cache_capacity),
            details: Cache::weak(config.details_cache_capacity),
            retained: Cache::strong(),
            flights: Mutex::new(HashMap::new()),
            index,
            data,
            config,
        }),
    })
}

impl HeapDump {
    pub(crate) fn index(&self) -> &HeapIndex {
        &self.inner.index
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.inner.data
    }

    pub fn header(&self) -> &DumpHeader {
        &self.inner.index.header
    }

    pub fn id_size(&self) -> u8 {
        self.inner.index.id_size()
    }

    pub fn config(&self) -> &HeapConfig {
        &self.inner.config
    }

    /// Give up this handle. The mapping and tables are released once the
    /// last clone (including running retained size jobs) is gone.
    pub fn close(self) {
        if Arc::strong_count(&self.inner) == 1 {
            debug!("Closing heap dump, releasing {} bytes", self.inner.data.len());
        }
    }

    /// Every object in the dump, class objects included
    pub fn object_count(&self) -> usize {
        self.index().node_count()
    }

    /// All classes, in id order
    pub fn classes(&self) -> impl ExactSizeIterator<Item = ClassInfo<'_>> + '_ {
        let mut order: Vec<ClassIdx> = (0..self.index().classes.len() as ClassIdx).collect();
        order.sort_by_key(|c| self.index().class(*c).id);
        order.into_iter().map(move |c| ClassInfo::new(self, c))
    }

    pub fn class(&self, id: u64) -> Result<ClassInfo<'_>> {
        self.index()
            .class_by_id
            .get(&id)
            .map(|idx| ClassInfo::new(self, *idx))
            .ok_or(HeapError::NoSuchClass(id))
    }

    /// Look a class up by its Java name (`java.util.HashMap`, `int[]`).
    ///
    /// With several classes of that name (different loaders) the one with
    /// the lowest id wins.
    pub fn class_by_name(&self, name: &str) -> Option<ClassInfo<'_>> {
        let found = self.inner.class_names.get_or_insert_with(&name.to_string(), |name| {
            let index = self.index();
            (0..index.classes.len() as ClassIdx)
                .filter(|c| index.class(*c).name == *name)
                .min_by_key(|c| index.class(*c).id)
        });
        found.map(|idx| ClassInfo::new(self, idx))
    }

    /// Instances of exactly this class, in id order
    pub fn instances(&self, class_id: u64) -> Result<Instances<'_>> {
        Ok(self.class(class_id)?.instances())
    }

    pub fn instance(&self, id: u64) -> Result<Instance<'_>> {
        self.index()
            .nodes
            .lookup(id)
            .map(|n| Instance::new(self, n))
            .ok_or(HeapError::NoSuchInstance(id))
    }

    pub fn references<'h>(&'h self, instance: &Instance<'h>, direction: Direction) -> References<'h> {
        instance.references(direction)
    }

    /// GC roots that point at objects in the dump, in dump order
    pub fn gc_roots(&self) -> impl ExactSizeIterator<Item = GcRoot> + '_ {
        let index = self.index();
        index.roots.iter().map(move |r| GcRoot {
            kind: r.kind,
            object_id: index.nodes.ids[r.node as usize],
        })
    }

    pub fn threads(&self) -> Vec<ThreadInfo> {
        let index = self.index();
        index
            .threads
            .iter()
            .map(|t| ThreadInfo {
                serial: t.serial,
                object_id: t.object_id,
                name: t.name.clone().or_else(|| self.thread_name(t.object_id)),
                frames: index
                    .stack_traces
                    .get(&t.stack_serial)
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect()
    }

    /// Name from the `name` field of the `java.lang.Thread` object
    fn thread_name(&self, object_id: u64) -> Option<String> {
        let thread = self.instance(object_id).ok()?;
        let name = thread.field_instance("name").ok()??;
        self.details(name.id()).ok()?
    }

    /// Roots held by one thread: its locals, JNI locals and the thread
    /// object itself
    pub fn thread_local_roots(&self, thread_serial: u32) -> Vec<GcRoot> {
        self.gc_roots()
            .filter(|r| r.kind.thread_serial() == Some(thread_serial))
            .collect()
    }

    /// Short description of an instance (a string's text, a boxed value,
    /// an array length). Memoised.
    pub fn details(&self, id: u64) -> Result<Option<String>> {
        let instance = self.instance(id)?;
        let details = self
            .inner
            .details
            .get_or_try_insert_with(&id, |_| Ok::<_, HeapError>(compute_details(&instance)?.map(Arc::from)))?;
        Ok(details.map(|d| d.to_string()))
    }

    /// Start, or join, the retained size computation for `roots`.
    ///
    /// The result is kept for the lifetime of the dump, so later requests
    /// finish immediately.
    pub fn retained_sizes(
        &self,
        roots: RootSet,
        sink: Arc<dyn ProgressSink>,
        cancel: CancelToken,
    ) -> Result<RetainedSizeJob> {
        let cap = self.inner.config.max_dominator_iterations;
        dominator::start(self, roots, cap, sink, cancel)
    }

    /// Like [`HeapDump::retained_sizes`] with an explicit sweep limit
    pub fn retained_sizes_capped(
        &self,
        roots: RootSet,
        max_iterations: Option<u32>,
        sink: Arc<dyn ProgressSink>,
        cancel: CancelToken,
    ) -> Result<RetainedSizeJob> {
        dominator::start(self, roots, max_iterations, sink, cancel)
    }

    /// Already computed retained sizes, without starting anything
    pub fn cached_retained_sizes(&self, roots: &RootSet) -> Option<RetainedSizes> {
        self.inner
            .retained
            .peek(roots)
            .map(|tree| RetainedSizes::new(self.clone(), tree))
    }

    /// Drop memoised views in response to host memory pressure
    pub fn release_memory(&self, pressure: MemoryPressure) -> usize {
        self.inner.details.release_memory(pressure) + self.inner.class_names.release_memory(pressure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hprof::writer::TestHeap;
    use crate::hprof::{BasicType, Value};
    use std::io::Write;

    fn small() -> TestHeap {
        let mut h = TestHeap::new();
        h.class(0x20, "x/Item", TestHeap::OBJECT, &[("id", BasicType::Int)]);
        for i in 0..10 {
            h.object(0x100 + i, 0x20, &[Value::Int(i as i32)]);
        }
        h.root(0x100);
        h.sticky_class(0x20);
        h
    }

    #[test]
    fn test_load_from_bytes_and_file() {
        let _ = env_logger::builder().is_test(true).try_init();
        let bytes = small().bytes();
        let heap = load_heap(bytes.clone(), HeapConfig::default()).unwrap();
        assert_eq!(heap.object_count(), 12);
        assert_eq!(heap.header().id_size, 8);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        let mapped = load_heap(file.path(), HeapConfig::default()).unwrap();
        assert_eq!(mapped.object_count(), 12);
        mapped.close();

        let zst = tempfile::Builder::new().suffix(".zst").tempfile().unwrap();
        std::fs::write(zst.path(), zstd::encode_all(&bytes[..], 3).unwrap()).unwrap();
        let decompressed = load_heap(zst.path(), HeapConfig::default()).unwrap();
        assert_eq!(decompressed.class(0x20).unwrap().instance_count(), 10);
    }

    #[test]
    fn test_truncated_dump_fails() {
        let mut bytes = small().bytes();
        bytes.truncate(bytes.len() / 2);
        match load_heap(bytes, HeapConfig::default()) {
            Err(HeapError::CorruptDump { .. }) => {}
            other => panic!("unexpected {:?}", other.err()),
        }
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            load_heap(Path::new("/nonexistent/dump.hprof"), HeapConfig::default()),
            Err(HeapError::Io(_))
        ));
    }

    #[test]
    fn test_one_past_last_id() {
        let heap = load_heap(small().bytes(), HeapConfig::default()).unwrap();
        assert!(heap.instance(0x109).is_ok());
        assert!(matches!(heap.instance(0x10a), Err(HeapError::NoSuchInstance(0x10a))));
    }

    #[test]
    fn test_four_byte_identifiers() {
        use crate::dominator::RootSet;
        use crate::util::progress::{CancelToken, NoProgress};
        use crate::ReverseIndexMode;

        let mut h = TestHeap::with_id_size(4);
        h.class(0x20, "f/Pair", TestHeap::OBJECT, &[("other", BasicType::Object)]);
        h.class(0x40, "[Lf/Pair;", TestHeap::OBJECT, &[]);
        h.object(0x100, 0x20, &[Value::Object(0x101)]);
        h.object(0x101, 0x20, &[Value::Object(0x100)]);
        h.object_array(0x200, 0x40, &[0x101, 0]);
        h.root(0x100);
        let bytes = h.bytes();

        for mode in [ReverseIndexMode::Eager, ReverseIndexMode::Lazy { window: 1 }] {
            let heap = load_heap(bytes.clone(), HeapConfig::default().reverse_index(mode)).unwrap();
            assert_eq!(heap.id_size(), 4);
            // 8 byte header and one 4 byte reference
            assert_eq!(heap.instance(0x100).unwrap().shallow_size(), 12);
            // 12 byte array header and two 4 byte slots
            assert_eq!(heap.instance(0x200).unwrap().shallow_size(), 20);

            let targets = |id: u64, direction: Direction| -> Vec<u64> {
                let mut ids: Vec<u64> = heap
                    .instance(id)
                    .unwrap()
                    .references(direction)
                    .map(|r| r.unwrap().other(direction))
                    .collect();
                ids.sort();
                ids
            };
            assert_eq!(targets(0x100, Direction::Outgoing), vec![0x101]);
            assert_eq!(targets(0x200, Direction::Outgoing), vec![0x101]);
            assert_eq!(targets(0x101, Direction::Incoming), vec![0x100, 0x200]);
            assert_eq!(targets(0x100, Direction::Incoming), vec![0x101]);

            let sizes = heap
                .retained_sizes(RootSet::GcRoots, Arc::new(NoProgress), CancelToken::new())
                .unwrap()
                .wait()
                .unwrap();
            assert_eq!(sizes.retained_size(0x100).unwrap(), Some(24));
            assert_eq!(sizes.retained_size(0x200).unwrap(), None);
        }
    }

    #[test]
    fn test_gc_roots_and_classes() {
        let heap = load_heap(small().bytes(), HeapConfig::default()).unwrap();
        let roots: Vec<GcRoot> = heap.gc_roots().collect();
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0].object_id, 0x100);
        assert_eq!(roots[1].kind, RootKind::StickyClass);
        let names: Vec<&str> = heap.classes().map(|c| c.name()).collect();
        assert_eq!(names, vec!["java.lang.Object", "x.Item"]);
        assert_eq!(heap.class_by_name("x.Item").unwrap().id(), 0x20);
        assert!(heap.class_by_name("x.Missing").is_none());
        let ids: Vec<u64> = heap.instances(0x20).unwrap().map(|i| i.id()).collect();
        assert_eq!(ids.len(), 10);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_threads() {
        let mut h = TestHeap::new();
        h.class(0x20, "java/lang/Thread", TestHeap::OBJECT, &[]);
        h.object(0x100, 0x20, &[]);
        h.object(0x101, TestHeap::OBJECT, &[]);
        let main = h.string("main");
        let method = h.string("run");
        let source = h.string("Main.java");
        h.w.stack_frame(0x900, method, source, 42);
        h.w.stack_trace(7, 1, &[0x900]);
        h.w.start_thread(1, 0x100, 7, main);
        h.w.root_thread_object(0x100, 1, 7);
        h.w.root_java_frame(0x101, 1, 0);
        h.w.root_java_frame(0x101, 2, 0);
        let heap = load_heap(h.bytes(), HeapConfig::default()).unwrap();
        let threads = heap.threads();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].name.as_deref(), Some("main"));
        assert_eq!(threads[0].frames.len(), 1);
        assert_eq!(threads[0].frames[0].method, "run");
        assert_eq!(threads[0].frames[0].source_file, "Main.java");
        assert_eq!(threads[0].frames[0].line, 42);
        let local: Vec<u64> = heap.thread_local_roots(1).iter().map(|r| r.object_id).collect();
        assert_eq!(local, vec![0x100, 0x101]);
    }

    #[test]
    fn test_concurrent_enumeration_is_deterministic() {
        let mut h = TestHeap::new();
        h.class(0x20, "x/Many", TestHeap::OBJECT, &[]);
        for i in 0..50_000u64 {
            h.object(0x1000 + i * 2, 0x20, &[]);
        }
        let heap = load_heap(h.bytes(), HeapConfig::default()).unwrap();
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let heap = heap.clone();
                std::thread::spawn(move || {
                    heap.instances(0x20)
                        .unwrap()
                        .map(|i| i.id())
                        .collect::<Vec<u64>>()
                })
            })
            .collect();
        let results: Vec<Vec<u64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0].len(), 50_000);
        assert_eq!(results[0], results[1]);
    }
}
