use super::{tag, BasicType, Cursor, Value, MAGIC_PREFIX, SUPPORTED_VERSIONS};
use crate::error::{Corruption, HeapError, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DumpHeader {
    pub version: String,
    pub id_size: u8,
    pub timestamp: u64,
    /// Offset of the first top-level record
    pub records_start: usize,
}

/// Why an object is a GC root, with the thread context where the dump has one
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RootKind {
    Unknown,
    JniGlobal,
    JniLocal { thread_serial: u32, frame: u32 },
    JavaFrame { thread_serial: u32, frame: u32 },
    NativeStack { thread_serial: u32 },
    StickyClass,
    ThreadBlock { thread_serial: u32 },
    MonitorUsed,
    ThreadObject { thread_serial: u32, stack_serial: u32 },
}

impl RootKind {
    pub fn name(&self) -> &'static str {
        match self {
            RootKind::Unknown => "unknown",
            RootKind::JniGlobal => "JNI global",
            RootKind::JniLocal { .. } => "JNI local",
            RootKind::JavaFrame { .. } => "Java frame",
            RootKind::NativeStack { .. } => "native stack",
            RootKind::StickyClass => "sticky class",
            RootKind::ThreadBlock { .. } => "thread block",
            RootKind::MonitorUsed => "monitor used",
            RootKind::ThreadObject { .. } => "thread object",
        }
    }

    /// The thread this root belongs to, for thread-local roots
    pub fn thread_serial(&self) -> Option<u32> {
        match *self {
            RootKind::JniLocal { thread_serial, .. }
            | RootKind::JavaFrame { thread_serial, .. }
            | RootKind::NativeStack { thread_serial }
            | RootKind::ThreadBlock { thread_serial }
            | RootKind::ThreadObject { thread_serial, .. } => Some(thread_serial),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldDecl {
    pub name_id: u64,
    pub ty: BasicType,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StaticField {
    pub name_id: u64,
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClassDump {
    pub offset: u64,
    pub id: u64,
    pub super_id: u64,
    pub loader_id: u64,
    pub instance_size: u32,
    pub statics: Vec<StaticField>,
    pub fields: Vec<FieldDecl>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackFrameRecord {
    pub id: u64,
    pub method_name_id: u64,
    pub signature_id: u64,
    pub source_file_id: u64,
    pub class_serial: u32,
    pub line: i32,
}

/// A heap dump sub-record. `offset` always points at the sub-record tag.
#[derive(Clone, Debug, PartialEq)]
pub enum HeapRecord<'a> {
    GcRoot {
        kind: RootKind,
        object_id: u64,
    },
    Class(ClassDump),
    Instance {
        offset: u64,
        id: u64,
        class_id: u64,
        data: &'a [u8],
    },
    ObjectArray {
        offset: u64,
        id: u64,
        class_id: u64,
        length: u32,
        elements: &'a [u8],
    },
    PrimitiveArray {
        offset: u64,
        id: u64,
        element: BasicType,
        length: u32,
        data: &'a [u8],
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Record<'a> {
    Utf8 {
        id: u64,
        text: &'a [u8],
    },
    LoadClass {
        serial: u32,
        class_id: u64,
        name_id: u64,
    },
    StackFrame(StackFrameRecord),
    StackTrace {
        serial: u32,
        thread_serial: u32,
        frames: Vec<u64>,
    },
    StartThread {
        serial: u32,
        object_id: u64,
        stack_serial: u32,
        name_id: u64,
    },
    Heap(HeapRecord<'a>),
    HeapDumpEnd,
}

/// Consumer of the record stream
pub trait RecordSink<'a> {
    fn record(&mut self, record: Record<'a>) -> Result<()>;
}

impl<'a, F> RecordSink<'a> for F
where
    F: FnMut(Record<'a>) -> Result<()>,
{
    fn record(&mut self, record: Record<'a>) -> Result<()> {
        self(record)
    }
}

/// Sequential reader over a whole dump held in memory or mapped from disk
pub struct DumpReader<'a> {
    data: &'a [u8],
    header: DumpHeader,
}

impl<'a> DumpReader<'a> {
    const MAX_MAGIC: usize = 64;

    pub fn open(data: &'a [u8]) -> Result<DumpReader<'a>> {
        let header = Self::read_header(data)?;
        Ok(DumpReader { data, header })
    }

    fn read_header(data: &[u8]) -> Result<DumpHeader> {
        let head = &data[..data.len().min(Self::MAX_MAGIC)];
        let Some(nul) = head.iter().position(|b| *b == 0) else {
            let common = head.len().min(MAGIC_PREFIX.len());
            if head.len() < Self::MAX_MAGIC && head[..common] == MAGIC_PREFIX[..common] {
                return Err(HeapError::corrupt(
                    head.len() as u64,
                    Corruption::Truncated {
                        needed: 1,
                        available: 0,
                    },
                ));
            }
            return Err(HeapError::corrupt(0, Corruption::BadMagic));
        };
        let magic = &data[..nul];
        if !magic.starts_with(MAGIC_PREFIX) {
            return Err(HeapError::corrupt(0, Corruption::BadMagic));
        }
        let version = String::from_utf8_lossy(&magic[MAGIC_PREFIX.len()..]).into_owned();
        if !SUPPORTED_VERSIONS.contains(&version.as_str()) {
            return Err(HeapError::UnsupportedVersion { found: version });
        }
        let mut c = Cursor::new(data, nul + 1, 8);
        let id_size = c.u32()?;
        if id_size != 4 && id_size != 8 {
            return Err(HeapError::corrupt(
                (nul + 1) as u64,
                Corruption::InvalidIdSize(id_size),
            ));
        }
        let timestamp = c.u64()?;
        Ok(DumpHeader {
            version,
            id_size: id_size as u8,
            timestamp,
            records_start: c.pos(),
        })
    }

    pub fn header(&self) -> &DumpHeader {
        &self.header
    }

    pub fn id_size(&self) -> u8 {
        self.header.id_size
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Stream every record of the dump to `sink`, in dump order.
    ///
    /// Unknown top-level records are skipped. Sub-records have no length
    /// prefix, so an unknown sub-record ends the read with an error.
    pub fn read_records<S: RecordSink<'a>>(&self, sink: &mut S) -> Result<()> {
        let mut c = Cursor::new(self.data, self.header.records_start, self.id_size());
        let mut skipped = 0;
        while !c.is_empty() {
            let record_offset = c.pos();
            let record_tag = c.u8()?;
            let _time = c.u32()?;
            let length = c.u32()? as usize;
            if length > c.remaining() {
                return Err(HeapError::corrupt(
                    record_offset as u64,
                    Corruption::Truncated {
                        needed: length as u64,
                        available: c.remaining() as u64,
                    },
                ));
            }
            let body_end = c.pos() + length;
            let mut body = c.window(body_end);
            match record_tag {
                tag::UTF8 => {
                    let id = body.id()?;
                    let text = body.bytes(body.remaining())?;
                    sink.record(Record::Utf8 { id, text })?;
                }
                tag::LOAD_CLASS => {
                    let serial = body.u32()?;
                    let class_id = body.id()?;
                    let _stack_serial = body.u32()?;
                    let name_id = body.id()?;
                    sink.record(Record::LoadClass {
                        serial,
                        class_id,
                        name_id,
                    })?;
                }
                tag::STACK_FRAME => {
                    let frame = StackFrameRecord {
                        id: body.id()?,
                        method_name_id: body.id()?,
                        signature_id: body.id()?,
                        source_file_id: body.id()?,
                        class_serial: body.u32()?,
                        line: body.u32()? as i32,
                    };
                    sink.record(Record::StackFrame(frame))?;
                }
                tag::STACK_TRACE => {
                    let serial = body.u32()?;
                    let thread_serial = body.u32()?;
                    let count = body.u32()? as usize;
                    let mut frames = Vec::with_capacity(count.min(body.remaining()));
                    for _ in 0..count {
                        frames.push(body.id()?);
                    }
                    sink.record(Record::StackTrace {
                        serial,
                        thread_serial,
                        frames,
                    })?;
                }
                tag::START_THREAD => {
                    let serial = body.u32()?;
                    let object_id = body.id()?;
                    let stack_serial = body.u32()?;
                    let name_id = body.id()?;
                    sink.record(Record::StartThread {
                        serial,
                        object_id,
                        stack_serial,
                        name_id,
                    })?;
                }
                tag::HEAP_DUMP | tag::HEAP_DUMP_SEGMENT => {
                    while !body.is_empty() {
                        let record = read_heap_record(&mut body)?;
                        sink.record(Record::Heap(record))?;
                    }
                }
                tag::HEAP_DUMP_END => sink.record(Record::HeapDumpEnd)?,
                other => {
                    debug!(
                        "Skipping unknown record tag 0x{:x} at offset {} ({} bytes)",
                        other, record_offset, length
                    );
                    skipped += 1;
                }
            }
            c.skip(body_end - c.pos())?;
        }
        if skipped > 0 {
            info!("Skipped {} records with unknown tags", skipped);
        }
        Ok(())
    }

    /// Re-read the heap sub-record starting at `offset`
    pub fn read_heap_record_at(&self, offset: u64) -> Result<HeapRecord<'a>> {
        read_heap_record_at(self.data, offset, self.id_size())
    }
}

pub(crate) fn read_heap_record_at(data: &[u8], offset: u64, id_size: u8) -> Result<HeapRecord<'_>> {
    let mut c = Cursor::new(data, offset as usize, id_size);
    read_heap_record(&mut c)
}

pub(crate) fn read_heap_record<'a>(c: &mut Cursor<'a>) -> Result<HeapRecord<'a>> {
    let offset = c.pos() as u64;
    let sub_tag = c.u8()?;
    let id_size = c.id_size() as usize;
    let record = match sub_tag {
        tag::ROOT_UNKNOWN => HeapRecord::GcRoot {
            object_id: c.id()?,
            kind: RootKind::Unknown,
        },
        tag::ROOT_JNI_GLOBAL => {
            let object_id = c.id()?;
            let _global_ref = c.id()?;
            HeapRecord::GcRoot {
                object_id,
                kind: RootKind::JniGlobal,
            }
        }
        tag::ROOT_JNI_LOCAL | tag::ROOT_JAVA_FRAME => {
            let object_id = c.id()?;
            let thread_serial = c.u32()?;
            let frame = c.u32()?;
            let kind = if sub_tag == tag::ROOT_JNI_LOCAL {
                RootKind::JniLocal {
                    thread_serial,
                    frame,
                }
            } else {
                RootKind::JavaFrame {
                    thread_serial,
                    frame,
                }
            };
            HeapRecord::GcRoot { object_id, kind }
        }
        tag::ROOT_NATIVE_STACK | tag::ROOT_THREAD_BLOCK => {
            let object_id = c.id()?;
            let thread_serial = c.u32()?;
            let kind = if sub_tag == tag::ROOT_NATIVE_STACK {
                RootKind::NativeStack { thread_serial }
            } else {
                RootKind::ThreadBlock { thread_serial }
            };
            HeapRecord::GcRoot { object_id, kind }
        }
        tag::ROOT_STICKY_CLASS => HeapRecord::GcRoot {
            object_id: c.id()?,
            kind: RootKind::StickyClass,
        },
        tag::ROOT_MONITOR_USED => HeapRecord::GcRoot {
            object_id: c.id()?,
            kind: RootKind::MonitorUsed,
        },
        tag::ROOT_THREAD_OBJECT => {
            let object_id = c.id()?;
            let thread_serial = c.u32()?;
            let stack_serial = c.u32()?;
            HeapRecord::GcRoot {
                object_id,
                kind: RootKind::ThreadObject {
                    thread_serial,
                    stack_serial,
                },
            }
        }
        tag::CLASS_DUMP => HeapRecord::Class(read_class_dump(c, offset)?),
        tag::INSTANCE_DUMP => {
            let id = c.id()?;
            let _stack_serial = c.u32()?;
            let class_id = c.id()?;
            let length = c.u32()? as usize;
            HeapRecord::Instance {
                offset,
                id,
                class_id,
                data: c.bytes(length)?,
            }
        }
        tag::OBJ_ARRAY_DUMP => {
            let id = c.id()?;
            let _stack_serial = c.u32()?;
            let length = c.u32()?;
            let class_id = c.id()?;
            let elements = c.bytes(length as usize * id_size)?;
            HeapRecord::ObjectArray {
                offset,
                id,
                class_id,
                length,
                elements,
            }
        }
        tag::PRIM_ARRAY_DUMP => {
            let id = c.id()?;
            let _stack_serial = c.u32()?;
            let length = c.u32()?;
            let element = c.basic_type()?;
            let data = c.bytes(length as usize * element.size(c.id_size()))?;
            HeapRecord::PrimitiveArray {
                offset,
                id,
                element,
                length,
                data,
            }
        }
        other => {
            return Err(HeapError::corrupt(
                offset,
                Corruption::UnknownSubRecord(other),
            ))
        }
    };
    Ok(record)
}

fn read_class_dump(c: &mut Cursor<'_>, offset: u64) -> Result<ClassDump> {
    let id = c.id()?;
    let _stack_serial = c.u32()?;
    let super_id = c.id()?;
    let loader_id = c.id()?;
    // signers, protection domain and two reserved ids
    for _ in 0..4 {
        c.id()?;
    }
    let instance_size = c.u32()?;
    let constant_pool = c.u16()?;
    for _ in 0..constant_pool {
        let _index = c.u16()?;
        let ty = c.basic_type()?;
        c.value(ty)?;
    }
    let static_count = c.u16()?;
    let mut statics = Vec::with_capacity(static_count as usize);
    for _ in 0..static_count {
        let name_id = c.id()?;
        let ty = c.basic_type()?;
        statics.push(StaticField {
            name_id,
            value: c.value(ty)?,
        });
    }
    let field_count = c.u16()?;
    let mut fields = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        let name_id = c.id()?;
        fields.push(FieldDecl {
            name_id,
            ty: c.basic_type()?,
        });
    }
    Ok(ClassDump {
        offset,
        id,
        super_id,
        loader_id,
        instance_size,
        statics,
        fields,
    })
}
