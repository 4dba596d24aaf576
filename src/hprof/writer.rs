//! Synthesises HPROF dumps for tests.

use super::{tag, BasicType, Value};

pub(crate) struct HprofWriter {
    id_size: u8,
    records: Vec<u8>,
    segment: Vec<u8>,
}

impl HprofWriter {
    pub(crate) fn new(id_size: u8) -> Self {
        HprofWriter {
            id_size,
            records: vec![],
            segment: vec![],
        }
    }

    fn put_id(buf: &mut Vec<u8>, id_size: u8, id: u64) {
        if id_size == 4 {
            buf.extend_from_slice(&(id as u32).to_be_bytes());
        } else {
            buf.extend_from_slice(&id.to_be_bytes());
        }
    }

    pub(crate) fn encode_value(&self, buf: &mut Vec<u8>, v: Value) {
        match v {
            Value::Object(id) => Self::put_id(buf, self.id_size, id),
            Value::Boolean(b) => buf.push(b as u8),
            Value::Char(c) => buf.extend_from_slice(&c.to_be_bytes()),
            Value::Float(f) => buf.extend_from_slice(&f.to_bits().to_be_bytes()),
            Value::Double(d) => buf.extend_from_slice(&d.to_bits().to_be_bytes()),
            Value::Byte(b) => buf.push(b as u8),
            Value::Short(s) => buf.extend_from_slice(&s.to_be_bytes()),
            Value::Int(i) => buf.extend_from_slice(&i.to_be_bytes()),
            Value::Long(l) => buf.extend_from_slice(&l.to_be_bytes()),
        }
    }

    pub(crate) fn encode_values(&self, values: &[Value]) -> Vec<u8> {
        let mut buf = vec![];
        for v in values {
            self.encode_value(&mut buf, *v);
        }
        buf
    }

    pub(crate) fn raw_record(&mut self, record_tag: u8, body: &[u8]) {
        self.records.push(record_tag);
        self.records.extend_from_slice(&0u32.to_be_bytes());
        self.records
            .extend_from_slice(&(body.len() as u32).to_be_bytes());
        self.records.extend_from_slice(body);
    }

    pub(crate) fn raw_sub_record(&mut self, bytes: &[u8]) {
        self.segment.extend_from_slice(bytes);
    }

    pub(crate) fn utf8(&mut self, id: u64, text: &str) {
        let mut body = vec![];
        Self::put_id(&mut body, self.id_size, id);
        body.extend_from_slice(text.as_bytes());
        self.raw_record(tag::UTF8, &body);
    }

    pub(crate) fn load_class(&mut self, serial: u32, class_id: u64, name_id: u64) {
        let mut body = serial.to_be_bytes().to_vec();
        Self::put_id(&mut body, self.id_size, class_id);
        body.extend_from_slice(&0u32.to_be_bytes());
        Self::put_id(&mut body, self.id_size, name_id);
        self.raw_record(tag::LOAD_CLASS, &body);
    }

    pub(crate) fn stack_frame(&mut self, id: u64, method_id: u64, source_id: u64, line: i32) {
        let mut body = vec![];
        for x in [id, method_id, 0, source_id] {
            Self::put_id(&mut body, self.id_size, x);
        }
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(&line.to_be_bytes());
        self.raw_record(tag::STACK_FRAME, &body);
    }

    pub(crate) fn stack_trace(&mut self, serial: u32, thread_serial: u32, frames: &[u64]) {
        let mut body = serial.to_be_bytes().to_vec();
        body.extend_from_slice(&thread_serial.to_be_bytes());
        body.extend_from_slice(&(frames.len() as u32).to_be_bytes());
        for f in frames {
            Self::put_id(&mut body, self.id_size, *f);
        }
        self.raw_record(tag::STACK_TRACE, &body);
    }

    pub(crate) fn start_thread(&mut self, serial: u32, object_id: u64, stack_serial: u32, name_id: u64) {
        let mut body = serial.to_be_bytes().to_vec();
        Self::put_id(&mut body, self.id_size, object_id);
        body.extend_from_slice(&stack_serial.to_be_bytes());
        for x in [name_id, 0, 0] {
            Self::put_id(&mut body, self.id_size, x);
        }
        self.raw_record(tag::START_THREAD, &body);
    }

    pub(crate) fn class_dump(
        &mut self,
        id: u64,
        super_id: u64,
        statics: &[(u64, Value)],
        fields: &[(u64, BasicType)],
    ) {
        let id_size = self.id_size;
        let mut b = vec![tag::CLASS_DUMP];
        Self::put_id(&mut b, id_size, id);
        b.extend_from_slice(&0u32.to_be_bytes());
        Self::put_id(&mut b, id_size, super_id);
        for _ in 0..5 {
            Self::put_id(&mut b, id_size, 0);
        }
        let instance_size: usize = fields.iter().map(|(_, t)| t.size(id_size)).sum();
        b.extend_from_slice(&(instance_size as u32).to_be_bytes());
        b.extend_from_slice(&0u16.to_be_bytes());
        b.extend_from_slice(&(statics.len() as u16).to_be_bytes());
        for (name, value) in statics {
            Self::put_id(&mut b, id_size, *name);
            b.push(value.basic_type() as u8);
            self.encode_value(&mut b, *value);
        }
        b.extend_from_slice(&(fields.len() as u16).to_be_bytes());
        for (name, ty) in fields {
            Self::put_id(&mut b, id_size, *name);
            b.push(*ty as u8);
        }
        self.segment.extend_from_slice(&b);
    }

    pub(crate) fn instance(&mut self, id: u64, class_id: u64, data: &[u8]) {
        let mut b = vec![tag::INSTANCE_DUMP];
        Self::put_id(&mut b, self.id_size, id);
        b.extend_from_slice(&0u32.to_be_bytes());
        Self::put_id(&mut b, self.id_size, class_id);
        b.extend_from_slice(&(data.len() as u32).to_be_bytes());
        b.extend_from_slice(data);
        self.segment.extend_from_slice(&b);
    }

    pub(crate) fn obj_array(&mut self, id: u64, class_id: u64, items: &[u64]) {
        let mut b = vec![tag::OBJ_ARRAY_DUMP];
        Self::put_id(&mut b, self.id_size, id);
        b.extend_from_slice(&0u32.to_be_bytes());
        b.extend_from_slice(&(items.len() as u32).to_be_bytes());
        Self::put_id(&mut b, self.id_size, class_id);
        for i in items {
            Self::put_id(&mut b, self.id_size, *i);
        }
        self.segment.extend_from_slice(&b);
    }

    pub(crate) fn prim_array(&mut self, id: u64, element: BasicType, data: &[u8]) {
        let length = data.len() / element.size(self.id_size);
        let mut b = vec![tag::PRIM_ARRAY_DUMP];
        Self::put_id(&mut b, self.id_size, id);
        b.extend_from_slice(&0u32.to_be_bytes());
        b.extend_from_slice(&(length as u32).to_be_bytes());
        b.push(element as u8);
        b.extend_from_slice(data);
        self.segment.extend_from_slice(&b);
    }

    /// A root sub-record carrying only the object id
    pub(crate) fn root(&mut self, root_tag: u8, object_id: u64) {
        let mut b = vec![root_tag];
        Self::put_id(&mut b, self.id_size, object_id);
        self.segment.extend_from_slice(&b);
    }

    pub(crate) fn root_java_frame(&mut self, object_id: u64, thread_serial: u32, frame: u32) {
        let mut b = vec![tag::ROOT_JAVA_FRAME];
        Self::put_id(&mut b, self.id_size, object_id);
        b.extend_from_slice(&thread_serial.to_be_bytes());
        b.extend_from_slice(&frame.to_be_bytes());
        self.segment.extend_from_slice(&b);
    }

    pub(crate) fn root_thread_object(&mut self, object_id: u64, thread_serial: u32, stack_serial: u32) {
        let mut b = vec![tag::ROOT_THREAD_OBJECT];
        Self::put_id(&mut b, self.id_size, object_id);
        b.extend_from_slice(&thread_serial.to_be_bytes());
        b.extend_from_slice(&stack_serial.to_be_bytes());
        self.segment.extend_from_slice(&b);
    }

    pub(crate) fn finish(mut self) -> Vec<u8> {
        let mut out = b"JAVA PROFILE 1.0.2\0".to_vec();
        out.extend_from_slice(&(self.id_size as u32).to_be_bytes());
        out.extend_from_slice(&0u64.to_be_bytes());
        if !self.segment.is_empty() {
            let segment = std::mem::take(&mut self.segment);
            self.raw_record(tag::HEAP_DUMP_SEGMENT, &segment);
            self.raw_record(tag::HEAP_DUMP_END, &[]);
        }
        out.extend_from_slice(&self.records);
        out
    }
}

/// Higher level builder that takes care of names and string ids
pub(crate) struct TestHeap {
    pub(crate) w: HprofWriter,
    next_string: u64,
    next_serial: u32,
}

impl TestHeap {
    pub(crate) const OBJECT: u64 = 0x10;

    /// Starts with `java/lang/Object` already dumped at id [`TestHeap::OBJECT`]
    pub(crate) fn new() -> Self {
        Self::with_id_size(8)
    }

    pub(crate) fn with_id_size(id_size: u8) -> Self {
        let mut h = TestHeap {
            w: HprofWriter::new(id_size),
            next_string: 0x1_0000,
            next_serial: 1,
        };
        h.class(Self::OBJECT, "java/lang/Object", 0, &[]);
        h
    }

    pub(crate) fn string(&mut self, s: &str) -> u64 {
        let id = self.next_string;
        self.next_string += 1;
        self.w.utf8(id, s);
        id
    }

    pub(crate) fn class(&mut self, id: u64, name: &str, super_id: u64, fields: &[(&str, BasicType)]) {
        self.class_with_statics(id, name, super_id, fields, &[]);
    }

    pub(crate) fn class_with_statics(
        &mut self,
        id: u64,
        name: &str,
        super_id: u64,
        fields: &[(&str, BasicType)],
        statics: &[(&str, Value)],
    ) {
        let name_id = self.string(name);
        let serial = self.next_serial;
        self.next_serial += 1;
        self.w.load_class(serial, id, name_id);
        let fields: Vec<(u64, BasicType)> = fields
            .iter()
            .map(|(n, t)| (self.string(n), *t))
            .collect();
        let statics: Vec<(u64, Value)> = statics
            .iter()
            .map(|(n, v)| (self.string(n), *v))
            .collect();
        self.w.class_dump(id, super_id, &statics, &fields);
    }

    /// Field values in dump order: the class's own fields first, then its superclass's
    pub(crate) fn object(&mut self, id: u64, class_id: u64, values: &[Value]) {
        let data = self.w.encode_values(values);
        self.w.instance(id, class_id, &data);
    }

    pub(crate) fn object_array(&mut self, id: u64, class_id: u64, items: &[u64]) {
        self.w.obj_array(id, class_id, items);
    }

    pub(crate) fn prim_array(&mut self, id: u64, element: BasicType, values: &[Value]) {
        let data = self.w.encode_values(values);
        self.w.prim_array(id, element, &data);
    }

    pub(crate) fn root(&mut self, object_id: u64) {
        self.w.root(tag::ROOT_UNKNOWN, object_id);
    }

    pub(crate) fn sticky_class(&mut self, class_id: u64) {
        self.w.root(tag::ROOT_STICKY_CLASS, class_id);
    }

    pub(crate) fn bytes(self) -> Vec<u8> {
        self.w.finish()
    }
}
