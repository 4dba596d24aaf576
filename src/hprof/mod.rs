//! The HPROF binary heap dump container.
//!
//! All multi-byte quantities are big-endian. Identifiers are either 4 or 8
//! bytes wide, as declared in the header.

mod cursor;
mod reader;
#[cfg(test)]
pub(crate) mod writer;

pub(crate) use cursor::Cursor;
pub(crate) use reader::read_heap_record_at;
pub use reader::{
    ClassDump, DumpHeader, DumpReader, FieldDecl, HeapRecord, Record, RecordSink, RootKind,
    StackFrameRecord, StaticField,
};

use crate::error::{Corruption, HeapError, Result};

pub const MAGIC_PREFIX: &[u8] = b"JAVA PROFILE ";
pub const SUPPORTED_VERSIONS: [&str; 2] = ["1.0.1", "1.0.2"];

pub(crate) mod tag {
    pub const UTF8: u8 = 0x01;
    pub const LOAD_CLASS: u8 = 0x02;
    pub const STACK_FRAME: u8 = 0x04;
    pub const STACK_TRACE: u8 = 0x05;
    pub const START_THREAD: u8 = 0x0A;
    pub const HEAP_DUMP: u8 = 0x0C;
    pub const HEAP_DUMP_SEGMENT: u8 = 0x1C;
    pub const HEAP_DUMP_END: u8 = 0x2C;

    pub const ROOT_UNKNOWN: u8 = 0xFF;
    pub const ROOT_JNI_GLOBAL: u8 = 0x01;
    pub const ROOT_JNI_LOCAL: u8 = 0x02;
    pub const ROOT_JAVA_FRAME: u8 = 0x03;
    pub const ROOT_NATIVE_STACK: u8 = 0x04;
    pub const ROOT_STICKY_CLASS: u8 = 0x05;
    pub const ROOT_THREAD_BLOCK: u8 = 0x06;
    pub const ROOT_MONITOR_USED: u8 = 0x07;
    pub const ROOT_THREAD_OBJECT: u8 = 0x08;
    pub const CLASS_DUMP: u8 = 0x20;
    pub const INSTANCE_DUMP: u8 = 0x21;
    pub const OBJ_ARRAY_DUMP: u8 = 0x22;
    pub const PRIM_ARRAY_DUMP: u8 = 0x23;
}

#[repr(u8)]
#[derive(Hash, PartialEq, Eq, Clone, Copy, Debug)]
pub enum BasicType {
    Object = 2,
    Boolean = 4,
    Char = 5,
    Float = 6,
    Double = 7,
    Byte = 8,
    Short = 9,
    Int = 10,
    Long = 11,
}

impl BasicType {
    pub const PRIMITIVES: [BasicType; 8] = [
        BasicType::Boolean,
        BasicType::Char,
        BasicType::Float,
        BasicType::Double,
        BasicType::Byte,
        BasicType::Short,
        BasicType::Int,
        BasicType::Long,
    ];

    pub(crate) fn from_tag(t: u8, offset: u64) -> Result<BasicType> {
        Ok(match t {
            2 => BasicType::Object,
            4 => BasicType::Boolean,
            5 => BasicType::Char,
            6 => BasicType::Float,
            7 => BasicType::Double,
            8 => BasicType::Byte,
            9 => BasicType::Short,
            10 => BasicType::Int,
            11 => BasicType::Long,
            x => return Err(HeapError::corrupt(offset, Corruption::BadBasicType(x))),
        })
    }

    /// Width in the dump, given the identifier size for object slots
    pub fn size(self, id_size: u8) -> usize {
        match self {
            BasicType::Object => id_size as usize,
            BasicType::Boolean | BasicType::Byte => 1,
            BasicType::Char | BasicType::Short => 2,
            BasicType::Float | BasicType::Int => 4,
            BasicType::Double | BasicType::Long => 8,
        }
    }

    /// Java source name of the type, `int`, `boolean`, ...
    pub fn java_name(self) -> &'static str {
        match self {
            BasicType::Object => "object",
            BasicType::Boolean => "boolean",
            BasicType::Char => "char",
            BasicType::Float => "float",
            BasicType::Double => "double",
            BasicType::Byte => "byte",
            BasicType::Short => "short",
            BasicType::Int => "int",
            BasicType::Long => "long",
        }
    }
}

/// A decoded field, static field or array element value
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    Object(u64),
    Boolean(bool),
    Char(u16),
    Float(f32),
    Double(f64),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
}

impl Value {
    pub fn basic_type(&self) -> BasicType {
        match self {
            Value::Object(_) => BasicType::Object,
            Value::Boolean(_) => BasicType::Boolean,
            Value::Char(_) => BasicType::Char,
            Value::Float(_) => BasicType::Float,
            Value::Double(_) => BasicType::Double,
            Value::Byte(_) => BasicType::Byte,
            Value::Short(_) => BasicType::Short,
            Value::Int(_) => BasicType::Int,
            Value::Long(_) => BasicType::Long,
        }
    }

    /// The referenced object id, if this is a non-null reference
    pub fn as_object(&self) -> Option<u64> {
        match self {
            Value::Object(id) if *id != 0 => Some(*id),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Byte(v) => Some(v as i64),
            Value::Short(v) => Some(v as i64),
            Value::Char(v) => Some(v as i64),
            Value::Int(v) => Some(v as i64),
            Value::Long(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Object(0) => write!(f, "null"),
            Value::Object(id) => write!(f, "#0x{:x}", id),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Char(v) => match char::from_u32(*v as u32) {
                Some(c) => write!(f, "{}", c),
                None => write!(f, "\\u{:04x}", v),
            },
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Byte(v) => write!(f, "{}", v),
            Value::Short(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}", v),
        }
    }
}

/// Convert a JVM internal class name into Java source form.
///
/// `java/lang/String` becomes `java.lang.String`, `[I` becomes `int[]` and
/// `[[Ljava/lang/Object;` becomes `java.lang.Object[][]`.
pub fn java_class_name(raw: &str) -> String {
    let dims = raw.bytes().take_while(|b| *b == b'[').count();
    if dims == 0 {
        return raw.replace('/', ".");
    }
    let element = &raw[dims..];
    let base = match element {
        "Z" => "boolean".to_string(),
        "C" => "char".to_string(),
        "F" => "float".to_string(),
        "D" => "double".to_string(),
        "B" => "byte".to_string(),
        "S" => "short".to_string(),
        "I" => "int".to_string(),
        "J" => "long".to_string(),
        e if e.starts_with('L') && e.ends_with(';') => e[1..e.len() - 1].replace('/', "."),
        e => e.replace('/', "."),
    };
    let mut name = base;
    for _ in 0..dims {
        name.push_str("[]");
    }
    name
}
