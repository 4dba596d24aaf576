use super::Instance;
use crate::error::Result;
use crate::hprof::{BasicType, HeapRecord, Value};
use crate::index::NodeKind;

const MAX_ARRAY_TEXT: usize = 128;

const BOXES: [&str; 8] = [
    "java.lang.Integer",
    "java.lang.Long",
    "java.lang.Short",
    "java.lang.Byte",
    "java.lang.Character",
    "java.lang.Boolean",
    "java.lang.Float",
    "java.lang.Double",
];

fn utf16(data: &[u8]) -> String {
    let units = data.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]]));
    char::decode_utf16(units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

fn latin1(data: &[u8]) -> String {
    data.iter().map(|b| *b as char).collect()
}

fn truncate(s: String) -> String {
    match s.char_indices().nth(MAX_ARRAY_TEXT) {
        Some((at, _)) => format!("{}...", &s[..at]),
        None => s,
    }
}

fn items(length: u32) -> String {
    if length == 1 {
        "1 item".to_string()
    } else {
        format!("{} items", length)
    }
}

/// Chars `[offset, offset + count)` of a `char[]` backing an older String,
/// or `None` if the window falls outside the array
fn char_window(data: &[u8], offset: i32, count: i32) -> Option<&[u8]> {
    let start = usize::try_from(offset).ok()?.checked_mul(2)?;
    let len = usize::try_from(count).ok()?.checked_mul(2)?;
    data.get(start..start.checked_add(len)?)
}

/// The text of a `java.lang.String`, from either a `char[]` or a compact
/// `byte[]` plus `coder` (0 latin-1, 1 UTF-16)
fn string_value(instance: &Instance<'_>) -> Result<Option<String>> {
    let Some(value) = instance.field_instance("value")? else {
        return Ok(None);
    };
    let HeapRecord::PrimitiveArray { element, data, .. } = value.record()? else {
        return Ok(None);
    };
    Ok(match element {
        BasicType::Char => {
            // Pre JDK 7 strings may share a larger array
            match (instance.field("offset")?, instance.field("count")?) {
                (Some(Value::Int(offset)), Some(Value::Int(count))) => {
                    char_window(data, offset, count).map(utf16)
                }
                _ => Some(utf16(data)),
            }
        }
        BasicType::Byte => match instance.field("coder")? {
            Some(Value::Byte(1)) => Some(utf16(data)),
            _ => Some(latin1(data)),
        },
        _ => None,
    })
}

/// Short text shown next to an instance, if its type has one
pub(crate) fn compute_details(instance: &Instance<'_>) -> Result<Option<String>> {
    match instance.kind() {
        NodeKind::Class => Ok(instance.as_class().map(|c| c.name().to_string())),
        NodeKind::ObjectArray => Ok(instance.array_length()?.map(items)),
        NodeKind::PrimitiveArray => {
            let HeapRecord::PrimitiveArray {
                element,
                length,
                data,
                ..
            } = instance.record()?
            else {
                return Ok(None);
            };
            Ok(Some(match element {
                BasicType::Char => truncate(utf16(data)),
                _ => items(length),
            }))
        }
#[cfg(test)]
mod tests {
    use super::*;
    use crate::hprof::writer::TestHeap;
    use crate::{load_heap, ByteSource, HeapConfig};

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abc".to_string()), "abc");
        let long: String = std::iter::repeat('x').take(200).collect();
        let t = truncate(long);
        assert_eq!(t.len(), MAX_ARRAY_TEXT + 3);
        assert!(t.ends_with("..."));
    }

    #[test]
    fn test_details() {
        let mut h = TestHeap::new();
        h.class(
            0x20,
            "java/lang/String",
            TestHeap::OBJECT,
            &[("value", BasicType::Object), ("coder", BasicType::Byte)],
        );
        h.class(0x21, "java/lang/Integer", TestHeap::OBJECT, &[("value", BasicType::Int)]);
        h.class(0x22, "java/lang/Character", TestHeap::OBJECT, &[("value", BasicType::Char)]);
        h.class(0x23, "[Ljava/lang/Object;", TestHeap::OBJECT, &[]);
        h.prim_array(0x100, BasicType::Byte, &[Value::Byte(b'h' as i8), Value::Byte(b'i' as i8)]);
        h.object(0x101, 0x20, &[Value::Object(0x100), Value::Byte(0)]);
        h.prim_array(0x102, BasicType::Char, &[Value::Char('o' as u16), Value::Char('k' as u16)]);
        h.object(0x103, 0x20, &[Value::Object(0x102), Value::Byte(1)]);
        h.object(0x104, 0x21, &[Value::Int(-42)]);
        h.object(0x105, 0x22, &[Value::Char('Z' as u16)]);
        h.object_array(0x106, 0x23, &[0x101, 0x104]);
        h.prim_array(0x107, BasicType::Int, &[Value::Int(1), Value::Int(2), Value::Int(3)]);
        h.object_array(0x108, 0x23, &[0]);
        h.prim_array(0x109, BasicType::Long, &[Value::Long(7)]);
        let heap = load_heap(ByteSource::Bytes(h.bytes()), HeapConfig::default()).unwrap();
        let d = |id| heap.details(id).unwrap();
        assert_eq!(d(0x101).as_deref(), Some("hi"));
        assert_eq!(d(0x103).as_deref(), Some("ok"));
        assert_eq!(d(0x104).as_deref(), Some("-42"));
        assert_eq!(d(0x105).as_deref(), Some("Z"));
        assert_eq!(d(0x106).as_deref(), Some("2 items"));
        assert_eq!(d(0x107).as_deref(), Some("3 items"));
        assert_eq!(d(0x100).as_deref(), Some("2 items"));
        assert_eq!(d(0x102).as_deref(), Some("ok"));
        assert_eq!(d(0x108).as_deref(), Some("1 item"));
        assert_eq!(d(0x109).as_deref(), Some("1 item"));
        assert_eq!(d(0x21).as_deref(), Some("java.lang.Integer"));
        assert_eq!(d(TestHeap::OBJECT).as_deref(), Some("java.lang.Object"));
        assert!(heap.details(0x999).is_err());
    }

    #[test]
    fn test_string_with_offset_and_count() {
        let mut h = TestHeap::new();
        h.class(
            0x20,
            "java/lang/String",
            TestHeap::OBJECT,
            &[
                ("value", BasicType::Object),
                ("offset", BasicType::Int),
                ("count", BasicType::Int),
            ],
        );
        let chars: Vec<Value> = "key=value".encode_utf16().map(Value::Char).collect();
        h.prim_array(0x100, BasicType::Char, &chars);
        h.object(0x101, 0x20, &[Value::Object(0x100), Value::Int(0), Value::Int(3)]);
        h.object(0x102, 0x20, &[Value::Object(0x100), Value::Int(4), Value::Int(5)]);
        h.object(0x103, 0x20, &[Value::Object(0x100), Value::Int(4), Value::Int(6)]);
        h.object(0x104, 0x20, &[Value::Object(0x100), Value::Int(9), Value::Int(0)]);
        let heap = load_heap(ByteSource::Bytes(h.bytes()), HeapConfig::default()).unwrap();
        let d = |id| heap.details(id).unwrap();
        assert_eq!(d(0x101).as_deref(), Some("key"));
        assert_eq!(d(0x102).as_deref(), Some("value"));
        assert_eq!(d(0x103), None);
        assert_eq!(d(0x104).as_deref(), Some(""));
        assert_eq!(d(0x100).as_deref(), Some("key=value"));
    }
}
