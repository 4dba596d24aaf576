use super::{BasicType, Value};
use crate::error::{Corruption, HeapError, Result};

/// Big-endian reader over a window of the dump.
///
/// Positions are absolute offsets into the whole dump so errors point at
/// the exact byte.
#[derive(Clone)]
pub(crate) struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
    id_size: u8,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(data: &'a [u8], pos: usize, id_size: u8) -> Self {
        Cursor {
            data,
            pos,
            end: data.len(),
            id_size,
        }
    }

    /// A cursor limited to `[pos, end)`
    pub(crate) fn window(&self, end: usize) -> Self {
        Cursor {
            data: self.data,
            pos: self.pos,
            end: end.min(self.end),
            id_size: self.id_size,
        }
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.end.saturating_sub(self.pos)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.end
    }

    pub(crate) fn id_size(&self) -> u8 {
        self.id_size
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(HeapError::corrupt(
                self.pos as u64,
                Corruption::Truncated {
                    needed: n as u64,
                    available: self.remaining() as u64,
                },
            ));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub(crate) fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut a = [0u8; N];
        a.copy_from_slice(self.bytes(N)?);
        Ok(a)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub(crate) fn id(&mut self) -> Result<u64> {
        if self.id_size == 4 {
            Ok(self.u32()? as u64)
        } else {
            self.u64()
        }
    }

    pub(crate) fn basic_type(&mut self) -> Result<BasicType> {
        let at = self.pos as u64;
        BasicType::from_tag(self.u8()?, at)
    }

    pub(crate) fn value(&mut self, ty: BasicType) -> Result<Value> {
        Ok(match ty {
            BasicType::Object => Value::Object(self.id()?),
            BasicType::Boolean => Value::Boolean(self.u8()? != 0),
            BasicType::Char => Value::Char(self.u16()?),
            BasicType::Float => Value::Float(f32::from_bits(self.u32()?)),
            BasicType::Double => Value::Double(f64::from_bits(self.u64()?)),
            BasicType::Byte => Value::Byte(self.u8()? as i8),
            BasicType::Short => Value::Short(self.u16()? as i16),
            BasicType::Int => Value::Int(self.u32()? as i32),
            BasicType::Long => Value::Long(self.u64()? as i64),
        })
    }
}
