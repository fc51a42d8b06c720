//! Argument primitives for method and content-header payloads.
//!
//! AMQP arguments are a packed sequence of octets, big-endian integers,
//! short strings (u8 length), long strings (u32 length), bit flags packed
//! into octets, and field tables. The client only builds and inspects the
//! connection/channel/basic methods it needs itself; everything else stays
//! opaque bytes that applications encode with these same primitives.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// A field table: string keys to typed values, encoded in key order.
pub type FieldTable = BTreeMap<String, FieldValue>;

/// A typed value inside a field table or field array.
///
/// Tags follow the RabbitMQ interpretation of the 0-9-1 grammar.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    F32(f32),
    F64(f64),
    Decimal { scale: u8, value: u32 },
    LongString(Bytes),
    Array(Vec<FieldValue>),
    Timestamp(u64),
    Table(FieldTable),
    Void,
    Bytes(Bytes),
}

impl FieldValue {
    /// Convenience constructor for UTF-8 long strings.
    pub fn string(value: impl AsRef<str>) -> Self {
        Self::LongString(Bytes::copy_from_slice(value.as_ref().as_bytes()))
    }

    /// The long string value as text, if this is a valid UTF-8 long string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::LongString(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Self::Bool(_) => b't',
            Self::I8(_) => b'b',
            Self::U8(_) => b'B',
            Self::I16(_) => b's',
            Self::U16(_) => b'u',
            Self::I32(_) => b'I',
            Self::U32(_) => b'i',
            Self::I64(_) => b'l',
            Self::F32(_) => b'f',
            Self::F64(_) => b'd',
            Self::Decimal { .. } => b'D',
            Self::LongString(_) => b'S',
            Self::Array(_) => b'A',
            Self::Timestamp(_) => b'T',
            Self::Table(_) => b'F',
            Self::Void => b'V',
            Self::Bytes(_) => b'x',
        }
    }
}

/// Builds a method or property argument list.
#[derive(Debug, Default)]
pub struct ArgWriter {
    buf: BytesMut,
}

impl ArgWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.buf.put_u16(value);
        self
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64(value);
        self
    }

    /// Short string: u8 length prefix, at most 255 bytes.
    pub fn short_str(&mut self, value: &str) -> Result<&mut Self> {
        let len = u8::try_from(value.len())
            .map_err(|_| FrameError::malformed("short string", format!("{} bytes exceeds 255", value.len())))?;
        self.buf.put_u8(len);
        self.buf.put_slice(value.as_bytes());
        Ok(self)
    }

    /// Long string: u32 length prefix, arbitrary bytes.
    pub fn long_str(&mut self, value: &[u8]) -> Result<&mut Self> {
        let len = u32::try_from(value.len())
            .map_err(|_| FrameError::malformed("long string", "length exceeds u32"))?;
        self.buf.put_u32(len);
        self.buf.put_slice(value);
        Ok(self)
    }

    /// Consecutive bit arguments, packed eight to an octet, low bit first.
    pub fn bits(&mut self, flags: &[bool]) -> &mut Self {
        for group in flags.chunks(8) {
            let mut octet = 0u8;
            for (i, set) in group.iter().enumerate() {
                if *set {
                    octet |= 1 << i;
                }
            }
            self.buf.put_u8(octet);
        }
        self
    }

    pub fn table(&mut self, table: &FieldTable) -> Result<&mut Self> {
        let mut inner = ArgWriter::new();
        for (key, value) in table {
            inner.short_str(key)?;
            inner.field_value(value)?;
        }
        self.long_str(&inner.buf)
    }

    fn field_value(&mut self, value: &FieldValue) -> Result<&mut Self> {
        self.buf.put_u8(value.tag());
        match value {
            FieldValue::Bool(v) => self.buf.put_u8(u8::from(*v)),
            FieldValue::I8(v) => self.buf.put_i8(*v),
            FieldValue::U8(v) => self.buf.put_u8(*v),
            FieldValue::I16(v) => self.buf.put_i16(*v),
            FieldValue::U16(v) => self.buf.put_u16(*v),
            FieldValue::I32(v) => self.buf.put_i32(*v),
            FieldValue::U32(v) => self.buf.put_u32(*v),
            FieldValue::I64(v) => self.buf.put_i64(*v),
            FieldValue::F32(v) => self.buf.put_f32(*v),
            FieldValue::F64(v) => self.buf.put_f64(*v),
            FieldValue::Decimal { scale, value } => {
                self.buf.put_u8(*scale);
                self.buf.put_u32(*value);
            }
            FieldValue::LongString(v) | FieldValue::Bytes(v) => {
                self.long_str(v)?;
            }
            FieldValue::Array(items) => {
                let mut inner = ArgWriter::new();
                for item in items {
                    inner.field_value(item)?;
                }
                self.long_str(&inner.buf)?;
            }
            FieldValue::Timestamp(v) => self.buf.put_u64(*v),
            FieldValue::Table(t) => {
                self.table(t)?;
            }
            FieldValue::Void => {}
        }
        Ok(self)
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Reads an argument list written by [`ArgWriter`] or a broker.
#[derive(Debug, Clone)]
pub struct ArgReader {
    buf: Bytes,
    context: &'static str,
}

impl ArgReader {
    /// `context` names the method being parsed in error messages.
    pub fn new(buf: Bytes, context: &'static str) -> Self {
        Self { buf, context }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(FrameError::malformed(
                self.context,
                format!("need {n} more bytes, have {}", self.buf.remaining()),
            ));
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn short_str(&mut self) -> Result<String> {
        let len = self.u8()? as usize;
        self.need(len)?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec())
            .map_err(|_| FrameError::malformed(self.context, "short string is not UTF-8"))
    }

    pub fn long_str(&mut self) -> Result<Bytes> {
        let len = self.u32()? as usize;
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    /// Read `count` packed bit arguments.
    pub fn bits(&mut self, count: usize) -> Result<Vec<bool>> {
        let mut flags = Vec::with_capacity(count);
        for _ in 0..count.div_ceil(8) {
            let octet = self.u8()?;
            for i in 0..8 {
                if flags.len() == count {
                    break;
                }
                flags.push(octet & (1 << i) != 0);
            }
        }
        Ok(flags)
    }

    pub fn table(&mut self) -> Result<FieldTable> {
        let raw = self.long_str()?;
        let mut inner = ArgReader::new(raw, self.context);
        let mut table = FieldTable::new();
        while inner.buf.has_remaining() {
            let key = inner.short_str()?;
            let value = inner.field_value()?;
            table.insert(key, value);
        }
        Ok(table)
    }

    fn field_value(&mut self) -> Result<FieldValue> {
        let tag = self.u8()?;
        let value = match tag {
            b't' => FieldValue::Bool(self.u8()? != 0),
            b'b' => FieldValue::I8(self.u8()? as i8),
            b'B' => FieldValue::U8(self.u8()?),
            b's' => FieldValue::I16(self.u16()? as i16),
            b'u' => FieldValue::U16(self.u16()?),
            b'I' => FieldValue::I32(self.u32()? as i32),
            b'i' => FieldValue::U32(self.u32()?),
            b'l' => FieldValue::I64(self.u64()? as i64),
            b'f' => FieldValue::F32(f32::from_bits(self.u32()?)),
            b'd' => FieldValue::F64(f64::from_bits(self.u64()?)),
            b'D' => FieldValue::Decimal {
                scale: self.u8()?,
                value: self.u32()?,
            },
            b'S' => FieldValue::LongString(self.long_str()?),
            b'x' => FieldValue::Bytes(self.long_str()?),
            b'A' => {
                let raw = self.long_str()?;
                let mut inner = ArgReader::new(raw, self.context);
                let mut items = Vec::new();
                while inner.buf.has_remaining() {
                    items.push(inner.field_value()?);
                }
                FieldValue::Array(items)
            }
            b'T' => FieldValue::Timestamp(self.u64()?),
            b'F' => FieldValue::Table(self.table()?),
            b'V' => FieldValue::Void,
            other => {
                return Err(FrameError::malformed(
                    self.context,
                    format!("unknown field type {:?}", other as char),
                ))
            }
        };
        Ok(value)
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Take everything not yet consumed.
    pub fn rest(&mut self) -> Bytes {
        self.buf.split_to(self.buf.remaining())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_and_strings() {
        let mut w = ArgWriter::new();
        w.u8(7).u16(0x0102).u32(3).u64(4);
        w.short_str("queue").unwrap();
        w.long_str(b"\x00guest\x00guest").unwrap();
        let mut r = ArgReader::new(w.finish(), "test");

        assert_eq!(r.u8().unwrap(), 7);
        assert_eq!(r.u16().unwrap(), 0x0102);
        assert_eq!(r.u32().unwrap(), 3);
        assert_eq!(r.u64().unwrap(), 4);
        assert_eq!(r.short_str().unwrap(), "queue");
        assert_eq!(r.long_str().unwrap().as_ref(), b"\x00guest\x00guest");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn short_string_rejects_overlong() {
        let long = "x".repeat(256);
        let err = ArgWriter::new().short_str(&long).unwrap_err();
        assert!(matches!(err, FrameError::Malformed { .. }));
    }

    #[test]
    fn bits_pack_low_bit_first() {
        let mut w = ArgWriter::new();
        w.bits(&[true, false, true]);
        let bytes = w.finish();
        assert_eq!(bytes.as_ref(), &[0b0000_0101]);

        let mut r = ArgReader::new(bytes, "bits");
        assert_eq!(r.bits(3).unwrap(), vec![true, false, true]);
    }

    #[test]
    fn nine_bits_span_two_octets() {
        let flags = [true; 9];
        let mut w = ArgWriter::new();
        w.bits(&flags);
        let bytes = w.finish();
        assert_eq!(bytes.len(), 2);
        assert_eq!(ArgReader::new(bytes, "bits").bits(9).unwrap(), flags.to_vec());
    }

    #[test]
    fn nested_table() {
        let mut caps = FieldTable::new();
        caps.insert("publisher_confirms".into(), FieldValue::Bool(true));

        let mut table = FieldTable::new();
        table.insert("product".into(), FieldValue::string("amqpmux"));
        table.insert("capabilities".into(), FieldValue::Table(caps));
        table.insert(
            "list".into(),
            FieldValue::Array(vec![FieldValue::I32(-1), FieldValue::Void]),
        );
        table.insert("ts".into(), FieldValue::Timestamp(1_700_000_000));
        table.insert(
            "price".into(),
            FieldValue::Decimal {
                scale: 2,
                value: 1999,
            },
        );

        let mut w = ArgWriter::new();
        w.table(&table).unwrap();
        let decoded = ArgReader::new(w.finish(), "table").table().unwrap();

        assert_eq!(decoded, table);
        assert_eq!(decoded["product"].as_str(), Some("amqpmux"));
    }

    #[test]
    fn truncated_input_is_malformed() {
        let mut r = ArgReader::new(Bytes::from_static(&[0, 0, 0, 9, b'a']), "connection.start");
        let err = r.long_str().unwrap_err();
        match err {
            FrameError::Malformed { context, .. } => assert_eq!(context, "connection.start"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unknown_field_tag_is_malformed() {
        let mut w = ArgWriter::new();
        let mut inner = ArgWriter::new();
        inner.short_str("k").unwrap();
        inner.u8(b'?');
        w.long_str(&inner.finish()).unwrap();

        let err = ArgReader::new(w.finish(), "table").table().unwrap_err();
        assert!(matches!(err, FrameError::Malformed { .. }));
    }
}
