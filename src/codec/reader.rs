//! Cursor-style typed reader over a frame payload.
//!
//! All integers are big-endian. Every read carries a `path`, the dotted
//! path of the field being decoded. It appears only in error messages
//! so that a truncated or malformed frame names the exact field it died on.

use bytes::Bytes;

use super::value::{Decimal, FieldTable, FieldValue};
use crate::error::{AmqpError, Result};

/// Largest accepted timestamp, in seconds (the source rejects dates the
/// other side of its calendar).
pub const MAX_TIMESTAMP_SECS: u64 = 8_640_000_000_000;

pub struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
}

macro_rules! read_int {
    ($name:ident, $ty:ty, $size:expr) => {
        pub fn $name(&mut self, path: &str) -> Result<$ty> {
            let bytes = self.take($size, path)?;
            let mut buf = [0u8; $size];
            buf.copy_from_slice(bytes);
            Ok(<$ty>::from_be_bytes(buf))
        }
    };
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Current cursor position from the start of the buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn take(&mut self, n: usize, path: &str) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(AmqpError::codec(
                path,
                format!("need {n} bytes, {} available", self.remaining()),
            ));
        }
        let slice = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    read_int!(read_u8, u8, 1);
    read_int!(read_i8, i8, 1);
    read_int!(read_u16, u16, 2);
    read_int!(read_i16, i16, 2);
    read_int!(read_u32, u32, 4);
    read_int!(read_i32, i32, 4);
    read_int!(read_u64, u64, 8);
    read_int!(read_i64, i64, 8);
    read_int!(read_f32, f32, 4);
    read_int!(read_f64, f64, 8);

    pub fn read_bool(&mut self, path: &str) -> Result<bool> {
        Ok(self.read_u8(path)? != 0)
    }

    /// Reserved fields are skipped on decode.
    pub fn skip(&mut self, n: usize, path: &str) -> Result<()> {
        self.take(n, path)?;
        Ok(())
    }

    pub fn read_short_string(&mut self, path: &str) -> Result<String> {
        let len = self.read_u8(path)? as usize;
        let bytes = self.take(len, path)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| AmqpError::codec(path, "short string is not valid UTF-8"))
    }

    pub fn read_long_string(&mut self, path: &str) -> Result<String> {
        let len = self.read_u32(path)? as usize;
        let bytes = self.take(len, path)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| AmqpError::codec(path, "long string is not valid UTF-8"))
    }

    /// Long string as raw bytes; SASL responses and binary fields are not
    /// UTF-8.
    pub fn read_long_bytes(&mut self, path: &str) -> Result<Bytes> {
        let len = self.read_u32(path)? as usize;
        Ok(Bytes::copy_from_slice(self.take(len, path)?))
    }

    pub fn read_timestamp(&mut self, path: &str) -> Result<u64> {
        let secs = self.read_u64(path)?;
        if secs > MAX_TIMESTAMP_SECS {
            return Err(AmqpError::codec(
                path,
                format!("timestamp {secs} out of range"),
            ));
        }
        Ok(secs)
    }

    pub fn read_decimal(&mut self, path: &str) -> Result<Decimal> {
        let scale = self.read_u8(path)?;
        let unscaled = self.read_u32(path)?;
        Ok(Decimal::new(scale, unscaled))
    }

    /// Field table: `u32 length | (shortstr key | typed value)*`.
    ///
    /// The cursor must land exactly on the declared end; overshoot or
    /// undershoot is a frame error.
    pub fn read_table(&mut self, path: &str) -> Result<FieldTable> {
        let len = self.read_u32(path)? as usize;
        let end = self.offset + len;
        if end > self.data.len() {
            return Err(AmqpError::codec(
                path,
                format!("table length {len} exceeds frame"),
            ));
        }

        let mut table = FieldTable::new();
        while self.offset < end {
            let key = self.read_short_string(path)?;
            let value_path = format!("{path}.{key}");
            let value = self.read_value(&value_path)?;
            table.insert_unchecked(key, value);
        }
        if self.offset != end {
            return Err(AmqpError::codec(path, "table entries overran declared end"));
        }
        Ok(table)
    }

    pub fn read_array(&mut self, path: &str) -> Result<Vec<FieldValue>> {
        let len = self.read_u32(path)? as usize;
        let end = self.offset + len;
        if end > self.data.len() {
            return Err(AmqpError::codec(
                path,
                format!("array length {len} exceeds frame"),
            ));
        }

        let mut values = Vec::new();
        while self.offset < end {
            let value_path = format!("{path}[{}]", values.len());
            values.push(self.read_value(&value_path)?);
        }
        if self.offset != end {
            return Err(AmqpError::codec(path, "array entries overran declared end"));
        }
        Ok(values)
    }

    fn read_value(&mut self, path: &str) -> Result<FieldValue> {
        let tag = self.read_u8(path)?;
        match tag {
            b't' => Ok(FieldValue::Bool(self.read_u8(path)? != 0)),
            b'b' => Ok(FieldValue::I8(self.read_i8(path)?)),
            b'B' => Ok(FieldValue::U8(self.read_u8(path)?)),
            b's' => Ok(FieldValue::I16(self.read_i16(path)?)),
            b'u' => Ok(FieldValue::U16(self.read_u16(path)?)),
            b'I' => Ok(FieldValue::I32(self.read_i32(path)?)),
            b'i' => Ok(FieldValue::U32(self.read_u32(path)?)),
            b'L' | b'l' => Ok(FieldValue::I64(self.read_i64(path)?)),
            b'f' => Ok(FieldValue::Float(self.read_f32(path)?)),
            b'd' => Ok(FieldValue::Double(self.read_f64(path)?)),
            b'D' => Ok(FieldValue::Decimal(self.read_decimal(path)?)),
            b'S' => Ok(FieldValue::LongString(self.read_long_string(path)?)),
            b'T' => Ok(FieldValue::Timestamp(self.read_timestamp(path)?)),
            b'V' => Ok(FieldValue::Void),
            b'x' => Ok(FieldValue::Binary(self.read_long_bytes(path)?)),
            b'F' => Ok(FieldValue::Table(self.read_table(path)?)),
            b'A' => Ok(FieldValue::Array(self.read_array(path)?)),
            other => Err(AmqpError::codec(
                path,
                format!("unknown field type tag {:?}", other as char),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_reads_are_big_endian() {
        let data = [0x01, 0x02, 0x00, 0x00, 0x00, 0x03];
        let mut r = ByteReader::new(&data);
        assert_eq!(r.read_u16("a").unwrap(), 0x0102);
        assert_eq!(r.read_u32("b").unwrap(), 3);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn short_read_names_the_field() {
        let mut r = ByteReader::new(&[0x01]);
        let err = r.read_u32("method.arguments.prefetch_count").unwrap_err();
        match err {
            AmqpError::Codec { path, .. } => {
                assert_eq!(path, "method.arguments.prefetch_count");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn short_string_roundtrip() {
        let data = [3, b'f', b'o', b'o', 0xFF];
        let mut r = ByteReader::new(&data);
        assert_eq!(r.read_short_string("s").unwrap(), "foo");
        assert_eq!(r.remaining(), 1);
    }

    #[test]
    fn timestamp_rejects_out_of_range() {
        let data = (MAX_TIMESTAMP_SECS + 1).to_be_bytes();
        let mut r = ByteReader::new(&data);
        assert!(r.read_timestamp("ts").is_err());

        let data = MAX_TIMESTAMP_SECS.to_be_bytes();
        let mut r = ByteReader::new(&data);
        assert_eq!(r.read_timestamp("ts").unwrap(), MAX_TIMESTAMP_SECS);
    }

    #[test]
    fn table_must_end_exactly() {
        // Declared length 6, but the single entry spans 7 bytes: a decoder
        // that trusts the declared end would read past it.
        let mut data = Vec::new();
        data.extend_from_slice(&6u32.to_be_bytes());
        data.extend_from_slice(&[1, b'k']); // key "k"
        data.push(b't'); // bool tag
        data.push(1);
        data.extend_from_slice(&[1, b'x', b'V']); // second entry, part of it past end

        let mut r = ByteReader::new(&data);
        // entry one consumes 4 bytes, entry two starts before end but its
        // value lands past it
        assert!(r.read_table("t").is_err());
    }

    #[test]
    fn nested_table_paths() {
        // table { outer: { bad: ? } }: inner decode fails on the bad tag.
        let mut inner = Vec::new();
        inner.extend_from_slice(&[3, b'b', b'a', b'd', b'?']); // unknown tag '?'
        let mut outer = Vec::new();
        outer.extend_from_slice(&[5, b'o', b'u', b't', b'e', b'r', b'F']);
        outer.extend_from_slice(&(inner.len() as u32).to_be_bytes());
        outer.extend_from_slice(&inner);
        let mut data = Vec::new();
        data.extend_from_slice(&(outer.len() as u32).to_be_bytes());
        data.extend_from_slice(&outer);

        let mut r = ByteReader::new(&data);
        let err = r.read_table("headers").unwrap_err();
        match err {
            AmqpError::Codec { path, .. } => assert_eq!(path, "headers.outer.bad"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
