//! Frame builder: an append-only typed writer that knows the frame
//! envelope.
//!
//! Length-prefixed structures (the frame payload itself, field tables,
//! field arrays) are written with a zeroed size slot that is patched once
//! the content is known, the same placeholder-then-backfill scheme the
//! wire demands everywhere.

use bytes::{BufMut, Bytes, BytesMut};

use super::value::{is_valid_table_key, FieldTable, FieldValue};
use crate::error::{AmqpError, Result};
use crate::protocol::constants::{frame_kind, FRAME_END};

/// Offset of the payload-size field inside the frame prefix
/// (`kind(1) | channel(2)`).
const SIZE_OFFSET: usize = 3;

/// Bytes preceding the payload: kind, channel, size.
pub const FRAME_PREFIX: usize = 7;

/// Envelope overhead of a complete frame: prefix plus the 0xCE terminator.
pub const FRAME_OVERHEAD: usize = FRAME_PREFIX + 1;

pub struct FrameBuilder {
    buf: BytesMut,
    /// Offset of the current frame's size slot, set by the `*_start`
    /// helpers and consumed by `set_frame_length`.
    frame_start: usize,
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
            frame_start: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            frame_start: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish and take the accumulated bytes (possibly several frames).
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    // Typed writes, all big-endian.

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_i8(&mut self, value: i8) {
        self.buf.put_i8(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    pub fn put_i16(&mut self, value: i16) {
        self.buf.put_i16(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub fn put_i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    pub fn put_f32(&mut self, value: f32) {
        self.buf.put_f32(value);
    }

    pub fn put_f64(&mut self, value: f64) {
        self.buf.put_f64(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.put_u8(value as u8);
    }

    pub fn put_bytes(&mut self, value: &[u8]) {
        self.buf.put_slice(value);
    }

    /// Reserved fields are emitted as zero fill.
    pub fn put_zeroes(&mut self, n: usize) {
        self.buf.put_bytes(0, n);
    }

    pub fn put_short_string(&mut self, value: &str, path: &str) -> Result<()> {
        if value.len() > u8::MAX as usize {
            return Err(AmqpError::codec(
                path,
                format!("short string of {} bytes exceeds 255", value.len()),
            ));
        }
        self.buf.put_u8(value.len() as u8);
        self.buf.put_slice(value.as_bytes());
        Ok(())
    }

    pub fn put_long_string(&mut self, value: &str) {
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value.as_bytes());
    }

    pub fn put_long_bytes(&mut self, value: &[u8]) {
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value);
    }

    /// Field table with the u32 length prefix patched after the entries.
    pub fn put_table(&mut self, table: &FieldTable, path: &str) -> Result<()> {
        let size_offset = self.buf.len();
        self.buf.put_u32(0);

        for (key, value) in table.iter() {
            if !is_valid_table_key(key) {
                return Err(AmqpError::InvalidTableKey(key.to_string()));
            }
            self.put_short_string(key, path)?;
            self.put_value(value, path)?;
        }

        self.patch_u32(size_offset);
        Ok(())
    }

    pub fn put_array(&mut self, values: &[FieldValue], path: &str) -> Result<()> {
        let size_offset = self.buf.len();
        self.buf.put_u32(0);

        for value in values {
            self.put_value(value, path)?;
        }

        self.patch_u32(size_offset);
        Ok(())
    }

    fn put_value(&mut self, value: &FieldValue, path: &str) -> Result<()> {
        match value {
            FieldValue::Bool(v) => {
                self.put_u8(b't');
                self.put_bool(*v);
            }
            FieldValue::I8(v) => {
                self.put_u8(b'b');
                self.put_i8(*v);
            }
            FieldValue::U8(v) => {
                self.put_u8(b'B');
                self.put_u8(*v);
            }
            FieldValue::I16(v) => {
                self.put_u8(b's');
                self.put_i16(*v);
            }
            FieldValue::U16(v) => {
                self.put_u8(b'u');
                self.put_u16(*v);
            }
            FieldValue::I32(v) => {
                self.put_u8(b'I');
                self.put_i32(*v);
            }
            FieldValue::U32(v) => {
                self.put_u8(b'i');
                self.put_u32(*v);
            }
            FieldValue::I64(v) => {
                self.put_u8(b'l');
                self.put_i64(*v);
            }
            FieldValue::Float(v) => {
                self.put_u8(b'f');
                self.put_f32(*v);
            }
            FieldValue::Double(v) => {
                self.put_u8(b'd');
                self.put_f64(*v);
            }
            FieldValue::Decimal(v) => {
                self.put_u8(b'D');
                self.put_u8(v.scale);
                self.put_u32(v.unscaled);
            }
            FieldValue::LongString(v) => {
                self.put_u8(b'S');
                self.put_long_string(v);
            }
            FieldValue::Binary(v) => {
                self.put_u8(b'x');
                self.put_long_bytes(v);
            }
            FieldValue::Timestamp(v) => {
                self.put_u8(b'T');
                self.put_u64(*v);
            }
            FieldValue::Void => {
                self.put_u8(b'V');
            }
            FieldValue::Table(v) => {
                self.put_u8(b'F');
                self.put_table(v, path)?;
            }
            FieldValue::Array(v) => {
                self.put_u8(b'A');
                self.put_array(v, path)?;
            }
        }
        Ok(())
    }

    /// Backfill a u32 length slot with the number of bytes written after it.
    fn patch_u32(&mut self, size_offset: usize) {
        let len = (self.buf.len() - size_offset - 4) as u32;
        self.buf[size_offset..size_offset + 4].copy_from_slice(&len.to_be_bytes());
    }

    // Frame helpers.

    /// Start a method frame: kind, channel, zeroed size slot, method id.
    /// The cursor lands on the first argument byte.
    pub fn method_start(&mut self, channel: u16, method_id: u32) {
        self.frame_start = self.buf.len();
        self.put_u8(frame_kind::METHOD);
        self.put_u16(channel);
        self.put_u32(0);
        self.put_u32(method_id);
    }

    /// Start a content-header frame: the method-like prefix, then
    /// `class_id | weight(0) | body_size`.
    pub fn header_start(&mut self, channel: u16, class_id: u16, body_size: u64) {
        self.frame_start = self.buf.len();
        self.put_u8(frame_kind::HEADER);
        self.put_u16(channel);
        self.put_u32(0);
        self.put_u16(class_id);
        self.put_u16(0);
        self.put_u64(body_size);
    }

    /// A complete body frame for one chunk.
    pub fn body(&mut self, channel: u16, chunk: &[u8]) {
        self.frame_start = self.buf.len();
        self.put_u8(frame_kind::BODY);
        self.put_u16(channel);
        self.put_u32(chunk.len() as u32);
        self.put_bytes(chunk);
        self.frame_end();
    }

    /// A complete 8-octet heartbeat frame.
    pub fn heartbeat(&mut self) {
        self.put_u8(frame_kind::HEARTBEAT);
        self.put_u16(0);
        self.put_u32(0);
        self.frame_end();
    }

    /// Append the 0xCE frame terminator.
    pub fn frame_end(&mut self) {
        self.put_u8(FRAME_END);
    }

    /// Backfill the current frame's payload size from the cursor position.
    /// Call after the last payload byte and before `frame_end`.
    pub fn set_frame_length(&mut self) {
        let payload = (self.buf.len() - self.frame_start - FRAME_PREFIX) as u32;
        let at = self.frame_start + SIZE_OFFSET;
        self.buf[at..at + 4].copy_from_slice(&payload.to_be_bytes());
    }
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::reader::ByteReader;
    use crate::codec::value::Decimal;
    use bytes::Bytes;

    #[test]
    fn heartbeat_is_eight_octets() {
        let mut w = FrameBuilder::new();
        w.heartbeat();
        let bytes = w.finish();
        assert_eq!(&bytes[..], &[8, 0, 0, 0, 0, 0, 0, 0xCE]);
    }

    #[test]
    fn method_frame_envelope() {
        let mut w = FrameBuilder::new();
        w.method_start(5, (20 << 16) | 11); // channel.open-ok
        w.put_long_string(""); // deprecated arg
        w.set_frame_length();
        w.frame_end();
        let bytes = w.finish();

        // kind | channel | size | payload | end
        assert_eq!(bytes[0], frame_kind::METHOD);
        assert_eq!(u16::from_be_bytes([bytes[1], bytes[2]]), 5);
        let size = u32::from_be_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]) as usize;
        assert_eq!(size, 4 + 4); // method id + empty longstr
        assert_eq!(bytes.len(), FRAME_PREFIX + size + 1);
        assert_eq!(*bytes.last().unwrap(), FRAME_END);
    }

    #[test]
    fn body_frame_envelope() {
        let mut w = FrameBuilder::new();
        w.body(2, b"payload");
        let bytes = w.finish();
        assert_eq!(bytes.len(), FRAME_PREFIX + 7 + 1);
        let size = u32::from_be_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
        assert_eq!(size, 7);
        assert_eq!(*bytes.last().unwrap(), FRAME_END);
    }

    #[test]
    fn table_roundtrip() {
        let mut table = FieldTable::new();
        table.insert("bool", true).unwrap();
        table.insert("int", -7i32).unwrap();
        table.insert("long", 1i64 << 40).unwrap();
        table.insert("str", "value").unwrap();
        table
            .insert("dec", FieldValue::Decimal(Decimal::new(2, 314)))
            .unwrap();
        table
            .insert("ts", FieldValue::Timestamp(1_700_000_000))
            .unwrap();
        table.insert("void", FieldValue::Void).unwrap();
        table
            .insert(
                "arr",
                FieldValue::Array(vec![FieldValue::U8(1), FieldValue::LongString("x".into())]),
            )
            .unwrap();
        let mut nested = FieldTable::new();
        nested.insert("inner", 1i32).unwrap();
        table.insert("tbl", FieldValue::Table(nested)).unwrap();

        let mut w = FrameBuilder::new();
        w.put_table(&table, "t").unwrap();
        let bytes = w.finish();

        let mut r = ByteReader::new(&bytes);
        let decoded = r.read_table("t").unwrap();
        assert_eq!(decoded, table);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn array_roundtrip() {
        let values = vec![
            FieldValue::I16(-3),
            FieldValue::Double(0.5),
            FieldValue::Binary(Bytes::from_static(b"\x00\x01")),
        ];
        let mut w = FrameBuilder::new();
        w.put_array(&values, "a").unwrap();
        let bytes = w.finish();

        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.read_array("a").unwrap(), values);
    }

    #[test]
    fn table_write_rejects_bad_key() {
        let mut table = FieldTable::new();
        table.insert_unchecked("0bad".into(), FieldValue::Void);
        let mut w = FrameBuilder::new();
        assert!(matches!(
            w.put_table(&table, "t"),
            Err(AmqpError::InvalidTableKey(_))
        ));
    }

    #[test]
    fn short_string_too_long() {
        let mut w = FrameBuilder::new();
        let long = "x".repeat(256);
        assert!(w.put_short_string(&long, "field").is_err());
    }

    #[test]
    fn several_frames_in_one_builder() {
        let mut w = FrameBuilder::new();
        w.method_start(1, (60 << 16) | 80);
        w.put_u64(9); // delivery tag
        w.put_bool(false);
        w.set_frame_length();
        w.frame_end();
        w.body(1, b"abc");
        let bytes = w.finish();

        // first frame: 7 + 13 + 1, second: 7 + 3 + 1
        assert_eq!(bytes.len(), 21 + 11);
        assert_eq!(bytes[20], FRAME_END);
        assert_eq!(bytes[31], FRAME_END);
    }
}
