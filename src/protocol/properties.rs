//! Basic-class content properties.
//!
//! A content header carries a 16-bit presence mask, MSB first: the i-th
//! property in declaration order is present when bit `1 << (15 - i)` is
//! set. The basic class declares 13 properties.

use crate::codec::{ByteReader, FieldTable, FrameBuilder};
use crate::error::Result;

/// Bit positions (`15 - i`) for each property in declaration order.
mod bit {
    pub const CONTENT_TYPE: u16 = 15;
    pub const CONTENT_ENCODING: u16 = 14;
    pub const HEADERS: u16 = 13;
    pub const DELIVERY_MODE: u16 = 12;
    pub const PRIORITY: u16 = 11;
    pub const CORRELATION_ID: u16 = 10;
    pub const REPLY_TO: u16 = 9;
    pub const EXPIRATION: u16 = 8;
    pub const MESSAGE_ID: u16 = 7;
    pub const TIMESTAMP: u16 = 6;
    pub const MESSAGE_TYPE: u16 = 5;
    pub const USER_ID: u16 = 4;
    pub const APP_ID: u16 = 3;
}

/// Message properties from the basic class. Every field is optional; only
/// the ones present are encoded, flagged in the presence mask.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BasicProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: Option<FieldTable>,
    /// 1 = transient, 2 = persistent; passed through untouched.
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    /// Seconds since the epoch.
    pub timestamp: Option<u64>,
    pub message_type: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
}

impl BasicProperties {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn decode(r: &mut ByteReader<'_>, path: &str) -> Result<Self> {
        let mask = r.read_u16(path)?;
        let mut props = Self::default();

        let present = |b: u16| mask & (1 << b) != 0;

        if present(bit::CONTENT_TYPE) {
            props.content_type = Some(r.read_short_string(path)?);
        }
        if present(bit::CONTENT_ENCODING) {
            props.content_encoding = Some(r.read_short_string(path)?);
        }
        if present(bit::HEADERS) {
            props.headers = Some(r.read_table(path)?);
        }
        if present(bit::DELIVERY_MODE) {
            props.delivery_mode = Some(r.read_u8(path)?);
        }
        if present(bit::PRIORITY) {
            props.priority = Some(r.read_u8(path)?);
        }
        if present(bit::CORRELATION_ID) {
            props.correlation_id = Some(r.read_short_string(path)?);
        }
        if present(bit::REPLY_TO) {
            props.reply_to = Some(r.read_short_string(path)?);
        }
        if present(bit::EXPIRATION) {
            props.expiration = Some(r.read_short_string(path)?);
        }
        if present(bit::MESSAGE_ID) {
            props.message_id = Some(r.read_short_string(path)?);
        }
        if present(bit::TIMESTAMP) {
            props.timestamp = Some(r.read_timestamp(path)?);
        }
        if present(bit::MESSAGE_TYPE) {
            props.message_type = Some(r.read_short_string(path)?);
        }
        if present(bit::USER_ID) {
            props.user_id = Some(r.read_short_string(path)?);
        }
        if present(bit::APP_ID) {
            props.app_id = Some(r.read_short_string(path)?);
        }

        Ok(props)
    }

    /// Encode presence mask and property fields. Like every other
    /// length-before-content structure, the mask slot is written first and
    /// patched once the fields are known.
    pub fn encode(&self, w: &mut FrameBuilder, path: &str) -> Result<()> {
        let mut mask: u16 = 0;
        let mut fields = FrameBuilder::new();

        if let Some(v) = &self.content_type {
            mask |= 1 << bit::CONTENT_TYPE;
            fields.put_short_string(v, path)?;
        }
        if let Some(v) = &self.content_encoding {
            mask |= 1 << bit::CONTENT_ENCODING;
            fields.put_short_string(v, path)?;
        }
        if let Some(v) = &self.headers {
            mask |= 1 << bit::HEADERS;
            fields.put_table(v, path)?;
        }
        if let Some(v) = self.delivery_mode {
            mask |= 1 << bit::DELIVERY_MODE;
            fields.put_u8(v);
        }
        if let Some(v) = self.priority {
            mask |= 1 << bit::PRIORITY;
            fields.put_u8(v);
        }
        if let Some(v) = &self.correlation_id {
            mask |= 1 << bit::CORRELATION_ID;
            fields.put_short_string(v, path)?;
        }
        if let Some(v) = &self.reply_to {
            mask |= 1 << bit::REPLY_TO;
            fields.put_short_string(v, path)?;
        }
        if let Some(v) = &self.expiration {
            mask |= 1 << bit::EXPIRATION;
            fields.put_short_string(v, path)?;
        }
        if let Some(v) = &self.message_id {
            mask |= 1 << bit::MESSAGE_ID;
            fields.put_short_string(v, path)?;
        }
        if let Some(v) = self.timestamp {
            mask |= 1 << bit::TIMESTAMP;
            fields.put_u64(v);
        }
        if let Some(v) = &self.message_type {
            mask |= 1 << bit::MESSAGE_TYPE;
            fields.put_short_string(v, path)?;
        }
        if let Some(v) = &self.user_id {
            mask |= 1 << bit::USER_ID;
            fields.put_short_string(v, path)?;
        }
        if let Some(v) = &self.app_id {
            mask |= 1 << bit::APP_ID;
            fields.put_short_string(v, path)?;
        }

        w.put_u16(mask);
        w.put_bytes(&fields.finish());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FieldValue;

    fn roundtrip(props: &BasicProperties) -> BasicProperties {
        let mut w = FrameBuilder::new();
        props.encode(&mut w, "properties").unwrap();
        let bytes = w.finish();
        let mut r = ByteReader::new(&bytes);
        BasicProperties::decode(&mut r, "properties").unwrap()
    }

    #[test]
    fn empty_properties() {
        let props = BasicProperties::default();
        assert!(props.is_empty());
        assert_eq!(roundtrip(&props), props);
    }

    #[test]
    fn all_properties() {
        let mut headers = FieldTable::new();
        headers.insert("x-key", "header-value").unwrap();
        headers.insert("n", 42i32).unwrap();

        let props = BasicProperties {
            content_type: Some("application/octet-stream".into()),
            content_encoding: Some("identity".into()),
            headers: Some(headers),
            delivery_mode: Some(2),
            priority: Some(5),
            correlation_id: Some("corr-1".into()),
            reply_to: Some("reply-q".into()),
            expiration: Some("60000".into()),
            message_id: Some("msg-7".into()),
            timestamp: Some(1_700_000_000),
            message_type: Some("event".into()),
            user_id: Some("guest".into()),
            app_id: Some("TEST".into()),
        };
        assert_eq!(roundtrip(&props), props);
    }

    #[test]
    fn sparse_flag_subsets() {
        // A handful of subsets; the mask must keep fields in declaration
        // order whatever is present.
        let subsets = [
            BasicProperties {
                app_id: Some("TEST".into()),
                ..Default::default()
            },
            BasicProperties {
                content_type: Some("text/plain".into()),
                timestamp: Some(123),
                ..Default::default()
            },
            BasicProperties {
                delivery_mode: Some(1),
                priority: Some(9),
                user_id: Some("u".into()),
                ..Default::default()
            },
        ];
        for props in subsets {
            assert_eq!(roundtrip(&props), props);
        }
    }

    #[test]
    fn mask_bits_msb_first() {
        let props = BasicProperties {
            content_type: Some("t".into()),
            ..Default::default()
        };
        let mut w = FrameBuilder::new();
        props.encode(&mut w, "p").unwrap();
        let bytes = w.finish();
        assert_eq!(u16::from_be_bytes([bytes[0], bytes[1]]), 1 << 15);
    }

    #[test]
    fn headers_table_value() {
        let mut headers = FieldTable::new();
        headers.insert("x-stream-offset", 100i64).unwrap();
        let props = BasicProperties {
            headers: Some(headers.clone()),
            ..Default::default()
        };
        let decoded = roundtrip(&props);
        assert_eq!(
            decoded.headers.unwrap().get("x-stream-offset"),
            Some(&FieldValue::I64(100))
        );
    }
}
