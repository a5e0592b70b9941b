//! Typed frames.
//!
//! A frame is `{kind, channel, payload}`; on the wire it is
//! `kind(1) | channel(2) | payload_size(4) | payload | 0xCE`. The size
//! field excludes the envelope.

use bytes::Bytes;

use super::method::Method;
use super::properties::BasicProperties;
use crate::codec::FrameBuilder;
use crate::error::Result;
use crate::protocol::constants::frame_kind;

/// Payload of a decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FramePayload {
    Method(Method),
    Header {
        class_id: u16,
        body_size: u64,
        properties: BasicProperties,
    },
    Body(Bytes),
    Heartbeat,
}

/// A complete decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub channel: u16,
    pub payload: FramePayload,
}

impl Frame {
    pub fn method(channel: u16, method: Method) -> Self {
        Self {
            channel,
            payload: FramePayload::Method(method),
        }
    }

    pub fn header(channel: u16, class_id: u16, body_size: u64, properties: BasicProperties) -> Self {
        Self {
            channel,
            payload: FramePayload::Header {
                class_id,
                body_size,
                properties,
            },
        }
    }

    pub fn body(channel: u16, bytes: Bytes) -> Self {
        Self {
            channel,
            payload: FramePayload::Body(bytes),
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            channel: 0,
            payload: FramePayload::Heartbeat,
        }
    }

    pub fn kind(&self) -> u8 {
        match self.payload {
            FramePayload::Method(_) => frame_kind::METHOD,
            FramePayload::Header { .. } => frame_kind::HEADER,
            FramePayload::Body(_) => frame_kind::BODY,
            FramePayload::Heartbeat => frame_kind::HEARTBEAT,
        }
    }

    /// Append the complete wire form of this frame to a builder.
    pub fn encode(&self, w: &mut FrameBuilder) -> Result<()> {
        match &self.payload {
            FramePayload::Method(method) => {
                w.method_start(self.channel, method.id());
                method.encode_args(w)?;
                w.set_frame_length();
                w.frame_end();
            }
            FramePayload::Header {
                class_id,
                body_size,
                properties,
            } => {
                w.header_start(self.channel, *class_id, *body_size);
                properties.encode(w, "header.properties")?;
                w.set_frame_length();
                w.frame_end();
            }
            FramePayload::Body(bytes) => {
                w.body(self.channel, bytes);
            }
            FramePayload::Heartbeat => {
                w.heartbeat();
            }
        }
        Ok(())
    }

    /// The complete wire form as a standalone buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut w = FrameBuilder::new();
        self.encode(&mut w)?;
        Ok(w.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::FRAME_END;

    #[test]
    fn method_frame_to_bytes() {
        let frame = Frame::method(3, Method::ChannelOpen);
        let bytes = frame.to_bytes().unwrap();

        assert_eq!(bytes[0], frame_kind::METHOD);
        assert_eq!(u16::from_be_bytes([bytes[1], bytes[2]]), 3);
        let size = u32::from_be_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]) as usize;
        assert_eq!(bytes.len(), 7 + size + 1);
        assert_eq!(*bytes.last().unwrap(), FRAME_END);
    }

    #[test]
    fn header_frame_to_bytes() {
        let props = BasicProperties {
            app_id: Some("TEST".into()),
            ..Default::default()
        };
        let frame = Frame::header(1, 60, 1234, props);
        let bytes = frame.to_bytes().unwrap();

        let size = u32::from_be_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]) as usize;
        // class(2) + weight(2) + size(8) + mask(2) + "TEST"(5)
        assert_eq!(size, 19);
        assert_eq!(bytes.len(), 7 + size + 1);
        assert_eq!(*bytes.last().unwrap(), FRAME_END);
    }

    #[test]
    fn heartbeat_frame_to_bytes() {
        let bytes = Frame::heartbeat().to_bytes().unwrap();
        assert_eq!(&bytes[..], &[frame_kind::HEARTBEAT, 0, 0, 0, 0, 0, 0, FRAME_END]);
    }
}
