//! Frame decoder: turns the raw socket byte stream into typed frames.
//!
//! Bytes arrive in arbitrary chunks; a carry-over buffer holds whatever
//! did not yet complete a frame. `push` extracts as many complete frames
//! as the accumulated bytes allow.
//!
//! A special case applies before the first frame: a broker that does not
//! speak our protocol version answers the client header with its own
//! 8-octet `AMQP\0 major minor revision` header and closes; that reply is
//! surfaced as a version-mismatch error rather than a frame.

use bytes::{Buf, Bytes, BytesMut};

use super::frame::{Frame, FramePayload};
use super::method::Method;
use super::properties::BasicProperties;
use crate::codec::{ByteReader, FRAME_PREFIX};
use crate::error::{AmqpError, Result};
use crate::protocol::constants::{frame_kind, FRAME_END};

pub struct FrameDecoder {
    buffer: BytesMut,
    /// Cleared once the first complete frame has been decoded; while set,
    /// an `AMQP` prefix means protocol-version mismatch.
    awaiting_first: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            awaiting_first: true,
        }
    }

    /// Number of buffered bytes not yet forming a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Push a chunk and extract every complete frame it finishes.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        if self.awaiting_first && self.buffer.len() >= 8 && self.buffer.starts_with(b"AMQP") {
            return Err(AmqpError::VersionMismatch {
                major: self.buffer[5],
                minor: self.buffer[6],
                revision: self.buffer[7],
            });
        }

        if self.buffer.len() < FRAME_PREFIX {
            return Ok(None);
        }

        // Peek the envelope without consuming; partial frames stay buffered.
        let kind = self.buffer[0];
        let channel = u16::from_be_bytes([self.buffer[1], self.buffer[2]]);
        let size = u32::from_be_bytes([
            self.buffer[3],
            self.buffer[4],
            self.buffer[5],
            self.buffer[6],
        ]) as usize;

        let total = FRAME_PREFIX + size + 1;
        if self.buffer.len() < total {
            return Ok(None);
        }

        if self.buffer[total - 1] != FRAME_END {
            return Err(AmqpError::FrameEndInvalid);
        }

        self.buffer.advance(FRAME_PREFIX);
        let payload = self.buffer.split_to(size).freeze();
        self.buffer.advance(1); // frame end
        self.awaiting_first = false;

        let frame = Self::decode_payload(kind, channel, payload)?;
        Ok(Some(frame))
    }

    fn decode_payload(kind: u8, channel: u16, payload: Bytes) -> Result<Frame> {
        match kind {
            frame_kind::METHOD => {
                let mut r = ByteReader::new(&payload);
                let method = Method::decode(&mut r)?;
                Ok(Frame::method(channel, method))
            }
            frame_kind::HEADER => {
                let mut r = ByteReader::new(&payload);
                let class_id = r.read_u16("header.class_id")?;
                let _ = r.read_u16("header.weight")?;
                let body_size = r.read_u64("header.body_size")?;
                let properties = BasicProperties::decode(&mut r, "header.properties")?;
                Ok(Frame::header(channel, class_id, body_size, properties))
            }
            frame_kind::BODY => Ok(Frame {
                channel,
                payload: FramePayload::Body(payload),
            }),
            frame_kind::HEARTBEAT => Ok(Frame::heartbeat()),
            other => Err(AmqpError::UnknownFrameKind(other)),
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_open_bytes(channel: u16) -> Bytes {
        Frame::method(channel, Method::ChannelOpen).to_bytes().unwrap()
    }

    #[test]
    fn single_complete_frame() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&channel_open_bytes(1)).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], Frame::method(1, Method::ChannelOpen));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut decoder = FrameDecoder::new();
        let mut data = Vec::new();
        data.extend_from_slice(&channel_open_bytes(1));
        data.extend_from_slice(&Frame::heartbeat().to_bytes().unwrap());
        data.extend_from_slice(&channel_open_bytes(2));

        let frames = decoder.push(&data).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].payload, FramePayload::Heartbeat);
        assert_eq!(frames[2].channel, 2);
    }

    #[test]
    fn byte_at_a_time() {
        let mut decoder = FrameDecoder::new();
        let bytes = channel_open_bytes(7);

        let mut all = Vec::new();
        for b in bytes.iter() {
            all.extend(decoder.push(&[*b]).unwrap());
        }
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].channel, 7);
    }

    #[test]
    fn bad_frame_end_is_fatal() {
        let mut decoder = FrameDecoder::new();
        let mut bytes = channel_open_bytes(1).to_vec();
        *bytes.last_mut().unwrap() = 0x00;
        assert!(matches!(
            decoder.push(&bytes),
            Err(AmqpError::FrameEndInvalid)
        ));
    }

    #[test]
    fn unknown_frame_kind_is_fatal() {
        let mut decoder = FrameDecoder::new();
        // kind 9, channel 0, size 0, end
        let bytes = [9u8, 0, 0, 0, 0, 0, 0, FRAME_END];
        assert!(matches!(
            decoder.push(&bytes),
            Err(AmqpError::UnknownFrameKind(9))
        ));
    }

    #[test]
    fn unknown_method_id_is_fatal() {
        let mut decoder = FrameDecoder::new();
        // method frame, channel 0, size 4, bogus id
        let mut bytes = vec![frame_kind::METHOD, 0, 0, 0, 0, 0, 4];
        bytes.extend_from_slice(&0x0063_0001u32.to_be_bytes());
        bytes.push(FRAME_END);
        assert!(matches!(
            decoder.push(&bytes),
            Err(AmqpError::UnknownMethod(_))
        ));
    }

    #[test]
    fn protocol_mismatch_reply() {
        let mut decoder = FrameDecoder::new();
        let err = decoder.push(b"AMQP\x00\x00\x08\x00").unwrap_err();
        match err {
            AmqpError::VersionMismatch {
                major,
                minor,
                revision,
            } => {
                assert_eq!((major, minor, revision), (0, 8, 0));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn amqp_prefix_after_first_frame_is_not_special() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&Frame::heartbeat().to_bytes().unwrap()).unwrap();

        // A body frame whose payload happens to begin with "AMQP".
        let body = Frame::body(1, Bytes::from_static(b"AMQPdata"));
        let frames = decoder.push(&body.to_bytes().unwrap()).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn header_frame_decodes_properties() {
        let props = BasicProperties {
            app_id: Some("TEST".into()),
            delivery_mode: Some(2),
            ..Default::default()
        };
        let frame = Frame::header(4, 60, 77, props.clone());
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&frame.to_bytes().unwrap()).unwrap();
        match &frames[0].payload {
            FramePayload::Header {
                class_id,
                body_size,
                properties,
            } => {
                assert_eq!(*class_id, 60);
                assert_eq!(*body_size, 77);
                assert_eq!(properties, &props);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
