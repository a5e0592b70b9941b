//! Publish channel: publisher confirms with streamed bodies.
//!
//! Every message goes out `mandatory` so an unroutable publish comes back
//! as `basic.return` instead of vanishing; `immediate` stays off (modern
//! brokers dropped it). The confirm waiter is registered for `basic.ack`
//! *and* `basic.return` before the first frame is written: whichever
//! arrives first settles the message, and a straggler ack after a return
//! is absorbed by the channel role.
//!
//! `publish` takes `&mut self` and does not resolve until the confirm
//! arrives, which serializes messages on the channel: the method, header
//! and body frames of one message are never interleaved with another
//! publish on the same channel.

use std::sync::Arc;

use tracing::debug;

use crate::channel::ChannelInner;
use crate::codec::{assert_name, FrameBuilder, FRAME_OVERHEAD};
use crate::error::{AmqpError, Result};
use crate::protocol::constants::{class, method_id};
use crate::protocol::{BasicProperties, Frame, Method};
use crate::stream::PublishBody;

/// One message to publish.
pub struct PublishMessage {
    /// Empty string is the default exchange.
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: PublishBody,
}

impl PublishMessage {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            properties: BasicProperties::default(),
            body: PublishBody::Empty,
        }
    }

    pub fn properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn body(mut self, body: impl Into<PublishBody>) -> Self {
        self.body = body.into();
        self
    }
}

/// Broker acknowledgement of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirm {
    pub delivery_tag: u64,
    pub multiple: bool,
}

/// A confirm-mode publisher owning one channel.
pub struct Publisher {
    channel: Arc<ChannelInner>,
    confirms_enabled: bool,
}

impl Publisher {
    pub(crate) fn new(channel: Arc<ChannelInner>) -> Self {
        Self {
            channel,
            confirms_enabled: false,
        }
    }

    /// Publish one message and await its confirm. Resolves `Ok` on
    /// `basic.ack`; an unroutable mandatory message resolves
    /// `Err(Returned)` on `basic.return`.
    pub async fn publish(&mut self, message: PublishMessage) -> Result<Confirm> {
        if let Some(priority) = message.properties.priority {
            if priority > 9 {
                return Err(AmqpError::InvalidPriority(priority));
            }
        }
        assert_name(&message.exchange, "exchange")?;

        if !self.confirms_enabled {
            self.channel
                .call_method(
                    Method::ConfirmSelect { no_wait: false },
                    &[method_id::CONFIRM_SELECT_OK],
                )
                .await?;
            self.confirms_enabled = true;
        }

        let body_size = message.body.size();
        let channel_id = self.channel.id;

        // basic.publish + content header, contiguous in one buffer.
        let mut head = FrameBuilder::new();
        Frame::method(
            channel_id,
            Method::BasicPublish {
                exchange: message.exchange,
                routing_key: message.routing_key,
                mandatory: true,
                immediate: false,
            },
        )
        .encode(&mut head)?;
        head.header_start(channel_id, class::BASIC, body_size);
        message.properties.encode(&mut head, "publish.properties")?;
        head.set_frame_length();
        head.frame_end();

        let pending = self
            .channel
            .begin_call(&[method_id::BASIC_ACK, method_id::BASIC_RETURN])?;

        if let Err(err) = self.channel.send_bytes(head.finish()).await {
            pending.fail(&self.channel, err.clone());
            return Err(err);
        }

        if let Err(err) = self.send_body(channel_id, message.body).await {
            pending.fail(&self.channel, err.clone());
            return Err(err);
        }

        match pending.wait(&self.channel).await? {
            Method::BasicAck {
                delivery_tag,
                multiple,
            } => {
                debug!(channel = channel_id, delivery_tag, "publish confirmed");
                Ok(Confirm {
                    delivery_tag,
                    multiple,
                })
            }
            Method::BasicReturn {
                reply_code,
                reply_text,
                exchange,
                routing_key,
            } => Err(AmqpError::Returned {
                reply_code,
                reply_text,
                exchange,
                routing_key,
            }),
            other => Err(AmqpError::UnexpectedFrame(format!("{other:?}"))),
        }
    }

    /// Emit the body as frames no larger than the negotiated frame size.
    async fn send_body(&self, channel_id: u16, body: PublishBody) -> Result<()> {
        let capacity = self.body_frame_capacity();
        match body {
            PublishBody::Empty => Ok(()),
            PublishBody::Buffer(bytes) => {
                let mut offset = 0;
                while offset < bytes.len() {
                    let end = (offset + capacity).min(bytes.len());
                    let mut w = FrameBuilder::with_capacity(end - offset + FRAME_OVERHEAD);
                    w.body(channel_id, &bytes[offset..end]);
                    self.channel.send_bytes(w.finish()).await?;
                    offset = end;
                }
                Ok(())
            }
            PublishBody::Stream { mut reader, size } => {
                use tokio::io::AsyncReadExt;

                let mut remaining = size;
                while remaining > 0 {
                    let want = (remaining as usize).min(capacity);
                    let mut chunk = vec![0u8; want];
                    match reader.read_exact(&mut chunk).await {
                        Ok(_) => {}
                        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                            return Err(AmqpError::UnexpectedFrame(format!(
                                "publish body ended {remaining} bytes early"
                            )));
                        }
                        Err(err) => return Err(err.into()),
                    }
                    remaining -= chunk.len() as u64;
                    let mut w = FrameBuilder::with_capacity(chunk.len() + FRAME_OVERHEAD);
                    w.body(channel_id, &chunk);
                    self.channel.send_bytes(w.finish()).await?;
                }
                Ok(())
            }
        }
    }

    /// Bytes of body payload that fit one frame within the negotiated
    /// frame size.
    fn body_frame_capacity(&self) -> usize {
        let frame_max = self
            .channel
            .conn
            .upgrade()
            .map(|conn| conn.frame_max())
            .unwrap_or(crate::protocol::constants::FRAME_MIN_SIZE);
        (frame_max as usize).saturating_sub(FRAME_OVERHEAD).max(1)
    }

    /// Close the publisher's channel gracefully.
    pub async fn close(self) -> Result<()> {
        self.channel.close(None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_builder() {
        let message = PublishMessage::new("logs", "info")
            .properties(BasicProperties {
                app_id: Some("TEST".into()),
                ..Default::default()
            })
            .body("payload");
        assert_eq!(message.exchange, "logs");
        assert_eq!(message.routing_key, "info");
        assert_eq!(message.body.size(), 7);
        assert_eq!(message.properties.app_id.as_deref(), Some("TEST"));
    }
}
