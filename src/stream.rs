//! Stream adapters: the backpressured byte streams at both edges of the
//! wire core.
//!
//! On the consume side each delivery exposes a [`DeliveryBody`], a
//! bounded chunk queue fed by the content-assembly state machine. While
//! the application does not read, the queue fills and the producer (the
//! connection's demux task) suspends, which stops socket reads: the
//! broker's own TCP backpressure takes over and large messages never
//! accumulate in memory.
//!
//! On the publish side a [`PublishBody`] supplies the outgoing bytes:
//! nothing, a buffer, or any `AsyncRead` with an explicit declared size.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

use crate::error::{AmqpError, Result};

/// Chunks buffered per delivery body; with frame-sized chunks this holds
/// roughly one `frame_max` of bytes in flight.
pub(crate) const BODY_QUEUE_CHUNKS: usize = 1;

/// Readable message body delivered by a consumer.
///
/// Yields exactly `size()` bytes in wire order, either chunk-wise via
/// [`chunk`](Self::chunk) or through the [`AsyncRead`] implementation.
/// If the channel dies mid-message the stream ends early and reports the
/// truncation as an error.
pub struct DeliveryBody {
    rx: Option<mpsc::Receiver<Bytes>>,
    pending: Option<Bytes>,
    expected: u64,
    received: u64,
}

impl DeliveryBody {
    pub(crate) fn new(rx: mpsc::Receiver<Bytes>, expected: u64) -> Self {
        Self {
            rx: Some(rx),
            pending: None,
            expected,
            received: 0,
        }
    }

    /// A body with no content (`body_size == 0`).
    pub(crate) fn empty() -> Self {
        Self {
            rx: None,
            pending: None,
            expected: 0,
            received: 0,
        }
    }

    /// Declared body size from the content header.
    pub fn size(&self) -> u64 {
        self.expected
    }

    /// Await the next chunk; `None` once the full body has arrived.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        if let Some(bytes) = self.pending.take() {
            return Ok(Some(bytes));
        }
        let rx = match self.rx.as_mut() {
            Some(rx) => rx,
            None => return self.finish(),
        };
        match rx.recv().await {
            Some(bytes) => {
                self.received += bytes.len() as u64;
                Ok(Some(bytes))
            }
            None => {
                self.rx = None;
                self.finish()
            }
        }
    }

    /// Drain the remaining bytes into one buffer.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity((self.expected - self.received) as usize);
        while let Some(chunk) = self.chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    fn finish(&self) -> Result<Option<Bytes>> {
        if self.received < self.expected {
            Err(AmqpError::UnexpectedFrame(format!(
                "body ended after {} of {} bytes",
                self.received, self.expected
            )))
        } else {
            Ok(None)
        }
    }
}

impl AsyncRead for DeliveryBody {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if let Some(pending) = &mut self.pending {
                let n = pending.len().min(buf.remaining());
                buf.put_slice(&pending.split_to(n));
                if pending.is_empty() {
                    self.pending = None;
                }
                return Poll::Ready(Ok(()));
            }

            let rx = match self.rx.as_mut() {
                Some(rx) => rx,
                None => {
                    return Poll::Ready(match self.finish() {
                        Ok(_) => Ok(()),
                        Err(err) => Err(io::Error::new(io::ErrorKind::UnexpectedEof, err)),
                    })
                }
            };

            match rx.poll_recv(cx) {
                Poll::Ready(Some(bytes)) => {
                    self.received += bytes.len() as u64;
                    if !bytes.is_empty() {
                        self.pending = Some(bytes);
                    }
                }
                Poll::Ready(None) => {
                    self.rx = None;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Body of an outgoing publish.
pub enum PublishBody {
    /// No content; a zero-size header is still sent.
    Empty,
    /// A bounded in-memory buffer.
    Buffer(Bytes),
    /// A readable byte stream with an explicit declared size. The stream
    /// must yield exactly `size` bytes.
    Stream {
        reader: Box<dyn AsyncRead + Send + Unpin>,
        size: u64,
    },
}

impl PublishBody {
    pub fn stream(reader: impl AsyncRead + Send + Unpin + 'static, size: u64) -> Self {
        PublishBody::Stream {
            reader: Box::new(reader),
            size,
        }
    }

    /// Declared size in bytes.
    pub fn size(&self) -> u64 {
        match self {
            PublishBody::Empty => 0,
            PublishBody::Buffer(bytes) => bytes.len() as u64,
            PublishBody::Stream { size, .. } => *size,
        }
    }
}

impl From<Bytes> for PublishBody {
    fn from(bytes: Bytes) -> Self {
        PublishBody::Buffer(bytes)
    }
}

impl From<Vec<u8>> for PublishBody {
    fn from(bytes: Vec<u8>) -> Self {
        PublishBody::Buffer(Bytes::from(bytes))
    }
}

impl From<&'static str> for PublishBody {
    fn from(text: &'static str) -> Self {
        PublishBody::Buffer(Bytes::from_static(text.as_bytes()))
    }
}

impl Default for PublishBody {
    fn default() -> Self {
        PublishBody::Empty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn chunks_arrive_in_order() {
        let (tx, rx) = mpsc::channel(4);
        let mut body = DeliveryBody::new(rx, 6);

        tx.send(Bytes::from_static(b"abc")).await.unwrap();
        tx.send(Bytes::from_static(b"def")).await.unwrap();
        drop(tx);

        assert_eq!(body.chunk().await.unwrap().unwrap(), "abc");
        assert_eq!(body.chunk().await.unwrap().unwrap(), "def");
        assert!(body.chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn async_read_reassembles() {
        let (tx, rx) = mpsc::channel(4);
        let mut body = DeliveryBody::new(rx, 10);

        tokio::spawn(async move {
            tx.send(Bytes::from_static(b"0123")).await.unwrap();
            tx.send(Bytes::from_static(b"4567")).await.unwrap();
            tx.send(Bytes::from_static(b"89")).await.unwrap();
        });

        let mut out = Vec::new();
        AsyncReadExt::read_to_end(&mut body, &mut out).await.unwrap();
        assert_eq!(out, b"0123456789");
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let (tx, rx) = mpsc::channel(4);
        let mut body = DeliveryBody::new(rx, 100);

        tx.send(Bytes::from_static(b"only this")).await.unwrap();
        drop(tx); // channel died before the body completed

        assert!(body.chunk().await.unwrap().is_some());
        assert!(matches!(
            body.chunk().await,
            Err(AmqpError::UnexpectedFrame(_))
        ));
    }

    #[tokio::test]
    async fn empty_body() {
        let mut body = DeliveryBody::empty();
        assert_eq!(body.size(), 0);
        assert!(body.chunk().await.unwrap().is_none());

        let mut out = Vec::new();
        AsyncReadExt::read_to_end(&mut body, &mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn publish_body_sizes() {
        assert_eq!(PublishBody::Empty.size(), 0);
        assert_eq!(PublishBody::from("TEST").size(), 4);
        let reader = std::io::Cursor::new(vec![0u8; 32]);
        assert_eq!(PublishBody::stream(reader, 32).size(), 32);
    }
}
