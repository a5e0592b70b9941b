//! # amqflow
//!
//! Streaming client core for the AMQP 0-9-1 wire protocol, suitable for
//! talking to a RabbitMQ-compatible broker.
//!
//! Unlike clients that buffer whole message bodies in memory, both
//! published and consumed payloads flow through as bounded, backpressured
//! byte streams, so a large message never needs to reside fully in RAM. A
//! slow consumer slows the socket; a slow broker slows the publisher.
//!
//! ## Architecture
//!
//! - **Codec** ([`codec`]): typed big-endian readers/writers, the
//!   field-table grammar, and the frame envelope helpers.
//! - **Protocol tables** ([`protocol`]): every method of the connection,
//!   channel, exchange, queue, basic, confirm and tx classes with its
//!   decoder, encoder and canonical name.
//! - **Connection** ([`Connection`]): handshake, SASL (PLAIN/AMQPLAIN),
//!   tuning, heartbeats, channel multiplexing, graceful and forced close.
//! - **Channels**: request/response matching with FIFO waiters, plus
//!   per-role content handling for publishers and consumers.
//!
//! ## Example
//!
//! ```ignore
//! use amqflow::{ConnectOptions, Connection, PublishMessage, SubscribeOptions};
//!
//! #[tokio::main]
//! async fn main() -> amqflow::Result<()> {
//!     let conn = Connection::connect(ConnectOptions::default()).await?;
//!
//!     let mut publisher = conn.publisher().await?;
//!     publisher
//!         .publish(PublishMessage::new("", "work").body("hello"))
//!         .await?;
//!
//!     let mut consumer = conn.subscribe(SubscribeOptions::new("work")).await?;
//!     while let Some(mut delivery) = consumer.next().await? {
//!         let body = delivery.body.read_to_end().await?;
//!         println!("{} bytes", body.len());
//!         delivery.ack().await?;
//!     }
//!
//!     conn.close().await
//! }
//! ```

pub mod codec;
pub mod protocol;

mod channel;
mod commands;
mod connection;
mod consume;
mod error;
mod publish;
mod stream;

pub use commands::{Channel, ExchangeOptions, QueueInfo, QueueOptions};
pub use connection::{AuthMechanism, ConnectOptions, Connection};
pub use consume::{Consumer, Delivery, SubscribeOptions};
pub use error::{reply_code, AmqpError, CloseReason, Result};
pub use protocol::BasicProperties;
pub use publish::{Confirm, PublishMessage, Publisher};
pub use stream::{DeliveryBody, PublishBody};
