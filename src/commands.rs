//! Command helpers: thin facades over the channel's request/response
//! machinery for exchange and queue management.
//!
//! Nothing here owns protocol state; every helper encodes one method,
//! awaits its `-ok`, and shapes the reply. Name assertions run before
//! anything is written.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::channel::{ChannelInner, Role};
use crate::codec::{assert_name, assert_not_empty, FieldTable};
use crate::connection::Connection;
use crate::error::{reply_code, AmqpError, Result};
use crate::protocol::constants::method_id;
use crate::protocol::Method;

/// Exchange declaration options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
}

/// Queue declaration options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

/// Shape of `queue.declare-ok`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A command channel.
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

impl Channel {
    pub(crate) fn new(inner: Arc<ChannelInner>) -> Self {
        Self { inner }
    }

    /// `exchange.declare` with the given type (`direct`, `fanout`,
    /// `topic`, `headers`).
    pub async fn exchange_declare(
        &self,
        exchange: &str,
        exchange_type: &str,
        options: ExchangeOptions,
    ) -> Result<()> {
        assert_not_empty(exchange, "exchange")?;
        assert_name(exchange, "exchange")?;
        self.inner
            .call_method(
                Method::ExchangeDeclare {
                    exchange: exchange.to_string(),
                    exchange_type: exchange_type.to_string(),
                    passive: false,
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: options.internal,
                    no_wait: false,
                    arguments: FieldTable::new(),
                },
                &[method_id::EXCHANGE_DECLARE_OK],
            )
            .await?;
        Ok(())
    }

    pub async fn exchange_delete(&self, exchange: &str, if_unused: bool) -> Result<()> {
        assert_not_empty(exchange, "exchange")?;
        assert_name(exchange, "exchange")?;
        self.inner
            .call_method(
                Method::ExchangeDelete {
                    exchange: exchange.to_string(),
                    if_unused,
                    no_wait: false,
                },
                &[method_id::EXCHANGE_DELETE_OK],
            )
            .await?;
        Ok(())
    }

    pub async fn queue_declare(&self, queue: &str, options: QueueOptions) -> Result<QueueInfo> {
        assert_name(queue, "queue")?;
        let reply = self
            .inner
            .call_method(
                Method::QueueDeclare {
                    queue: queue.to_string(),
                    passive: false,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    no_wait: false,
                    arguments: FieldTable::new(),
                },
                &[method_id::QUEUE_DECLARE_OK],
            )
            .await?;
        into_queue_info(reply)
    }

    pub async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        assert_name(queue, "queue")?;
        assert_name(exchange, "exchange")?;
        self.inner
            .call_method(
                Method::QueueBind {
                    queue: queue.to_string(),
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    no_wait: false,
                    arguments: FieldTable::new(),
                },
                &[method_id::QUEUE_BIND_OK],
            )
            .await?;
        Ok(())
    }

    pub async fn queue_unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        assert_name(queue, "queue")?;
        assert_name(exchange, "exchange")?;
        self.inner
            .call_method(
                Method::QueueUnbind {
                    queue: queue.to_string(),
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    arguments: FieldTable::new(),
                },
                &[method_id::QUEUE_UNBIND_OK],
            )
            .await?;
        Ok(())
    }

    /// Returns the number of messages purged.
    pub async fn queue_purge(&self, queue: &str) -> Result<u32> {
        assert_not_empty(queue, "queue")?;
        assert_name(queue, "queue")?;
        let reply = self
            .inner
            .call_method(
                Method::QueuePurge {
                    queue: queue.to_string(),
                    no_wait: false,
                },
                &[method_id::QUEUE_PURGE_OK],
            )
            .await?;
        match reply {
            Method::QueuePurgeOk { message_count } => Ok(message_count),
            other => Err(AmqpError::UnexpectedFrame(format!("{other:?}"))),
        }
    }

    /// Returns the number of messages deleted with the queue.
    pub async fn queue_delete(&self, queue: &str, if_unused: bool, if_empty: bool) -> Result<u32> {
        assert_not_empty(queue, "queue")?;
        assert_name(queue, "queue")?;
        let reply = self
            .inner
            .call_method(
                Method::QueueDelete {
                    queue: queue.to_string(),
                    if_unused,
                    if_empty,
                    no_wait: false,
                },
                &[method_id::QUEUE_DELETE_OK],
            )
            .await?;
        match reply {
            Method::QueueDeleteOk { message_count } => Ok(message_count),
            other => Err(AmqpError::UnexpectedFrame(format!("{other:?}"))),
        }
    }

    /// Graceful close of this channel.
    pub async fn close(self) -> Result<()> {
        self.inner.close(None).await
    }
}

fn into_queue_info(reply: Method) -> Result<QueueInfo> {
    match reply {
        Method::QueueDeclareOk {
            queue,
            message_count,
            consumer_count,
        } => Ok(QueueInfo {
            queue,
            message_count,
            consumer_count,
        }),
        other => Err(AmqpError::UnexpectedFrame(format!("{other:?}"))),
    }
}

/// Passive-declare probes. A failed passive declare kills its channel
/// with `404 NOT_FOUND`, so each probe runs on a throwaway channel.
impl Connection {
    /// True if the exchange exists.
    pub async fn exchange_exists(&self, exchange: &str) -> Result<bool> {
        assert_not_empty(exchange, "exchange")?;
        assert_name(exchange, "exchange")?;

        let probe = self.inner.open_channel(Role::Rpc).await?;
        let result = probe
            .call_method(
                Method::ExchangeDeclare {
                    exchange: exchange.to_string(),
                    exchange_type: String::new(),
                    passive: true,
                    durable: false,
                    auto_delete: false,
                    internal: false,
                    no_wait: false,
                    arguments: FieldTable::new(),
                },
                &[method_id::EXCHANGE_DECLARE_OK],
            )
            .await;

        match result {
            Ok(_) => {
                probe.close(None).await?;
                Ok(true)
            }
            Err(err) => not_found_as_false(err),
        }
    }

    /// Counts for an existing queue, via passive declare.
    pub async fn queue_stat(&self, queue: &str) -> Result<QueueInfo> {
        assert_not_empty(queue, "queue")?;
        assert_name(queue, "queue")?;

        let probe = self.inner.open_channel(Role::Rpc).await?;
        let reply = probe
            .call_method(
                Method::QueueDeclare {
                    queue: queue.to_string(),
                    passive: true,
                    durable: false,
                    exclusive: false,
                    auto_delete: false,
                    no_wait: false,
                    arguments: FieldTable::new(),
                },
                &[method_id::QUEUE_DECLARE_OK],
            )
            .await?;
        probe.close(None).await?;
        into_queue_info(reply)
    }

    /// True if the queue exists.
    pub async fn queue_exists(&self, queue: &str) -> Result<bool> {
        match self.queue_stat(queue).await {
            Ok(_) => Ok(true),
            Err(err) => not_found_as_false(err),
        }
    }
}

fn not_found_as_false(err: AmqpError) -> Result<bool> {
    match &err {
        AmqpError::ChannelClosed { reason } if reason.reply_code == reply_code::NOT_FOUND => {
            Ok(false)
        }
        _ => Err(err),
    }
}
