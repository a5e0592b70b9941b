//! Protocol method tables.
//!
//! One variant per method of the classes connection(10), channel(20),
//! exchange(40), queue(50), basic(60), confirm(85) and tx(90), each with a
//! decoder (reader -> args), an encoder (args -> writer) and a canonical
//! name. The tables are mechanical transcriptions of the RabbitMQ 0-9-1
//! XML: reserved fields decode as skips and encode as zero fill, and runs
//! of consecutive bit arguments share one octet, LSB = first declared bit.

use bytes::Bytes;

use crate::codec::{ByteReader, FieldTable, FrameBuilder};
use crate::error::{AmqpError, Result};
use crate::protocol::constants::method_id as id;

/// A decoded method frame payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    ConnectionStart {
        version_major: u8,
        version_minor: u8,
        server_properties: FieldTable,
        mechanisms: String,
        locales: String,
    },
    ConnectionStartOk {
        client_properties: FieldTable,
        mechanism: String,
        response: Bytes,
        locale: String,
    },
    ConnectionSecure {
        challenge: Bytes,
    },
    ConnectionSecureOk {
        response: Bytes,
    },
    ConnectionTune {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionTuneOk {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionOpen {
        vhost: String,
    },
    ConnectionOpenOk,
    ConnectionClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ConnectionCloseOk,
    ConnectionBlocked {
        reason: String,
    },
    ConnectionUnblocked,
    ConnectionUpdateSecret {
        new_secret: Bytes,
        reason: String,
    },
    ConnectionUpdateSecretOk,

    ChannelOpen,
    ChannelOpenOk,
    ChannelFlow {
        active: bool,
    },
    ChannelFlowOk {
        active: bool,
    },
    ChannelClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ChannelCloseOk,

    ExchangeDeclare {
        exchange: String,
        exchange_type: String,
        passive: bool,
        durable: bool,
        auto_delete: bool,
        internal: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    ExchangeDeclareOk,
    ExchangeDelete {
        exchange: String,
        if_unused: bool,
        no_wait: bool,
    },
    ExchangeDeleteOk,
    ExchangeBind {
        destination: String,
        source: String,
        routing_key: String,
        no_wait: bool,
        arguments: FieldTable,
    },
    ExchangeBindOk,
    ExchangeUnbind {
        destination: String,
        source: String,
        routing_key: String,
        no_wait: bool,
        arguments: FieldTable,
    },
    ExchangeUnbindOk,

    QueueDeclare {
        queue: String,
        passive: bool,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    QueueDeclareOk {
        queue: String,
        message_count: u32,
        consumer_count: u32,
    },
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
        no_wait: bool,
        arguments: FieldTable,
    },
    QueueBindOk,
    QueuePurge {
        queue: String,
        no_wait: bool,
    },
    QueuePurgeOk {
        message_count: u32,
    },
    QueueDelete {
        queue: String,
        if_unused: bool,
        if_empty: bool,
        no_wait: bool,
    },
    QueueDeleteOk {
        message_count: u32,
    },
    QueueUnbind {
        queue: String,
        exchange: String,
        routing_key: String,
        arguments: FieldTable,
    },
    QueueUnbindOk,

    BasicQos {
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    },
    BasicQosOk,
    BasicConsume {
        queue: String,
        consumer_tag: String,
        no_local: bool,
        no_ack: bool,
        exclusive: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    BasicConsumeOk {
        consumer_tag: String,
    },
    BasicCancel {
        consumer_tag: String,
        no_wait: bool,
    },
    BasicCancelOk {
        consumer_tag: String,
    },
    BasicPublish {
        exchange: String,
        routing_key: String,
        mandatory: bool,
        immediate: bool,
    },
    BasicReturn {
        reply_code: u16,
        reply_text: String,
        exchange: String,
        routing_key: String,
    },
    BasicDeliver {
        consumer_tag: String,
        delivery_tag: u64,
        redelivered: bool,
        exchange: String,
        routing_key: String,
    },
    BasicGet {
        queue: String,
        no_ack: bool,
    },
    BasicGetOk {
        delivery_tag: u64,
        redelivered: bool,
        exchange: String,
        routing_key: String,
        message_count: u32,
    },
    BasicGetEmpty,
    BasicAck {
        delivery_tag: u64,
        multiple: bool,
    },
    BasicReject {
        delivery_tag: u64,
        requeue: bool,
    },
    BasicRecoverAsync {
        requeue: bool,
    },
    BasicRecover {
        requeue: bool,
    },
    BasicRecoverOk,
    BasicNack {
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    },

    ConfirmSelect {
        no_wait: bool,
    },
    ConfirmSelectOk,

    TxSelect,
    TxSelectOk,
    TxCommit,
    TxCommitOk,
    TxRollback,
    TxRollbackOk,
}

fn bit(octet: u8, n: u8) -> bool {
    octet & (1 << n) != 0
}

fn pack2(a: bool, b: bool) -> u8 {
    a as u8 | (b as u8) << 1
}

impl Method {
    /// The 32-bit wire id `(class << 16) | method`.
    pub fn id(&self) -> u32 {
        use Method::*;
        match self {
            ConnectionStart { .. } => id::CONNECTION_START,
            ConnectionStartOk { .. } => id::CONNECTION_START_OK,
            ConnectionSecure { .. } => id::CONNECTION_SECURE,
            ConnectionSecureOk { .. } => id::CONNECTION_SECURE_OK,
            ConnectionTune { .. } => id::CONNECTION_TUNE,
            ConnectionTuneOk { .. } => id::CONNECTION_TUNE_OK,
            ConnectionOpen { .. } => id::CONNECTION_OPEN,
            ConnectionOpenOk => id::CONNECTION_OPEN_OK,
            ConnectionClose { .. } => id::CONNECTION_CLOSE,
            ConnectionCloseOk => id::CONNECTION_CLOSE_OK,
            ConnectionBlocked { .. } => id::CONNECTION_BLOCKED,
            ConnectionUnblocked => id::CONNECTION_UNBLOCKED,
            ConnectionUpdateSecret { .. } => id::CONNECTION_UPDATE_SECRET,
            ConnectionUpdateSecretOk => id::CONNECTION_UPDATE_SECRET_OK,
            ChannelOpen => id::CHANNEL_OPEN,
            ChannelOpenOk => id::CHANNEL_OPEN_OK,
            ChannelFlow { .. } => id::CHANNEL_FLOW,
            ChannelFlowOk { .. } => id::CHANNEL_FLOW_OK,
            ChannelClose { .. } => id::CHANNEL_CLOSE,
            ChannelCloseOk => id::CHANNEL_CLOSE_OK,
            ExchangeDeclare { .. } => id::EXCHANGE_DECLARE,
            ExchangeDeclareOk => id::EXCHANGE_DECLARE_OK,
            ExchangeDelete { .. } => id::EXCHANGE_DELETE,
            ExchangeDeleteOk => id::EXCHANGE_DELETE_OK,
            ExchangeBind { .. } => id::EXCHANGE_BIND,
            ExchangeBindOk => id::EXCHANGE_BIND_OK,
            ExchangeUnbind { .. } => id::EXCHANGE_UNBIND,
            ExchangeUnbindOk => id::EXCHANGE_UNBIND_OK,
            QueueDeclare { .. } => id::QUEUE_DECLARE,
            QueueDeclareOk { .. } => id::QUEUE_DECLARE_OK,
            QueueBind { .. } => id::QUEUE_BIND,
            QueueBindOk => id::QUEUE_BIND_OK,
            QueuePurge { .. } => id::QUEUE_PURGE,
            QueuePurgeOk { .. } => id::QUEUE_PURGE_OK,
            QueueDelete { .. } => id::QUEUE_DELETE,
            QueueDeleteOk { .. } => id::QUEUE_DELETE_OK,
            QueueUnbind { .. } => id::QUEUE_UNBIND,
            QueueUnbindOk => id::QUEUE_UNBIND_OK,
            BasicQos { .. } => id::BASIC_QOS,
            BasicQosOk => id::BASIC_QOS_OK,
            BasicConsume { .. } => id::BASIC_CONSUME,
            BasicConsumeOk { .. } => id::BASIC_CONSUME_OK,
            BasicCancel { .. } => id::BASIC_CANCEL,
            BasicCancelOk { .. } => id::BASIC_CANCEL_OK,
            BasicPublish { .. } => id::BASIC_PUBLISH,
            BasicReturn { .. } => id::BASIC_RETURN,
            BasicDeliver { .. } => id::BASIC_DELIVER,
            BasicGet { .. } => id::BASIC_GET,
            BasicGetOk { .. } => id::BASIC_GET_OK,
            BasicGetEmpty => id::BASIC_GET_EMPTY,
            BasicAck { .. } => id::BASIC_ACK,
            BasicReject { .. } => id::BASIC_REJECT,
            BasicRecoverAsync { .. } => id::BASIC_RECOVER_ASYNC,
            BasicRecover { .. } => id::BASIC_RECOVER,
            BasicRecoverOk => id::BASIC_RECOVER_OK,
            BasicNack { .. } => id::BASIC_NACK,
            ConfirmSelect { .. } => id::CONFIRM_SELECT,
            ConfirmSelectOk => id::CONFIRM_SELECT_OK,
            TxSelect => id::TX_SELECT,
            TxSelectOk => id::TX_SELECT_OK,
            TxCommit => id::TX_COMMIT,
            TxCommitOk => id::TX_COMMIT_OK,
            TxRollback => id::TX_ROLLBACK,
            TxRollbackOk => id::TX_ROLLBACK_OK,
        }
    }

    /// Canonical method name.
    pub fn name(&self) -> &'static str {
        method_name(self.id()).unwrap_or("unknown")
    }

    /// True for methods whose semantics imply a following content header
    /// and body frames.
    pub fn has_content(&self) -> bool {
        matches!(
            self,
            Method::BasicPublish { .. }
                | Method::BasicReturn { .. }
                | Method::BasicDeliver { .. }
                | Method::BasicGetOk { .. }
        )
    }

    /// Decode a method payload (the reader is positioned after the frame
    /// prefix, at the method id).
    pub fn decode(r: &mut ByteReader<'_>) -> Result<Method> {
        let key = r.read_u32("method.id")?;
        let name = method_name(key).ok_or(AmqpError::UnknownMethod(key))?;

        match key {
            id::CONNECTION_START => Ok(Method::ConnectionStart {
                version_major: r.read_u8(name)?,
                version_minor: r.read_u8(name)?,
                server_properties: r.read_table(name)?,
                mechanisms: r.read_long_string(name)?,
                locales: r.read_long_string(name)?,
            }),
            id::CONNECTION_START_OK => Ok(Method::ConnectionStartOk {
                client_properties: r.read_table(name)?,
                mechanism: r.read_short_string(name)?,
                response: r.read_long_bytes(name)?,
                locale: r.read_short_string(name)?,
            }),
            id::CONNECTION_SECURE => Ok(Method::ConnectionSecure {
                challenge: r.read_long_bytes(name)?,
            }),
            id::CONNECTION_SECURE_OK => Ok(Method::ConnectionSecureOk {
                response: r.read_long_bytes(name)?,
            }),
            id::CONNECTION_TUNE => Ok(Method::ConnectionTune {
                channel_max: r.read_u16(name)?,
                frame_max: r.read_u32(name)?,
                heartbeat: r.read_u16(name)?,
            }),
            id::CONNECTION_TUNE_OK => Ok(Method::ConnectionTuneOk {
                channel_max: r.read_u16(name)?,
                frame_max: r.read_u32(name)?,
                heartbeat: r.read_u16(name)?,
            }),
            id::CONNECTION_OPEN => {
                let vhost = r.read_short_string(name)?;
                let _ = r.read_short_string(name)?; // reserved
                let _ = r.read_u8(name)?; // reserved
                Ok(Method::ConnectionOpen { vhost })
            }
            id::CONNECTION_OPEN_OK => {
                let _ = r.read_short_string(name)?; // reserved
                Ok(Method::ConnectionOpenOk)
            }
            id::CONNECTION_CLOSE => Ok(Method::ConnectionClose {
                reply_code: r.read_u16(name)?,
                reply_text: r.read_short_string(name)?,
                class_id: r.read_u16(name)?,
                method_id: r.read_u16(name)?,
            }),
            id::CONNECTION_CLOSE_OK => Ok(Method::ConnectionCloseOk),
            id::CONNECTION_BLOCKED => Ok(Method::ConnectionBlocked {
                reason: r.read_short_string(name)?,
            }),
            id::CONNECTION_UNBLOCKED => Ok(Method::ConnectionUnblocked),
            id::CONNECTION_UPDATE_SECRET => Ok(Method::ConnectionUpdateSecret {
                new_secret: r.read_long_bytes(name)?,
                reason: r.read_short_string(name)?,
            }),
            id::CONNECTION_UPDATE_SECRET_OK => Ok(Method::ConnectionUpdateSecretOk),

            id::CHANNEL_OPEN => {
                let _ = r.read_short_string(name)?; // reserved
                Ok(Method::ChannelOpen)
            }
            id::CHANNEL_OPEN_OK => {
                let _ = r.read_long_bytes(name)?; // reserved
                Ok(Method::ChannelOpenOk)
            }
            id::CHANNEL_FLOW => Ok(Method::ChannelFlow {
                active: r.read_bool(name)?,
            }),
            id::CHANNEL_FLOW_OK => Ok(Method::ChannelFlowOk {
                active: r.read_bool(name)?,
            }),
            id::CHANNEL_CLOSE => Ok(Method::ChannelClose {
                reply_code: r.read_u16(name)?,
                reply_text: r.read_short_string(name)?,
                class_id: r.read_u16(name)?,
                method_id: r.read_u16(name)?,
            }),
            id::CHANNEL_CLOSE_OK => Ok(Method::ChannelCloseOk),

            id::EXCHANGE_DECLARE => {
                r.skip(2, name)?; // reserved ticket
                let exchange = r.read_short_string(name)?;
                let exchange_type = r.read_short_string(name)?;
                let bits = r.read_u8(name)?;
                Ok(Method::ExchangeDeclare {
                    exchange,
                    exchange_type,
                    passive: bit(bits, 0),
                    durable: bit(bits, 1),
                    auto_delete: bit(bits, 2),
                    internal: bit(bits, 3),
                    no_wait: bit(bits, 4),
                    arguments: r.read_table(name)?,
                })
            }
            id::EXCHANGE_DECLARE_OK => Ok(Method::ExchangeDeclareOk),
            id::EXCHANGE_DELETE => {
                r.skip(2, name)?;
                let exchange = r.read_short_string(name)?;
                let bits = r.read_u8(name)?;
                Ok(Method::ExchangeDelete {
                    exchange,
                    if_unused: bit(bits, 0),
                    no_wait: bit(bits, 1),
                })
            }
            id::EXCHANGE_DELETE_OK => Ok(Method::ExchangeDeleteOk),
            id::EXCHANGE_BIND => {
                r.skip(2, name)?;
                Ok(Method::ExchangeBind {
                    destination: r.read_short_string(name)?,
                    source: r.read_short_string(name)?,
                    routing_key: r.read_short_string(name)?,
                    no_wait: r.read_bool(name)?,
                    arguments: r.read_table(name)?,
                })
            }
            id::EXCHANGE_BIND_OK => Ok(Method::ExchangeBindOk),
            id::EXCHANGE_UNBIND => {
                r.skip(2, name)?;
                Ok(Method::ExchangeUnbind {
                    destination: r.read_short_string(name)?,
                    source: r.read_short_string(name)?,
                    routing_key: r.read_short_string(name)?,
                    no_wait: r.read_bool(name)?,
                    arguments: r.read_table(name)?,
                })
            }
            id::EXCHANGE_UNBIND_OK => Ok(Method::ExchangeUnbindOk),

            id::QUEUE_DECLARE => {
                r.skip(2, name)?;
                let queue = r.read_short_string(name)?;
                let bits = r.read_u8(name)?;
                Ok(Method::QueueDeclare {
                    queue,
                    passive: bit(bits, 0),
                    durable: bit(bits, 1),
                    exclusive: bit(bits, 2),
                    auto_delete: bit(bits, 3),
                    no_wait: bit(bits, 4),
                    arguments: r.read_table(name)?,
                })
            }
            id::QUEUE_DECLARE_OK => Ok(Method::QueueDeclareOk {
                queue: r.read_short_string(name)?,
                message_count: r.read_u32(name)?,
                consumer_count: r.read_u32(name)?,
            }),
            id::QUEUE_BIND => {
                r.skip(2, name)?;
                Ok(Method::QueueBind {
                    queue: r.read_short_string(name)?,
                    exchange: r.read_short_string(name)?,
                    routing_key: r.read_short_string(name)?,
                    no_wait: r.read_bool(name)?,
                    arguments: r.read_table(name)?,
                })
            }
            id::QUEUE_BIND_OK => Ok(Method::QueueBindOk),
            id::QUEUE_PURGE => {
                r.skip(2, name)?;
                Ok(Method::QueuePurge {
                    queue: r.read_short_string(name)?,
                    no_wait: r.read_bool(name)?,
                })
            }
            id::QUEUE_PURGE_OK => Ok(Method::QueuePurgeOk {
                message_count: r.read_u32(name)?,
            }),
            id::QUEUE_DELETE => {
                r.skip(2, name)?;
                let queue = r.read_short_string(name)?;
                let bits = r.read_u8(name)?;
                Ok(Method::QueueDelete {
                    queue,
                    if_unused: bit(bits, 0),
                    if_empty: bit(bits, 1),
                    no_wait: bit(bits, 2),
                })
            }
            id::QUEUE_DELETE_OK => Ok(Method::QueueDeleteOk {
                message_count: r.read_u32(name)?,
            }),
            id::QUEUE_UNBIND => {
                r.skip(2, name)?;
                Ok(Method::QueueUnbind {
                    queue: r.read_short_string(name)?,
                    exchange: r.read_short_string(name)?,
                    routing_key: r.read_short_string(name)?,
                    arguments: r.read_table(name)?,
                })
            }
            id::QUEUE_UNBIND_OK => Ok(Method::QueueUnbindOk),

            id::BASIC_QOS => Ok(Method::BasicQos {
                prefetch_size: r.read_u32(name)?,
                prefetch_count: r.read_u16(name)?,
                global: r.read_bool(name)?,
            }),
            id::BASIC_QOS_OK => Ok(Method::BasicQosOk),
            id::BASIC_CONSUME => {
                r.skip(2, name)?;
                let queue = r.read_short_string(name)?;
                let consumer_tag = r.read_short_string(name)?;
                let bits = r.read_u8(name)?;
                Ok(Method::BasicConsume {
                    queue,
                    consumer_tag,
                    no_local: bit(bits, 0),
                    no_ack: bit(bits, 1),
                    exclusive: bit(bits, 2),
                    no_wait: bit(bits, 3),
                    arguments: r.read_table(name)?,
                })
            }
            id::BASIC_CONSUME_OK => Ok(Method::BasicConsumeOk {
                consumer_tag: r.read_short_string(name)?,
            }),
            id::BASIC_CANCEL => Ok(Method::BasicCancel {
                consumer_tag: r.read_short_string(name)?,
                no_wait: r.read_bool(name)?,
            }),
            id::BASIC_CANCEL_OK => Ok(Method::BasicCancelOk {
                consumer_tag: r.read_short_string(name)?,
            }),
            id::BASIC_PUBLISH => {
                r.skip(2, name)?;
                let exchange = r.read_short_string(name)?;
                let routing_key = r.read_short_string(name)?;
                let bits = r.read_u8(name)?;
                Ok(Method::BasicPublish {
                    exchange,
                    routing_key,
                    mandatory: bit(bits, 0),
                    immediate: bit(bits, 1),
                })
            }
            id::BASIC_RETURN => Ok(Method::BasicReturn {
                reply_code: r.read_u16(name)?,
                reply_text: r.read_short_string(name)?,
                exchange: r.read_short_string(name)?,
                routing_key: r.read_short_string(name)?,
            }),
            id::BASIC_DELIVER => Ok(Method::BasicDeliver {
                consumer_tag: r.read_short_string(name)?,
                delivery_tag: r.read_u64(name)?,
                redelivered: r.read_bool(name)?,
                exchange: r.read_short_string(name)?,
                routing_key: r.read_short_string(name)?,
            }),
            id::BASIC_GET => {
                r.skip(2, name)?;
                Ok(Method::BasicGet {
                    queue: r.read_short_string(name)?,
                    no_ack: r.read_bool(name)?,
                })
            }
            id::BASIC_GET_OK => Ok(Method::BasicGetOk {
                delivery_tag: r.read_u64(name)?,
                redelivered: r.read_bool(name)?,
                exchange: r.read_short_string(name)?,
                routing_key: r.read_short_string(name)?,
                message_count: r.read_u32(name)?,
            }),
            id::BASIC_GET_EMPTY => {
                let _ = r.read_short_string(name)?; // reserved
                Ok(Method::BasicGetEmpty)
            }
            id::BASIC_ACK => Ok(Method::BasicAck {
                delivery_tag: r.read_u64(name)?,
                multiple: r.read_bool(name)?,
            }),
            id::BASIC_REJECT => Ok(Method::BasicReject {
                delivery_tag: r.read_u64(name)?,
                requeue: r.read_bool(name)?,
            }),
            id::BASIC_RECOVER_ASYNC => Ok(Method::BasicRecoverAsync {
                requeue: r.read_bool(name)?,
            }),
            id::BASIC_RECOVER => Ok(Method::BasicRecover {
                requeue: r.read_bool(name)?,
            }),
            id::BASIC_RECOVER_OK => Ok(Method::BasicRecoverOk),
            id::BASIC_NACK => {
                let delivery_tag = r.read_u64(name)?;
                let bits = r.read_u8(name)?;
                Ok(Method::BasicNack {
                    delivery_tag,
                    multiple: bit(bits, 0),
                    requeue: bit(bits, 1),
                })
            }

            id::CONFIRM_SELECT => Ok(Method::ConfirmSelect {
                no_wait: r.read_bool(name)?,
            }),
            id::CONFIRM_SELECT_OK => Ok(Method::ConfirmSelectOk),

            id::TX_SELECT => Ok(Method::TxSelect),
            id::TX_SELECT_OK => Ok(Method::TxSelectOk),
            id::TX_COMMIT => Ok(Method::TxCommit),
            id::TX_COMMIT_OK => Ok(Method::TxCommitOk),
            id::TX_ROLLBACK => Ok(Method::TxRollback),
            id::TX_ROLLBACK_OK => Ok(Method::TxRollbackOk),

            other => Err(AmqpError::UnknownMethod(other)),
        }
    }

    /// Encode the method arguments (the caller has already written the
    /// frame prefix and method id via `method_start`).
    pub fn encode_args(&self, w: &mut FrameBuilder) -> Result<()> {
        let name = self.name();
        match self {
            Method::ConnectionStart {
                version_major,
                version_minor,
                server_properties,
                mechanisms,
                locales,
            } => {
                w.put_u8(*version_major);
                w.put_u8(*version_minor);
                w.put_table(server_properties, name)?;
                w.put_long_string(mechanisms);
                w.put_long_string(locales);
            }
            Method::ConnectionStartOk {
                client_properties,
                mechanism,
                response,
                locale,
            } => {
                w.put_table(client_properties, name)?;
                w.put_short_string(mechanism, name)?;
                w.put_long_bytes(response);
                w.put_short_string(locale, name)?;
            }
            Method::ConnectionSecure { challenge } => {
                w.put_long_bytes(challenge);
            }
            Method::ConnectionSecureOk { response } => {
                w.put_long_bytes(response);
            }
            Method::ConnectionTune {
                channel_max,
                frame_max,
                heartbeat,
            }
            | Method::ConnectionTuneOk {
                channel_max,
                frame_max,
                heartbeat,
            } => {
                w.put_u16(*channel_max);
                w.put_u32(*frame_max);
                w.put_u16(*heartbeat);
            }
            Method::ConnectionOpen { vhost } => {
                w.put_short_string(vhost, name)?;
                w.put_short_string("", name)?; // reserved
                w.put_u8(0); // reserved
            }
            Method::ConnectionOpenOk => {
                w.put_short_string("", name)?; // reserved
            }
            Method::ConnectionClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            }
            | Method::ChannelClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            } => {
                w.put_u16(*reply_code);
                w.put_short_string(reply_text, name)?;
                w.put_u16(*class_id);
                w.put_u16(*method_id);
            }
            Method::ConnectionCloseOk => {}
            Method::ConnectionBlocked { reason } => {
                w.put_short_string(reason, name)?;
            }
            Method::ConnectionUnblocked => {}
            Method::ConnectionUpdateSecret { new_secret, reason } => {
                w.put_long_bytes(new_secret);
                w.put_short_string(reason, name)?;
            }
            Method::ConnectionUpdateSecretOk => {}

            Method::ChannelOpen => {
                w.put_short_string("", name)?; // reserved
            }
            Method::ChannelOpenOk => {
                w.put_long_bytes(b""); // reserved
            }
            Method::ChannelFlow { active } | Method::ChannelFlowOk { active } => {
                w.put_bool(*active);
            }
            Method::ChannelCloseOk => {}

            Method::ExchangeDeclare {
                exchange,
                exchange_type,
                passive,
                durable,
                auto_delete,
                internal,
                no_wait,
                arguments,
            } => {
                w.put_zeroes(2); // reserved ticket
                w.put_short_string(exchange, name)?;
                w.put_short_string(exchange_type, name)?;
                w.put_u8(
                    *passive as u8
                        | (*durable as u8) << 1
                        | (*auto_delete as u8) << 2
                        | (*internal as u8) << 3
                        | (*no_wait as u8) << 4,
                );
                w.put_table(arguments, name)?;
            }
            Method::ExchangeDeclareOk => {}
            Method::ExchangeDelete {
                exchange,
                if_unused,
                no_wait,
            } => {
                w.put_zeroes(2);
                w.put_short_string(exchange, name)?;
                w.put_u8(pack2(*if_unused, *no_wait));
            }
            Method::ExchangeDeleteOk => {}
            Method::ExchangeBind {
                destination,
                source,
                routing_key,
                no_wait,
                arguments,
            }
            | Method::ExchangeUnbind {
                destination,
                source,
                routing_key,
                no_wait,
                arguments,
            } => {
                w.put_zeroes(2);
                w.put_short_string(destination, name)?;
                w.put_short_string(source, name)?;
                w.put_short_string(routing_key, name)?;
                w.put_bool(*no_wait);
                w.put_table(arguments, name)?;
            }
            Method::ExchangeBindOk | Method::ExchangeUnbindOk => {}

            Method::QueueDeclare {
                queue,
                passive,
                durable,
                exclusive,
                auto_delete,
                no_wait,
                arguments,
            } => {
                w.put_zeroes(2);
                w.put_short_string(queue, name)?;
                w.put_u8(
                    *passive as u8
                        | (*durable as u8) << 1
                        | (*exclusive as u8) << 2
                        | (*auto_delete as u8) << 3
                        | (*no_wait as u8) << 4,
                );
                w.put_table(arguments, name)?;
            }
            Method::QueueDeclareOk {
                queue,
                message_count,
                consumer_count,
            } => {
                w.put_short_string(queue, name)?;
                w.put_u32(*message_count);
                w.put_u32(*consumer_count);
            }
            Method::QueueBind {
                queue,
                exchange,
                routing_key,
                no_wait,
                arguments,
            } => {
                w.put_zeroes(2);
                w.put_short_string(queue, name)?;
                w.put_short_string(exchange, name)?;
                w.put_short_string(routing_key, name)?;
                w.put_bool(*no_wait);
                w.put_table(arguments, name)?;
            }
            Method::QueueBindOk => {}
            Method::QueuePurge { queue, no_wait } => {
                w.put_zeroes(2);
                w.put_short_string(queue, name)?;
                w.put_bool(*no_wait);
            }
            Method::QueuePurgeOk { message_count } | Method::QueueDeleteOk { message_count } => {
                w.put_u32(*message_count);
            }
            Method::QueueDelete {
                queue,
                if_unused,
                if_empty,
                no_wait,
            } => {
                w.put_zeroes(2);
                w.put_short_string(queue, name)?;
                w.put_u8(*if_unused as u8 | (*if_empty as u8) << 1 | (*no_wait as u8) << 2);
            }
            Method::QueueUnbind {
                queue,
                exchange,
                routing_key,
                arguments,
            } => {
                w.put_zeroes(2);
                w.put_short_string(queue, name)?;
                w.put_short_string(exchange, name)?;
                w.put_short_string(routing_key, name)?;
                w.put_table(arguments, name)?;
            }
            Method::QueueUnbindOk => {}

            Method::BasicQos {
                prefetch_size,
                prefetch_count,
                global,
            } => {
                w.put_u32(*prefetch_size);
                w.put_u16(*prefetch_count);
                w.put_bool(*global);
            }
            Method::BasicQosOk => {}
            Method::BasicConsume {
                queue,
                consumer_tag,
                no_local,
                no_ack,
                exclusive,
                no_wait,
                arguments,
            } => {
                w.put_zeroes(2);
                w.put_short_string(queue, name)?;
                w.put_short_string(consumer_tag, name)?;
                w.put_u8(
                    *no_local as u8
                        | (*no_ack as u8) << 1
                        | (*exclusive as u8) << 2
                        | (*no_wait as u8) << 3,
                );
                w.put_table(arguments, name)?;
            }
            Method::BasicConsumeOk { consumer_tag } | Method::BasicCancelOk { consumer_tag } => {
                w.put_short_string(consumer_tag, name)?;
            }
            Method::BasicCancel {
                consumer_tag,
                no_wait,
            } => {
                w.put_short_string(consumer_tag, name)?;
                w.put_bool(*no_wait);
            }
            Method::BasicPublish {
                exchange,
                routing_key,
                mandatory,
                immediate,
            } => {
                w.put_zeroes(2);
                w.put_short_string(exchange, name)?;
                w.put_short_string(routing_key, name)?;
                w.put_u8(pack2(*mandatory, *immediate));
            }
            Method::BasicReturn {
                reply_code,
                reply_text,
                exchange,
                routing_key,
            } => {
                w.put_u16(*reply_code);
                w.put_short_string(reply_text, name)?;
                w.put_short_string(exchange, name)?;
                w.put_short_string(routing_key, name)?;
            }
            Method::BasicDeliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
            } => {
                w.put_short_string(consumer_tag, name)?;
                w.put_u64(*delivery_tag);
                w.put_bool(*redelivered);
                w.put_short_string(exchange, name)?;
                w.put_short_string(routing_key, name)?;
            }
            Method::BasicGet { queue, no_ack } => {
                w.put_zeroes(2);
                w.put_short_string(queue, name)?;
                w.put_bool(*no_ack);
            }
            Method::BasicGetOk {
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
                message_count,
            } => {
                w.put_u64(*delivery_tag);
                w.put_bool(*redelivered);
                w.put_short_string(exchange, name)?;
                w.put_short_string(routing_key, name)?;
                w.put_u32(*message_count);
            }
            Method::BasicGetEmpty => {
                w.put_short_string("", name)?; // reserved
            }
            Method::BasicAck {
                delivery_tag,
                multiple,
            } => {
                w.put_u64(*delivery_tag);
                w.put_bool(*multiple);
            }
            Method::BasicReject {
                delivery_tag,
                requeue,
            } => {
                w.put_u64(*delivery_tag);
                w.put_bool(*requeue);
            }
            Method::BasicRecoverAsync { requeue } | Method::BasicRecover { requeue } => {
                w.put_bool(*requeue);
            }
            Method::BasicRecoverOk => {}
            Method::BasicNack {
                delivery_tag,
                multiple,
                requeue,
            } => {
                w.put_u64(*delivery_tag);
                w.put_u8(pack2(*multiple, *requeue));
            }

            Method::ConfirmSelect { no_wait } => {
                w.put_bool(*no_wait);
            }
            Method::ConfirmSelectOk => {}

            Method::TxSelect
            | Method::TxSelectOk
            | Method::TxCommit
            | Method::TxCommitOk
            | Method::TxRollback
            | Method::TxRollbackOk => {}
        }
        Ok(())
    }
}

/// Canonical name for a method id, or `None` when no decoder exists.
pub fn method_name(key: u32) -> Option<&'static str> {
    Some(match key {
        id::CONNECTION_START => "connection.start",
        id::CONNECTION_START_OK => "connection.start-ok",
        id::CONNECTION_SECURE => "connection.secure",
        id::CONNECTION_SECURE_OK => "connection.secure-ok",
        id::CONNECTION_TUNE => "connection.tune",
        id::CONNECTION_TUNE_OK => "connection.tune-ok",
        id::CONNECTION_OPEN => "connection.open",
        id::CONNECTION_OPEN_OK => "connection.open-ok",
        id::CONNECTION_CLOSE => "connection.close",
        id::CONNECTION_CLOSE_OK => "connection.close-ok",
        id::CONNECTION_BLOCKED => "connection.blocked",
        id::CONNECTION_UNBLOCKED => "connection.unblocked",
        id::CONNECTION_UPDATE_SECRET => "connection.update-secret",
        id::CONNECTION_UPDATE_SECRET_OK => "connection.update-secret-ok",
        id::CHANNEL_OPEN => "channel.open",
        id::CHANNEL_OPEN_OK => "channel.open-ok",
        id::CHANNEL_FLOW => "channel.flow",
        id::CHANNEL_FLOW_OK => "channel.flow-ok",
        id::CHANNEL_CLOSE => "channel.close",
        id::CHANNEL_CLOSE_OK => "channel.close-ok",
        id::EXCHANGE_DECLARE => "exchange.declare",
        id::EXCHANGE_DECLARE_OK => "exchange.declare-ok",
        id::EXCHANGE_DELETE => "exchange.delete",
        id::EXCHANGE_DELETE_OK => "exchange.delete-ok",
        id::EXCHANGE_BIND => "exchange.bind",
        id::EXCHANGE_BIND_OK => "exchange.bind-ok",
        id::EXCHANGE_UNBIND => "exchange.unbind",
        id::EXCHANGE_UNBIND_OK => "exchange.unbind-ok",
        id::QUEUE_DECLARE => "queue.declare",
        id::QUEUE_DECLARE_OK => "queue.declare-ok",
        id::QUEUE_BIND => "queue.bind",
        id::QUEUE_BIND_OK => "queue.bind-ok",
        id::QUEUE_PURGE => "queue.purge",
        id::QUEUE_PURGE_OK => "queue.purge-ok",
        id::QUEUE_DELETE => "queue.delete",
        id::QUEUE_DELETE_OK => "queue.delete-ok",
        id::QUEUE_UNBIND => "queue.unbind",
        id::QUEUE_UNBIND_OK => "queue.unbind-ok",
        id::BASIC_QOS => "basic.qos",
        id::BASIC_QOS_OK => "basic.qos-ok",
        id::BASIC_CONSUME => "basic.consume",
        id::BASIC_CONSUME_OK => "basic.consume-ok",
        id::BASIC_CANCEL => "basic.cancel",
        id::BASIC_CANCEL_OK => "basic.cancel-ok",
        id::BASIC_PUBLISH => "basic.publish",
        id::BASIC_RETURN => "basic.return",
        id::BASIC_DELIVER => "basic.deliver",
        id::BASIC_GET => "basic.get",
        id::BASIC_GET_OK => "basic.get-ok",
        id::BASIC_GET_EMPTY => "basic.get-empty",
        id::BASIC_ACK => "basic.ack",
        id::BASIC_REJECT => "basic.reject",
        id::BASIC_RECOVER_ASYNC => "basic.recover-async",
        id::BASIC_RECOVER => "basic.recover",
        id::BASIC_RECOVER_OK => "basic.recover-ok",
        id::BASIC_NACK => "basic.nack",
        id::CONFIRM_SELECT => "confirm.select",
        id::CONFIRM_SELECT_OK => "confirm.select-ok",
        id::TX_SELECT => "tx.select",
        id::TX_SELECT_OK => "tx.select-ok",
        id::TX_COMMIT => "tx.commit",
        id::TX_COMMIT_OK => "tx.commit-ok",
        id::TX_ROLLBACK => "tx.rollback",
        id::TX_ROLLBACK_OK => "tx.rollback-ok",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(method: Method) {
        let mut w = FrameBuilder::new();
        w.put_u32(method.id());
        method.encode_args(&mut w).unwrap();
        let bytes = w.finish();

        let mut r = ByteReader::new(&bytes);
        let decoded = Method::decode(&mut r).unwrap();
        assert_eq!(decoded, method);
        assert_eq!(r.remaining(), 0, "decoder must consume all arguments");
    }

    #[test]
    fn connection_methods_roundtrip() {
        let mut server_properties = FieldTable::new();
        server_properties.insert("product", "RabbitMQ").unwrap();

        roundtrip(Method::ConnectionStart {
            version_major: 0,
            version_minor: 9,
            server_properties,
            mechanisms: "PLAIN AMQPLAIN".into(),
            locales: "en_US".into(),
        });
        roundtrip(Method::ConnectionStartOk {
            client_properties: FieldTable::new(),
            mechanism: "PLAIN".into(),
            response: Bytes::from_static(b"\x00guest\x00guest"),
            locale: "en_US".into(),
        });
        roundtrip(Method::ConnectionTune {
            channel_max: 2047,
            frame_max: 131_072,
            heartbeat: 60,
        });
        roundtrip(Method::ConnectionOpen { vhost: "/".into() });
        roundtrip(Method::ConnectionOpenOk);
        roundtrip(Method::ConnectionClose {
            reply_code: 320,
            reply_text: "CONNECTION_FORCED".into(),
            class_id: 0,
            method_id: 0,
        });
        roundtrip(Method::ConnectionBlocked {
            reason: "low on disk".into(),
        });
        roundtrip(Method::ConnectionUpdateSecret {
            new_secret: Bytes::from_static(b"token"),
            reason: "refresh".into(),
        });
    }

    #[test]
    fn channel_methods_roundtrip() {
        roundtrip(Method::ChannelOpen);
        roundtrip(Method::ChannelOpenOk);
        roundtrip(Method::ChannelFlow { active: true });
        roundtrip(Method::ChannelFlowOk { active: false });
        roundtrip(Method::ChannelClose {
            reply_code: 404,
            reply_text: "NOT_FOUND - no queue".into(),
            class_id: 50,
            method_id: 10,
        });
        roundtrip(Method::ChannelCloseOk);
    }

    #[test]
    fn exchange_and_queue_methods_roundtrip() {
        roundtrip(Method::ExchangeDeclare {
            exchange: "logs".into(),
            exchange_type: "direct".into(),
            passive: false,
            durable: true,
            auto_delete: false,
            internal: false,
            no_wait: false,
            arguments: FieldTable::new(),
        });
        roundtrip(Method::ExchangeDelete {
            exchange: "logs".into(),
            if_unused: true,
            no_wait: false,
        });
        roundtrip(Method::QueueDeclare {
            queue: "work".into(),
            passive: true,
            durable: true,
            exclusive: false,
            auto_delete: true,
            no_wait: false,
            arguments: FieldTable::new(),
        });
        roundtrip(Method::QueueDeclareOk {
            queue: "work".into(),
            message_count: 3,
            consumer_count: 1,
        });
        roundtrip(Method::QueueBind {
            queue: "work".into(),
            exchange: "logs".into(),
            routing_key: "info".into(),
            no_wait: false,
            arguments: FieldTable::new(),
        });
        roundtrip(Method::QueuePurge {
            queue: "work".into(),
            no_wait: false,
        });
        roundtrip(Method::QueuePurgeOk { message_count: 0 });
        roundtrip(Method::QueueDelete {
            queue: "work".into(),
            if_unused: false,
            if_empty: true,
            no_wait: false,
        });
        roundtrip(Method::QueueUnbind {
            queue: "work".into(),
            exchange: "logs".into(),
            routing_key: "info".into(),
            arguments: FieldTable::new(),
        });
    }

    #[test]
    fn basic_methods_roundtrip() {
        roundtrip(Method::BasicQos {
            prefetch_size: 0,
            prefetch_count: 10,
            global: true,
        });
        let mut arguments = FieldTable::new();
        arguments.insert("x-priority", 5i32).unwrap();
        roundtrip(Method::BasicConsume {
            queue: "work".into(),
            consumer_tag: "".into(),
            no_local: false,
            no_ack: false,
            exclusive: false,
            no_wait: false,
            arguments,
        });
        roundtrip(Method::BasicConsumeOk {
            consumer_tag: "amq.ctag-1".into(),
        });
        roundtrip(Method::BasicCancel {
            consumer_tag: "amq.ctag-1".into(),
            no_wait: false,
        });
        roundtrip(Method::BasicPublish {
            exchange: "logs".into(),
            routing_key: "info".into(),
            mandatory: true,
            immediate: false,
        });
        roundtrip(Method::BasicReturn {
            reply_code: 312,
            reply_text: "NO_ROUTE".into(),
            exchange: "logs".into(),
            routing_key: "nowhere".into(),
        });
        roundtrip(Method::BasicDeliver {
            consumer_tag: "amq.ctag-1".into(),
            delivery_tag: 42,
            redelivered: false,
            exchange: "logs".into(),
            routing_key: "info".into(),
        });
        roundtrip(Method::BasicGetOk {
            delivery_tag: 7,
            redelivered: true,
            exchange: "logs".into(),
            routing_key: "info".into(),
            message_count: 9,
        });
        roundtrip(Method::BasicGetEmpty);
        roundtrip(Method::BasicAck {
            delivery_tag: 42,
            multiple: false,
        });
        roundtrip(Method::BasicNack {
            delivery_tag: 42,
            multiple: false,
            requeue: true,
        });
        roundtrip(Method::BasicReject {
            delivery_tag: 42,
            requeue: false,
        });
        roundtrip(Method::BasicRecover { requeue: true });
    }

    #[test]
    fn confirm_and_tx_methods_roundtrip() {
        roundtrip(Method::ConfirmSelect { no_wait: false });
        roundtrip(Method::ConfirmSelectOk);
        roundtrip(Method::TxSelect);
        roundtrip(Method::TxCommitOk);
        roundtrip(Method::TxRollback);
    }

    #[test]
    fn unknown_method_id_is_rejected() {
        let mut w = FrameBuilder::new();
        w.put_u32(0x0063_0001); // class 99
        let bytes = w.finish();
        let mut r = ByteReader::new(&bytes);
        assert!(matches!(
            Method::decode(&mut r),
            Err(AmqpError::UnknownMethod(0x0063_0001))
        ));
    }

    #[test]
    fn bit_packing_lsb_first() {
        let method = Method::QueueDeclare {
            queue: "q".into(),
            passive: true,
            durable: false,
            exclusive: true,
            auto_delete: false,
            no_wait: true,
            arguments: FieldTable::new(),
        };
        let mut w = FrameBuilder::new();
        w.put_u32(method.id());
        method.encode_args(&mut w).unwrap();
        let bytes = w.finish();
        // id(4) + reserved(2) + shortstr "q"(2) then the bit octet
        assert_eq!(bytes[8], 0b0001_0101);
    }

    #[test]
    fn names_match_wire_ids() {
        assert_eq!(Method::ChannelOpen.name(), "channel.open");
        assert_eq!(
            Method::BasicPublish {
                exchange: String::new(),
                routing_key: String::new(),
                mandatory: true,
                immediate: false,
            }
            .name(),
            "basic.publish"
        );
        assert_eq!(method_name(id::CONFIRM_SELECT_OK), Some("confirm.select-ok"));
        assert_eq!(method_name(0xdead_beef), None);
    }

    #[test]
    fn content_bearing_methods() {
        assert!(Method::BasicDeliver {
            consumer_tag: String::new(),
            delivery_tag: 0,
            redelivered: false,
            exchange: String::new(),
            routing_key: String::new(),
        }
        .has_content());
        assert!(!Method::BasicAck {
            delivery_tag: 0,
            multiple: false
        }
        .has_content());
    }
}
