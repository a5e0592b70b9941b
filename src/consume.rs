//! Consume channel: subscription flow and content assembly.
//!
//! Content arrives as `basic.deliver`, one content header, then 0..N body
//! frames. The assembly keeps a single in-flight message per channel and
//! enforces the ordering rules strictly: a deliver while one is in
//! progress, a header without a deliver, a body without a header, or a
//! body overrunning the declared size all kill the channel with
//! `unexpected_frame`.
//!
//! Deliveries flow to the application through a queue bounded by the
//! subscription's prefetch count; each delivery's body is its own bounded
//! chunk queue (see [`crate::stream::DeliveryBody`]). Both queues push
//! back into the connection's demux task, so a slow consumer slows the
//! socket instead of growing buffers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::channel::ChannelInner;
use crate::codec::{assert_name, FieldTable};
use crate::error::{reply_code, AmqpError, CloseReason, Result};
use crate::protocol::constants::method_id;
use crate::protocol::{BasicProperties, Method};
use crate::stream::{DeliveryBody, BODY_QUEUE_CHUNKS};

/// Subscription options for [`crate::Connection::subscribe`].
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub queue: String,
    /// Messages in flight before the broker stops sending; also the bound
    /// of the delivery queue.
    pub prefetch_count: u16,
    /// Empty asks the broker to generate one.
    pub consumer_tag: String,
    pub no_local: bool,
    pub no_ack: bool,
    pub exclusive: bool,
    /// `x-priority` consumer argument.
    pub priority: Option<i32>,
    /// `x-cancel-on-ha-failover` consumer argument.
    pub cancel_on_ha_failover: Option<bool>,
    /// `x-stream-offset` consumer argument.
    pub stream_offset: Option<i64>,
    /// Extra consumer arguments merged after the `x-` options above.
    pub arguments: FieldTable,
}

impl SubscribeOptions {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            prefetch_count: 1,
            consumer_tag: String::new(),
            no_local: false,
            no_ack: false,
            exclusive: false,
            priority: None,
            cancel_on_ha_failover: None,
            stream_offset: None,
            arguments: FieldTable::new(),
        }
    }

    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    fn consume_arguments(&self) -> Result<FieldTable> {
        let mut arguments = FieldTable::new();
        if let Some(priority) = self.priority {
            arguments.insert("x-priority", priority)?;
        }
        if let Some(cancel) = self.cancel_on_ha_failover {
            arguments.insert("x-cancel-on-ha-failover", cancel)?;
        }
        if let Some(offset) = self.stream_offset {
            arguments.insert("x-stream-offset", offset)?;
        }
        for (key, value) in self.arguments.iter() {
            arguments.insert(key.to_string(), value.clone())?;
        }
        Ok(arguments)
    }
}

/// Routing metadata of one delivery.
#[derive(Debug, Clone)]
struct DeliverInfo {
    consumer_tag: String,
    delivery_tag: u64,
    redelivered: bool,
    exchange: String,
    routing_key: String,
}

/// The in-flight message being assembled: method seen, header maybe seen,
/// body bytes still owed.
struct Assembly {
    info: DeliverInfo,
    properties: Option<BasicProperties>,
    remaining: u64,
    body_tx: Option<mpsc::Sender<Bytes>>,
}

struct ConsumeState {
    consumer_tag: Option<String>,
    cancelled: bool,
    deliveries: Option<mpsc::Sender<Delivery>>,
    current: Option<Assembly>,
}

/// Per-channel consumer state; the role handlers of a consume channel.
pub(crate) struct ConsumeRole {
    state: Mutex<ConsumeState>,
}

impl ConsumeRole {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ConsumeState {
                consumer_tag: None,
                cancelled: false,
                deliveries: None,
                current: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConsumeState> {
        self.state.lock().expect("consume state poisoned")
    }

    pub(crate) async fn on_deliver(&self, channel: &ChannelInner, method: Method) -> Result<()> {
        let Method::BasicDeliver {
            consumer_tag,
            delivery_tag,
            redelivered,
            exchange,
            routing_key,
        } = method
        else {
            unreachable!("routed by method id");
        };

        let failure = {
            let mut state = self.lock();
            if state
                .consumer_tag
                .as_deref()
                .is_some_and(|tag| tag != consumer_tag)
            {
                Some(AmqpError::UnknownConsumerTag(consumer_tag.clone()))
            } else if state.current.is_some() {
                Some(AmqpError::UnexpectedFrame(
                    "basic.deliver while content in progress".into(),
                ))
            } else {
                state.current = Some(Assembly {
                    info: DeliverInfo {
                        consumer_tag,
                        delivery_tag,
                        redelivered,
                        exchange,
                        routing_key,
                    },
                    properties: None,
                    remaining: 0,
                    body_tx: None,
                });
                None
            }
        };

        if let Some(error) = failure {
            channel.fail(error).await;
        }
        Ok(())
    }

    pub(crate) async fn on_header(
        &self,
        channel: &ChannelInner,
        body_size: u64,
        properties: BasicProperties,
    ) -> Result<()> {
        enum Next {
            Fail(AmqpError),
            Emit(Delivery, mpsc::Sender<Delivery>),
        }

        let next = {
            let mut state = self.lock();
            let armed = state.deliveries.is_some();
            let awaiting_header = state
                .current
                .as_ref()
                .is_some_and(|current| current.properties.is_none());

            if !armed || !awaiting_header {
                Next::Fail(AmqpError::UnexpectedFrame(
                    "content header without matching deliver".into(),
                ))
            } else {
                let deliveries = state.deliveries.clone().expect("checked above");
                if body_size == 0 {
                    let assembly = state.current.take().expect("checked above");
                    let acker = Acker::new(channel, assembly.info.delivery_tag);
                    let delivery =
                        Delivery::new(assembly.info, properties, DeliveryBody::empty(), acker);
                    Next::Emit(delivery, deliveries)
                } else {
                    let current = state.current.as_mut().expect("checked above");
                    let acker = Acker::new(channel, current.info.delivery_tag);
                    let (body_tx, body_rx) = mpsc::channel(BODY_QUEUE_CHUNKS);
                    current.properties = Some(properties.clone());
                    current.remaining = body_size;
                    current.body_tx = Some(body_tx);
                    let delivery = Delivery::new(
                        current.info.clone(),
                        properties,
                        DeliveryBody::new(body_rx, body_size),
                        acker,
                    );
                    Next::Emit(delivery, deliveries)
                }
            }
        };

        match next {
            Next::Fail(error) => {
                channel.fail(error).await;
                Ok(())
            }
            Next::Emit(delivery, deliveries) => {
                // Suspends when the application is prefetch_count behind.
                if deliveries.send(delivery).await.is_err() {
                    debug!(channel = channel.id, "delivery dropped, consumer gone");
                }
                Ok(())
            }
        }
    }

    pub(crate) async fn on_body(&self, channel: &ChannelInner, bytes: Bytes) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }

        enum Next {
            Fail(AmqpError),
            Push(mpsc::Sender<Bytes>),
        }

        let next = {
            let mut state = self.lock();
            match &mut state.current {
                Some(current) if current.properties.is_some() => {
                    if bytes.len() as u64 > current.remaining {
                        Next::Fail(AmqpError::UnexpectedFrame(format!(
                            "body frame of {} bytes exceeds remaining {}",
                            bytes.len(),
                            current.remaining
                        )))
                    } else {
                        current.remaining -= bytes.len() as u64;
                        let finished = current.remaining == 0;
                        let tx = current.body_tx.clone().expect("body sender present");
                        if finished {
                            // Dropping the assembly closes the body stream
                            // once the last queued chunk is read.
                            state.current = None;
                        }
                        Next::Push(tx)
                    }
                }
                _ => Next::Fail(AmqpError::UnexpectedFrame(
                    "content body without matching header".into(),
                )),
            }
        };

        match next {
            Next::Fail(error) => {
                channel.fail(error).await;
                Ok(())
            }
            Next::Push(tx) => {
                // Suspends while the body reader is saturated.
                if tx.send(bytes).await.is_err() {
                    debug!(channel = channel.id, "body chunk dropped, reader gone");
                }
                Ok(())
            }
        }
    }

    /// Broker-initiated cancel: answer `cancel-ok` and kill the channel
    /// unless we initiated the cancel ourselves.
    pub(crate) async fn on_cancel(
        &self,
        channel: &ChannelInner,
        consumer_tag: String,
    ) -> Result<()> {
        channel
            .send_method(Method::BasicCancelOk {
                consumer_tag: consumer_tag.clone(),
            })
            .await?;

        let cancelled = self.lock().cancelled;
        if !cancelled {
            channel
                .fail(AmqpError::ChannelClosed {
                    reason: CloseReason::new(reply_code::CONNECTION_FORCED, "Consumer cancelled"),
                })
                .await;
        }
        Ok(())
    }

    /// Destroy-time cleanup: end the delivery stream and any in-flight
    /// body.
    pub(crate) fn release(&self, _error: AmqpError) {
        let mut state = self.lock();
        state.deliveries = None;
        state.current = None;
    }
}

/// `basic.ack` / `basic.nack` sender, armed exactly once.
struct Acker {
    channel: Weak<ChannelInner>,
    delivery_tag: u64,
    done: AtomicBool,
}

impl Acker {
    fn new(channel: &ChannelInner, delivery_tag: u64) -> Self {
        Self {
            channel: channel.weak(),
            delivery_tag,
            done: AtomicBool::new(false),
        }
    }

    async fn send(&self, method: Method) -> Result<()> {
        if self.done.swap(true, Ordering::AcqRel) {
            return Ok(()); // second ack/nack is a no-op
        }
        match self.channel.upgrade() {
            Some(channel) => channel.send_method(method).await,
            None => Err(AmqpError::ConnectionInactive),
        }
    }
}

/// One consumed message: routing info, properties, and the body stream.
pub struct Delivery {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: DeliveryBody,
    acker: Acker,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("consumer_tag", &self.consumer_tag)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

impl Delivery {
    fn new(info: DeliverInfo, properties: BasicProperties, body: DeliveryBody, acker: Acker) -> Self {
        Self {
            consumer_tag: info.consumer_tag,
            delivery_tag: info.delivery_tag,
            redelivered: info.redelivered,
            exchange: info.exchange,
            routing_key: info.routing_key,
            properties,
            body,
            acker,
        }
    }

    /// Acknowledge this message (single, not multiple). Repeat calls are
    /// no-ops.
    pub async fn ack(&self) -> Result<()> {
        self.acker
            .send(Method::BasicAck {
                delivery_tag: self.delivery_tag,
                multiple: false,
            })
            .await
    }

    /// Negatively acknowledge this message, optionally requeueing it.
    /// Repeat calls are no-ops.
    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker
            .send(Method::BasicNack {
                delivery_tag: self.delivery_tag,
                multiple: false,
                requeue,
            })
            .await
    }
}

/// A running subscription. Pull messages with [`next`](Self::next); drop
/// or [`cancel`](Self::cancel) to stop.
pub struct Consumer {
    channel: Arc<ChannelInner>,
    deliveries: mpsc::Receiver<Delivery>,
    consumer_tag: String,
}

impl Consumer {
    /// qos -> arm the assembly -> consume, in that order, so the prefetch
    /// window exists before the first deliver can arrive.
    pub(crate) async fn subscribe(
        channel: Arc<ChannelInner>,
        options: SubscribeOptions,
    ) -> Result<Self> {
        assert_name(&options.queue, "queue")?;

        channel
            .call_method(
                Method::BasicQos {
                    prefetch_size: 0,
                    prefetch_count: options.prefetch_count,
                    global: true,
                },
                &[method_id::BASIC_QOS_OK],
            )
            .await?;

        let (deliveries_tx, deliveries_rx) =
            mpsc::channel(usize::from(options.prefetch_count.max(1)));
        let role = match &channel.role {
            crate::channel::Role::Consume(role) => role,
            _ => unreachable!("subscribe on a non-consume channel"),
        };
        role.lock().deliveries = Some(deliveries_tx);

        let consume = Method::BasicConsume {
            queue: options.queue.clone(),
            consumer_tag: options.consumer_tag.clone(),
            no_local: options.no_local,
            no_ack: options.no_ack,
            exclusive: options.exclusive,
            no_wait: false,
            arguments: options.consume_arguments()?,
        };
        let reply = channel
            .call_method(consume, &[method_id::BASIC_CONSUME_OK])
            .await?;
        let consumer_tag = match reply {
            Method::BasicConsumeOk { consumer_tag } => consumer_tag,
            other => return Err(AmqpError::UnexpectedFrame(format!("{other:?}"))),
        };
        role.lock().consumer_tag = Some(consumer_tag.clone());

        Ok(Self {
            channel,
            deliveries: deliveries_rx,
            consumer_tag,
        })
    }

    /// Tag assigned by the broker (or passed in the options).
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Await the next delivery. `Ok(None)` after a clean cancel; an error
    /// if the channel died.
    pub async fn next(&mut self) -> Result<Option<Delivery>> {
        match self.deliveries.recv().await {
            Some(delivery) => Ok(Some(delivery)),
            None => match self.channel.last_error() {
                Some(error) => Err(error),
                None => Ok(None),
            },
        }
    }

    /// Stop consuming: `basic.cancel` -> `cancel-ok`, end the delivery
    /// stream, close the channel.
    pub async fn cancel(mut self) -> Result<()> {
        let role = match &self.channel.role {
            crate::channel::Role::Consume(role) => role,
            _ => unreachable!(),
        };
        role.lock().cancelled = true;

        self.channel
            .call_method(
                Method::BasicCancel {
                    consumer_tag: self.consumer_tag.clone(),
                    no_wait: false,
                },
                &[method_id::BASIC_CANCEL_OK],
            )
            .await?;

        role.lock().deliveries = None;
        self.deliveries.close();
        self.channel.close(None).await
    }
}
