//! Channel state machine.
//!
//! One [`ChannelInner`] exists per allocated channel id (id 0 is the
//! connection's own control channel). A channel is three things:
//!
//! 1. a registry of request waiters, `method id -> FIFO of pending
//!    callers`, ordered by [`UniqueId`] so that overlapping calls on the
//!    same reply id resolve oldest-first;
//! 2. a role (control, rpc, publish or consume) supplying the handlers
//!    for methods that arrive without a matching waiter (the source
//!    modeled this as an inheritance chain; here the role value carries
//!    the same hooks);
//! 3. a small lifecycle: open until local close, remote close, or a
//!    destroy cascading from the connection.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::connection::ConnectionInner;
use crate::consume::ConsumeRole;
use crate::error::{AmqpError, CloseReason, Result};
use crate::protocol::constants::method_id;
use crate::protocol::{BasicProperties, Frame, Method};

/// Monotonic key ordering overlapping waiters on one reply id:
/// `(wall-clock ms, sequence)`, sequence bumped on same-millisecond ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct UniqueId {
    millis: u64,
    sequence: u32,
}

static UNIQUE_STATE: Mutex<(u64, u32)> = Mutex::new((0, 0));

impl UniqueId {
    pub(crate) fn next() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let mut state = UNIQUE_STATE.lock().expect("unique id state poisoned");
        let millis = now.max(state.0);
        if millis == state.0 {
            state.1 += 1;
        } else {
            *state = (millis, 0);
        }
        Self {
            millis,
            sequence: state.1,
        }
    }
}

/// One pending `call`, possibly registered under several reply ids
/// (publish waits on ack *and* return at once). Whichever id arrives
/// first takes the sender; the entries under the other ids become dead
/// and are swept when encountered.
struct Waiter {
    key: UniqueId,
    ids: Vec<u32>,
    tx: Mutex<Option<oneshot::Sender<Result<Method>>>>,
}

impl Waiter {
    fn resolve(&self, result: Result<Method>) -> bool {
        match self.tx.lock().expect("waiter poisoned").take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    fn is_resolved(&self) -> bool {
        self.tx.lock().expect("waiter poisoned").is_none()
    }
}

#[derive(Default)]
struct WaiterTable {
    by_id: HashMap<u32, BTreeMap<UniqueId, Arc<Waiter>>>,
}

impl WaiterTable {
    fn register(&mut self, ids: &[u32]) -> (Arc<Waiter>, oneshot::Receiver<Result<Method>>) {
        let (tx, rx) = oneshot::channel();
        let waiter = Arc::new(Waiter {
            key: UniqueId::next(),
            ids: ids.to_vec(),
            tx: Mutex::new(Some(tx)),
        });
        for id in ids {
            self.by_id
                .entry(*id)
                .or_default()
                .insert(waiter.key, waiter.clone());
        }
        (waiter, rx)
    }

    fn remove(&mut self, waiter: &Waiter) {
        for id in &waiter.ids {
            if let Some(list) = self.by_id.get_mut(id) {
                list.remove(&waiter.key);
                if list.is_empty() {
                    self.by_id.remove(id);
                }
            }
        }
    }

    fn pop_oldest(&mut self, id: u32) -> Option<Arc<Waiter>> {
        let list = self.by_id.get_mut(&id)?;
        let key = list.keys().next().copied();
        let waiter = key.and_then(|key| list.remove(&key));
        if waiter.is_none() {
            self.by_id.remove(&id);
        }
        waiter
    }

    /// Resolve the oldest live waiter for this method id, if any.
    fn resolve(&mut self, method: &Method) -> bool {
        let id = method.id();
        while let Some(waiter) = self.pop_oldest(id) {
            let resolved = waiter.resolve(Ok(method.clone()));
            // Drop the waiter's entries under its other expected ids either
            // way; a dead entry must not shadow a younger live waiter.
            self.remove(&waiter);
            if resolved {
                return true;
            }
        }
        false
    }

    fn reject_all(&mut self, error: &AmqpError) {
        let table = std::mem::take(&mut self.by_id);
        for (_, list) in table {
            for (_, waiter) in list {
                if !waiter.is_resolved() {
                    waiter.resolve(Err(error.clone()));
                }
            }
        }
    }
}

/// A registered waiter whose frames have not all been written yet.
pub(crate) struct PendingCall {
    waiter: Arc<Waiter>,
    rx: oneshot::Receiver<Result<Method>>,
}

impl PendingCall {
    /// Resolve the waiter with a local error and drop its registrations.
    pub(crate) fn fail(self, channel: &ChannelInner, error: AmqpError) {
        self.waiter.resolve(Err(error));
        channel
            .waiters
            .lock()
            .expect("waiter table poisoned")
            .remove(&self.waiter);
    }

    /// Await the matching reply (or the error the channel died with).
    pub(crate) async fn wait(self, channel: &ChannelInner) -> Result<Method> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(channel
                .last_error()
                .unwrap_or(AmqpError::ConnectionInactive)),
        }
    }
}

/// What a channel does with methods no waiter claimed, and with content
/// frames.
pub(crate) enum Role {
    /// Channel 0: connection-level methods.
    Control,
    /// Plain request/response channel (commands).
    Rpc,
    /// Publisher-confirm channel; ignores straggler acks and returned
    /// message content.
    Publish,
    /// Consumer channel with content assembly.
    Consume(ConsumeRole),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    Closed,
    Destroyed,
}

struct LifeState {
    lifecycle: Lifecycle,
    error: Option<AmqpError>,
}

pub(crate) struct ChannelInner {
    pub(crate) id: u16,
    pub(crate) conn: Weak<ConnectionInner>,
    pub(crate) role: Role,
    pub(crate) flow: AtomicBool,
    weak_self: Weak<ChannelInner>,
    waiters: Mutex<WaiterTable>,
    state: Mutex<LifeState>,
}

impl ChannelInner {
    pub(crate) fn new(id: u16, conn: Weak<ConnectionInner>, role: Role) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            id,
            conn,
            role,
            flow: AtomicBool::new(false),
            weak_self: weak.clone(),
            waiters: Mutex::new(WaiterTable::default()),
            state: Mutex::new(LifeState {
                lifecycle: Lifecycle::Open,
                error: None,
            }),
        })
    }

    /// Weak handle for long-lived references back into this channel
    /// (delivery ackers).
    pub(crate) fn weak(&self) -> Weak<ChannelInner> {
        self.weak_self.clone()
    }

    fn connection(&self) -> Result<Arc<ConnectionInner>> {
        self.conn.upgrade().ok_or(AmqpError::ConnectionInactive)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.lock().expect("channel state poisoned").lifecycle == Lifecycle::Open
    }

    /// The error this channel died with, if it died with one.
    pub(crate) fn last_error(&self) -> Option<AmqpError> {
        self.state
            .lock()
            .expect("channel state poisoned")
            .error
            .clone()
    }

    fn check_usable(&self) -> Result<()> {
        let state = self.state.lock().expect("channel state poisoned");
        match state.lifecycle {
            Lifecycle::Open => Ok(()),
            _ => Err(state.error.clone().unwrap_or(AmqpError::ChannelClosed {
                reason: CloseReason::success(),
            })),
        }
    }

    /// Write raw frame bytes through the connection.
    pub(crate) async fn send_bytes(&self, bytes: Bytes) -> Result<()> {
        self.connection()?.send(bytes).await
    }

    /// Encode and write a single method frame on this channel.
    pub(crate) async fn send_method(&self, method: Method) -> Result<()> {
        let bytes = Frame::method(self.id, method).to_bytes()?;
        self.send_bytes(bytes).await
    }

    /// Register a waiter for the given reply ids without sending anything
    /// yet. Registration happens before the caller's first write, so no
    /// reply can race it.
    pub(crate) fn begin_call(&self, expect: &[u32]) -> Result<PendingCall> {
        self.check_usable()?;
        debug_assert!(!expect.is_empty());
        let (waiter, rx) = self
            .waiters
            .lock()
            .expect("waiter table poisoned")
            .register(expect);
        Ok(PendingCall { waiter, rx })
    }

    /// Send pre-encoded frames and await the first reply whose method id
    /// is in `expect`. Overlapping calls on the same id resolve FIFO.
    pub(crate) async fn call(&self, expect: &[u32], bytes: Bytes) -> Result<Method> {
        let pending = self.begin_call(expect)?;
        if let Err(err) = self.send_bytes(bytes).await {
            pending.fail(self, err.clone());
            return Err(err);
        }
        pending.wait(self).await
    }

    /// Encode one method and await its reply.
    pub(crate) async fn call_method(&self, method: Method, expect: &[u32]) -> Result<Method> {
        let bytes = Frame::method(self.id, method).to_bytes()?;
        self.call(expect, bytes).await
    }

    /// Graceful local close: `channel.close` -> `channel.close-ok`.
    /// No-op when already closed or destroyed.
    pub(crate) async fn close(&self, error: Option<&AmqpError>) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }

        let reason = match error {
            Some(err) => err.close_reason(),
            None => CloseReason::success(),
        };
        let close = Method::ChannelClose {
            reply_code: reason.reply_code,
            reply_text: reason.reply_text,
            class_id: reason.class_id,
            method_id: reason.method_id,
        };
        self.call_method(close, &[method_id::CHANNEL_CLOSE_OK])
            .await?;

        self.mark(Lifecycle::Closed, None);
        if let Some(conn) = self.conn.upgrade() {
            conn.remove_channel(self.id);
        }
        Ok(())
    }

    fn mark(&self, lifecycle: Lifecycle, error: Option<AmqpError>) {
        let mut state = self.state.lock().expect("channel state poisoned");
        if state.lifecycle == Lifecycle::Open {
            state.lifecycle = lifecycle;
            state.error = error;
        }
    }

    /// Reject every pending waiter and release role resources. Does not
    /// touch the connection's channel map; callers own that.
    pub(crate) fn destroy(&self, error: AmqpError) {
        self.mark(Lifecycle::Destroyed, Some(error.clone()));
        self.waiters
            .lock()
            .expect("waiter table poisoned")
            .reject_all(&error);
        if let Role::Consume(role) = &self.role {
            role.release(error);
        }
    }

    /// Destroy this channel only (soft error): best-effort notify the
    /// broker, then tear down locally.
    async fn destroy_soft(&self, error: AmqpError) {
        let reason = error.close_reason();
        let close = Method::ChannelClose {
            reply_code: reason.reply_code,
            reply_text: reason.reply_text,
            class_id: reason.class_id,
            method_id: reason.method_id,
        };
        let _ = self.send_method(close).await;
        self.destroy(error);
        if let Some(conn) = self.conn.upgrade() {
            conn.remove_channel(self.id);
        }
    }

    /// Entry point from the demux loop. `Err` means a connection-fatal
    /// condition the caller must escalate.
    pub(crate) async fn handle_method(&self, method: Method) -> Result<()> {
        if self
            .waiters
            .lock()
            .expect("waiter table poisoned")
            .resolve(&method)
        {
            return Ok(());
        }

        match &method {
            Method::ChannelFlow { active } => {
                self.flow.store(*active, Ordering::Release);
                self.send_method(Method::ChannelFlowOk { active: *active })
                    .await?;
                Ok(())
            }
            Method::ChannelClose {
                reply_code,
                reply_text,
                class_id,
                method_id: failing_method,
            } => {
                let reason = CloseReason {
                    reply_code: *reply_code,
                    reply_text: reply_text.clone(),
                    class_id: *class_id,
                    method_id: *failing_method,
                };
                let _ = self.send_method(Method::ChannelCloseOk).await;
                self.destroy(AmqpError::ChannelClosed { reason });
                if let Some(conn) = self.conn.upgrade() {
                    conn.remove_channel(self.id);
                }
                Ok(())
            }
            _ => self.handle_role_method(method).await,
        }
    }

    async fn handle_role_method(&self, method: Method) -> Result<()> {
        match &self.role {
            Role::Control => self.handle_connection_method(method).await,
            Role::Rpc => Err(AmqpError::HandlerNotFound(method.name())),
            Role::Publish => match method {
                // A late broker confirm after a basic.return already
                // resolved this message; the return was terminal.
                Method::BasicAck { .. } | Method::BasicNack { .. } => {
                    debug!(channel = self.id, "ignoring straggler confirm");
                    Ok(())
                }
                Method::BasicReturn { .. } => {
                    debug!(channel = self.id, "ignoring straggler return");
                    Ok(())
                }
                other => Err(AmqpError::HandlerNotFound(other.name())),
            },
            Role::Consume(role) => match method {
                Method::BasicDeliver { .. } => role.on_deliver(self, method).await,
                Method::BasicCancel { consumer_tag, .. } => {
                    role.on_cancel(self, consumer_tag).await
                }
                other => Err(AmqpError::HandlerNotFound(other.name())),
            },
        }
    }

    async fn handle_connection_method(&self, method: Method) -> Result<()> {
        let conn = self.connection()?;
        match method {
            Method::ConnectionBlocked { reason } => {
                warn!(%reason, "connection blocked by broker");
                conn.set_blocked(true);
                Ok(())
            }
            Method::ConnectionUnblocked => {
                conn.set_blocked(false);
                Ok(())
            }
            Method::ConnectionUpdateSecret { .. } => {
                Err(AmqpError::NotImplemented("connection.update-secret"))
            }
            Method::ConnectionClose {
                reply_code,
                reply_text,
                class_id,
                method_id: failing_method,
            } => {
                let reason = CloseReason {
                    reply_code,
                    reply_text,
                    class_id,
                    method_id: failing_method,
                };
                let _ = self.send_method(Method::ConnectionCloseOk).await;
                conn.destroy(AmqpError::ConnectionClosed { reason });
                Ok(())
            }
            Method::ConnectionCloseOk => {
                // Normally consumed by the close() waiter; a stray one
                // means the peer finished a close we already gave up on.
                debug!("stray connection.close-ok");
                Ok(())
            }
            other => Err(AmqpError::HandlerNotFound(other.name())),
        }
    }

    /// Content header frame for this channel.
    pub(crate) async fn handle_header(
        &self,
        body_size: u64,
        properties: BasicProperties,
    ) -> Result<()> {
        match &self.role {
            Role::Consume(role) => role.on_header(self, body_size, properties).await,
            Role::Publish => {
                // Content of a returned message; the return method already
                // resolved the publish.
                debug!(channel = self.id, "discarding returned content header");
                Ok(())
            }
            _ => {
                self.destroy_soft(AmqpError::UnexpectedFrame(
                    "content header on a non-content channel".into(),
                ))
                .await;
                Ok(())
            }
        }
    }

    /// Content body frame for this channel.
    pub(crate) async fn handle_body(&self, bytes: Bytes) -> Result<()> {
        match &self.role {
            Role::Consume(role) => role.on_body(self, bytes).await,
            Role::Publish => {
                debug!(channel = self.id, "discarding returned content body");
                Ok(())
            }
            _ => {
                self.destroy_soft(AmqpError::UnexpectedFrame(
                    "content body on a non-content channel".into(),
                ))
                .await;
                Ok(())
            }
        }
    }

    /// Soft-error teardown reachable from role handlers.
    pub(crate) async fn fail(&self, error: AmqpError) {
        self.destroy_soft(error).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_ids_are_monotonic() {
        let a = UniqueId::next();
        let b = UniqueId::next();
        let c = UniqueId::next();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn waiters_resolve_fifo() {
        let mut table = WaiterTable::default();
        let (_w1, mut rx1) = table.register(&[method_id::BASIC_QOS_OK]);
        let (_w2, mut rx2) = table.register(&[method_id::BASIC_QOS_OK]);

        assert!(table.resolve(&Method::BasicQosOk));
        assert!(table.resolve(&Method::BasicQosOk));
        assert!(!table.resolve(&Method::BasicQosOk));

        // Both resolved, in registration order.
        assert!(matches!(rx1.try_recv(), Ok(Ok(Method::BasicQosOk))));
        assert!(matches!(rx2.try_recv(), Ok(Ok(Method::BasicQosOk))));
    }

    #[test]
    fn multi_id_waiter_deregisters_everywhere() {
        let mut table = WaiterTable::default();
        let (_w, mut rx) = table.register(&[method_id::BASIC_ACK, method_id::BASIC_RETURN]);

        let ret = Method::BasicReturn {
            reply_code: 312,
            reply_text: "NO_ROUTE".into(),
            exchange: "x".into(),
            routing_key: "k".into(),
        };
        assert!(table.resolve(&ret));
        assert!(matches!(rx.try_recv(), Ok(Ok(Method::BasicReturn { .. }))));

        // The ack registration is gone with it.
        assert!(!table.resolve(&Method::BasicAck {
            delivery_tag: 1,
            multiple: false
        }));
    }

    #[test]
    fn dead_entries_do_not_shadow_younger_waiters() {
        let mut table = WaiterTable::default();
        // w1 waits on ack+return, w2 on ack only.
        let (_w1, rx1) = table.register(&[method_id::BASIC_ACK, method_id::BASIC_RETURN]);
        let (_w2, mut rx2) = table.register(&[method_id::BASIC_ACK]);

        // w1 resolved by return; its ack entry is now dead.
        let ret = Method::BasicReturn {
            reply_code: 312,
            reply_text: "NO_ROUTE".into(),
            exchange: "x".into(),
            routing_key: "k".into(),
        };
        assert!(table.resolve(&ret));
        drop(rx1);

        // The following ack must reach w2.
        let ack = Method::BasicAck {
            delivery_tag: 2,
            multiple: false,
        };
        assert!(table.resolve(&ack));
        assert!(matches!(rx2.try_recv(), Ok(Ok(Method::BasicAck { .. }))));
    }

    #[test]
    fn reject_all_fans_out() {
        let mut table = WaiterTable::default();
        let (_w1, mut rx1) = table.register(&[method_id::QUEUE_DECLARE_OK]);
        let (_w2, mut rx2) = table.register(&[method_id::QUEUE_BIND_OK]);

        table.reject_all(&AmqpError::HeartbeatTimeout);

        assert!(matches!(
            rx1.try_recv(),
            Ok(Err(AmqpError::HeartbeatTimeout))
        ));
        assert!(matches!(
            rx2.try_recv(),
            Ok(Err(AmqpError::HeartbeatTimeout))
        ));
    }
}
