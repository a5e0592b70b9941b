//! Connection state machine and IO loops.
//!
//! Lifecycle, client side:
//!
//! ```text
//! send "AMQP\0 0 9 1"
//!   -> connection.start   (select SASL mechanism, send start-ok)
//!   -> connection.secure  (not implemented -> fatal)
//!    | connection.tune    (negotiate, send tune-ok + open)
//!   -> connection.open-ok (spawn reader/writer/heartbeat tasks)
//! ```
//!
//! After the handshake every socket write funnels through a dedicated
//! writer task fed by a bounded channel, and a single read task drives the
//! frame decoder and dispatches frames to channels by id. All of a
//! connection's state advances on these two tasks plus the two heartbeat
//! timers; channels never touch the socket directly.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::channel::{ChannelInner, Role};
use crate::codec::{FieldTable, FrameBuilder};
use crate::commands::Channel;
use crate::consume::{ConsumeRole, Consumer, SubscribeOptions};
use crate::error::{AmqpError, CloseReason, Result};
use crate::protocol::constants::{method_id, PORT, PROTOCOL_HEADER};
use crate::protocol::{Frame, FrameDecoder, FramePayload, Method};
use crate::publish::Publisher;

/// Writer queue depth; sends suspend when the socket falls this far
/// behind.
const WRITER_QUEUE_FRAMES: usize = 64;

/// Frames written per syscall batch.
const WRITER_BATCH: usize = 16;

/// Read buffer size for the demux loop.
const READ_CHUNK: usize = 64 * 1024;

/// Fallback frame size when the peer declares no limit.
const DEFAULT_FRAME_MAX: u32 = 131_072;

/// SASL mechanisms this client can answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMechanism {
    /// `LOGIN`/`PASSWORD` as bare field-table entries (no length prefix).
    AmqPlain,
    /// `\0user\0pass`.
    Plain,
}

impl AuthMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMechanism::AmqPlain => "AMQPLAIN",
            AuthMechanism::Plain => "PLAIN",
        }
    }

    fn response(&self, username: &str, password: &str) -> Result<Bytes> {
        match self {
            AuthMechanism::Plain => {
                let mut buf = Vec::with_capacity(username.len() + password.len() + 2);
                buf.push(0);
                buf.extend_from_slice(username.as_bytes());
                buf.push(0);
                buf.extend_from_slice(password.as_bytes());
                Ok(Bytes::from(buf))
            }
            AuthMechanism::AmqPlain => {
                // Table *items* only: the 4-octet length prefix is omitted.
                let mut w = FrameBuilder::new();
                w.put_short_string("LOGIN", "sasl.login")?;
                w.put_u8(b'S');
                w.put_long_string(username);
                w.put_short_string("PASSWORD", "sasl.password")?;
                w.put_u8(b'S');
                w.put_long_string(password);
                Ok(w.finish())
            }
        }
    }
}

/// Connection configuration. Every field has the protocol default; a zero
/// `channel_max`/`frame_max` means "accept the server's value".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub username: String,
    pub password: String,
    /// Preference order for SASL mechanism selection.
    pub auth_mechanisms: Vec<AuthMechanism>,
    pub channel_max: u16,
    pub frame_max: u32,
    /// Desired heartbeat interval in seconds; 0 disables client checking.
    pub heartbeat: u16,
    pub locale: String,
    /// Handshake deadline.
    pub connection_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: PORT,
            vhost: "/".into(),
            username: "guest".into(),
            password: "guest".into(),
            auth_mechanisms: vec![AuthMechanism::AmqPlain, AuthMechanism::Plain],
            channel_max: 0,
            frame_max: 0,
            heartbeat: 0,
            locale: "en_US".into(),
            connection_timeout: Duration::from_millis(60_000),
        }
    }
}

impl ConnectOptions {
    fn select_mechanism(&self, offered: &str) -> Result<AuthMechanism> {
        let offered_list: Vec<&str> = offered.split(' ').filter(|s| !s.is_empty()).collect();
        self.auth_mechanisms
            .iter()
            .copied()
            .find(|m| offered_list.contains(&m.as_str()))
            .ok_or_else(|| AmqpError::MechanismsRejected {
                offered: offered.to_string(),
            })
    }

    fn client_properties(&self) -> FieldTable {
        let mut props = FieldTable::new();
        let _ = props.insert("product", env!("CARGO_PKG_NAME"));
        let _ = props.insert("version", env!("CARGO_PKG_VERSION"));
        let _ = props.insert("platform", "rust");
        let mut caps = FieldTable::new();
        let _ = caps.insert("publisher_confirms", true);
        let _ = caps.insert("basic.nack", true);
        let _ = caps.insert("consumer_cancel_notify", true);
        let _ = caps.insert("connection.blocked", true);
        let _ = props.insert("capabilities", crate::codec::FieldValue::Table(caps));
        props
    }
}

/// An open AMQP connection. Dropping it tears everything down.
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    /// Dial `host:port` over TCP and perform the handshake.
    pub async fn connect(options: ConnectOptions) -> Result<Self> {
        let stream = TcpStream::connect((options.host.clone(), options.port)).await?;
        stream.set_nodelay(true)?;
        Self::handshake(stream, options).await
    }

    /// Perform the handshake over an already-established transport.
    /// Anything `AsyncRead + AsyncWrite` works; TLS wrapping and in-memory
    /// test pipes both enter here.
    pub async fn handshake<S>(stream: S, options: ConnectOptions) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let timeout = options.connection_timeout;
        match tokio::time::timeout(timeout, handshake_inner(stream, options)).await {
            Ok(result) => result,
            Err(_) => Err(AmqpError::HandshakeTimeout),
        }
    }

    /// Open a plain command channel.
    pub async fn channel(&self) -> Result<Channel> {
        let inner = self.inner.open_channel(Role::Rpc).await?;
        Ok(Channel::new(inner))
    }

    /// Open a publisher channel with confirms.
    pub async fn publisher(&self) -> Result<Publisher> {
        let inner = self.inner.open_channel(Role::Publish).await?;
        Ok(Publisher::new(inner))
    }

    /// Open a consumer channel and subscribe to a queue.
    pub async fn subscribe(&self, options: SubscribeOptions) -> Result<Consumer> {
        let inner = self
            .inner
            .open_channel(Role::Consume(ConsumeRole::new()))
            .await?;
        Consumer::subscribe(inner, options).await
    }

    /// True while the broker has publishes blocked
    /// (`connection.blocked`).
    pub fn is_blocked(&self) -> bool {
        self.inner.blocked.load(Ordering::Acquire)
    }

    /// Negotiated frame size.
    pub fn frame_max(&self) -> u32 {
        self.inner.frame_max()
    }

    /// Negotiated channel limit.
    pub fn channel_max(&self) -> u16 {
        self.inner.tuned_channel_max.load(Ordering::Acquire)
    }

    /// Negotiated heartbeat interval in seconds.
    pub fn heartbeat(&self) -> u16 {
        self.inner.tuned_heartbeat.load(Ordering::Acquire)
    }

    /// Graceful close: `connection.close` -> `connection.close-ok`, then
    /// teardown.
    pub async fn close(self) -> Result<()> {
        let zero = self.inner.zero_channel();
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Ok(());
        }
        let reason = CloseReason::success();
        let close = Method::ConnectionClose {
            reply_code: reason.reply_code,
            reply_text: reason.reply_text.clone(),
            class_id: 0,
            method_id: 0,
        };
        let result = zero
            .call_method(close, &[method_id::CONNECTION_CLOSE_OK])
            .await;
        self.inner
            .destroy(AmqpError::ConnectionClosed { reason });
        result.map(|_| ())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.inner.destroy(AmqpError::ConnectionClosed {
            reason: CloseReason::new(320, "connection dropped"),
        });
    }
}

pub(crate) struct ConnectionInner {
    /// Taken on destroy so the writer task drains its queue (the goodbye
    /// `connection.close` included) and exits on its own.
    writer_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    channels: Mutex<HashMap<u16, Arc<ChannelInner>>>,
    zero: OnceLock<Arc<ChannelInner>>,

    tuned_channel_max: AtomicU16,
    tuned_frame_max: AtomicU32,
    tuned_heartbeat: AtomicU16,

    pub(crate) opened: AtomicBool,
    pub(crate) blocked: AtomicBool,
    pub(crate) destroyed: AtomicBool,

    last_error: Mutex<Option<AmqpError>>,
    /// Milliseconds since `epoch` of the last inbound byte chunk.
    last_recv_ms: AtomicU64,
    epoch: Instant,

    weak_self: std::sync::Weak<ConnectionInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionInner {
    fn new(writer_tx: mpsc::Sender<Bytes>, tuned: (u16, u32, u16)) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            writer_tx: Mutex::new(Some(writer_tx)),
            channels: Mutex::new(HashMap::new()),
            zero: OnceLock::new(),
            tuned_channel_max: AtomicU16::new(tuned.0),
            tuned_frame_max: AtomicU32::new(tuned.1),
            tuned_heartbeat: AtomicU16::new(tuned.2),
            opened: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            last_error: Mutex::new(None),
            last_recv_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            weak_self: weak.clone(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn zero_channel(&self) -> Arc<ChannelInner> {
        self.zero.get().expect("channel 0 missing").clone()
    }

    pub(crate) fn frame_max(&self) -> u32 {
        match self.tuned_frame_max.load(Ordering::Acquire) {
            0 => DEFAULT_FRAME_MAX,
            v => v,
        }
    }

    fn last_error(&self) -> Option<AmqpError> {
        self.last_error.lock().expect("last_error poisoned").clone()
    }

    pub(crate) fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::Release);
    }

    fn touch_recv(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        self.last_recv_ms.store(ms, Ordering::Release);
    }

    fn writer(&self) -> Option<mpsc::Sender<Bytes>> {
        self.writer_tx.lock().expect("writer_tx poisoned").clone()
    }

    /// Enqueue pre-encoded frames for the writer task; suspends when the
    /// queue is full.
    pub(crate) async fn send(&self, bytes: Bytes) -> Result<()> {
        let tx = match self.writer() {
            Some(tx) if !self.destroyed.load(Ordering::Acquire) => tx,
            _ => return Err(self.last_error().unwrap_or(AmqpError::ConnectionInactive)),
        };
        tx.send(bytes)
            .await
            .map_err(|_| self.last_error().unwrap_or(AmqpError::ConnectionInactive))
    }

    pub(crate) fn remove_channel(&self, id: u16) {
        self.channels.lock().expect("channels poisoned").remove(&id);
    }

    /// Allocate the lowest free channel id: reuse the lowest gap if one
    /// exists below the highest used id, otherwise extend by one.
    fn allocate_id(channels: &HashMap<u16, Arc<ChannelInner>>, channel_max: u16) -> Result<u16> {
        let limit = if channel_max == 0 { u16::MAX } else { channel_max };
        let max_used = channels.keys().copied().max().unwrap_or(0);

        if (max_used as usize) > channels.len() {
            for id in 1..=max_used {
                if !channels.contains_key(&id) {
                    return Ok(id);
                }
            }
        }
        if max_used >= limit {
            return Err(AmqpError::ChannelMaxReached);
        }
        Ok(max_used + 1)
    }

    pub(crate) async fn open_channel(&self, role: Role) -> Result<Arc<ChannelInner>> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(self.last_error().unwrap_or(AmqpError::ConnectionInactive));
        }
        if !self.opened.load(Ordering::Acquire) || self.blocked.load(Ordering::Acquire) {
            return Err(AmqpError::ConnectionInactive);
        }

        let channel = {
            let mut channels = self.channels.lock().expect("channels poisoned");
            let id = Self::allocate_id(&channels, self.tuned_channel_max.load(Ordering::Acquire))?;
            let channel = ChannelInner::new(id, self.weak_self.clone(), role);
            channels.insert(id, channel.clone());
            channel
        };

        match channel
            .call_method(Method::ChannelOpen, &[method_id::CHANNEL_OPEN_OK])
            .await
        {
            Ok(_) => {
                channel.flow.store(true, Ordering::Release);
                Ok(channel)
            }
            Err(err) => {
                self.remove_channel(channel.id);
                Err(err)
            }
        }
    }

    /// Forced close: stop the timers and IO tasks, cascade the error to
    /// every channel and pending waiter, drop the socket.
    pub(crate) fn destroy(&self, error: AmqpError) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(%error, "destroying connection");
        *self.last_error.lock().expect("last_error poisoned") = Some(error.clone());

        let channels: Vec<_> = {
            let mut map = self.channels.lock().expect("channels poisoned");
            map.drain().map(|(_, c)| c).collect()
        };
        for channel in channels {
            channel.destroy(error.clone());
        }
        if let Some(zero) = self.zero.get() {
            zero.destroy(error);
        }

        // Dropping the sender lets the writer flush what is queued (the
        // goodbye close frame included) and exit; the reader and timers
        // are cancelled outright.
        drop(self.writer_tx.lock().expect("writer_tx poisoned").take());
        for task in self.tasks.lock().expect("tasks poisoned").drain(..) {
            task.abort();
        }
    }

    /// Hard-error escalation: tell the broker why, then tear down.
    pub(crate) fn fail_connection(&self, error: AmqpError) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        error!(%error, "connection-fatal error");
        let reason = error.close_reason();
        let close = Frame::method(
            0,
            Method::ConnectionClose {
                reply_code: reason.reply_code,
                reply_text: reason.reply_text,
                class_id: reason.class_id,
                method_id: reason.method_id,
            },
        );
        if let Ok(bytes) = close.to_bytes() {
            if let Some(tx) = self.writer() {
                let _ = tx.try_send(bytes);
            }
        }
        self.destroy(error);
    }

    async fn dispatch(&self, frame: Frame) -> Result<()> {
        let channel = if frame.channel == 0 {
            Some(self.zero_channel())
        } else {
            self.channels
                .lock()
                .expect("channels poisoned")
                .get(&frame.channel)
                .cloned()
        };

        let channel = match channel {
            Some(c) => c,
            None => {
                warn!(channel = frame.channel, "frame for unknown channel");
                return Ok(());
            }
        };

        match frame.payload {
            FramePayload::Heartbeat => Ok(()),
            FramePayload::Method(method) => channel.handle_method(method).await,
            FramePayload::Header {
                body_size,
                properties,
                ..
            } => channel.handle_header(body_size, properties).await,
            FramePayload::Body(bytes) => channel.handle_body(bytes).await,
        }
    }
}

/// Read one complete frame during the handshake, before the IO tasks
/// exist.
async fn read_handshake_frame<S>(
    read_half: &mut ReadHalf<S>,
    decoder: &mut FrameDecoder,
    pending: &mut VecDeque<Frame>,
) -> Result<Frame>
where
    S: AsyncRead + AsyncWrite,
{
    loop {
        if let Some(frame) = pending.pop_front() {
            return Ok(frame);
        }
        let mut buf = [0u8; 4096];
        let n = read_half.read(&mut buf).await?;
        if n == 0 {
            return Err(AmqpError::ConnectionClosed {
                reason: CloseReason::new(320, "connection closed during handshake"),
            });
        }
        pending.extend(decoder.push(&buf[..n])?);
    }
}

async fn handshake_inner<S>(stream: S, options: ConnectOptions) -> Result<Connection>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    write_half.write_all(&PROTOCOL_HEADER).await?;
    write_half.flush().await?;

    let mut decoder = FrameDecoder::new();
    let mut pending = VecDeque::new();

    // connection.start: pick a mechanism and authenticate.
    let start = read_handshake_frame(&mut read_half, &mut decoder, &mut pending).await?;
    let (mechanisms, _locales) = match start.payload {
        FramePayload::Method(Method::ConnectionStart {
            mechanisms,
            locales,
            ..
        }) => (mechanisms, locales),
        other => {
            return Err(AmqpError::UnexpectedFrame(format!(
                "expected connection.start, got {other:?}"
            )))
        }
    };

    let mechanism = options.select_mechanism(&mechanisms)?;
    let start_ok = Method::ConnectionStartOk {
        client_properties: options.client_properties(),
        mechanism: mechanism.as_str().to_string(),
        response: mechanism.response(&options.username, &options.password)?,
        locale: options.locale.clone(),
    };
    write_half
        .write_all(&Frame::method(0, start_ok).to_bytes()?)
        .await?;
    write_half.flush().await?;

    // connection.secure is not supported; connection.tune negotiates.
    let next = read_handshake_frame(&mut read_half, &mut decoder, &mut pending).await?;
    let (server_channel_max, server_frame_max, _server_heartbeat) = match next.payload {
        FramePayload::Method(Method::ConnectionSecure { .. }) => {
            return Err(AmqpError::NotImplemented("connection.secure"))
        }
        FramePayload::Method(Method::ConnectionTune {
            channel_max,
            frame_max,
            heartbeat,
        }) => (channel_max, frame_max, heartbeat),
        other => {
            return Err(AmqpError::UnexpectedFrame(format!(
                "expected connection.tune, got {other:?}"
            )))
        }
    };

    let negotiate = |client: u32, server: u32| -> u32 {
        if client != 0 {
            client.min(server)
        } else {
            server
        }
    };
    let channel_max = negotiate(options.channel_max as u32, server_channel_max as u32) as u16;
    let frame_max = negotiate(options.frame_max, server_frame_max);
    // Heartbeat is the client's desired receive rate, not a min.
    let heartbeat = options.heartbeat;

    let tune_ok = Method::ConnectionTuneOk {
        channel_max,
        frame_max,
        heartbeat,
    };
    write_half
        .write_all(&Frame::method(0, tune_ok).to_bytes()?)
        .await?;

    let open = Method::ConnectionOpen {
        vhost: options.vhost.clone(),
    };
    write_half
        .write_all(&Frame::method(0, open).to_bytes()?)
        .await?;
    write_half.flush().await?;

    let open_ok = read_handshake_frame(&mut read_half, &mut decoder, &mut pending).await?;
    match open_ok.payload {
        FramePayload::Method(Method::ConnectionOpenOk) => {}
        other => {
            return Err(AmqpError::UnexpectedFrame(format!(
                "expected connection.open-ok, got {other:?}"
            )))
        }
    }

    // Handshake complete: wire up the tasks.
    let (writer_tx, writer_rx) = mpsc::channel(WRITER_QUEUE_FRAMES);
    let inner = ConnectionInner::new(writer_tx, (channel_max, frame_max, heartbeat));
    let zero = ChannelInner::new(0, Arc::downgrade(&inner), Role::Control);
    inner.zero.set(zero).ok().expect("channel 0 set twice");
    inner.touch_recv();
    inner.opened.store(true, Ordering::Release);

    // The writer is not in the abortable task set: it must outlive a
    // destroy long enough to flush the goodbye frame, and exits by itself
    // once the queue closes.
    tokio::spawn(writer_loop(
        writer_rx,
        write_half,
        Arc::downgrade(&inner),
    ));

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(read_loop(
        read_half,
        decoder,
        pending,
        inner.clone(),
    )));
    if heartbeat > 0 {
        tasks.push(tokio::spawn(heartbeat_send_loop(
            Arc::downgrade(&inner),
            heartbeat,
        )));
        tasks.push(tokio::spawn(heartbeat_check_loop(
            Arc::downgrade(&inner),
            heartbeat,
        )));
    }
    *inner.tasks.lock().expect("tasks poisoned") = tasks;

    debug!(
        channel_max,
        frame_max, heartbeat, "connection opened"
    );
    Ok(Connection { inner })
}

/// Drain the writer queue onto the socket, batching ready frames.
async fn writer_loop<S>(
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: WriteHalf<S>,
    conn: std::sync::Weak<ConnectionInner>,
) where
    S: AsyncRead + AsyncWrite,
{
    while let Some(first) = rx.recv().await {
        let mut batch = Vec::with_capacity(WRITER_BATCH);
        batch.push(first);
        while batch.len() < WRITER_BATCH {
            match rx.try_recv() {
                Ok(bytes) => batch.push(bytes),
                Err(_) => break,
            }
        }

        for bytes in &batch {
            if let Err(err) = writer.write_all(bytes).await {
                warn!(%err, "socket write failed");
                if let Some(conn) = conn.upgrade() {
                    conn.destroy(err.into());
                }
                return;
            }
        }
        if let Err(err) = writer.flush().await {
            if let Some(conn) = conn.upgrade() {
                conn.destroy(err.into());
            }
            return;
        }
    }
}

/// Read chunks, refresh liveness, decode and dispatch frames.
async fn read_loop<S>(
    mut reader: ReadHalf<S>,
    mut decoder: FrameDecoder,
    mut pending: VecDeque<Frame>,
    conn: Arc<ConnectionInner>,
) where
    S: AsyncRead + AsyncWrite,
{
    // Frames the handshake read past its own needs come first.
    while let Some(frame) = pending.pop_front() {
        if let Err(err) = conn.dispatch(frame).await {
            conn.fail_connection(err);
            return;
        }
    }

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        if conn.destroyed.load(Ordering::Acquire) {
            return;
        }
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                conn.destroy(AmqpError::ConnectionClosed {
                    reason: CloseReason::new(320, "connection closed by peer"),
                });
                return;
            }
            Ok(n) => n,
            Err(err) => {
                conn.destroy(err.into());
                return;
            }
        };

        conn.touch_recv();
        let frames = match decoder.push(&buf[..n]) {
            Ok(frames) => frames,
            Err(err) => {
                conn.fail_connection(err);
                return;
            }
        };
        for frame in frames {
            if let Err(err) = conn.dispatch(frame).await {
                conn.fail_connection(err);
                return;
            }
        }
    }
}

/// Margin of error applied to both heartbeat loops:
/// `clamp(heartbeat / 100, 50ms, 1000ms)`.
fn heartbeat_margin_ms(heartbeat_secs: u16) -> u64 {
    (u64::from(heartbeat_secs) * 1000 / 100).clamp(50, 1000)
}

/// Emit one heartbeat frame per interval, compensating for the time the
/// write itself took.
async fn heartbeat_send_loop(conn: std::sync::Weak<ConnectionInner>, heartbeat_secs: u16) {
    let interval_ms = u64::from(heartbeat_secs) * 1000;
    let margin = heartbeat_margin_ms(heartbeat_secs);
    let heartbeat = match Frame::heartbeat().to_bytes() {
        Ok(bytes) => bytes,
        Err(_) => return,
    };

    let mut delay = interval_ms.saturating_sub(margin);
    loop {
        tokio::time::sleep(Duration::from_millis(delay)).await;
        let conn = match conn.upgrade() {
            Some(conn) if !conn.destroyed.load(Ordering::Acquire) => conn,
            _ => return,
        };

        let started = Instant::now();
        if conn.send(heartbeat.clone()).await.is_err() {
            return;
        }
        let took = started.elapsed().as_millis() as u64;
        delay = interval_ms.saturating_sub(margin).saturating_sub(took);
    }
}

/// Once a second, verify some bytes arrived within the allowed window.
async fn heartbeat_check_loop(conn: std::sync::Weak<ConnectionInner>, heartbeat_secs: u16) {
    let window_ms = u64::from(heartbeat_secs) * 1000 + heartbeat_margin_ms(heartbeat_secs);
    let mut ticker = tokio::time::interval(Duration::from_millis(1000));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let conn = match conn.upgrade() {
            Some(conn) if !conn.destroyed.load(Ordering::Acquire) => conn,
            _ => return,
        };

        let now_ms = conn.epoch.elapsed().as_millis() as u64;
        let last = conn.last_recv_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(last) > window_ms {
            conn.fail_connection(AmqpError::HeartbeatTimeout);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol() {
        let options = ConnectOptions::default();
        assert_eq!(options.host, "127.0.0.1");
        assert_eq!(options.port, 5672);
        assert_eq!(options.vhost, "/");
        assert_eq!(options.username, "guest");
        assert_eq!(options.password, "guest");
        assert_eq!(
            options.auth_mechanisms,
            vec![AuthMechanism::AmqPlain, AuthMechanism::Plain]
        );
        assert_eq!(options.heartbeat, 0);
        assert_eq!(options.locale, "en_US");
        assert_eq!(options.connection_timeout, Duration::from_millis(60_000));
    }

    #[test]
    fn mechanism_selection_prefers_client_order() {
        let options = ConnectOptions::default();
        assert_eq!(
            options.select_mechanism("PLAIN AMQPLAIN").unwrap(),
            AuthMechanism::AmqPlain
        );

        let plain_only = ConnectOptions {
            auth_mechanisms: vec![AuthMechanism::Plain],
            ..Default::default()
        };
        assert_eq!(
            plain_only.select_mechanism("AMQPLAIN PLAIN").unwrap(),
            AuthMechanism::Plain
        );

        assert!(matches!(
            options.select_mechanism("EXTERNAL"),
            Err(AmqpError::MechanismsRejected { .. })
        ));
    }

    #[test]
    fn plain_response_shape() {
        let response = AuthMechanism::Plain.response("guest", "secret").unwrap();
        assert_eq!(&response[..], b"\x00guest\x00secret");
    }

    #[test]
    fn amqplain_response_has_no_length_prefix() {
        let response = AuthMechanism::AmqPlain.response("u", "p").unwrap();
        // shortstr "LOGIN" | 'S' | longstr "u" | shortstr "PASSWORD" | 'S' | longstr "p"
        let mut expected = Vec::new();
        expected.extend_from_slice(&[5]);
        expected.extend_from_slice(b"LOGIN");
        expected.push(b'S');
        expected.extend_from_slice(&1u32.to_be_bytes());
        expected.push(b'u');
        expected.extend_from_slice(&[8]);
        expected.extend_from_slice(b"PASSWORD");
        expected.push(b'S');
        expected.extend_from_slice(&1u32.to_be_bytes());
        expected.push(b'p');
        assert_eq!(&response[..], &expected[..]);
    }

    #[test]
    fn heartbeat_margin_clamps() {
        assert_eq!(heartbeat_margin_ms(1), 50); // 10ms -> floor 50
        assert_eq!(heartbeat_margin_ms(10), 100);
        assert_eq!(heartbeat_margin_ms(60), 600);
        assert_eq!(heartbeat_margin_ms(600), 1000); // 6s -> ceiling 1000
    }

    #[test]
    fn channel_id_allocation() {
        let mut channels: HashMap<u16, Arc<ChannelInner>> = HashMap::new();
        let dummy = |id: u16| {
            ChannelInner::new(id, std::sync::Weak::new(), Role::Rpc)
        };

        assert_eq!(ConnectionInner::allocate_id(&channels, 10).unwrap(), 1);
        channels.insert(1, dummy(1));
        channels.insert(2, dummy(2));
        channels.insert(3, dummy(3));
        assert_eq!(ConnectionInner::allocate_id(&channels, 10).unwrap(), 4);

        // A gap below the highest id is reused first.
        channels.remove(&2);
        assert_eq!(ConnectionInner::allocate_id(&channels, 10).unwrap(), 2);

        // Exhaustion.
        channels.insert(2, dummy(2));
        channels.insert(4, dummy(4));
        channels.insert(5, dummy(5));
        assert!(matches!(
            ConnectionInner::allocate_id(&channels, 5),
            Err(AmqpError::ChannelMaxReached)
        ));

        // channel_max 0 means the whole id space.
        assert_eq!(ConnectionInner::allocate_id(&channels, 0).unwrap(), 6);
    }
}
