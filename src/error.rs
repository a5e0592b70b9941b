//! Error types for amqflow.
//!
//! AMQP distinguishes *hard* errors (connection-level reply codes, the
//! whole connection is torn down) from *soft* errors (channel-level reply
//! codes, only the channel dies). Local failures (bad arguments, codec
//! assertions, transport faults, timeouts) are mapped onto the same code
//! space so that every error can be reported to the broker in a
//! `connection.close` / `channel.close` frame.
//!
//! The error type is `Clone`: a single broker-side close is fanned out to
//! every waiter that was pending on the connection or channel.

use std::sync::Arc;

use thiserror::Error;

/// Reply code constants from the AMQP 0-9-1 specification.
pub mod reply_code {
    /// Success.
    pub const REPLY_SUCCESS: u16 = 200;

    // Soft (channel) errors.
    pub const CONTENT_TOO_LARGE: u16 = 311;
    pub const NO_ROUTE: u16 = 312;
    pub const NO_CONSUMERS: u16 = 313;
    pub const ACCESS_REFUSED: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const RESOURCE_LOCKED: u16 = 405;
    pub const PRECONDITION_FAILED: u16 = 406;

    // Hard (connection) errors.
    pub const CONNECTION_FORCED: u16 = 320;
    pub const INVALID_PATH: u16 = 402;
    pub const FRAME_ERROR: u16 = 501;
    pub const SYNTAX_ERROR: u16 = 502;
    pub const COMMAND_INVALID: u16 = 503;
    pub const CHANNEL_ERROR: u16 = 504;
    pub const UNEXPECTED_FRAME: u16 = 505;
    pub const RESOURCE_ERROR: u16 = 506;
    pub const NOT_ALLOWED: u16 = 530;
    pub const NOT_IMPLEMENTED: u16 = 540;
    pub const INTERNAL_ERROR: u16 = 541;

    /// True for connection-level (hard) codes.
    pub fn is_hard(code: u16) -> bool {
        matches!(
            code,
            CONNECTION_FORCED
                | INVALID_PATH
                | FRAME_ERROR
                | SYNTAX_ERROR
                | COMMAND_INVALID
                | CHANNEL_ERROR
                | UNEXPECTED_FRAME
                | RESOURCE_ERROR
                | NOT_ALLOWED
                | NOT_IMPLEMENTED
                | INTERNAL_ERROR
        )
    }
}

/// The code/text/method triple carried by `connection.close` and
/// `channel.close` in both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// AMQP reply code (see [`reply_code`]).
    pub reply_code: u16,
    /// Human-readable reply text.
    pub reply_text: String,
    /// Class id of the method that caused the close, or 0.
    pub class_id: u16,
    /// Method id (within the class) that caused the close, or 0.
    pub method_id: u16,
}

impl CloseReason {
    pub fn new(reply_code: u16, reply_text: impl Into<String>) -> Self {
        Self {
            reply_code,
            reply_text: reply_text.into(),
            class_id: 0,
            method_id: 0,
        }
    }

    /// The `{200, "buy!"}` pair sent when closing without an error.
    pub fn success() -> Self {
        Self::new(reply_code::REPLY_SUCCESS, "buy!")
    }
}

/// Main error type for all amqflow operations.
#[derive(Debug, Error, Clone)]
pub enum AmqpError {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// Encode/decode failure; `path` is the dotted path of the field that
    /// failed.
    #[error("codec error at {path}: {message}")]
    Codec { path: String, message: String },

    /// Frame does not end with the 0xCE terminator.
    #[error("invalid frame end")]
    FrameEndInvalid,

    /// Frame kind octet outside METHOD/HEADER/BODY/HEARTBEAT.
    #[error("unknown frame kind: {0}")]
    UnknownFrameKind(u8),

    /// Method id with no decoder in the protocol tables.
    #[error("unknown method id: {0:#010x}")]
    UnknownMethod(u32),

    /// Broker replied with its protocol header: version negotiation failed.
    #[error("server does not support AMQP 0-9-1, offered {major}.{minor}.{revision}")]
    VersionMismatch { major: u8, minor: u8, revision: u8 },

    /// No overlap between our mechanism preference list and the server's.
    #[error("no usable SASL mechanism, server offers: {offered}")]
    MechanismsRejected { offered: String },

    /// The handshake did not complete within `connection_timeout`.
    #[error("connection timeout during handshake")]
    HandshakeTimeout,

    /// No inbound traffic for longer than the negotiated heartbeat allows.
    #[error("Heartbeat timeout expired")]
    HeartbeatTimeout,

    /// The broker closed the connection (or we closed it on a hard error).
    #[error("connection closed: {} {}", reason.reply_code, reason.reply_text)]
    ConnectionClosed { reason: CloseReason },

    /// The broker closed the channel (or we closed it on a soft error).
    #[error("channel closed: {} {}", reason.reply_code, reason.reply_text)]
    ChannelClosed { reason: CloseReason },

    /// A mandatory publish could not be routed; the broker returned it.
    #[error("message returned: {reply_code} {reply_text}")]
    Returned {
        reply_code: u16,
        reply_text: String,
        exchange: String,
        routing_key: String,
    },

    /// Content frames arrived in an order the assembly state machine
    /// cannot accept.
    #[error("unexpected content frame: {0}")]
    UnexpectedFrame(String),

    /// Received method has neither a pending waiter nor a handler.
    #[error("Handler for {0} not found")]
    HandlerNotFound(&'static str),

    /// `basic.deliver` carried a consumer tag we never registered.
    #[error("unknown consumer tag: {0}")]
    UnknownConsumerTag(String),

    /// Message priority outside 0..=9.
    #[error("invalid priority {0}, expected 0..=9")]
    InvalidPriority(u8),

    /// Exchange/queue name longer than 127 bytes or outside
    /// `[a-zA-Z0-9-_.:]`.
    #[error("invalid name {0:?} for {1}")]
    InvalidName(String, &'static str),

    /// Field-table key outside the AMQP key grammar.
    #[error("invalid table key {0:?}")]
    InvalidTableKey(String),

    /// Required argument missing or empty.
    #[error("argument {0} must not be empty")]
    EmptyArgument(&'static str),

    /// Channel id space exhausted.
    #[error("Channel max limit exceeded")]
    ChannelMaxReached,

    /// Operation on a connection that is not open, blocked, or destroyed.
    #[error("Connection inactive")]
    ConnectionInactive,

    /// Feature the peer asked for that this client does not implement.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
}

impl AmqpError {
    pub(crate) fn codec(path: &str, message: impl Into<String>) -> Self {
        Self::Codec {
            path: path.to_string(),
            message: message.into(),
        }
    }

    /// The AMQP reply code this error maps to when reported to the broker.
    pub fn reply_code(&self) -> u16 {
        use reply_code::*;
        match self {
            AmqpError::Io(_) => INTERNAL_ERROR,
            AmqpError::Codec { .. } => SYNTAX_ERROR,
            AmqpError::FrameEndInvalid => FRAME_ERROR,
            AmqpError::UnknownFrameKind(_) => FRAME_ERROR,
            AmqpError::UnknownMethod(_) => FRAME_ERROR,
            AmqpError::VersionMismatch { .. } => NOT_IMPLEMENTED,
            AmqpError::MechanismsRejected { .. } => NOT_ALLOWED,
            AmqpError::HandshakeTimeout => CONNECTION_FORCED,
            AmqpError::HeartbeatTimeout => CONNECTION_FORCED,
            AmqpError::ConnectionClosed { reason } => reason.reply_code,
            AmqpError::ChannelClosed { reason } => reason.reply_code,
            AmqpError::Returned { reply_code, .. } => *reply_code,
            AmqpError::UnexpectedFrame(_) => UNEXPECTED_FRAME,
            AmqpError::HandlerNotFound(_) => COMMAND_INVALID,
            AmqpError::UnknownConsumerTag(_) => NO_CONSUMERS,
            AmqpError::InvalidPriority(_) => PRECONDITION_FAILED,
            AmqpError::InvalidName(..) => PRECONDITION_FAILED,
            AmqpError::InvalidTableKey(_) => SYNTAX_ERROR,
            AmqpError::EmptyArgument(_) => SYNTAX_ERROR,
            AmqpError::ChannelMaxReached => CHANNEL_ERROR,
            AmqpError::ConnectionInactive => CHANNEL_ERROR,
            AmqpError::NotImplemented(_) => NOT_IMPLEMENTED,
        }
    }

    /// True if this error tears down the whole connection.
    pub fn is_hard(&self) -> bool {
        reply_code::is_hard(self.reply_code())
    }

    /// The code/text pair to put into an outgoing close method.
    pub(crate) fn close_reason(&self) -> CloseReason {
        match self {
            AmqpError::ConnectionClosed { reason } | AmqpError::ChannelClosed { reason } => {
                reason.clone()
            }
            other => CloseReason::new(other.reply_code(), other.to_string()),
        }
    }
}

impl From<std::io::Error> for AmqpError {
    fn from(err: std::io::Error) -> Self {
        AmqpError::Io(Arc::new(err))
    }
}

/// Result type alias using AmqpError.
pub type Result<T> = std::result::Result<T, AmqpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_and_soft_codes() {
        assert!(reply_code::is_hard(reply_code::CONNECTION_FORCED));
        assert!(reply_code::is_hard(reply_code::FRAME_ERROR));
        assert!(!reply_code::is_hard(reply_code::NO_ROUTE));
        assert!(!reply_code::is_hard(reply_code::PRECONDITION_FAILED));
        assert!(!reply_code::is_hard(reply_code::REPLY_SUCCESS));
    }

    #[test]
    fn error_reply_codes() {
        assert_eq!(AmqpError::HeartbeatTimeout.reply_code(), 320);
        assert_eq!(AmqpError::FrameEndInvalid.reply_code(), 501);
        assert_eq!(AmqpError::ChannelMaxReached.reply_code(), 504);
        assert_eq!(
            AmqpError::UnexpectedFrame("body before header".into()).reply_code(),
            505
        );
        assert!(AmqpError::HeartbeatTimeout.is_hard());
        assert!(!AmqpError::InvalidPriority(12).is_hard());
    }

    #[test]
    fn close_without_error_is_200_buy() {
        let reason = CloseReason::success();
        assert_eq!(reason.reply_code, 200);
        assert_eq!(reason.reply_text, "buy!");
    }

    #[test]
    fn close_reason_carries_broker_code() {
        let err = AmqpError::ConnectionClosed {
            reason: CloseReason::new(320, "CONNECTION_FORCED - shutdown"),
        };
        let reason = err.close_reason();
        assert_eq!(reason.reply_code, 320);
        assert!(reason.reply_text.contains("shutdown"));
    }

    #[test]
    fn errors_are_cloneable() {
        let err: AmqpError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        let clone = err.clone();
        assert_eq!(clone.reply_code(), reply_code::INTERNAL_ERROR);
    }
}
