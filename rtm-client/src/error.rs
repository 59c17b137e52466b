use rtm_core::{auth::AuthError, CodecError, EndpointError};
use thiserror::Error;

/// Errors surfaced by the [`Client`](crate::Client) facade.
///
/// Recoverable failures (transport drops, per-subscription errors) never
/// appear here; the client absorbs them and reports through observer
/// callbacks instead.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Malformed endpoint or appkey, raised at construction
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    /// The soft queue bound would be exceeded; retry later
    #[error("action queue is full")]
    QueueFull,

    /// The client has been disposed and can no longer be used
    #[error("client has been disposed")]
    Disposed,

    /// A synchronous wrapper timed out waiting for its acknowledgement.
    /// The underlying request is not cancelled and may still complete.
    #[error("timed out waiting for an acknowledgement")]
    AckTimeout,

    /// The connection dropped before the acknowledgement arrived
    #[error("the acknowledgement was dropped before a reply arrived")]
    AckDropped,

    /// The server answered the request with a negative reply
    #[error(transparent)]
    ErrorReply(#[from] ErrorReply),

    /// Authentication failed
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Subscribe args carried a key managed by the client itself
    #[error("subscribe args must not set {0:?}; it is derived from the delivery mode")]
    ReservedSubscribeArg(&'static str),
}

/// A negative (`*/error`) reply, carried into [`ClientError`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorReply {
    pub action: String,
    pub error: String,
    pub reason: Option<String>,
}

impl std::fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.action, self.error)?;
        if let Some(reason) = &self.reason {
            write!(f, " ({reason})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorReply {}

/// Transport-level failures. Any of these abandons the current connection;
/// the supervisor decides whether to reconnect.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Frame (de)serialization failed
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Underlying websocket error
    #[error(transparent)]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    /// Socket-level I/O error (proxy tunnel establishment)
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Remote server sent a Close frame or went away
    #[error("websocket closed unexpectedly")]
    UnexpectedClose,

    /// Unexpected internal channel closure. This is likely a bug.
    #[error("unexpected internal channel closure")]
    DeadChannel,

    /// The server missed a ping deadline
    #[error("server did not answer a ping in time")]
    MissedPong,

    /// The HTTPS proxy refused the tunnel
    #[error("proxy CONNECT failed: {0}")]
    Proxy(String),
}

/// A well-formed frame that violates the PDU protocol. Logged and treated
/// as a transport failure: the connection is closed and re-established.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("pdu has an empty \"action\" field")]
    MissingAction,

    #[error("pdu for {action:?} has no \"body\" field")]
    MissingBody { action: String },

    #[error("unsolicited general error: {payload}")]
    GeneralError { payload: String },
}
