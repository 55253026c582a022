//! Error types for hub operations.
//!
//! Each public operation on the connection controller has its own error enum
//! so callers can match on exactly the failures that operation can produce.
//! Transport failures are carried inside as [`TransportError`].

/// Failures reported by a [`HubTransport`](crate::transport::HubTransport).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The transport has no open connection right now.
    NotConnected,
    /// The connection dropped while the request was in flight.
    ConnectionLost(String),
    /// The negotiate request failed or was rejected.
    Negotiate(String),
    /// The protocol handshake failed or was rejected.
    Handshake(String),
    /// The hub completed the invocation with an error.
    Hub(String),
    /// A frame could not be encoded or decoded.
    Protocol(String),
    /// WebSocket-level I/O error.
    WebSocket(String),
    /// The transport was stopped.
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::NotConnected => write!(f, "Not connected"),
            TransportError::ConnectionLost(e) => write!(f, "Connection lost: {e}"),
            TransportError::Negotiate(e) => write!(f, "Negotiation failed: {e}"),
            TransportError::Handshake(e) => write!(f, "Handshake failed: {e}"),
            TransportError::Hub(e) => write!(f, "Hub error: {e}"),
            TransportError::Protocol(e) => write!(f, "Protocol error: {e}"),
            TransportError::WebSocket(e) => write!(f, "WebSocket error: {e}"),
            TransportError::Closed => write!(f, "Transport closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Errors returned by [`ConnectionController::send`](crate::connection::ConnectionController::send).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The controller is not in the `Connected` state.
    NotConnected,
    /// The payload could not be serialized.
    Payload(String),
    Transport(TransportError),
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::NotConnected => write!(f, "Cannot send: not connected"),
            SendError::Payload(e) => write!(f, "Cannot send: invalid payload: {e}"),
            SendError::Transport(e) => write!(f, "Send failed: {e}"),
        }
    }
}

impl std::error::Error for SendError {}

impl From<TransportError> for SendError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NotConnected => SendError::NotConnected,
            other => SendError::Transport(other),
        }
    }
}

/// Errors returned by [`ConnectionController::invoke`](crate::connection::ConnectionController::invoke).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    /// The controller is not in the `Connected` state.
    NotConnected,
    Transport(TransportError),
}

impl std::fmt::Display for InvokeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvokeError::NotConnected => write!(f, "Cannot invoke: not connected"),
            InvokeError::Transport(e) => write!(f, "Invocation failed: {e}"),
        }
    }
}

impl std::error::Error for InvokeError {}

impl From<TransportError> for InvokeError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NotConnected => InvokeError::NotConnected,
            other => InvokeError::Transport(other),
        }
    }
}

/// Errors returned by [`ConnectionController::open_stream`](crate::connection::ConnectionController::open_stream).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Another stream already holds the single stream slot.
    StreamAlreadyActive,
    /// The controller is not in the `Connected` state.
    NotConnected,
    Transport(TransportError),
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::StreamAlreadyActive => write!(f, "A stream is already active"),
            StreamError::NotConnected => write!(f, "Cannot open stream: not connected"),
            StreamError::Transport(e) => write!(f, "Stream failed: {e}"),
        }
    }
}

impl std::error::Error for StreamError {}

impl From<TransportError> for StreamError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NotConnected => StreamError::NotConnected,
            other => StreamError::Transport(other),
        }
    }
}

/// Errors returned by [`ConnectionController::cancel_stream`](crate::connection::ConnectionController::cancel_stream).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelError {
    /// The handle does not match the active stream (stale or never opened).
    NoSuchStream,
}

impl std::fmt::Display for CancelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelError::NoSuchStream => write!(f, "No such stream"),
        }
    }
}

impl std::error::Error for CancelError {}
