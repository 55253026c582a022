//! Hub transport seam.
//!
//! [`HubTransport`] is the persistent-connection primitive the connection
//! controller is layered on: start/stop, fire-and-forget sends, request/reply
//! invocations, and server-push streams. Everything the server initiates
//! (lifecycle changes, push invocations, stream items, stream completions)
//! is reported on a single [`TransportEvent`] channel handed to
//! [`HubTransport::start`], so the controller sees them in arrival order.
//!
//! [`signalr::SignalRTransport`] speaks the SignalR JSON hub protocol over a
//! WebSocket.

pub mod protocol;
pub mod signalr;

#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TransportError;

pub use signalr::{SignalROptions, SignalRTransport};

/// Everything a transport reports asynchronously.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The first connection attempt succeeded.
    Opened,
    /// The first connection attempt failed. No retry follows.
    FailedToOpen(TransportError),
    /// The connection is gone for good. `None` means a clean close.
    Closed(Option<TransportError>),
    /// The connection dropped and a reconnect attempt is about to start.
    WillReconnect(TransportError),
    /// A reconnect attempt succeeded.
    Reconnected,
    /// The server invoked a client method.
    Invocation {
        target: String,
        arguments: Vec<Value>,
    },
    /// One item of a server-push stream.
    StreamItem { invocation_id: String, item: Value },
    /// A server-push stream finished, successfully or not.
    StreamCompleted {
        invocation_id: String,
        error: Option<TransportError>,
    },
}

/// Sending half of the event channel a transport reports on.
pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// A persistent, auto-reconnecting hub connection.
#[async_trait]
pub trait HubTransport: Send + Sync + 'static {
    /// Begin opening a connection to `endpoint`. Returns once the attempt is
    /// under way; the outcome arrives as `Opened` or `FailedToOpen`.
    async fn start(&self, endpoint: Url, events: TransportEvents);

    /// Fire-and-forget invocation. Completes once the frame is on the wire.
    async fn send(&self, method: &str, arguments: Vec<Value>) -> Result<(), TransportError>;

    /// Request/reply invocation.
    async fn invoke(&self, method: &str, arguments: Vec<Value>) -> Result<Value, TransportError>;

    /// Start a server-push stream under a caller-chosen invocation id. Items
    /// and the completion arrive as events tagged with that id.
    async fn stream(
        &self,
        invocation_id: &str,
        method: &str,
        arguments: Vec<Value>,
    ) -> Result<(), TransportError>;

    /// Ask the server to stop a stream. Best-effort.
    async fn cancel_stream(&self, invocation_id: &str) -> Result<(), TransportError>;

    /// Close the connection. Reported as `Closed(None)`.
    async fn stop(&self);
}
