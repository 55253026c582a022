//! Connection lifecycle state machine.

use std::fmt;

use crate::error::TransportError;

/// Lifecycle notifications surfaced by the controller, one per accepted
/// state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Opened,
    FailedToOpen(TransportError),
    /// `None` is a clean close.
    Closed(Option<TransportError>),
    WillReconnect(TransportError),
    Reconnected,
}

/// Current state of a [`ConnectionController`](super::ConnectionController).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// The first open failed. Terminal.
    FailedToOpen(String),
    /// The connection ended after having been open. Terminal.
    ClosedWithError(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::FailedToOpen(_) | ConnectionState::ClosedWithError(_)
        )
    }

    /// The state `event` moves to, or `None` when no edge leaves the current
    /// state for that event.
    pub fn on_lifecycle(&self, event: &LifecycleEvent) -> Option<ConnectionState> {
        use ConnectionState as S;
        use LifecycleEvent as E;

        match (self, event) {
            (S::Connecting, E::Opened) | (S::Reconnecting, E::Reconnected) => Some(S::Connected),
            (S::Connecting, E::FailedToOpen(e)) => Some(S::FailedToOpen(e.to_string())),
            // stop() before the first open completed
            (S::Connecting, E::Closed(e)) => Some(S::FailedToOpen(close_reason(e.as_ref()))),
            (S::Connected, E::WillReconnect(_)) => Some(S::Reconnecting),
            (S::Connected | S::Reconnecting, E::Closed(e)) => {
                Some(S::ClosedWithError(close_reason(e.as_ref())))
            }
            _ => None,
        }
    }
}

fn close_reason(error: Option<&TransportError>) -> String {
    error.map_or_else(|| "connection closed".to_string(), ToString::to_string)
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::FailedToOpen(reason) => write!(f, "failed to open: {reason}"),
            ConnectionState::ClosedWithError(reason) => write!(f, "closed: {reason}"),
        }
    }
}
