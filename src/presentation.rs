//! Projection of the chat log and connection lifecycle into one view state.
//!
//! The adapter owns no domain data. It holds the latest [`ViewState`] in a
//! `watch` channel (for renderers that only care about "now") and reports
//! every banner change on a `broadcast` channel, so a transient
//! `SendComplete` is still observable even though it is cleared immediately.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::connection::{ConnectionState, LifecycleEvent};
use crate::session::store::ChatLog;

/// User-facing connection/send signal. Exactly one is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Banner {
    #[default]
    None,
    SendError,
    SendComplete,
    ConnectionError,
    Reconnecting,
}

/// Inputs that may move the banner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BannerInput {
    Lifecycle(LifecycleEvent),
    SendFailed,
    SendSucceeded,
    Dismissed,
}

impl Banner {
    /// The banner after `input`. Inputs that leave the banner unchanged
    /// return `self`.
    pub fn apply(self, input: &BannerInput) -> Banner {
        match input {
            BannerInput::Lifecycle(event) => match event {
                LifecycleEvent::Opened | LifecycleEvent::Closed(None) => self,
                LifecycleEvent::FailedToOpen(_) | LifecycleEvent::Closed(Some(_)) => {
                    Banner::ConnectionError
                }
                LifecycleEvent::WillReconnect(_) => Banner::Reconnecting,
                LifecycleEvent::Reconnected => Banner::None,
            },
            BannerInput::SendFailed => Banner::SendError,
            BannerInput::SendSucceeded => Banner::SendComplete,
            BannerInput::Dismissed => Banner::None,
        }
    }

    /// Short human-readable text for the banner, `None` when nothing shows.
    pub fn text(self) -> Option<&'static str> {
        match self {
            Banner::None => None,
            Banner::SendError => Some("Message could not be sent"),
            Banner::SendComplete => Some("Message sent"),
            Banner::ConnectionError => Some("Connection error"),
            Banner::Reconnecting => Some("Reconnecting..."),
        }
    }
}

/// Everything a UI needs to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewState {
    pub messages: ChatLog,
    pub banner: Banner,
    pub connection: ConnectionState,
}

/// Publishes [`ViewState`] and banner signals. Cheap to clone; clones share
/// the same channels.
#[derive(Clone)]
pub struct PresentationAdapter {
    view: Arc<watch::Sender<ViewState>>,
    signals: broadcast::Sender<Banner>,
}

impl PresentationAdapter {
    pub fn new(messages: ChatLog, connection: ConnectionState) -> Self {
        let (view, _) = watch::channel(ViewState {
            messages,
            banner: Banner::None,
            connection,
        });
        let (signals, _) = broadcast::channel(64);
        Self {
            view: Arc::new(view),
            signals,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.view.subscribe()
    }

    /// Every banner change from now on, including transient ones.
    pub fn signals(&self) -> broadcast::Receiver<Banner> {
        self.signals.subscribe()
    }

    pub fn view(&self) -> ViewState {
        self.view.borrow().clone()
    }

    pub fn set_messages(&self, messages: ChatLog) {
        self.view.send_modify(|view| view.messages = messages);
    }

    pub fn on_lifecycle(&self, event: LifecycleEvent, connection: ConnectionState) {
        self.view.send_modify(|view| view.connection = connection);
        self.publish(&BannerInput::Lifecycle(event));
    }

    pub fn send_failed(&self) {
        self.publish(&BannerInput::SendFailed);
    }

    /// Flash `SendComplete`, then clear.
    pub fn send_succeeded(&self) {
        self.publish(&BannerInput::SendSucceeded);
        self.publish(&BannerInput::Dismissed);
    }

    pub fn dismiss(&self) {
        self.publish(&BannerInput::Dismissed);
    }

    fn publish(&self, input: &BannerInput) {
        let mut changed = None;
        self.view.send_if_modified(|view| {
            let next = view.banner.apply(input);
            if next == view.banner {
                return false;
            }
            view.banner = next;
            changed = Some(next);
            true
        });
        if let Some(banner) = changed {
            debug!(?banner, "Banner changed");
            // no subscribers is fine
            let _ = self.signals.send(banner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::message::Message;

    fn lost() -> TransportError {
        TransportError::ConnectionLost("reset".into())
    }

    fn adapter() -> PresentationAdapter {
        PresentationAdapter::new(Arc::from(Vec::new()), ConnectionState::Connecting)
    }

    #[test]
    fn lifecycle_mapping() {
        use LifecycleEvent as E;
        let cases = [
            (Banner::SendError, E::Opened, Banner::SendError),
            (Banner::None, E::FailedToOpen(lost()), Banner::ConnectionError),
            (Banner::None, E::Closed(Some(lost())), Banner::ConnectionError),
            (Banner::Reconnecting, E::Closed(None), Banner::Reconnecting),
            (Banner::None, E::WillReconnect(lost()), Banner::Reconnecting),
            (Banner::Reconnecting, E::Reconnected, Banner::None),
        ];
        for (from, event, want) in cases {
            assert_eq!(
                from.apply(&BannerInput::Lifecycle(event.clone())),
                want,
                "{from:?} + {event:?}"
            );
        }
    }

    #[test]
    fn send_outcomes_replace_current_banner() {
        assert_eq!(
            Banner::Reconnecting.apply(&BannerInput::SendFailed),
            Banner::SendError
        );
        assert_eq!(
            Banner::ConnectionError.apply(&BannerInput::SendSucceeded),
            Banner::SendComplete
        );
        assert_eq!(
            Banner::SendError.apply(&BannerInput::Dismissed),
            Banner::None
        );
    }

    #[test]
    fn send_complete_is_transient() {
        let adapter = adapter();
        let mut signals = adapter.signals();
        adapter.send_succeeded();
        assert_eq!(signals.try_recv().unwrap(), Banner::SendComplete);
        assert_eq!(signals.try_recv().unwrap(), Banner::None);
        assert_eq!(adapter.view().banner, Banner::None);
    }

    #[test]
    fn unchanged_banner_is_not_rebroadcast() {
        let adapter = adapter();
        let mut signals = adapter.signals();
        adapter.send_failed();
        adapter.send_failed();
        adapter.on_lifecycle(LifecycleEvent::Opened, ConnectionState::Connected);
        assert_eq!(signals.try_recv().unwrap(), Banner::SendError);
        assert!(signals.try_recv().is_err());

        let view = adapter.view();
        assert_eq!(view.banner, Banner::SendError);
        assert_eq!(view.connection, ConnectionState::Connected);
    }

    #[test]
    fn reconnect_cycle_sets_and_clears() {
        let adapter = adapter();
        adapter.on_lifecycle(LifecycleEvent::WillReconnect(lost()), ConnectionState::Reconnecting);
        assert_eq!(adapter.view().banner, Banner::Reconnecting);
        adapter.on_lifecycle(LifecycleEvent::Reconnected, ConnectionState::Connected);
        assert_eq!(adapter.view().banner, Banner::None);
    }

    #[test]
    fn dismiss_clears_connection_error() {
        let adapter = adapter();
        adapter.on_lifecycle(
            LifecycleEvent::FailedToOpen(lost()),
            ConnectionState::FailedToOpen("reset".into()),
        );
        assert_eq!(adapter.view().banner, Banner::ConnectionError);
        adapter.dismiss();
        assert_eq!(adapter.view().banner, Banner::None);
        assert_eq!(Banner::None.text(), None);
    }

    #[test]
    fn messages_are_projected() {
        let adapter = adapter();
        let mut view = adapter.subscribe();
        adapter.set_messages(Arc::from(vec![Message::new("A", "hi")]));
        assert!(view.has_changed().unwrap());
        assert_eq!(view.borrow_and_update().messages.len(), 1);
    }
}
