//! Hub connection controller.
//!
//! [`ConnectionController`] owns a [`HubTransport`] and turns its raw
//! callbacks into one ordered stream of [`ControllerEvent`]s. A single event
//! loop task consumes the transport's channel and, for each event, advances
//! the [`ConnectionState`] machine, runs push handlers, or filters stream
//! traffic through the [`StreamRegistry`]. Outgoing operations are gated on
//! the `Connected` state.

pub mod state;
pub mod stream;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use reqwest::Url;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{CancelError, InvokeError, SendError, StreamError, TransportError};
use crate::transport::{HubTransport, TransportEvent};

pub use state::{ConnectionState, LifecycleEvent};
pub use stream::{StreamHandle, StreamRegistry};

/// Handler for a server-to-client invocation. Receives the raw arguments.
pub type PushHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Receiver of [`ControllerEvent`]s. Called on the controller's event loop,
/// interleaved with push handlers in the order the transport reported them.
pub type EventSink = Arc<dyn Fn(ControllerEvent) + Send + Sync>;

/// Everything the controller reports, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Lifecycle(LifecycleEvent),
    StreamItem {
        handle: StreamHandle,
        item: Value,
    },
    /// Terminal event of a stream. The slot is already free when this is
    /// delivered.
    StreamCompleted {
        handle: StreamHandle,
        error: Option<TransportError>,
    },
}

struct Inner {
    transport: Arc<dyn HubTransport>,
    state: watch::Sender<ConnectionState>,
    streams: Mutex<StreamRegistry>,
    handlers: Mutex<HashMap<String, PushHandler>>,
    /// Held across a send so the next one starts only after it finished.
    send_lock: tokio::sync::Mutex<()>,
    events: EventSink,
}

/// Lifecycle owner for one hub connection. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionController {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionController {
    /// Create a controller in `Disconnected`, returning the receiving end of
    /// its event stream.
    pub fn new(
        transport: Arc<dyn HubTransport>,
    ) -> (Self, mpsc::UnboundedReceiver<ControllerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = Self::with_sink(
            transport,
            Arc::new(move |event: ControllerEvent| {
                if tx.send(event).is_err() {
                    debug!("Hub: controller event dropped, no consumer");
                }
            }),
        );
        (controller, rx)
    }

    /// Create a controller in `Disconnected` that hands every event to
    /// `events`. A push handler that forwards into the same place as `events`
    /// sees pushes and controller events in one arrival order.
    pub fn with_sink(transport: Arc<dyn HubTransport>, events: EventSink) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                transport,
                state,
                streams: Mutex::new(StreamRegistry::default()),
                handlers: Mutex::new(HashMap::new()),
                send_lock: tokio::sync::Mutex::new(()),
                events,
            }),
        }
    }

    /// Start connecting to `endpoint`. Only acts from `Disconnected`; later
    /// calls are ignored. A malformed endpoint ends in `FailedToOpen`.
    pub async fn connect(&self, endpoint: &str) {
        let started = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            debug!(state = %self.state(), "Hub: connect ignored");
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(event_loop(Arc::clone(&self.inner), rx));

        match parse_endpoint(endpoint) {
            Ok(url) => self.inner.transport.start(url, tx).await,
            Err(e) => {
                warn!("Hub: {e}");
                let _ = tx.send(TransportEvent::FailedToOpen(e));
            }
        }
    }

    /// Fire-and-forget call of `method` with one argument. Sends are issued
    /// one at a time.
    pub async fn send<T>(&self, method: &str, payload: &T) -> Result<(), SendError>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(payload).map_err(|e| SendError::Payload(e.to_string()))?;
        let _serial = self.inner.send_lock.lock().await;
        if !self.is_connected() {
            return Err(SendError::NotConnected);
        }
        self.inner
            .transport
            .send(method, vec![payload])
            .await
            .map_err(SendError::from)
    }

    /// Request/reply call of `method`.
    pub async fn invoke(&self, method: &str, arguments: Vec<Value>) -> Result<Value, InvokeError> {
        if !self.is_connected() {
            return Err(InvokeError::NotConnected);
        }
        self.inner
            .transport
            .invoke(method, arguments)
            .await
            .map_err(InvokeError::from)
    }

    /// Start a server-push stream in the single stream slot.
    pub async fn open_stream(
        &self,
        method: &str,
        arguments: Vec<Value>,
    ) -> Result<StreamHandle, StreamError> {
        let handle = {
            let mut streams = lock(&self.inner.streams);
            let handle = streams.reserve()?;
            if !self.is_connected() {
                streams.complete(handle.invocation_id());
                return Err(StreamError::NotConnected);
            }
            handle
        };

        if let Err(e) = self
            .inner
            .transport
            .stream(handle.invocation_id(), method, arguments)
            .await
        {
            lock(&self.inner.streams).complete(handle.invocation_id());
            return Err(e.into());
        }
        debug!(stream = %handle, method, "Hub: stream opened");
        Ok(handle)
    }

    /// Cancel the active stream. The slot is free once this returns; the
    /// server-side cancel request is best-effort.
    pub async fn cancel_stream(&self, handle: &StreamHandle) -> Result<(), CancelError> {
        lock(&self.inner.streams).release(handle)?;
        if let Err(e) = self
            .inner
            .transport
            .cancel_stream(handle.invocation_id())
            .await
        {
            warn!("Hub: cancel request for {handle} failed: {e}");
        }
        debug!(stream = %handle, "Hub: stream cancelled");
        Ok(())
    }

    /// Register the handler for server invocations of `method`, replacing any
    /// previous one.
    pub fn on<F>(&self, method: &str, handler: F)
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let previous = lock(&self.inner.handlers).insert(method.to_string(), Arc::new(handler));
        if previous.is_some() {
            debug!(method, "Hub: push handler replaced");
        }
    }

    pub async fn close(&self) {
        info!("Hub: closing connection");
        self.inner.transport.stop().await;
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn active_stream(&self) -> Option<StreamHandle> {
        lock(&self.inner.streams).active().cloned()
    }

    fn is_connected(&self) -> bool {
        self.inner.state.borrow().is_connected()
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Url, TransportError> {
    let url = Url::parse(endpoint)
        .map_err(|e| TransportError::Protocol(format!("Invalid hub endpoint '{endpoint}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") || !url.has_host() {
        return Err(TransportError::Protocol(format!(
            "Invalid hub endpoint '{endpoint}': expected an http(s) or ws(s) URL"
        )));
    }
    Ok(url)
}

/// Consume transport events until every sender is gone.
async fn event_loop(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            TransportEvent::Opened => inner.apply_lifecycle(LifecycleEvent::Opened),
            TransportEvent::FailedToOpen(e) => inner.apply_lifecycle(LifecycleEvent::FailedToOpen(e)),
            TransportEvent::Closed(e) => inner.apply_lifecycle(LifecycleEvent::Closed(e)),
            TransportEvent::WillReconnect(e) => {
                inner.apply_lifecycle(LifecycleEvent::WillReconnect(e));
            }
            TransportEvent::Reconnected => inner.apply_lifecycle(LifecycleEvent::Reconnected),
            TransportEvent::Invocation { target, arguments } => inner.dispatch_push(&target, &arguments),
            TransportEvent::StreamItem {
                invocation_id,
                item,
            } => {
                let handle = lock(&inner.streams).matching(&invocation_id).cloned();
                match handle {
                    Some(handle) => inner.emit(ControllerEvent::StreamItem { handle, item }),
                    None => debug!(invocation_id = %invocation_id, "Hub: late stream item ignored"),
                }
            }
            TransportEvent::StreamCompleted {
                invocation_id,
                error,
            } => {
                let handle = lock(&inner.streams).complete(&invocation_id);
                match handle {
                    Some(handle) => inner.emit(ControllerEvent::StreamCompleted { handle, error }),
                    None => debug!(invocation_id = %invocation_id, "Hub: late stream completion ignored"),
                }
            }
        }
    }
    debug!("Hub: transport event channel closed");
}

impl Inner {
    fn apply_lifecycle(&self, event: LifecycleEvent) {
        let mut accepted = false;
        self.state.send_if_modified(|state| match state.on_lifecycle(&event) {
            Some(next) => {
                debug!(from = %state, to = %next, "Hub: state change");
                *state = next;
                accepted = true;
                true
            }
            None => false,
        });

        if accepted {
            self.emit(ControllerEvent::Lifecycle(event));
        } else {
            let current = self.state.borrow().clone();
            warn!(state = %current, "Hub: dropping out-of-order {event:?}");
        }
    }

    fn dispatch_push(&self, method: &str, arguments: &[Value]) {
        let handler = lock(&self.handlers).get(method).cloned();
        match handler {
            Some(handler) => handler(arguments),
            None => debug!(method, "Hub: no handler for server invocation"),
        }
    }

    fn emit(&self, event: ControllerEvent) {
        (self.events)(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::message::Message;
    use crate::transport::testing::{Call, FakeTransport};

    const ENDPOINT: &str = "http://localhost:5000/chat";

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ControllerEvent>) -> ControllerEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for controller event")
            .expect("event stream closed")
    }

    async fn wait_for_state(controller: &ConnectionController, want: ConnectionState) {
        let mut rx = controller.watch_state();
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| *s == want))
            .await
            .expect("timed out waiting for state")
            .unwrap();
    }

    async fn connected() -> (
        ConnectionController,
        Arc<FakeTransport>,
        mpsc::UnboundedReceiver<ControllerEvent>,
    ) {
        let transport = FakeTransport::new();
        let (controller, mut events) = ConnectionController::new(transport.clone());
        controller.connect(ENDPOINT).await;
        transport.emit(TransportEvent::Opened);
        assert_eq!(
            next_event(&mut events).await,
            ControllerEvent::Lifecycle(LifecycleEvent::Opened)
        );
        assert_eq!(controller.state(), ConnectionState::Connected);
        (controller, transport, events)
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let transport = FakeTransport::new();
        let (controller, _events) = ConnectionController::new(transport.clone());
        controller.connect(ENDPOINT).await;
        controller.connect(ENDPOINT).await;
        assert_eq!(controller.state(), ConnectionState::Connecting);
        assert_eq!(transport.calls(), vec![Call::Start(ENDPOINT.to_string())]);
    }

    #[tokio::test]
    async fn malformed_endpoint_fails_to_open() {
        let transport = FakeTransport::new();
        let (controller, mut events) = ConnectionController::new(transport.clone());
        controller.connect("not a url").await;
        assert!(matches!(
            next_event(&mut events).await,
            ControllerEvent::Lifecycle(LifecycleEvent::FailedToOpen(_))
        ));
        assert!(matches!(controller.state(), ConnectionState::FailedToOpen(_)));
        assert!(!transport.started());

        controller.connect(ENDPOINT).await;
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn unsupported_scheme_is_malformed() {
        let (controller, _events) = ConnectionController::new(FakeTransport::new());
        controller.connect("ftp://example.com/chat").await;
        wait_for_state(
            &controller,
            ConnectionState::FailedToOpen(
                "Protocol error: Invalid hub endpoint 'ftp://example.com/chat': expected an http(s) or ws(s) URL"
                    .into(),
            ),
        )
        .await;
    }

    #[tokio::test]
    async fn operations_require_connected() {
        let transport = FakeTransport::new();
        let (controller, _events) = ConnectionController::new(transport.clone());
        controller.connect(ENDPOINT).await;

        let msg = Message::new("A", "hi");
        assert_eq!(controller.send("Broadcast", &msg).await, Err(SendError::NotConnected));
        assert_eq!(
            controller.invoke("DadJoke", vec![]).await,
            Err(InvokeError::NotConnected)
        );
        assert_eq!(
            controller.open_stream("CountDown", vec![json!(5)]).await,
            Err(StreamError::NotConnected)
        );
        assert_eq!(controller.active_stream(), None);
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn send_forwards_payload_without_local_effects() {
        let (controller, transport, mut events) = connected().await;
        controller
            .send("Broadcast", &Message::new("A", "hi"))
            .await
            .unwrap();
        assert_eq!(
            transport.calls()[1],
            Call::Send {
                method: "Broadcast".into(),
                arguments: vec![json!({"name": "A", "text": "hi"})],
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_failure_is_returned() {
        let (controller, transport, _events) = connected().await;
        transport.next_send(Err(TransportError::WebSocket("broken pipe".into())));
        assert_eq!(
            controller.send("Broadcast", &Message::new("A", "hi")).await,
            Err(SendError::Transport(TransportError::WebSocket(
                "broken pipe".into()
            )))
        );
    }

    #[tokio::test]
    async fn invoke_returns_reply() {
        let (controller, transport, _events) = connected().await;
        transport.next_invoke(Ok(json!("a joke")));
        assert_eq!(controller.invoke("DadJoke", vec![]).await, Ok(json!("a joke")));
    }

    #[tokio::test]
    async fn reconnecting_rejects_operations_then_recovers() {
        let (controller, transport, mut events) = connected().await;
        transport.emit(TransportEvent::WillReconnect(TransportError::ConnectionLost(
            "reset".into(),
        )));
        assert!(matches!(
            next_event(&mut events).await,
            ControllerEvent::Lifecycle(LifecycleEvent::WillReconnect(_))
        ));
        assert_eq!(controller.state(), ConnectionState::Reconnecting);
        assert_eq!(
            controller.invoke("DadJoke", vec![]).await,
            Err(InvokeError::NotConnected)
        );

        transport.emit(TransportEvent::Reconnected);
        assert_eq!(
            next_event(&mut events).await,
            ControllerEvent::Lifecycle(LifecycleEvent::Reconnected)
        );
        assert!(controller.invoke("DadJoke", vec![]).await.is_ok());
    }

    #[tokio::test]
    async fn out_of_order_lifecycle_is_dropped() {
        let (controller, transport, mut events) = connected().await;
        transport.emit(TransportEvent::Reconnected);
        transport.emit(TransportEvent::Closed(Some(TransportError::Closed)));
        assert_eq!(
            next_event(&mut events).await,
            ControllerEvent::Lifecycle(LifecycleEvent::Closed(Some(TransportError::Closed)))
        );
        assert_eq!(
            controller.state(),
            ConnectionState::ClosedWithError("Transport closed".into())
        );

        transport.emit(TransportEvent::Opened);
        transport.emit(TransportEvent::Reconnected);
        tokio::task::yield_now().await;
        assert!(controller.state().is_terminal());
    }

    #[tokio::test]
    async fn close_ends_in_closed_with_error() {
        let (controller, transport, mut events) = connected().await;
        controller.close().await;
        assert_eq!(
            next_event(&mut events).await,
            ControllerEvent::Lifecycle(LifecycleEvent::Closed(None))
        );
        assert_eq!(
            controller.state(),
            ConnectionState::ClosedWithError("connection closed".into())
        );
        assert_eq!(transport.calls().last(), Some(&Call::Stop));
    }

    #[tokio::test]
    async fn second_stream_is_rejected() {
        let (controller, _transport, _events) = connected().await;
        let first = controller
            .open_stream("CountDown", vec![json!(5)])
            .await
            .unwrap();
        assert_eq!(
            controller.open_stream("CountDown", vec![json!(5)]).await,
            Err(StreamError::StreamAlreadyActive)
        );
        assert_eq!(controller.active_stream(), Some(first));
    }

    #[tokio::test]
    async fn stream_items_then_completion_free_the_slot() {
        let (controller, transport, mut events) = connected().await;
        let handle = controller
            .open_stream("CountDown", vec![json!(2)])
            .await
            .unwrap();
        let id = handle.invocation_id().to_string();

        for n in 1..=2 {
            transport.emit(TransportEvent::StreamItem {
                invocation_id: id.clone(),
                item: json!(n),
            });
        }
        transport.emit(TransportEvent::StreamCompleted {
            invocation_id: id.clone(),
            error: None,
        });

        for n in 1..=2 {
            assert_eq!(
                next_event(&mut events).await,
                ControllerEvent::StreamItem {
                    handle: handle.clone(),
                    item: json!(n)
                }
            );
        }
        assert_eq!(
            next_event(&mut events).await,
            ControllerEvent::StreamCompleted {
                handle: handle.clone(),
                error: None
            }
        );
        assert_eq!(controller.active_stream(), None);
        assert!(controller.open_stream("CountDown", vec![json!(2)]).await.is_ok());
    }

    #[tokio::test]
    async fn failed_stream_start_releases_slot() {
        let (controller, transport, _events) = connected().await;
        transport.next_stream(Err(TransportError::WebSocket("gone".into())));
        assert_eq!(
            controller.open_stream("CountDown", vec![json!(5)]).await,
            Err(StreamError::Transport(TransportError::WebSocket("gone".into())))
        );
        assert_eq!(controller.active_stream(), None);
    }

    #[tokio::test]
    async fn stale_cancel_is_rejected() {
        let (controller, transport, mut events) = connected().await;
        let old = controller.open_stream("CountDown", vec![]).await.unwrap();
        transport.emit(TransportEvent::StreamCompleted {
            invocation_id: old.invocation_id().to_string(),
            error: None,
        });
        next_event(&mut events).await;

        let current = controller.open_stream("CountDown", vec![]).await.unwrap();
        assert_eq!(controller.cancel_stream(&old).await, Err(CancelError::NoSuchStream));
        assert_eq!(controller.active_stream(), Some(current));
    }

    #[tokio::test]
    async fn late_items_after_cancel_are_ignored() {
        let (controller, transport, mut events) = connected().await;
        let handle = controller.open_stream("CountDown", vec![]).await.unwrap();
        // a failed cancel request still frees the slot
        transport.next_cancel(Err(TransportError::NotConnected));
        controller.cancel_stream(&handle).await.unwrap();
        assert_eq!(controller.active_stream(), None);
        assert!(transport
            .calls()
            .contains(&Call::Cancel(handle.invocation_id().to_string())));

        transport.emit(TransportEvent::StreamItem {
            invocation_id: handle.invocation_id().to_string(),
            item: json!(3),
        });
        transport.emit(TransportEvent::StreamCompleted {
            invocation_id: handle.invocation_id().to_string(),
            error: None,
        });
        transport.emit(TransportEvent::WillReconnect(TransportError::Closed));
        assert!(matches!(
            next_event(&mut events).await,
            ControllerEvent::Lifecycle(LifecycleEvent::WillReconnect(_))
        ));
    }

    #[tokio::test]
    async fn sink_and_push_handlers_share_arrival_order() {
        let transport = FakeTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let sink_tx = tx.clone();
        let controller = ConnectionController::with_sink(
            transport.clone(),
            Arc::new(move |event: ControllerEvent| {
                let label = match event {
                    ControllerEvent::Lifecycle(e) => format!("{e:?}"),
                    ControllerEvent::StreamItem { item, .. } => format!("item {item}"),
                    ControllerEvent::StreamCompleted { .. } => "completed".to_string(),
                };
                let _ = sink_tx.send(label);
            }),
        );
        controller.on("NewMessage", move |args| {
            let _ = tx.send(format!("push {}", args[0]["text"]));
        });
        controller.connect(ENDPOINT).await;
        transport.emit(TransportEvent::Opened);
        wait_for_state(&controller, ConnectionState::Connected).await;
        let handle = controller.open_stream("CountDown", vec![]).await.unwrap();
        let id = handle.invocation_id().to_string();

        transport.emit(TransportEvent::StreamItem {
            invocation_id: id.clone(),
            item: json!(1),
        });
        transport.emit(TransportEvent::Invocation {
            target: "NewMessage".into(),
            arguments: vec![json!({"name": "B", "text": "after"})],
        });
        transport.emit(TransportEvent::StreamCompleted {
            invocation_id: id,
            error: None,
        });

        let mut seen = Vec::new();
        for _ in 0..4 {
            let label = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(label);
        }
        assert_eq!(
            seen,
            vec!["Opened", "item 1", "push \"after\"", "completed"]
        );
    }

    #[tokio::test]
    async fn last_push_handler_wins() {
        let (controller, transport, mut events) = connected().await;
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        controller.on("NewMessage", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = second.clone();
        controller.on("NewMessage", move |args| {
            assert_eq!(args[0]["text"], "hi");
            counter.fetch_add(1, Ordering::SeqCst);
        });

        transport.emit(TransportEvent::Invocation {
            target: "NewMessage".into(),
            arguments: vec![json!({"name": "A", "text": "hi"})],
        });
        transport.emit(TransportEvent::Invocation {
            target: "Unhandled".into(),
            arguments: vec![],
        });
        // push handlers run before later events are emitted
        transport.emit(TransportEvent::WillReconnect(TransportError::Closed));
        next_event(&mut events).await;

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
