//! SignalR JSON hub client over WebSocket with auto-reconnect.
//!
//! [`SignalRTransport`] owns one background task per started connection. The
//! task negotiates (unless disabled), opens the WebSocket, performs the JSON
//! protocol handshake, and then runs the I/O loop: incoming records are
//! dispatched to pending invocations or reported as [`TransportEvent`]s,
//! outgoing frames are written in the order they were queued, and a ping is
//! sent every keep-alive interval.
//!
//! When an open connection drops, every in-flight invocation fails with
//! `ConnectionLost`, every open stream is completed with that error, and the
//! task walks the configured reconnect delays. The first successful attempt
//! reports `Reconnected`; running out of delays reports `Closed(Some(_))`. A
//! failed *first* open is reported as `FailedToOpen` and is never retried.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{self, HubMessage};
use super::{HubTransport, TransportEvent, TransportEvents};
use crate::error::TransportError;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Connection tuning for [`SignalRTransport`].
#[derive(Debug, Clone)]
pub struct SignalROptions {
    /// Connect the WebSocket directly instead of POSTing `/negotiate` first.
    pub skip_negotiation: bool,
    /// Reconnect after an unexpected drop.
    pub auto_reconnect: bool,
    /// Delay before each reconnect attempt. One attempt per entry.
    pub reconnect_delays: Vec<Duration>,
    /// Interval between client pings.
    pub keep_alive_interval: Duration,
    /// Silence from the server longer than this counts as a lost connection.
    pub server_timeout: Duration,
    /// Maximum wait for the handshake response.
    pub handshake_timeout: Duration,
}

impl Default for SignalROptions {
    fn default() -> Self {
        Self {
            skip_negotiation: false,
            auto_reconnect: true,
            reconnect_delays: [0, 2, 10, 30].into_iter().map(Duration::from_secs).collect(),
            keep_alive_interval: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(15),
        }
    }
}

/// A frame queued for the I/O loop plus the channel that learns whether it
/// reached the socket.
struct Outbound {
    frame: String,
    written: oneshot::Sender<Result<(), TransportError>>,
}

/// State shared between the public handle and the connection task.
struct Shared {
    /// Present only while a WebSocket is open.
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    /// Invocations waiting for a Completion, keyed by invocation id.
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Value, TransportError>>>>,
    /// Invocation ids of open server-push streams.
    streams: Mutex<HashSet<String>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

/// SignalR JSON protocol client.
pub struct SignalRTransport {
    options: SignalROptions,
    http: reqwest::Client,
    shared: Arc<Shared>,
}

impl SignalRTransport {
    pub fn new(options: SignalROptions) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TransportError::Negotiate(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            options,
            http,
            shared: Arc::new(Shared {
                outbound: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                streams: Mutex::new(HashSet::new()),
                next_id: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    fn next_invocation_id(&self) -> String {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Queue a frame and wait until the I/O loop has written it.
    async fn enqueue(&self, frame: String) -> Result<(), TransportError> {
        let sender = self
            .shared
            .outbound
            .lock()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)?;
        let (written, result) = oneshot::channel();
        sender
            .send(Outbound { frame, written })
            .await
            .map_err(|_| TransportError::NotConnected)?;
        result.await.unwrap_or_else(|_| {
            Err(TransportError::ConnectionLost(
                "connection dropped before the frame was written".to_string(),
            ))
        })
    }
}

#[async_trait]
impl HubTransport for SignalRTransport {
    async fn start(&self, endpoint: Url, events: TransportEvents) {
        tokio::spawn(connection_loop(
            Arc::clone(&self.shared),
            self.options.clone(),
            self.http.clone(),
            endpoint,
            events,
        ));
    }

    async fn send(&self, method: &str, arguments: Vec<Value>) -> Result<(), TransportError> {
        self.enqueue(protocol::encode_invocation(None, method, &arguments))
            .await
    }

    async fn invoke(&self, method: &str, arguments: Vec<Value>) -> Result<Value, TransportError> {
        let id = self.next_invocation_id();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id.clone(), tx);

        if let Err(e) = self
            .enqueue(protocol::encode_invocation(Some(&id), method, &arguments))
            .await
        {
            self.shared.pending.lock().await.remove(&id);
            return Err(e);
        }

        rx.await.unwrap_or_else(|_| {
            Err(TransportError::ConnectionLost(
                "invocation abandoned".to_string(),
            ))
        })
    }

    async fn stream(
        &self,
        invocation_id: &str,
        method: &str,
        arguments: Vec<Value>,
    ) -> Result<(), TransportError> {
        self.shared
            .streams
            .lock()
            .await
            .insert(invocation_id.to_string());

        let frame = protocol::encode_stream_invocation(invocation_id, method, &arguments);
        if let Err(e) = self.enqueue(frame).await {
            self.shared.streams.lock().await.remove(invocation_id);
            return Err(e);
        }
        Ok(())
    }

    async fn cancel_stream(&self, invocation_id: &str) -> Result<(), TransportError> {
        self.shared.streams.lock().await.remove(invocation_id);
        self.enqueue(protocol::encode_cancel_invocation(invocation_id))
            .await
    }

    async fn stop(&self) {
        self.shared.shutdown.cancel();
    }
}

/// Why an open connection's I/O loop ended.
enum Disconnect {
    /// `stop()` was called.
    Stopped,
    /// The server sent a Close record.
    ServerClosed {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Socket error, EOF, or server timeout.
    Lost(TransportError),
}

/// Outcome of the reconnect loop.
enum Reconnect {
    Connected(Box<WsStream>, Vec<String>),
    Stopped,
    Exhausted,
}

/// Connection task: open, run, reconnect, until stopped or out of attempts.
async fn connection_loop(
    shared: Arc<Shared>,
    options: SignalROptions,
    http: reqwest::Client,
    endpoint: Url,
    events: TransportEvents,
) {
    info!("Hub: connecting to {endpoint}");
    let opened = tokio::select! {
        () = shared.shutdown.cancelled() => {
            let _ = events.send(TransportEvent::Closed(None));
            return;
        }
        result = open_connection(&http, &options, &endpoint) => result,
    };

    let (mut ws, mut leftover) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            warn!("Hub: failed to open connection: {e}");
            let _ = events.send(TransportEvent::FailedToOpen(e));
            return;
        }
    };
    info!("Hub: connected");
    let _ = events.send(TransportEvent::Opened);

    loop {
        let (out_tx, out_rx) = mpsc::channel::<Outbound>(256);
        *shared.outbound.lock().await = Some(out_tx);
        let reason = run_io(ws, leftover, out_rx, &shared, &events, &options).await;
        *shared.outbound.lock().await = None;

        let (error, may_reconnect) = match reason {
            Disconnect::Stopped
            | Disconnect::ServerClosed {
                error: None,
                ..
            } => {
                fail_in_flight(&shared, &events, &TransportError::Closed).await;
                info!("Hub: connection closed");
                let _ = events.send(TransportEvent::Closed(None));
                return;
            }
            Disconnect::ServerClosed {
                error: Some(e),
                allow_reconnect,
            } => (TransportError::Hub(e), allow_reconnect),
            Disconnect::Lost(e) => (e, true),
        };

        fail_in_flight(
            &shared,
            &events,
            &TransportError::ConnectionLost(error.to_string()),
        )
        .await;

        if !(options.auto_reconnect && may_reconnect) {
            warn!("Hub: connection closed with error: {error}");
            let _ = events.send(TransportEvent::Closed(Some(error)));
            return;
        }

        warn!("Hub: connection lost ({error}), reconnecting...");
        let _ = events.send(TransportEvent::WillReconnect(error.clone()));

        match reconnect_loop(&shared, &options, &http, &endpoint).await {
            Reconnect::Connected(new_ws, new_leftover) => {
                ws = *new_ws;
                leftover = new_leftover;
                info!("Hub: reconnected");
                let _ = events.send(TransportEvent::Reconnected);
            }
            Reconnect::Stopped => {
                info!("Hub: stopped while reconnecting");
                let _ = events.send(TransportEvent::Closed(None));
                return;
            }
            Reconnect::Exhausted => {
                warn!(
                    "Hub: giving up after {} reconnect attempts",
                    options.reconnect_delays.len()
                );
                let _ = events.send(TransportEvent::Closed(Some(error)));
                return;
            }
        }
    }
}

/// I/O loop for one open WebSocket.
async fn run_io(
    ws: WsStream,
    leftover: Vec<String>,
    mut out_rx: mpsc::Receiver<Outbound>,
    shared: &Shared,
    events: &TransportEvents,
    options: &SignalROptions,
) -> Disconnect {
    let (mut ws_sink, mut ws_reader) = ws.split();

    if let Some(reason) = process_records(leftover.iter().map(String::as_str), shared, events).await
    {
        return reason;
    }

    let mut keep_alive = tokio::time::interval(options.keep_alive_interval);
    keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; the handshake already proved liveness.
    keep_alive.tick().await;
    let mut last_received = Instant::now();

    loop {
        let deadline = last_received + options.server_timeout;
        tokio::select! {
            () = shared.shutdown.cancelled() => {
                let _ = ws_sink.send(WsMessage::Text(protocol::encode_close().into())).await;
                let _ = ws_sink.close().await;
                return Disconnect::Stopped;
            }
            msg = ws_reader.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        last_received = Instant::now();
                        if let Some(reason) =
                            process_records(protocol::split_records(&text), shared, events).await
                        {
                            return reason;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        return Disconnect::Lost(TransportError::ConnectionLost(
                            "WebSocket closed".to_string(),
                        ));
                    }
                    Some(Err(e)) => {
                        return Disconnect::Lost(TransportError::WebSocket(e.to_string()));
                    }
                    Some(Ok(_)) => {
                        // Binary/Ping/Pong still prove the peer is alive
                        last_received = Instant::now();
                    }
                }
            }
            outbound = out_rx.recv() => {
                let Some(Outbound { frame, written }) = outbound else {
                    return Disconnect::Stopped;
                };
                let result = ws_sink
                    .send(WsMessage::Text(frame.into()))
                    .await
                    .map_err(|e| TransportError::WebSocket(e.to_string()));
                let failure = result.clone().err();
                let _ = written.send(result);
                if let Some(e) = failure {
                    return Disconnect::Lost(e);
                }
            }
            _ = keep_alive.tick() => {
                if let Err(e) = ws_sink.send(WsMessage::Text(protocol::encode_ping().into())).await {
                    return Disconnect::Lost(TransportError::WebSocket(e.to_string()));
                }
            }
            () = tokio::time::sleep_until(deadline) => {
                return Disconnect::Lost(TransportError::ConnectionLost(format!(
                    "no message from server within {}s",
                    options.server_timeout.as_secs()
                )));
            }
        }
    }
}

/// Decode and dispatch records. Returns a disconnect reason on a Close record.
async fn process_records<'a>(
    records: impl Iterator<Item = &'a str>,
    shared: &Shared,
    events: &TransportEvents,
) -> Option<Disconnect> {
    for record in records {
        match protocol::parse_message(record) {
            Ok(HubMessage::Close {
                error,
                allow_reconnect,
            }) => {
                return Some(Disconnect::ServerClosed {
                    error,
                    allow_reconnect,
                });
            }
            Ok(message) => dispatch_message(message, shared, events).await,
            Err(e) => warn!("Hub: dropping malformed record: {e}"),
        }
    }
    None
}

/// Route one server record to its pending invocation or the event channel.
async fn dispatch_message(message: HubMessage, shared: &Shared, events: &TransportEvents) {
    match message {
        HubMessage::Invocation {
            invocation_id,
            target,
            arguments,
        } => {
            if invocation_id.is_some() {
                debug!(method = %target, "Hub: server asked for a client result; not supported");
            }
            let _ = events.send(TransportEvent::Invocation { target, arguments });
        }
        HubMessage::StreamItem {
            invocation_id,
            item,
        } => {
            if shared.streams.lock().await.contains(&invocation_id) {
                let _ = events.send(TransportEvent::StreamItem {
                    invocation_id,
                    item,
                });
            } else {
                debug!(invocation_id = %invocation_id, "Hub: item for unknown stream dropped");
            }
        }
        HubMessage::Completion {
            invocation_id,
            result,
            error,
        } => {
            let waiter = shared.pending.lock().await.remove(&invocation_id);
            if let Some(tx) = waiter {
                let outcome = match error {
                    Some(e) => Err(TransportError::Hub(e)),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(outcome);
            } else if shared.streams.lock().await.remove(&invocation_id) {
                let _ = events.send(TransportEvent::StreamCompleted {
                    invocation_id,
                    error: error.map(TransportError::Hub),
                });
            } else {
                debug!(invocation_id = %invocation_id, "Hub: completion for unknown invocation dropped");
            }
        }
        HubMessage::Ping | HubMessage::Close { .. } => {}
        HubMessage::Other(msg_type) => {
            debug!(msg_type, "Hub: ignoring message");
        }
    }
}

/// Fail every pending invocation and complete every open stream with `error`.
async fn fail_in_flight(shared: &Shared, events: &TransportEvents, error: &TransportError) {
    let pending: Vec<_> = shared.pending.lock().await.drain().collect();
    for (_, tx) in pending {
        let _ = tx.send(Err(error.clone()));
    }
    let streams: Vec<_> = shared.streams.lock().await.drain().collect();
    for invocation_id in streams {
        let _ = events.send(TransportEvent::StreamCompleted {
            invocation_id,
            error: Some(error.clone()),
        });
    }
}

/// Walk the reconnect delays until an attempt succeeds or the delays run out.
async fn reconnect_loop(
    shared: &Shared,
    options: &SignalROptions,
    http: &reqwest::Client,
    endpoint: &Url,
) -> Reconnect {
    for (attempt, delay) in options.reconnect_delays.iter().enumerate() {
        tokio::select! {
            () = shared.shutdown.cancelled() => return Reconnect::Stopped,
            () = tokio::time::sleep(*delay) => {}
        }

        let result = tokio::select! {
            () = shared.shutdown.cancelled() => return Reconnect::Stopped,
            result = open_connection(http, options, endpoint) => result,
        };
        match result {
            Ok((ws, leftover)) => return Reconnect::Connected(Box::new(ws), leftover),
            Err(e) => warn!("Hub: reconnect attempt {} failed: {e}", attempt + 1),
        }
    }
    Reconnect::Exhausted
}

/// Negotiate, connect, and handshake. Returns the socket plus any records the
/// server sent in the same frame as its handshake reply.
async fn open_connection(
    http: &reqwest::Client,
    options: &SignalROptions,
    endpoint: &Url,
) -> Result<(WsStream, Vec<String>), TransportError> {
    let token = if options.skip_negotiation {
        None
    } else {
        Some(negotiate(http, endpoint).await?)
    };
    let ws_url = build_ws_url(endpoint, token.as_deref())?;
    debug!("Hub: opening WebSocket {ws_url}");

    let (mut ws, _response) = tokio_tungstenite::connect_async(ws_url.as_str())
        .await
        .map_err(|e| TransportError::WebSocket(format!("WebSocket connect failed: {e}")))?;

    ws.send(WsMessage::Text(protocol::handshake_request().into()))
        .await
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;

    let leftover = tokio::time::timeout(options.handshake_timeout, read_handshake(&mut ws))
        .await
        .map_err(|_| {
            TransportError::Handshake("timed out waiting for handshake response".to_string())
        })??;
    Ok((ws, leftover))
}

async fn read_handshake(ws: &mut WsStream) -> Result<Vec<String>, TransportError> {
    while let Some(msg) = ws.next().await {
        match msg.map_err(|e| TransportError::WebSocket(e.to_string()))? {
            WsMessage::Text(text) => {
                let mut records = protocol::split_records(&text);
                let Some(first) = records.next() else {
                    continue;
                };
                protocol::parse_handshake_response(first)?;
                return Ok(records.map(ToString::to_string).collect());
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
    Err(TransportError::Handshake(
        "connection closed during handshake".to_string(),
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NegotiateResponse {
    connection_id: Option<String>,
    connection_token: Option<String>,
    error: Option<String>,
}

/// `POST <endpoint>/negotiate?negotiateVersion=1` and return the connection token.
async fn negotiate(http: &reqwest::Client, endpoint: &Url) -> Result<String, TransportError> {
    let url = negotiate_url(endpoint)?;
    debug!("Hub: negotiating at {url}");

    let resp = http
        .post(url)
        .send()
        .await
        .map_err(|e| TransportError::Negotiate(e.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(TransportError::Negotiate(format!(
            "HTTP {}",
            status.as_u16()
        )));
    }

    let body: NegotiateResponse = resp
        .json()
        .await
        .map_err(|e| TransportError::Negotiate(format!("invalid response: {e}")))?;
    if let Some(error) = body.error {
        return Err(TransportError::Negotiate(error));
    }
    body.connection_token
        .or(body.connection_id)
        .ok_or_else(|| TransportError::Negotiate("response carried no connection id".to_string()))
}

fn negotiate_url(endpoint: &Url) -> Result<Url, TransportError> {
    let mut url = endpoint.clone();
    let scheme = match url.scheme() {
        "http" | "ws" => "http",
        "https" | "wss" => "https",
        other => {
            return Err(TransportError::Negotiate(format!(
                "Invalid URL scheme: {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| TransportError::Negotiate(format!("Cannot use scheme {scheme}")))?;
    let path = format!("{}/negotiate", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut().append_pair("negotiateVersion", "1");
    Ok(url)
}

/// Map the hub endpoint to its WebSocket URL, attaching the connection token.
fn build_ws_url(endpoint: &Url, connection_token: Option<&str>) -> Result<Url, TransportError> {
    let mut url = endpoint.clone();
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::Protocol(format!(
                "Invalid URL scheme: {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| TransportError::Protocol(format!("Cannot use scheme {scheme}")))?;
    if let Some(token) = connection_token {
        url.query_pairs_mut().append_pair("id", token);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn ws_url_swaps_scheme() {
        assert_eq!(
            build_ws_url(&url("http://10.0.0.2:5000/chat"), None)
                .unwrap()
                .as_str(),
            "ws://10.0.0.2:5000/chat"
        );
        assert_eq!(
            build_ws_url(&url("https://hub.example.com/chat"), None)
                .unwrap()
                .as_str(),
            "wss://hub.example.com/chat"
        );
    }

    #[test]
    fn ws_url_appends_connection_token() {
        let ws = build_ws_url(&url("http://localhost:5000/chat"), Some("abc+/=")).unwrap();
        assert_eq!(ws.scheme(), "ws");
        let pairs: Vec<(String, String)> = ws.query_pairs().into_owned().collect();
        assert_eq!(pairs, vec![("id".to_string(), "abc+/=".to_string())]);
    }

    #[test]
    fn negotiate_url_is_http_with_version() {
        let n = negotiate_url(&url("ws://localhost:5000/chat/")).unwrap();
        assert_eq!(
            n.as_str(),
            "http://localhost:5000/chat/negotiate?negotiateVersion=1"
        );
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(build_ws_url(&url("ftp://example.com/chat"), None).is_err());
        assert!(negotiate_url(&url("ftp://example.com/chat")).is_err());
    }

    #[test]
    fn default_reconnect_policy_has_four_attempts() {
        let options = SignalROptions::default();
        assert_eq!(options.reconnect_delays.len(), 4);
        assert_eq!(options.reconnect_delays[0], Duration::ZERO);
    }

    #[tokio::test]
    async fn operations_before_open_report_not_connected() {
        let transport = SignalRTransport::new(SignalROptions::default()).unwrap();
        assert_eq!(
            transport.send("Broadcast", vec![]).await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(
            transport.invoke("DadJoke", vec![]).await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(
            transport.stream("s-1", "CountDown", vec![]).await,
            Err(TransportError::NotConnected)
        );
        assert!(transport.shared.pending.lock().await.is_empty());
        assert!(transport.shared.streams.lock().await.is_empty());
    }
}
