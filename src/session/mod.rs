//! Chat session: the single delivery context.
//!
//! [`ChatSession::start`] wires a [`ConnectionController`] to a
//! [`ChatSessionStore`] and a [`PresentationAdapter`] and runs one task that
//! owns both. Everything that can change what the user sees enters that task
//! through one inbox and is handled one event at a time:
//!
//! - controller events (lifecycle, stream items, stream completion),
//! - hub pushes (`NewMessage`, `MessageReceived`), forwarded by push handlers,
//! - user input, classified by [`commands::parse`],
//! - completions of network calls, which run in spawned tasks so the loop
//!   never waits on the hub.
//!
//! Controller events and pushes are written to the inbox from the
//! controller's event loop, so they keep the order the hub sent them in.
//!
//! Broadcast sends go through a dedicated worker so they reach the hub in the
//! order they were submitted.

pub mod commands;
pub mod store;

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionController, ControllerEvent, StreamHandle};
use crate::error::{CancelError, InvokeError, SendError, StreamError};
use crate::message::Message;
use crate::presentation::{Banner, PresentationAdapter, ViewState};
use crate::storage::MessageStore;
use crate::transport::HubTransport;

use self::commands::Command;
use self::store::{ChatSessionStore, LogFeed, LogSubscription};

/// Push of a [`Message`] object.
pub const NEW_MESSAGE: &str = "NewMessage";
/// Push of `(user, text)` strings.
pub const MESSAGE_RECEIVED: &str = "MessageReceived";
pub const DAD_JOKE: &str = "DadJoke";
pub const COUNT_DOWN: &str = "CountDown";

const DAD: &str = "Dad";
const DAD_FALLBACK: &str = "Dad is tired today";
const COUNTER: &str = "Counter";
const COUNT_FINISHED: &str = "Counting Finished!";

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub endpoint: String,
    /// Name attached to every line this client broadcasts.
    pub user_name: String,
}

enum SessionEvent {
    Controller(ControllerEvent),
    Input(String),
    Pushed(Message),
    SendFinished(Result<(), SendError>),
    JokeFinished(Result<Value, InvokeError>),
    CountStarted(Result<StreamHandle, StreamError>),
    CancelFinished(Result<(), CancelError>),
    Dismiss,
    Shutdown,
}

type SendJob = BoxFuture<'static, Result<(), SendError>>;

/// Handle to a running chat session.
pub struct ChatSession {
    controller: ConnectionController,
    inbox: mpsc::UnboundedSender<SessionEvent>,
    log: LogFeed,
    presentation: PresentationAdapter,
    task: JoinHandle<()>,
}

impl ChatSession {
    /// Load the persisted log, start the delivery loop, and begin connecting.
    pub async fn start(
        transport: Arc<dyn HubTransport>,
        storage: Arc<dyn MessageStore>,
        options: SessionOptions,
    ) -> Self {
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let sink = inbox.clone();
        let controller = ConnectionController::with_sink(
            transport,
            Arc::new(move |event: ControllerEvent| {
                let _ = sink.send(SessionEvent::Controller(event));
            }),
        );

        let mut store = ChatSessionStore::new(storage);
        let messages = store.load_persisted().await;
        let presentation = PresentationAdapter::new(messages, controller.state());
        let log = store.feed();

        register_push_handlers(&controller, &inbox);

        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        tokio::spawn(send_worker(outbox_rx, inbox.clone()));

        let delivery = Delivery {
            controller: controller.clone(),
            store,
            presentation: presentation.clone(),
            user_name: options.user_name,
            inbox: inbox.clone(),
            outbox,
            count: CountState::Idle,
        };
        let task = tokio::spawn(delivery.run(inbox_rx));

        controller.connect(&options.endpoint).await;

        Self {
            controller,
            inbox,
            log,
            presentation,
            task,
        }
    }

    /// Handle one line of user input: a slash command or a chat line.
    pub fn submit(&self, input: impl Into<String>) {
        self.deliver(SessionEvent::Input(input.into()));
    }

    /// Clear the banner.
    pub fn dismiss(&self) {
        self.deliver(SessionEvent::Dismiss);
    }

    pub fn subscribe_log(&self) -> LogSubscription {
        self.log.subscribe()
    }

    pub fn view(&self) -> watch::Receiver<ViewState> {
        self.presentation.subscribe()
    }

    pub fn signals(&self) -> broadcast::Receiver<Banner> {
        self.presentation.signals()
    }

    pub fn controller(&self) -> &ConnectionController {
        &self.controller
    }

    /// Close the connection and stop the delivery loop.
    pub async fn shutdown(self) {
        self.controller.close().await;
        self.deliver(SessionEvent::Shutdown);
        if let Err(e) = self.task.await {
            warn!("Session loop ended abnormally: {e}");
        }
    }

    fn deliver(&self, event: SessionEvent) {
        if self.inbox.send(event).is_err() {
            debug!("Session loop gone, event dropped");
        }
    }
}

fn register_push_handlers(
    controller: &ConnectionController,
    inbox: &mpsc::UnboundedSender<SessionEvent>,
) {
    let tx = inbox.clone();
    controller.on(NEW_MESSAGE, move |args| {
        if let Some(message) = parse_new_message(args) {
            let _ = tx.send(SessionEvent::Pushed(message));
        }
    });

    let tx = inbox.clone();
    controller.on(MESSAGE_RECEIVED, move |args| {
        if let Some(message) = parse_message_received(args) {
            let _ = tx.send(SessionEvent::Pushed(message));
        }
    });
}

fn parse_new_message(args: &[Value]) -> Option<Message> {
    let Some(payload) = args.first() else {
        warn!("{NEW_MESSAGE} push without arguments");
        return None;
    };
    match Message::deserialize(payload) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!("Malformed {NEW_MESSAGE} payload: {e}");
            None
        }
    }
}

fn parse_message_received(args: &[Value]) -> Option<Message> {
    match (
        args.first().and_then(Value::as_str),
        args.get(1).and_then(Value::as_str),
    ) {
        (Some(user), Some(text)) => Some(Message::new(user, text)),
        _ => {
            warn!("Malformed {MESSAGE_RECEIVED} arguments: {args:?}");
            None
        }
    }
}

/// Issues queued broadcasts one after another.
async fn send_worker(
    mut jobs: mpsc::UnboundedReceiver<SendJob>,
    inbox: mpsc::UnboundedSender<SessionEvent>,
) {
    while let Some(job) = jobs.recv().await {
        let result = job.await;
        if inbox.send(SessionEvent::SendFinished(result)).is_err() {
            break;
        }
    }
}

/// Where `/count` stands between the command and the stream start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CountState {
    Idle,
    /// `open_stream` is in flight.
    Starting,
    /// `open_stream` is in flight and `/cancel` arrived meanwhile.
    CancelOnStart,
}

/// State owned by the delivery loop.
struct Delivery {
    controller: ConnectionController,
    store: ChatSessionStore,
    presentation: PresentationAdapter,
    user_name: String,
    inbox: mpsc::UnboundedSender<SessionEvent>,
    outbox: mpsc::UnboundedSender<SendJob>,
    count: CountState,
}

impl Delivery {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = inbox.recv().await {
            if matches!(event, SessionEvent::Shutdown) {
                break;
            }
            self.handle(event).await;
        }
        debug!("Session loop finished");
    }

    async fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Controller(event) => self.on_controller_event(event).await,
            SessionEvent::Input(text) => self.on_input(&text),
            SessionEvent::Pushed(message) => {
                let log = self.store.append_received(message).await;
                self.presentation.set_messages(log);
            }
            SessionEvent::SendFinished(Ok(())) => self.presentation.send_succeeded(),
            SessionEvent::SendFinished(Err(e)) => {
                warn!("Send failed: {e}");
                self.presentation.send_failed();
            }
            SessionEvent::JokeFinished(result) => {
                let text = match result {
                    Ok(Value::String(joke)) => joke,
                    Ok(Value::Null) => DAD_FALLBACK.to_string(),
                    Ok(other) => other.to_string(),
                    Err(e) => {
                        warn!("{DAD_JOKE} failed: {e}");
                        DAD_FALLBACK.to_string()
                    }
                };
                self.append_local(Message::new(DAD, text)).await;
            }
            SessionEvent::CountStarted(Ok(handle)) => {
                debug!(stream = %handle, "Countdown started");
                if self.count == CountState::CancelOnStart {
                    self.cancel(handle);
                }
                self.count = CountState::Idle;
            }
            SessionEvent::CountStarted(Err(e)) => {
                warn!("Cannot start countdown: {e}");
                self.count = CountState::Idle;
            }
            SessionEvent::CancelFinished(Ok(())) => info!("Countdown cancelled"),
            SessionEvent::CancelFinished(Err(e)) => debug!("Countdown already over: {e}"),
            SessionEvent::Dismiss => self.presentation.dismiss(),
            SessionEvent::Shutdown => {}
        }
    }

    fn on_input(&mut self, input: &str) {
        let Some(command) = commands::parse(input) else {
            return;
        };
        match command {
            Command::Broadcast(text) => {
                let message = Message::new(self.user_name.clone(), text);
                let job = self.store.request_send(&self.controller, message).boxed();
                if self.outbox.send(job).is_err() {
                    warn!("Send worker gone, message dropped");
                }
            }
            Command::DadJoke => {
                let controller = self.controller.clone();
                self.spawn(async move {
                    SessionEvent::JokeFinished(controller.invoke(DAD_JOKE, Vec::new()).await)
                });
            }
            Command::Count(count) => {
                if self.count != CountState::Idle {
                    debug!("Countdown already starting");
                    return;
                }
                self.count = CountState::Starting;
                let controller = self.controller.clone();
                self.spawn(async move {
                    SessionEvent::CountStarted(
                        controller.open_stream(COUNT_DOWN, vec![json!(count)]).await,
                    )
                });
            }
            Command::Cancel => match (self.controller.active_stream(), self.count) {
                (Some(handle), _) => self.cancel(handle),
                (None, CountState::Starting) => {
                    debug!("Countdown still starting, cancelling once it runs");
                    self.count = CountState::CancelOnStart;
                }
                (None, _) => debug!("No countdown to cancel"),
            },
        }
    }

    fn cancel(&self, handle: StreamHandle) {
        let controller = self.controller.clone();
        self.spawn(async move {
            SessionEvent::CancelFinished(controller.cancel_stream(&handle).await)
        });
    }

    async fn on_controller_event(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::Lifecycle(event) => {
                self.presentation
                    .on_lifecycle(event, self.controller.state());
            }
            ControllerEvent::StreamItem { item, .. } => {
                self.append_local(Message::new(COUNTER, item_text(item))).await;
            }
            ControllerEvent::StreamCompleted { handle, error } => {
                if let Some(e) = error {
                    warn!(stream = %handle, "Countdown ended with error: {e}");
                }
                self.append_local(Message::new(COUNTER, COUNT_FINISHED)).await;
            }
        }
    }

    async fn append_local(&mut self, message: Message) {
        let log = self.store.append_local(message).await;
        self.presentation.set_messages(log);
    }

    /// Run a network call off-loop and feed its outcome back in.
    fn spawn<F>(&self, work: F)
    where
        F: Future<Output = SessionEvent> + Send + 'static,
    {
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let _ = inbox.send(work.await);
        });
    }
}

fn item_text(item: Value) -> String {
    match item {
        Value::String(text) => text,
        other => other.to_string(),
    }
}
