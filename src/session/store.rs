//! Ordered, append-only chat log with persistence and snapshot publishing.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::connection::ConnectionController;
use crate::error::SendError;
use crate::message::Message;
use crate::storage::MessageStore;

/// Immutable snapshot of the full log.
pub type ChatLog = Arc<[Message]>;

/// Hub method used to publish a chat line to every client.
pub const BROADCAST_METHOD: &str = "Broadcast";

const SNAPSHOT_BUFFER: usize = 64;

/// Owner of the chat log. Lives inside the session's delivery loop.
pub struct ChatSessionStore {
    log: Vec<Message>,
    storage: Arc<dyn MessageStore>,
    feed: LogFeed,
    latest: watch::Sender<ChatLog>,
}

impl ChatSessionStore {
    pub fn new(storage: Arc<dyn MessageStore>) -> Self {
        let (latest, latest_rx) = watch::channel::<ChatLog>(Arc::from(Vec::new()));
        let (snapshots, _) = broadcast::channel(SNAPSHOT_BUFFER);
        Self {
            log: Vec::new(),
            storage,
            feed: LogFeed {
                snapshots,
                latest: latest_rx,
            },
            latest,
        }
    }

    /// Load what the store persisted and place it ahead of anything already
    /// in the log.
    pub async fn load_persisted(&mut self) -> ChatLog {
        match self.storage.load_all().await {
            Ok(persisted) => {
                debug!(count = persisted.len(), "Loaded persisted messages");
                let live = std::mem::replace(&mut self.log, persisted);
                self.log.extend(live);
            }
            Err(e) => warn!("Failed to load persisted messages: {e}"),
        }
        self.publish()
    }

    /// Append a message that arrived from the hub.
    pub async fn append_received(&mut self, message: Message) -> ChatLog {
        self.append(message).await
    }

    /// Append a message produced on this client (command output, fallbacks).
    pub async fn append_local(&mut self, message: Message) -> ChatLog {
        self.append(message).await
    }

    /// Broadcast `message` through the hub. The log is left alone; the
    /// message shows up once the server echoes it back.
    pub fn request_send(
        &self,
        controller: &ConnectionController,
        message: Message,
    ) -> impl Future<Output = Result<(), SendError>> + Send + 'static {
        let controller = controller.clone();
        async move { controller.send(BROADCAST_METHOD, &message).await }
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> ChatLog {
        self.latest.borrow().clone()
    }

    pub fn subscribe(&self) -> LogSubscription {
        self.feed.subscribe()
    }

    /// A handle that can create subscriptions from outside the delivery loop.
    pub fn feed(&self) -> LogFeed {
        self.feed.clone()
    }

    async fn append(&mut self, message: Message) -> ChatLog {
        if let Err(e) = self.storage.save(&message).await {
            warn!("Failed to persist message: {e}");
        }
        self.log.push(message);
        self.publish()
    }

    fn publish(&self) -> ChatLog {
        let snapshot: ChatLog = Arc::from(self.log.as_slice());
        self.latest.send_replace(snapshot.clone());
        // no subscribers is fine
        let _ = self.feed.snapshots.send(snapshot.clone());
        snapshot
    }
}

/// Subscription factory for the log snapshot sequence.
#[derive(Clone)]
pub struct LogFeed {
    snapshots: broadcast::Sender<ChatLog>,
    latest: watch::Receiver<ChatLog>,
}

impl LogFeed {
    pub fn subscribe(&self) -> LogSubscription {
        // Subscribe before reading the current snapshot so nothing published
        // in between is lost. Such a snapshot then also arrives as an update;
        // `LogSubscription::next` drops that repeat.
        let updates = self.snapshots.subscribe();
        LogSubscription::new(self.latest.borrow().clone(), updates, self.latest.clone())
    }
}

/// The current snapshot followed by every later one, in order.
pub struct LogSubscription {
    initial: Option<ChatLog>,
    /// Last snapshot handed out; the same snapshot is never yielded twice.
    last: Option<ChatLog>,
    updates: broadcast::Receiver<ChatLog>,
    latest: watch::Receiver<ChatLog>,
}

impl LogSubscription {
    fn new(
        initial: ChatLog,
        updates: broadcast::Receiver<ChatLog>,
        latest: watch::Receiver<ChatLog>,
    ) -> Self {
        Self {
            initial: Some(initial),
            last: None,
            updates,
            latest,
        }
    }

    /// Next snapshot, or `None` once the store is gone. A subscriber that
    /// fell behind skips straight to the latest snapshot.
    pub async fn next(&mut self) -> Option<ChatLog> {
        if let Some(initial) = self.initial.take() {
            self.last = Some(initial.clone());
            return Some(initial);
        }
        loop {
            let snapshot = match self.updates.recv().await {
                Ok(snapshot) => snapshot,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Log subscriber lagged, resynchronizing");
                    self.updates = self.updates.resubscribe();
                    self.latest.borrow().clone()
                }
                Err(RecvError::Closed) => return None,
            };
            if self
                .last
                .as_ref()
                .is_some_and(|last| Arc::ptr_eq(last, &snapshot))
            {
                continue;
            }
            self.last = Some(snapshot.clone());
            return Some(snapshot);
        }
    }
}
