//! Message persistence.
//!
//! The chat log is saved one message at a time as it is appended and loaded
//! once at session start. [`JsonlStore`] keeps an append-only `.jsonl` file
//! where each line is keyed by the millisecond timestamp of its save:
//!
//! ```text
//! {"key":"1718000000123","name":"Kim","text":"hello"}
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::warn;

use crate::message::Message;

/// Persistence failures. Callers log these; they never reach the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    Io(String),
    Encode(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "Storage I/O error: {e}"),
            StorageError::Encode(e) => write!(f, "Storage encode error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Durable storage for the chat log.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    async fn save(&self, message: &Message) -> Result<(), StorageError>;

    /// Every saved message, oldest first.
    async fn load_all(&self) -> Result<Vec<Message>, StorageError>;
}

/// Process-lifetime store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: Mutex<Vec<Message>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            messages: Mutex::new(messages),
        }
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn save(&self, message: &Message) -> Result<(), StorageError> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Message>, StorageError> {
        Ok(self
            .messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

#[derive(Serialize, Deserialize)]
struct Record {
    key: String,
    name: String,
    text: String,
}

/// Append-only JSON-lines file.
#[derive(Debug, Clone)]
pub struct JsonlStore {
    path: PathBuf,
}

impl JsonlStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

#[async_trait]
impl MessageStore for JsonlStore {
    async fn save(&self, message: &Message) -> Result<(), StorageError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| StorageError::Io(format!("create {}: {e}", dir.display())))?;
        }

        let record = Record {
            key: now_millis().to_string(),
            name: message.name.clone(),
            text: message.text.clone(),
        };
        let mut line =
            serde_json::to_string(&record).map_err(|e| StorageError::Encode(e.to_string()))?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| StorageError::Io(format!("open {}: {e}", self.path.display())))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| StorageError::Io(e.to_string()))
    }

    async fn load_all(&self) -> Result<Vec<Message>, StorageError> {
        let file = match fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StorageError::Io(format!(
                    "open {}: {e}",
                    self.path.display()
                )))
            }
        };

        let mut lines = BufReader::new(file).lines();
        let mut records = Vec::new();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Record>(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping corrupt message line: {e}"),
            }
        }

        // Stable: equal keys keep file order.
        records.sort_by_key(|r| r.key.parse::<u128>().unwrap_or(u128::MAX));
        Ok(records
            .into_iter()
            .map(|r| Message::new(r.name, r.text))
            .collect())
    }
}
