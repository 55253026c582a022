//! Chat message value type.
//!
//! A [`Message`] carries no server-assigned id. Identity is structural over
//! `name` and `text`, so two messages with the same content are
//! indistinguishable once they are in the log.

use serde::{Deserialize, Serialize};

/// A single chat line: who said it and what they said.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message {
    pub name: String,
    pub text: String,
}

impl Message {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.text)
    }
}
