//! Single-slot registry for the one server-push stream a controller may hold.

use std::fmt;

use crate::error::{CancelError, StreamError};

/// Opaque token for one stream invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamHandle {
    invocation_id: String,
}

impl StreamHandle {
    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.invocation_id)
    }
}

/// Holds at most one active [`StreamHandle`].
///
/// Handles are never reused: each reservation gets a fresh invocation id, so a
/// handle kept around after its stream ended can never match a later one.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    active: Option<StreamHandle>,
    issued: u64,
}

impl StreamRegistry {
    /// Claim the slot for a new stream.
    pub fn reserve(&mut self) -> Result<StreamHandle, StreamError> {
        if self.active.is_some() {
            return Err(StreamError::StreamAlreadyActive);
        }
        self.issued += 1;
        let handle = StreamHandle {
            invocation_id: format!("stream-{}", self.issued),
        };
        self.active = Some(handle.clone());
        Ok(handle)
    }

    pub fn active(&self) -> Option<&StreamHandle> {
        self.active.as_ref()
    }

    /// The active handle, if its invocation id is `invocation_id`.
    pub fn matching(&self, invocation_id: &str) -> Option<&StreamHandle> {
        self.active
            .as_ref()
            .filter(|h| h.invocation_id == invocation_id)
    }

    /// Clear the slot for a cancellation. Fails if `handle` is not the
    /// active one.
    pub fn release(&mut self, handle: &StreamHandle) -> Result<(), CancelError> {
        if self.active.as_ref() != Some(handle) {
            return Err(CancelError::NoSuchStream);
        }
        self.active = None;
        Ok(())
    }

    /// Clear the slot because the stream `invocation_id` completed. Returns
    /// the handle it held, or `None` if that stream is no longer active.
    pub fn complete(&mut self, invocation_id: &str) -> Option<StreamHandle> {
        self.matching(invocation_id)?;
        self.active.take()
    }
}
