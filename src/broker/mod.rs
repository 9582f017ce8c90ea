//! Durable, transactional conversation queue.
//!
//! The consumer only sees [`QueueClient`] and [`ReceiveTransaction`]; the
//! sled-backed [`SledQueue`] is the facility this binary ships with.

mod error;
mod sled_queue;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use error::QueueError;
#[cfg(test)]
pub use sled_queue::ConversationState;
pub use sled_queue::SledQueue;

/// Opaque 128-bit conversation identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationHandle(Uuid);

impl ConversationHandle {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ConversationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One dequeued message. All three parts come from the same queue entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueMessage {
    pub conversation_handle: ConversationHandle,
    pub message_type_name: String,
    pub body: Vec<u8>,
}

pub trait QueueClient {
    type Transaction: ReceiveTransaction;

    fn begin(&self) -> Result<Self::Transaction, QueueError>;
}

/// Unit of work scoped to a single receive attempt.
///
/// Dropping a transaction without committing rolls it back, making any
/// received message visible again.
pub trait ReceiveTransaction {
    /// Waits up to `timeout` for the next message. May be called once.
    fn receive(&mut self, timeout: Duration) -> Result<Option<QueueMessage>, QueueError>;

    fn end_conversation(&mut self, handle: ConversationHandle) -> Result<(), QueueError>;

    fn commit(self) -> Result<(), QueueError>;

    fn rollback(self);
}

/// `[schema].[name]`, with `]` doubled inside each part.
pub fn qualified_queue_name(schema: &str, name: &str) -> String {
    format!("{}.{}", bracketize(schema), bracketize(name))
}

fn bracketize(part: &str) -> String {
    format!("[{}]", part.replace(']', "]]"))
}
