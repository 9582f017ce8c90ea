use std::fmt;
use std::path::PathBuf;

use crate::storage::StorageError;

use super::ConversationHandle;

#[derive(Debug)]
pub enum QueueError {
    Setup(StorageError),
    CreateDataDir {
        path: PathBuf,
        source: std::io::Error,
    },
    Sled(sled::Error),
    SerializeRecord(serde_json::Error),
    DeserializeRecord(serde_json::Error),
    CorruptMessageKey {
        len: usize,
    },
    ConversationNotFound {
        handle: ConversationHandle,
    },
    ConversationClosed {
        handle: ConversationHandle,
    },
    ReceiveAlreadyAttempted,
    SubscriptionClosed,
    InFlightLockPoisoned,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup(source) => write!(f, "broker setup error: {source}"),
            Self::CreateDataDir { path, source } => write!(
                f,
                "failed to create broker data directory '{}': {source}",
                path.display()
            ),
            Self::Sled(source) => write!(f, "broker storage error: {source}"),
            Self::SerializeRecord(source) => {
                write!(f, "failed to serialize broker record: {source}")
            }
            Self::DeserializeRecord(source) => {
                write!(f, "failed to deserialize broker record: {source}")
            }
            Self::CorruptMessageKey { len } => {
                write!(f, "queue entry key has {len} bytes, expected 8")
            }
            Self::ConversationNotFound { handle } => {
                write!(f, "conversation {handle} does not exist")
            }
            Self::ConversationClosed { handle } => {
                write!(f, "conversation {handle} has already been ended")
            }
            Self::ReceiveAlreadyAttempted => {
                write!(f, "receive was already attempted in this transaction")
            }
            Self::SubscriptionClosed => write!(f, "queue change subscription closed"),
            Self::InFlightLockPoisoned => write!(f, "in-flight message registry lock poisoned"),
        }
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Setup(source) => Some(source),
            Self::CreateDataDir { source, .. } => Some(source),
            Self::Sled(source) => Some(source),
            Self::SerializeRecord(source) | Self::DeserializeRecord(source) => Some(source),
            _ => None,
        }
    }
}
