use std::fmt;

use crate::broker::{ConversationHandle, QueueError};
use crate::payload::ProcessingError;

/// Fatal result of a consumer run. Every variant stops the loop.
#[derive(Debug)]
pub enum ConsumerError {
    Queue(QueueError),
    /// The message was acknowledged (conversation ended, transaction
    /// committed) before this was raised.
    Processing {
        conversation_handle: ConversationHandle,
        message_type: String,
        source: ProcessingError,
    },
}

impl fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue(source) => write!(f, "queue facility error: {source}"),
            Self::Processing {
                conversation_handle,
                message_type,
                source,
            } => write!(
                f,
                "failed to process '{message_type}' message on conversation {conversation_handle}: {source}"
            ),
        }
    }
}

impl std::error::Error for ConsumerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Queue(source) => Some(source),
            Self::Processing { source, .. } => Some(source),
        }
    }
}

impl From<QueueError> for ConsumerError {
    fn from(value: QueueError) -> Self {
        Self::Queue(value)
    }
}
