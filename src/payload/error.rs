use std::fmt;

use crate::storage::StorageError;

/// Failures raised while routing or handling one message.
#[derive(Debug)]
pub enum ProcessingError {
    Classification {
        message_type: String,
        reason: String,
    },
    UnsupportedTrackingType {
        tracking_type: String,
    },
    MalformedPayload {
        reason: String,
    },
    SinkWrite {
        key: String,
        source: StorageError,
    },
}

impl ProcessingError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Classification { .. } => "classification",
            Self::UnsupportedTrackingType { .. } => "unsupported_tracking_type",
            Self::MalformedPayload { .. } => "malformed_payload",
            Self::SinkWrite { .. } => "sink_write",
        }
    }
}

impl fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Classification {
                message_type,
                reason,
            } => write!(f, "cannot classify message type '{message_type}': {reason}"),
            Self::UnsupportedTrackingType { tracking_type } => {
                write!(f, "invalid tracking type '{tracking_type}'")
            }
            Self::MalformedPayload { reason } => write!(f, "malformed payload: {reason}"),
            Self::SinkWrite { key, source } => {
                write!(f, "failed to write '{key}' to the field store: {source}")
            }
        }
    }
}

impl std::error::Error for ProcessingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SinkWrite { source, .. } => Some(source),
            _ => None,
        }
    }
}
