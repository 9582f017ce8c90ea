use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum StorageError {
    UnsupportedEngine {
        engine: String,
    },
    InvalidSledMode {
        mode: String,
    },
    HomeDirectoryUnavailable,
    CreateDataDir {
        path: PathBuf,
        source: std::io::Error,
    },
    InvalidFieldValue {
        key: String,
        field: String,
    },
    Sled(sled::Error),
    Redis(redis::RedisError),
    ConnectionLockPoisoned,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedEngine { engine } => write!(
                f,
                "unsupported storage.engine '{}'; allowed values: sled, redis",
                engine
            ),
            Self::InvalidSledMode { mode } => write!(
                f,
                "invalid sled mode '{}'; allowed values: low_space, high_throughput",
                mode
            ),
            Self::HomeDirectoryUnavailable => {
                write!(f, "cannot resolve storage path because HOME is not set")
            }
            Self::CreateDataDir { path, source } => write!(
                f,
                "failed to create storage data directory '{}': {source}",
                path.display()
            ),
            Self::InvalidFieldValue { key, field } => write!(
                f,
                "stored value for '{key}'.'{field}' is not valid UTF-8"
            ),
            Self::Sled(source) => write!(f, "sled storage error: {source}"),
            Self::Redis(source) => write!(f, "redis storage error: {source}"),
            Self::ConnectionLockPoisoned => write!(f, "redis connection lock is poisoned"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CreateDataDir { source, .. } => Some(source),
            Self::Sled(source) => Some(source),
            Self::Redis(source) => Some(source),
            _ => None,
        }
    }
}
