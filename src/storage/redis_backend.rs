use std::sync::Mutex;
use std::time::Duration;

use redis::{Commands, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};

use crate::config::RedisConfig;

use super::{FieldStore, StorageError};

/// Field store backed by Redis hashes: `HSET <key> <field> <value>`.
pub struct RedisStorage {
    connection: Mutex<redis::Connection>,
}

impl RedisStorage {
    /// Connects eagerly so an unreachable server fails at startup.
    pub fn connect(config: &RedisConfig) -> Result<Self, StorageError> {
        let client = redis::Client::open(connection_info(config)).map_err(StorageError::Redis)?;
        let connection = client
            .get_connection_with_timeout(Duration::from_millis(config.connect_timeout_ms))
            .map_err(StorageError::Redis)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T, StorageError> {
        let mut connection = self
            .connection
            .lock()
            .map_err(|_| StorageError::ConnectionLockPoisoned)?;
        op(&mut *connection).map_err(StorageError::Redis)
    }
}

pub(crate) fn connection_info(config: &RedisConfig) -> ConnectionInfo {
    ConnectionInfo {
        addr: ConnectionAddr::Tcp(config.host.clone(), config.port),
        redis: RedisConnectionInfo {
            db: config.database,
            password: config.password.clone(),
            ..RedisConnectionInfo::default()
        },
    }
}

impl FieldStore for RedisStorage {
    fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), StorageError> {
        self.with_connection(|connection| connection.hset::<_, _, _, ()>(key, field, value))
    }

    fn get_field(&self, key: &str, field: &str) -> Result<Option<String>, StorageError> {
        self.with_connection(|connection| connection.hget(key, field))
    }

    /// Writes are acknowledged by the server; nothing is buffered locally.
    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
