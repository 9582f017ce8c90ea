use std::fs;
use std::path::{Path, PathBuf};

use serde_json::json;

use crate::config::AppConfig;
use crate::logging::{LogLevel, Logger};

use super::{
    FieldStore, RedisStorage, SledMode, SledStorage, StorageEngine, StorageError,
    expand_home_path,
};

pub struct StorageFacade {
    engine: StorageEngine,
    data_path: Option<PathBuf>,
    backend: Box<dyn FieldStore>,
}

impl StorageFacade {
    pub fn initialize(app_config: &AppConfig, logger: &Logger) -> Result<Self, StorageError> {
        let Some(engine) = StorageEngine::parse(&app_config.storage.engine) else {
            return Err(StorageError::UnsupportedEngine {
                engine: app_config.storage.engine.clone(),
            });
        };

        match engine {
            StorageEngine::Sled => Self::initialize_sled(app_config, logger),
            StorageEngine::Redis => {
                let redis = &app_config.storage.redis;
                logger.log(
                    LogLevel::Info,
                    Some("storage::init"),
                    "Connecting field store",
                    Some(json!({
                        "engine": engine.as_str(),
                        "host": redis.host,
                        "port": redis.port,
                        "database": redis.database
                    })),
                );
                Ok(Self {
                    engine,
                    data_path: None,
                    backend: Box::new(RedisStorage::connect(redis)?),
                })
            }
        }
    }

    fn initialize_sled(app_config: &AppConfig, logger: &Logger) -> Result<Self, StorageError> {
        let data_path = expand_home_path(&app_config.storage.path)?;
        let mode = parse_sled_mode(app_config.storage.sled.mode.as_deref())?;

        logger.log(
            LogLevel::Info,
            Some("storage::init"),
            "Initializing field store",
            Some(json!({
                "engine": StorageEngine::Sled.as_str(),
                "configured_path": app_config.storage.path,
                "resolved_path": data_path.display().to_string(),
                "sled": {
                    "cache_capacity": app_config.storage.sled.cache_capacity,
                    "mode": app_config.storage.sled.mode
                }
            })),
        );

        fs::create_dir_all(&data_path).map_err(|source| StorageError::CreateDataDir {
            path: data_path.clone(),
            source,
        })?;

        let backend = SledStorage::open(&data_path, app_config.storage.sled.cache_capacity, mode)?;
        Ok(Self {
            engine: StorageEngine::Sled,
            data_path: Some(data_path),
            backend: Box::new(backend),
        })
    }

    pub fn engine(&self) -> StorageEngine {
        self.engine
    }

    /// Local data directory; `None` for network-backed engines.
    pub fn data_path(&self) -> Option<&Path> {
        self.data_path.as_deref()
    }
}

impl FieldStore for StorageFacade {
    fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), StorageError> {
        self.backend.set_field(key, field, value)
    }

    fn get_field(&self, key: &str, field: &str) -> Result<Option<String>, StorageError> {
        self.backend.get_field(key, field)
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.backend.flush()
    }
}

pub(crate) fn parse_sled_mode(raw: Option<&str>) -> Result<Option<SledMode>, StorageError> {
    raw.map(|raw| {
        SledMode::parse(raw).ok_or_else(|| StorageError::InvalidSledMode {
            mode: raw.to_owned(),
        })
    })
    .transpose()
}
