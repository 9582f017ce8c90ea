use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use toml::Value;

pub const CONFIG_ENV_VAR: &str = "AUDITBRIDGE_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "auditbridge.toml";
const CONFIG_ARG: &str = "--config";

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub broker: BrokerConfig,
    pub queue: QueueConfig,
    pub storage: StorageConfig,
    pub error_log: ErrorLogConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
    #[serde(default)]
    pub file: Option<String>,
    /// Console output is opt-in; without `file` or `stdout` nothing is logged.
    #[serde(default)]
    pub stdout: bool,
}

/// Location and identity of the local durable queue facility.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct BrokerConfig {
    pub path: String,
    pub application_name: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct QueueConfig {
    pub schema: String,
    pub name: String,
    pub receive_timeout_ms: u64,
    pub end_dialog_message_type: String,
    pub error_message_type: String,
    /// When empty, every non-control message type is treated as a change set.
    #[serde(default)]
    pub application_message_types: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    pub engine: String,
    pub path: String,
    #[serde(default)]
    pub sled: SledConfig,
    #[serde(default)]
    pub redis: RedisConfig,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct SledConfig {
    #[serde(default)]
    pub cache_capacity: Option<u64>,
    #[serde(default)]
    pub mode: Option<String>,
}

/// Connection settings for `storage.engine = "redis"`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub database: i64,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_redis_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            database: 0,
            password: None,
            connect_timeout_ms: default_redis_connect_timeout_ms(),
        }
    }
}

fn default_redis_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_redis_connect_timeout_ms() -> u64 {
    2000
}

/// `path_template` may contain a `{date}` placeholder, rendered as `YYYY-MM-DD`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ErrorLogConfig {
    pub path_template: String,
}

impl AppConfig {
    /// Resolves the config file from `--config <path>`, then `AUDITBRIDGE_CONFIG`,
    /// then `./auditbridge.toml`. Remaining args are treated as overrides.
    pub fn load_with_discovery(
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let mut args: Vec<String> = args.into_iter().collect();
        let explicit = take_config_arg(&mut args)?;
        let env_path = std::env::var(CONFIG_ENV_VAR).ok().filter(|v| !v.is_empty());

        let path = match (explicit, env_path) {
            (Some(path), _) => PathBuf::from(path),
            (None, Some(path)) => PathBuf::from(path),
            (None, None) => {
                let candidate = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !candidate.is_file() {
                    return Err(ConfigError::NotFound {
                        searched: vec![
                            format!("{CONFIG_ARG} <path>"),
                            format!("${CONFIG_ENV_VAR}"),
                            candidate.to_string_lossy().to_string(),
                        ],
                    });
                }
                candidate
            }
        };

        Self::load_from_toml_with_args(path, args)
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source,
        })?;

        let mut root_value: Value =
            toml_content
                .parse()
                .map_err(|source| ConfigError::TomlParse {
                    path: path.as_ref().to_string_lossy().to_string(),
                    source,
                })?;

        let overrides = parse_cli_overrides(args)?;
        for (key_path, raw_value) in overrides {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        let config: Self = root_value.try_into().map_err(ConfigError::Deserialize)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_non_empty("queue.schema", &self.queue.schema)?;
        require_non_empty("queue.name", &self.queue.name)?;
        require_non_empty(
            "queue.end_dialog_message_type",
            &self.queue.end_dialog_message_type,
        )?;
        require_non_empty("queue.error_message_type", &self.queue.error_message_type)?;
        require_non_empty("error_log.path_template", &self.error_log.path_template)?;

        if self.queue.end_dialog_message_type == self.queue.error_message_type {
            return Err(ConfigError::Invalid {
                key: "queue.error_message_type".to_owned(),
                reason: "must differ from queue.end_dialog_message_type".to_owned(),
            });
        }

        let control_types = [
            &self.queue.end_dialog_message_type,
            &self.queue.error_message_type,
        ];
        if let Some(clash) = self
            .queue
            .application_message_types
            .iter()
            .find(|message_type| control_types.contains(message_type))
        {
            return Err(ConfigError::Invalid {
                key: "queue.application_message_types".to_owned(),
                reason: format!("'{clash}' is already a control message type"),
            });
        }

        Ok(())
    }
}

fn require_non_empty(key: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Invalid {
            key: key.to_owned(),
            reason: "must not be empty".to_owned(),
        });
    }
    Ok(())
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Deserialize(toml::de::Error),
    NotFound {
        searched: Vec<String>,
    },
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
    Invalid {
        key: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::NotFound { searched } => write!(
                f,
                "no configuration file found (looked at: {})",
                searched.join(", ")
            ),
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI argument '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
            Self::Invalid { key, reason } => write!(f, "invalid '{key}': {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn take_config_arg(args: &mut Vec<String>) -> Result<Option<String>, ConfigError> {
    let Some(position) = args.iter().position(|arg| arg == CONFIG_ARG) else {
        return Ok(None);
    };
    if position + 1 >= args.len() {
        return Err(ConfigError::MissingValueForArg {
            key: "config".to_owned(),
        });
    }

    let value = args.remove(position + 1);
    args.remove(position);
    Ok(Some(value))
}

fn parse_cli_overrides(
    args: impl IntoIterator<Item = String>,
) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(stripped) = arg.strip_prefix("--") else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };

        if stripped.is_empty() {
            return Err(ConfigError::InvalidArgFormat { arg });
        }

        let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
            key: stripped.to_owned(),
        })?;

        parsed.push((stripped.to_owned(), value));
    }

    Ok(parsed)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }
    let unknown = || ConfigError::UnknownPath {
        key: key_path.to_owned(),
    };

    let (final_key, sections) = parts.split_last().ok_or_else(|| ConfigError::InvalidPath {
        key: key_path.to_owned(),
    })?;

    let mut current = root;
    for section in sections {
        current = current
            .as_table_mut()
            .and_then(|table| table.get_mut(*section))
            .ok_or_else(unknown)?;
    }

    let current_value = current
        .as_table_mut()
        .and_then(|table| table.get_mut(*final_key))
        .ok_or_else(unknown)?;

    *current_value = parse_value_using_current_type(key_path, raw_value, current_value)?;
    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    let invalid = |expected: &'static str| ConfigError::InvalidValueForType {
        key: key_path.to_owned(),
        expected,
        value: raw_value.to_owned(),
    };

    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => raw_value
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid("integer")),
        Value::Float(_) => raw_value
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| invalid("float")),
        Value::Boolean(_) => raw_value
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|_| invalid("boolean")),
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}
