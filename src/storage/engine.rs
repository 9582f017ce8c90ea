use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageEngine {
    Sled,
    Redis,
}

impl StorageEngine {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "sled" => Some(Self::Sled),
            "redis" => Some(Self::Redis),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sled => "sled",
            Self::Redis => "redis",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SledMode {
    LowSpace,
    HighThroughput,
}

impl SledMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "low_space" => Some(Self::LowSpace),
            "high_throughput" => Some(Self::HighThroughput),
            _ => None,
        }
    }

    fn as_sled(self) -> sled::Mode {
        match self {
            Self::LowSpace => sled::Mode::LowSpace,
            Self::HighThroughput => sled::Mode::HighThroughput,
        }
    }
}

/// Opens a sled database with the tuning knobs shared by the field store and
/// the broker queue.
pub fn open_sled_db(
    data_path: &Path,
    cache_capacity: Option<u64>,
    mode: Option<SledMode>,
) -> sled::Result<sled::Db> {
    let mut config = sled::Config::new().path(data_path);

    if let Some(cache_capacity) = cache_capacity {
        config = config.cache_capacity(cache_capacity);
    }
    if let Some(mode) = mode {
        config = config.mode(mode.as_sled());
    }

    config.open()
}
