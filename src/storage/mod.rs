mod backend;
mod engine;
mod error;
mod facade;
mod path;
mod redis_backend;
mod sled_backend;

pub use backend::FieldStore;
pub use engine::{SledMode, StorageEngine, open_sled_db};
pub use error::StorageError;
pub use facade::StorageFacade;
pub(crate) use facade::parse_sled_mode;
pub(crate) use path::expand_home_path;
pub use redis_backend::RedisStorage;
pub use sled_backend::SledStorage;
