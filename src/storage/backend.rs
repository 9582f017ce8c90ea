use super::StorageError;

/// Hash-style key/value store: each key owns a set of named fields.
///
/// `set_field` is an overwrite, so replaying the same write is harmless.
pub trait FieldStore: Send + Sync {
    fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), StorageError>;
    fn get_field(&self, key: &str, field: &str) -> Result<Option<String>, StorageError>;
    fn flush(&self) -> Result<(), StorageError>;
}
