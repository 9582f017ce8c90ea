use std::path::Path;

use super::{FieldStore, SledMode, StorageError, open_sled_db};

pub struct SledStorage {
    db: sled::Db,
}

const HASH_PREFIX: &[u8] = b"v1:h:";
const FIELD_SEPARATOR: u8 = 0;

impl SledStorage {
    pub fn open(
        data_path: &Path,
        cache_capacity: Option<u64>,
        mode: Option<SledMode>,
    ) -> Result<Self, StorageError> {
        let db = open_sled_db(data_path, cache_capacity, mode).map_err(StorageError::Sled)?;
        Ok(Self { db })
    }

    #[cfg(test)]
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(StorageError::Sled)?;
        Ok(Self { db })
    }
}

/// `v1:h:<key>\0<field>`
fn field_key(key: &str, field: &str) -> Vec<u8> {
    let mut raw = Vec::with_capacity(HASH_PREFIX.len() + key.len() + 1 + field.len());
    raw.extend_from_slice(HASH_PREFIX);
    raw.extend_from_slice(key.as_bytes());
    raw.push(FIELD_SEPARATOR);
    raw.extend_from_slice(field.as_bytes());
    raw
}

impl FieldStore for SledStorage {
    fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), StorageError> {
        self.db
            .insert(field_key(key, field), value.as_bytes())
            .map(|_| ())
            .map_err(StorageError::Sled)
    }

    fn get_field(&self, key: &str, field: &str) -> Result<Option<String>, StorageError> {
        let value = self
            .db
            .get(field_key(key, field))
            .map_err(StorageError::Sled)?;
        value
            .map(|raw| {
                String::from_utf8(raw.to_vec()).map_err(|_| StorageError::InvalidFieldValue {
                    key: key.to_owned(),
                    field: field.to_owned(),
                })
            })
            .transpose()
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map(|_| ()).map_err(StorageError::Sled)
    }
}
