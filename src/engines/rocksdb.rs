use std::path::Path;

use log::debug;
use rocksdb::{IteratorMode, Options, DB};

use crate::config::EmbeddedConfig;
use crate::engines::{decode_key, decode_value, Keys, KvsEngine};
use crate::error::Operation;
use crate::{KvsError, Result};

/// An embedded RocksDB database opened at a directory.
///
/// RocksDB allows a single process to hold the database open; opening the
/// same path twice fails with a lock error from the engine.
pub struct RocksDbKvsEngine {
    db: DB,
}

impl RocksDbKvsEngine {
    /// Opens (or creates, if configured) the database at `path`.
    pub fn open(path: &Path, config: &EmbeddedConfig) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(config.create_if_missing);
        let db = DB::open(&opts, path).map_err(|e| KvsError::backend(Operation::Open, None, e))?;
        debug!("rocksdb opened at {}", path.display());
        Ok(RocksDbKvsEngine { db })
    }
}

impl KvsEngine for RocksDbKvsEngine {
    fn put(&mut self, key: String, value: String) -> Result<()> {
        self.db
            .put(key.as_bytes(), value.as_bytes())
            .map_err(|e| KvsError::backend(Operation::Put, Some(&key), e))
    }

    fn get(&mut self, key: String) -> Result<String> {
        match self.db.get(key.as_bytes()) {
            Ok(Some(value)) => decode_value(&key, value),
            Ok(None) => Err(KvsError::KeyNotFound { key }),
            Err(e) => Err(KvsError::backend(Operation::Get, Some(&key), e)),
        }
    }

    fn delete(&mut self, key: String) -> Result<()> {
        self.db
            .delete(key.as_bytes())
            .map_err(|e| KvsError::backend(Operation::Delete, Some(&key), e))
    }

    fn keys(&mut self) -> Result<Keys<'_>> {
        let keys = self.db.iterator(IteratorMode::Start).map(|item| match item {
            Ok((key, _)) => decode_key(key.into_vec()),
            Err(e) => Err(KvsError::backend(Operation::Keys, None, e)),
        });
        Ok(Box::new(keys))
    }
}
