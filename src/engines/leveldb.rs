use std::path::Path;

use log::debug;
use rusty_leveldb::{DBIterator, LdbIterator, Options, DB};

use crate::config::EmbeddedConfig;
use crate::engines::{decode_key, decode_value, Keys, KvsEngine};
use crate::error::Operation;
use crate::{KvsError, Result};

/// A LevelDB database opened at a directory.
pub struct LevelDbKvsEngine {
    db: DB,
}

impl LevelDbKvsEngine {
    /// Opens (or creates, if configured) the database at `path`.
    pub fn open(path: &Path, config: &EmbeddedConfig) -> Result<Self> {
        let opts = Options {
            create_if_missing: config.create_if_missing,
            ..Options::default()
        };
        let db = DB::open(path, opts).map_err(|e| KvsError::backend(Operation::Open, None, e))?;
        debug!("leveldb opened at {}", path.display());
        Ok(LevelDbKvsEngine { db })
    }
}

impl KvsEngine for LevelDbKvsEngine {
    fn put(&mut self, key: String, value: String) -> Result<()> {
        self.db
            .put(key.as_bytes(), value.as_bytes())
            .map_err(|e| KvsError::backend(Operation::Put, Some(&key), e))
    }

    /// The native lookup returns only an option and folds internal read
    /// failures into "absent", so an I/O error while reading surfaces here as
    /// [`KvsError::KeyNotFound`].
    fn get(&mut self, key: String) -> Result<String> {
        match self.db.get(key.as_bytes()) {
            Some(value) => decode_value(&key, value.to_vec()),
            None => Err(KvsError::KeyNotFound { key }),
        }
    }

    fn delete(&mut self, key: String) -> Result<()> {
        self.db
            .delete(key.as_bytes())
            .map_err(|e| KvsError::backend(Operation::Delete, Some(&key), e))
    }

    fn keys(&mut self) -> Result<Keys<'_>> {
        let iter = self
            .db
            .new_iter()
            .map_err(|e| KvsError::backend(Operation::Keys, None, e))?;
        Ok(Box::new(KeyIter { iter }))
    }
}

/// Owns the native iterator, which pins a snapshot of the database until
/// this is dropped.
struct KeyIter {
    iter: DBIterator,
}

impl Iterator for KeyIter {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        LdbIterator::next(&mut self.iter).map(|(key, _)| decode_key(key.to_vec()))
    }
}
