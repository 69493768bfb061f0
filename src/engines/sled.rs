use std::path::Path;

use log::debug;
use sled::Db;

use crate::config::EmbeddedConfig;
use crate::engines::{decode_key, decode_value, Keys, KvsEngine};
use crate::error::Operation;
use crate::{KvsError, Result};

/// An embedded sled tree opened at a directory.
#[derive(Clone)]
pub struct SledKvsEngine(Db);

impl SledKvsEngine {
    /// Wraps an already opened sled database.
    pub fn new(db: Db) -> Self {
        SledKvsEngine(db)
    }

    /// Opens (or creates, if configured) the tree at `path`.
    pub fn open(path: &Path, config: &EmbeddedConfig) -> Result<Self> {
        if !config.create_if_missing && !path.exists() {
            return Err(KvsError::backend(
                Operation::Open,
                None,
                format!("{} does not exist", path.display()),
            ));
        }
        let db = sled::open(path).map_err(|e| KvsError::backend(Operation::Open, None, e))?;
        debug!("sled tree opened at {}", path.display());
        Ok(SledKvsEngine(db))
    }
}

/// Writes land in sled's page cache and log; each mutation is flushed
/// before returning so it survives the handle being dropped.
impl KvsEngine for SledKvsEngine {
    fn put(&mut self, key: String, value: String) -> Result<()> {
        let tag = |e: sled::Error| KvsError::backend(Operation::Put, Some(&key), e);
        self.0.insert(key.as_bytes(), value.as_bytes()).map_err(tag)?;
        self.0.flush().map_err(tag)?;
        Ok(())
    }

    fn get(&mut self, key: String) -> Result<String> {
        let found = self
            .0
            .get(key.as_bytes())
            .map_err(|e| KvsError::backend(Operation::Get, Some(&key), e))?;
        match found {
            Some(value) => decode_value(&key, value.to_vec()),
            None => Err(KvsError::KeyNotFound { key }),
        }
    }

    fn delete(&mut self, key: String) -> Result<()> {
        let tag = |e: sled::Error| KvsError::backend(Operation::Delete, Some(&key), e);
        self.0.remove(key.as_bytes()).map_err(tag)?;
        self.0.flush().map_err(tag)?;
        Ok(())
    }

    fn keys(&mut self) -> Result<Keys<'_>> {
        let keys = self.0.iter().keys().map(|res| match res {
            Ok(key) => decode_key(key.to_vec()),
            Err(e) => Err(KvsError::backend(Operation::Keys, None, e)),
        });
        Ok(Box::new(keys))
    }
}
