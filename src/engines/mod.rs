use std::fmt;
use std::path::Path;
use std::str::FromStr;

use log::info;

use crate::config::Config;
use crate::{KvsError, Result};

/// Lazy sequence of key names returned by [`KvsEngine::keys`].
///
/// Finite and single-pass. Call `keys` again to re-scan.
pub type Keys<'a> = Box<dyn Iterator<Item = Result<String>> + 'a>;

/// The string -> string contract every backend is adapted to.
///
/// Engines are used as trait objects (see [`open`]), so the trait carries no
/// `Clone` or `Send` bound; some native clients are single-threaded.
/// Every call blocks until the backend answers.
pub trait KvsEngine {
    /// Sets the value of a key, overwriting any previous value.
    fn put(&mut self, key: String, value: String) -> Result<()>;

    /// Gets the value of a key.
    ///
    /// # Errors
    ///
    /// Returns [`KvsError::KeyNotFound`] if the key does not exist and
    /// [`KvsError::Decode`] if the stored value is not UTF-8 text.
    fn get(&mut self, key: String) -> Result<String>;

    /// Removes a key. Removing a key that does not exist succeeds.
    fn delete(&mut self, key: String) -> Result<()>;

    /// Enumerates every key in this handle's namespace, in no particular order.
    fn keys(&mut self) -> Result<Keys<'_>>;
}

impl<E: KvsEngine + ?Sized> KvsEngine for Box<E> {
    fn put(&mut self, key: String, value: String) -> Result<()> {
        (**self).put(key, value)
    }

    fn get(&mut self, key: String) -> Result<String> {
        (**self).get(key)
    }

    fn delete(&mut self, key: String) -> Result<()> {
        (**self).delete(key)
    }

    fn keys(&mut self) -> Result<Keys<'_>> {
        (**self).keys()
    }
}

/// Every engine type `open` knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// Embedded RocksDB, named by path
    RocksDb,
    /// Embedded LevelDB, named by path
    LevelDb,
    /// Aerospike cluster, named by set
    Aerospike,
    /// Redis server; the name is ignored
    Redis,
    /// Cloud Datastore, named by entity kind
    Datastore,
    /// Embedded sled tree, named by path
    Sled,
}

impl EngineKind {
    /// Every engine kind, in token order.
    pub const ALL: [EngineKind; 6] = [
        EngineKind::RocksDb,
        EngineKind::LevelDb,
        EngineKind::Aerospike,
        EngineKind::Redis,
        EngineKind::Datastore,
        EngineKind::Sled,
    ];

    /// The token accepted by [`open`].
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::RocksDb => "rocksdb",
            EngineKind::LevelDb => "leveldb",
            EngineKind::Aerospike => "aerospike",
            EngineKind::Redis => "redis",
            EngineKind::Datastore => "datastore",
            EngineKind::Sled => "sled",
        }
    }

    /// Whether this build carries the driver.
    pub fn is_enabled(&self) -> bool {
        match self {
            EngineKind::RocksDb => cfg!(feature = "rocksdb"),
            EngineKind::LevelDb => cfg!(feature = "leveldb"),
            EngineKind::Aerospike => cfg!(feature = "aerospike"),
            EngineKind::Redis => cfg!(feature = "redis"),
            EngineKind::Datastore => cfg!(feature = "datastore"),
            EngineKind::Sled => true,
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = KvsError;

    fn from_str(s: &str) -> Result<Self> {
        EngineKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| KvsError::UnknownEngine(s.to_owned()))
    }
}

/// Opens an engine by type name with default connection settings.
///
/// `name` is a path for the embedded engines, a set for aerospike and an
/// entity kind for datastore. Redis ignores it.
///
/// # Errors
///
/// Fails with [`KvsError::UnknownEngine`] for an unrecognized type name.
pub fn open(type_name: &str, name: &str) -> Result<Box<dyn KvsEngine>> {
    open_with(type_name, name, &Config::default())
}

/// Opens an engine by type name using the given connection settings.
pub fn open_with(type_name: &str, name: &str, config: &Config) -> Result<Box<dyn KvsEngine>> {
    let kind: EngineKind = type_name.parse()?;
    if !kind.is_enabled() {
        return Err(KvsError::EngineDisabled(kind));
    }
    info!("Opening {} engine for '{}'", kind, name);

    let engine: Box<dyn KvsEngine> = match kind {
        EngineKind::Sled => Box::new(SledKvsEngine::open(Path::new(name), &config.embedded)?),
        #[cfg(feature = "rocksdb")]
        EngineKind::RocksDb => Box::new(RocksDbKvsEngine::open(Path::new(name), &config.embedded)?),
        #[cfg(feature = "leveldb")]
        EngineKind::LevelDb => Box::new(LevelDbKvsEngine::open(Path::new(name), &config.embedded)?),
        #[cfg(feature = "aerospike")]
        EngineKind::Aerospike => Box::new(AerospikeKvsEngine::open(name, &config.aerospike)?),
        #[cfg(feature = "redis")]
        EngineKind::Redis => Box::new(RedisKvsEngine::open(&config.redis)?),
        #[cfg(feature = "datastore")]
        EngineKind::Datastore => Box::new(DatastoreKvsEngine::open(name, &config.datastore)?),
        #[allow(unreachable_patterns)]
        disabled => return Err(KvsError::EngineDisabled(disabled)),
    };
    Ok(engine)
}

/// The single field typed backends store the value under.
#[cfg_attr(not(any(feature = "aerospike", feature = "datastore")), allow(dead_code))]
pub(crate) const VALUE_FIELD: &str = "value";

/// Decodes bytes read back for `key` as UTF-8 text.
pub(crate) fn decode_value(key: &str, bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| KvsError::Decode {
        key: Some(key.to_owned()),
        detail: e.to_string(),
    })
}

/// Decodes a key name read back from a scan.
pub(crate) fn decode_key(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| KvsError::Decode {
        key: None,
        detail: e.to_string(),
    })
}

#[cfg(feature = "aerospike")]
mod aerospike;
#[cfg(feature = "datastore")]
mod datastore;
#[cfg(feature = "leveldb")]
mod leveldb;
#[cfg(feature = "redis")]
mod redis;
#[cfg(feature = "rocksdb")]
mod rocksdb;
mod sled;

#[cfg(feature = "aerospike")]
pub use self::aerospike::AerospikeKvsEngine;
#[cfg(feature = "datastore")]
pub use self::datastore::{DatastoreKvsEngine, Transport};
#[cfg(feature = "leveldb")]
pub use self::leveldb::LevelDbKvsEngine;
#[cfg(feature = "redis")]
pub use self::redis::RedisKvsEngine;
#[cfg(feature = "rocksdb")]
pub use self::rocksdb::RocksDbKvsEngine;
pub use self::sled::SledKvsEngine;
