#![deny(missing_docs)]
//! One key/value interface over several storage backends.
//!
//! Pick a backend by name with [`open`] and program against [`KvsEngine`]:
//!
//! ```no_run
//! # fn main() -> kvswitch::Result<()> {
//! let mut store = kvswitch::open("leveldb", "/tmp/users.ldb")?;
//! store.put("user:1".to_owned(), "alice".to_owned())?;
//! assert_eq!(store.get("user:1".to_owned())?, "alice");
//! for key in store.keys()? {
//!     println!("{}", key?);
//! }
//! # Ok(())
//! # }
//! ```

pub use config::Config;
pub use engines::{open, open_with, EngineKind, Keys, KvsEngine, SledKvsEngine};
pub use error::{BackendError, KvsError, Operation, Result};

#[cfg(feature = "aerospike")]
pub use engines::AerospikeKvsEngine;
#[cfg(feature = "datastore")]
pub use engines::{DatastoreKvsEngine, Transport};
#[cfg(feature = "leveldb")]
pub use engines::LevelDbKvsEngine;
#[cfg(feature = "redis")]
pub use engines::RedisKvsEngine;
#[cfg(feature = "rocksdb")]
pub use engines::RocksDbKvsEngine;

pub mod config;
mod engines;
mod error;
