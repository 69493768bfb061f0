//! Connection settings for the networked engines.
//!
//! Nothing here is compiled into the drivers: hosts, namespaces, tokens and
//! timeouts all come from a [`Config`], usually read from a TOML file.
//!
//! ```toml
//! [redis]
//! url = "redis://cache.internal:6379/2"
//! timeout_ms = 500
//!
//! [aerospike]
//! hosts = "10.0.0.5:3000,10.0.0.6:3000"
//! namespace = "ssd"
//!
//! [datastore]
//! project_id = "my-project"
//! access_token = "ya29...."
//! ```

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::Result;

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/0";
const DEFAULT_AEROSPIKE_HOSTS: &str = "127.0.0.1:3000";
const DEFAULT_AEROSPIKE_NAMESPACE: &str = "hdd";
const DEFAULT_DATASTORE_ENDPOINT: &str = "https://datastore.googleapis.com";
const DEFAULT_DATASTORE_PAGE_SIZE: u32 = 500;

/// Settings for every engine. Sections that are missing take their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Embedded engines (rocksdb, leveldb, sled)
    pub embedded: EmbeddedConfig,
    /// The redis engine
    pub redis: RedisConfig,
    /// The aerospike engine
    pub aerospike: AerospikeConfig,
    /// The Cloud Datastore engine
    pub datastore: DatastoreConfig,
}

impl Config {
    /// Parses a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Config> {
        Ok(toml::from_str(s)?)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let contents = fs::read_to_string(path)?;
        Config::from_toml_str(&contents)
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmbeddedConfig {
    pub create_if_missing: bool,
}

impl Default for EmbeddedConfig {
    fn default() -> Self {
        EmbeddedConfig {
            create_if_missing: true,
        }
    }
}

/// Redis connection settings. The database index is part of the url.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedisConfig {
    /// `redis://host:port/db`
    pub url: String,
    /// Connect, read and write timeout
    pub timeout_ms: Option<u64>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            url: DEFAULT_REDIS_URL.to_owned(),
            timeout_ms: None,
        }
    }
}

impl RedisConfig {
    /// The configured timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Aerospike cluster settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AerospikeConfig {
    /// Comma separated `host:port` seeds
    pub hosts: String,
    /// The namespace every set lives in
    pub namespace: String,
    /// Per-call timeout
    pub timeout_ms: Option<u64>,
}

impl Default for AerospikeConfig {
    fn default() -> Self {
        AerospikeConfig {
            hosts: DEFAULT_AEROSPIKE_HOSTS.to_owned(),
            namespace: DEFAULT_AEROSPIKE_NAMESPACE.to_owned(),
            timeout_ms: None,
        }
    }
}

impl AerospikeConfig {
    /// The configured timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Cloud Datastore settings.
///
/// When `DATASTORE_EMULATOR_HOST` is set and `endpoint` is left at its
/// default, requests go to the emulator instead. `DATASTORE_PROJECT_ID`
/// likewise fills in a missing `project_id`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatastoreConfig {
    /// Base url of the REST API
    pub endpoint: String,
    /// GCP project owning the datastore
    pub project_id: Option<String>,
    /// OAuth2 bearer token, not needed against the emulator
    pub access_token: Option<String>,
    /// Per-request timeout
    pub timeout_ms: Option<u64>,
    /// Keys fetched per query round trip in `keys`
    pub page_size: u32,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        DatastoreConfig {
            endpoint: DEFAULT_DATASTORE_ENDPOINT.to_owned(),
            project_id: None,
            access_token: None,
            timeout_ms: None,
            page_size: DEFAULT_DATASTORE_PAGE_SIZE,
        }
    }
}

impl DatastoreConfig {
    /// The configured timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// The endpoint after applying `DATASTORE_EMULATOR_HOST`.
    pub fn resolved_endpoint(&self) -> String {
        if self.endpoint == DEFAULT_DATASTORE_ENDPOINT {
            if let Ok(host) = env::var("DATASTORE_EMULATOR_HOST") {
                return format!("http://{}", host);
            }
        }
        self.endpoint.trim_end_matches('/').to_owned()
    }

    /// The project after applying `DATASTORE_PROJECT_ID`.
    pub fn resolved_project_id(&self) -> Option<String> {
        self.project_id
            .clone()
            .or_else(|| env::var("DATASTORE_PROJECT_ID").ok())
    }
}
