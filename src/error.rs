use std::error::Error;
use std::fmt;
use std::io;

use crate::engines::EngineKind;

/// Boxed error coming out of a native backend client.
pub type BackendError = Box<dyn Error + Send + Sync>;

/// The store operation that was running when a backend failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Connecting to or opening the backend
    Open,
    /// `put`
    Put,
    /// `get`
    Get,
    /// `delete`
    Delete,
    /// `keys`
    Keys,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Open => "open",
            Operation::Put => "put",
            Operation::Get => "get",
            Operation::Delete => "delete",
            Operation::Keys => "keys",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]

/// The KVS Error type
pub enum KvsError {
    /// IO Error
    IoError(io::Error),

    /// The engine name passed to `open` is not one we know
    UnknownEngine(String),

    /// The engine is known but its cargo feature was not compiled in
    EngineDisabled(EngineKind),

    /// Non existent key
    KeyNotFound {
        /// The key that was looked up
        key: String,
    },

    /// Stored bytes are not valid UTF-8 text, or not a string at all
    Decode {
        /// The key being read, if one was involved
        key: Option<String>,
        /// What was wrong with the stored data
        detail: String,
    },

    /// The native client failed
    Backend {
        /// Which operation failed
        op: Operation,
        /// The key involved, if any
        key: Option<String>,
        /// The native error
        source: BackendError,
    },

    /// Malformed configuration file
    Config(toml::de::Error),
}

impl KvsError {
    /// Wraps a native client error with the operation and key that produced it.
    pub fn backend<E>(op: Operation, key: Option<&str>, err: E) -> KvsError
    where
        E: Into<BackendError>,
    {
        KvsError::Backend {
            op,
            key: key.map(str::to_owned),
            source: err.into(),
        }
    }

    /// Returns true for a failed lookup of a missing key.
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, KvsError::KeyNotFound { .. })
    }
}

impl fmt::Display for KvsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvsError::IoError(e) => write!(f, "I/O error: {}", e),
            KvsError::UnknownEngine(name) => write!(f, "unknown engine type '{}'", name),
            KvsError::EngineDisabled(kind) => write!(
                f,
                "engine '{}' is not compiled in (enable the '{}' feature)",
                kind, kind
            ),
            KvsError::KeyNotFound { key } => write!(f, "key not found: '{}'", key),
            KvsError::Decode { key: Some(key), detail } => {
                write!(f, "cannot decode value of '{}': {}", key, detail)
            }
            KvsError::Decode { key: None, detail } => write!(f, "cannot decode key: {}", detail),
            KvsError::Backend {
                op,
                key: Some(key),
                source,
            } => write!(f, "{} '{}' failed: {}", op, key, source),
            KvsError::Backend {
                op,
                key: None,
                source,
            } => write!(f, "{} failed: {}", op, source),
            KvsError::Config(e) => write!(f, "invalid configuration: {}", e),
        }
    }
}

impl Error for KvsError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            KvsError::IoError(e) => Some(e),
            KvsError::Backend { source, .. } => Some(source.as_ref()),
            KvsError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for KvsError {
    fn from(value: io::Error) -> KvsError {
        KvsError::IoError(value)
    }
}

impl From<toml::de::Error> for KvsError {
    fn from(err: toml::de::Error) -> Self {
        KvsError::Config(err)
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, KvsError>;
