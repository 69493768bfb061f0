use std::collections::{HashSet, VecDeque};

use log::debug;
use redis::{Client, Commands, Connection};

use crate::config::RedisConfig;
use crate::engines::{decode_key, decode_value, Keys, KvsEngine};
use crate::error::Operation;
use crate::{KvsError, Result};

/// A connection to one database of a redis server.
///
/// The whole database is the namespace: there is no per-handle prefix, so
/// `keys` returns everything stored in the configured database index.
pub struct RedisKvsEngine {
    con: Connection,
}

impl RedisKvsEngine {
    /// Connects to the server named by `config.url`.
    pub fn open(config: &RedisConfig) -> Result<Self> {
        let tag = |e: redis::RedisError| KvsError::backend(Operation::Open, None, e);
        let client = Client::open(config.url.as_str()).map_err(tag)?;
        let timeout = config.timeout();
        let con = match timeout {
            Some(timeout) => client.get_connection_with_timeout(timeout),
            None => client.get_connection(),
        }
        .map_err(tag)?;
        con.set_read_timeout(timeout).map_err(tag)?;
        con.set_write_timeout(timeout).map_err(tag)?;
        debug!("connected to redis at {}", config.url);
        Ok(RedisKvsEngine { con })
    }
}

impl KvsEngine for RedisKvsEngine {
    fn put(&mut self, key: String, value: String) -> Result<()> {
        self.con
            .set::<_, _, ()>(&key, value)
            .map_err(|e| KvsError::backend(Operation::Put, Some(&key), e))
    }

    fn get(&mut self, key: String) -> Result<String> {
        match self.con.get::<_, Option<Vec<u8>>>(&key) {
            Ok(Some(value)) => decode_value(&key, value),
            Ok(None) => Err(KvsError::KeyNotFound { key }),
            Err(e) => Err(KvsError::backend(Operation::Get, Some(&key), e)),
        }
    }

    fn delete(&mut self, key: String) -> Result<()> {
        self.con
            .del::<_, ()>(&key)
            .map_err(|e| KvsError::backend(Operation::Delete, Some(&key), e))
    }

    /// Walks the keyspace with cursor based `SCAN`, one page per round trip.
    ///
    /// `SCAN` may return a key more than once across pages, so keys already
    /// yielded are remembered and skipped. A failing page ends the sequence
    /// with an error.
    fn keys(&mut self) -> Result<Keys<'_>> {
        Ok(Box::new(ScanPages {
            con: &mut self.con,
            cursor: 0,
            batch: VecDeque::new(),
            seen: HashSet::new(),
            done: false,
        }))
    }
}

struct ScanPages<'a> {
    con: &'a mut Connection,
    cursor: u64,
    batch: VecDeque<Vec<u8>>,
    seen: HashSet<Vec<u8>>,
    done: bool,
}

impl Iterator for ScanPages<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(key) = self.batch.pop_front() {
                if self.seen.insert(key.clone()) {
                    return Some(decode_key(key));
                }
                continue;
            }
            if self.done {
                return None;
            }
            let page = redis::cmd("SCAN")
                .arg(self.cursor)
                .query::<(u64, Vec<Vec<u8>>)>(&mut *self.con);
            match page {
                Ok((cursor, keys)) => {
                    self.cursor = cursor;
                    self.done = cursor == 0;
                    self.batch.extend(keys);
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(KvsError::backend(Operation::Keys, None, e)));
                }
            }
        }
    }
}
