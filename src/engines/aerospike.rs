use std::collections::HashMap;

use aerospike::{
    Bin, Bins, Client, ClientPolicy, ErrorKind, Key, ReadPolicy, Record, ResultCode, ScanPolicy,
    Value, WritePolicy,
};
use log::{debug, warn};

use crate::config::AerospikeConfig;
use crate::engines::{Keys, KvsEngine, VALUE_FIELD};
use crate::error::Operation;
use crate::{KvsError, Result};

/// One set in an aerospike namespace.
///
/// Records are addressed by the triple (namespace, set, key) and hold the
/// value in a single bin named `value`. The user key is stored alongside
/// each record so that scans can hand it back.
pub struct AerospikeKvsEngine {
    client: Client,
    namespace: String,
    set: String,
    read_policy: ReadPolicy,
    write_policy: WritePolicy,
    scan_policy: ScanPolicy,
}

fn native(op: Operation, key: Option<&str>, err: aerospike::Error) -> KvsError {
    // error_chain errors are not Sync, keep the rendered message instead
    KvsError::backend(op, key, err.to_string())
}

fn is_not_found(err: &aerospike::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ServerError(ResultCode::KeyNotFoundError)
    )
}

/// Classifies the outcome of a native `get`.
fn read_outcome(key: String, outcome: aerospike::Result<Record>) -> Result<String> {
    match outcome {
        Ok(record) => value_of(key, &record.bins),
        Err(e) if is_not_found(&e) => Err(KvsError::KeyNotFound { key }),
        Err(e) => Err(native(Operation::Get, Some(&key), e)),
    }
}

/// Projects the `value` bin out of a record's bins.
fn value_of(key: String, bins: &HashMap<String, Value>) -> Result<String> {
    match bins.get(VALUE_FIELD) {
        Some(Value::String(value)) => Ok(value.clone()),
        Some(other) => Err(KvsError::Decode {
            key: Some(key),
            detail: format!("bin '{}' holds a non-string value: {}", VALUE_FIELD, other),
        }),
        None => Err(KvsError::Decode {
            key: Some(key),
            detail: format!("record has no '{}' bin", VALUE_FIELD),
        }),
    }
}

/// Classifies the outcome of a native `delete`; a missing record is success.
fn delete_outcome(key: &str, outcome: aerospike::Result<bool>) -> Result<()> {
    match outcome {
        Ok(existed) => {
            if !existed {
                debug!("delete of missing key '{}'", key);
            }
            Ok(())
        }
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(native(Operation::Delete, Some(key), e)),
    }
}

/// The string user key stored with a scanned record, if any.
fn user_key_of(key: Option<Key>) -> Option<String> {
    match key.and_then(|k| k.user_key) {
        Some(Value::String(key)) => Some(key),
        _ => None,
    }
}

impl AerospikeKvsEngine {
    /// Connects to the cluster and binds the handle to `set`.
    pub fn open(set: &str, config: &AerospikeConfig) -> Result<Self> {
        let timeout = config.timeout();

        let mut client_policy = ClientPolicy::default();
        client_policy.timeout = timeout;
        let client = Client::new(&client_policy, &config.hosts)
            .map_err(|e| native(Operation::Open, None, e))?;

        let mut read_policy = ReadPolicy::default();
        read_policy.timeout = timeout;
        let mut write_policy = WritePolicy::default();
        write_policy.base_policy.timeout = timeout;
        write_policy.send_key = true;
        let mut scan_policy = ScanPolicy::default();
        scan_policy.base_policy.timeout = timeout;

        debug!(
            "connected to aerospike at {} ({}.{})",
            config.hosts, config.namespace, set
        );
        Ok(AerospikeKvsEngine {
            client,
            namespace: config.namespace.clone(),
            set: set.to_owned(),
            read_policy,
            write_policy,
            scan_policy,
        })
    }

    fn record_key(&self, op: Operation, key: &str) -> Result<Key> {
        Key::new(
            self.namespace.clone(),
            self.set.clone(),
            Value::from(key.to_owned()),
        )
        .map_err(|e| native(op, Some(key), e))
    }
}

impl KvsEngine for AerospikeKvsEngine {
    fn put(&mut self, key: String, value: String) -> Result<()> {
        let record_key = self.record_key(Operation::Put, &key)?;
        let bins = [Bin::new(VALUE_FIELD, Value::from(value))];
        self.client
            .put(&self.write_policy, &record_key, &bins)
            .map_err(|e| native(Operation::Put, Some(&key), e))
    }

    fn get(&mut self, key: String) -> Result<String> {
        let record_key = self.record_key(Operation::Get, &key)?;
        let outcome = self.client.get(&self.read_policy, &record_key, Bins::All);
        read_outcome(key, outcome)
    }

    /// The native client reports whether the record existed; a missing
    /// record is not an error here.
    fn delete(&mut self, key: String) -> Result<()> {
        let record_key = self.record_key(Operation::Delete, &key)?;
        let outcome = self.client.delete(&self.write_policy, &record_key);
        delete_outcome(&key, outcome)
    }

    /// Scans the whole set before yielding anything.
    ///
    /// The scan delivers records through a callback-style record set with no
    /// way to pause it, so every key is buffered first. Memory use grows with
    /// the size of the set. Records written without a stored string user key
    /// are skipped.
    fn keys(&mut self) -> Result<Keys<'_>> {
        let recordset = self
            .client
            .scan(&self.scan_policy, &self.namespace, &self.set, Bins::None)
            .map_err(|e| native(Operation::Keys, None, e))?;

        let mut keys = Vec::new();
        let mut skipped = 0usize;
        for record in &*recordset {
            let record = record.map_err(|e| native(Operation::Keys, None, e))?;
            match user_key_of(record.key) {
                Some(key) => keys.push(key),
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(
                "skipped {} records in {}.{} without a string user key",
                skipped, self.namespace, self.set
            );
        }
        Ok(Box::new(keys.into_iter().map(Ok)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(code: ResultCode) -> aerospike::Error {
        ErrorKind::ServerError(code).into()
    }

    fn bins(value: Value) -> HashMap<String, Value> {
        HashMap::from([(VALUE_FIELD.to_owned(), value)])
    }

    #[test]
    fn key_not_found_error_is_key_not_found() {
        let outcome = Err(server_error(ResultCode::KeyNotFoundError));
        match read_outcome("user:1".to_owned(), outcome) {
            Err(KvsError::KeyNotFound { key }) => assert_eq!(key, "user:1"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn other_server_errors_are_backend_errors() {
        let outcome = Err(server_error(ResultCode::Timeout));
        match read_outcome("k".to_owned(), outcome) {
            Err(KvsError::Backend { op, key, .. }) => {
                assert_eq!(op, Operation::Get);
                assert_eq!(key.as_deref(), Some("k"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn value_bin_is_projected() {
        let value = value_of("k".to_owned(), &bins(Value::from("alice".to_owned()))).unwrap();
        assert_eq!(value, "alice");
    }

    #[test]
    fn non_string_or_missing_bin_is_a_decode_error() {
        let err = value_of("k".to_owned(), &bins(Value::from(7i64))).unwrap_err();
        assert!(matches!(err, KvsError::Decode { .. }));

        let err = value_of("k".to_owned(), &HashMap::new()).unwrap_err();
        assert!(matches!(err, KvsError::Decode { .. }));
    }

    #[test]
    fn delete_of_missing_record_succeeds() {
        delete_outcome("k", Ok(true)).unwrap();
        delete_outcome("k", Ok(false)).unwrap();
        delete_outcome("k", Err(server_error(ResultCode::KeyNotFoundError))).unwrap();

        let err = delete_outcome("k", Err(server_error(ResultCode::Timeout))).unwrap_err();
        assert!(matches!(
            err,
            KvsError::Backend {
                op: Operation::Delete,
                ..
            }
        ));
    }

    #[test]
    fn scanned_records_need_a_string_user_key() {
        let named = Key::new("hdd", "users", Value::from("a".to_owned())).unwrap();
        assert_eq!(user_key_of(Some(named)).as_deref(), Some("a"));

        let numeric = Key::new("hdd", "users", Value::from(42i64)).unwrap();
        assert_eq!(user_key_of(Some(numeric)), None);

        let mut digest_only = Key::new("hdd", "users", Value::from("b".to_owned())).unwrap();
        digest_only.user_key = None;
        assert_eq!(user_key_of(Some(digest_only)), None);
        assert_eq!(user_key_of(None), None);
    }
}
