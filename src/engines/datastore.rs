use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use log::debug;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::DatastoreConfig;
use crate::engines::{Keys, KvsEngine, VALUE_FIELD};
use crate::error::{BackendError, Operation};
use crate::{KvsError, Result};

/// Carries one Cloud Datastore v1 RPC.
///
/// `method` is the RPC name (`lookup`, `commit`, `runQuery`) and `body` its
/// JSON request. Implementations return the decoded JSON response.
pub trait Transport {
    /// Sends `body` to `method` for `project_id`.
    fn call(
        &self,
        project_id: &str,
        method: &str,
        body: &Value,
    ) -> std::result::Result<Value, BackendError>;
}

/// The REST transport, `POST {endpoint}/v1/projects/{project}:{method}`.
struct HttpTransport {
    client: reqwest::blocking::Client,
    endpoint: String,
    access_token: Option<String>,
}

impl HttpTransport {
    fn new(
        endpoint: String,
        access_token: Option<String>,
        timeout: Option<Duration>,
    ) -> std::result::Result<Self, BackendError> {
        let mut builder = reqwest::blocking::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(HttpTransport {
            client: builder.build()?,
            endpoint,
            access_token,
        })
    }
}

impl Transport for HttpTransport {
    fn call(
        &self,
        project_id: &str,
        method: &str,
        body: &Value,
    ) -> std::result::Result<Value, BackendError> {
        let url = format!("{}/v1/projects/{}:{}", self.endpoint, project_id, method);
        let mut request = self.client.post(&url).json(body);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(format!("{} returned {}: {}", method, status, text).into());
        }
        Ok(response.json()?)
    }
}

#[derive(Debug, Deserialize)]
struct PathElement {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EntityKey {
    #[serde(default)]
    path: Vec<PathElement>,
}

impl EntityKey {
    /// The string name of the entity, absent for numeric ids.
    fn name(self) -> Option<String> {
        self.path.into_iter().last().and_then(|element| element.name)
    }
}

#[derive(Debug, Deserialize)]
struct Entity {
    key: EntityKey,
    #[serde(default)]
    properties: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct EntityResult {
    entity: Entity,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupResponse {
    #[serde(default)]
    found: Vec<EntityResult>,
    #[serde(default)]
    deferred: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryBatch {
    #[serde(default)]
    entity_results: Vec<EntityResult>,
    #[serde(default)]
    end_cursor: Option<String>,
    more_results: String,
}

#[derive(Debug, Deserialize)]
struct RunQueryResponse {
    batch: QueryBatch,
}

/// Lookups answered only with `deferred` are re-issued at most this many times.
const MAX_LOOKUP_ATTEMPTS: usize = 5;

fn parse<T: for<'de> Deserialize<'de>>(op: Operation, key: Option<&str>, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| KvsError::backend(op, key, e))
}

/// Entities of one kind in a Cloud Datastore project.
///
/// Each key maps to an entity keyed by (kind, key-name) with one unindexed
/// string property `value`.
pub struct DatastoreKvsEngine {
    transport: Box<dyn Transport>,
    project_id: String,
    kind: String,
    page_size: u32,
}

impl DatastoreKvsEngine {
    /// Builds an engine for `kind` talking REST to the configured endpoint.
    pub fn open(kind: &str, config: &DatastoreConfig) -> Result<Self> {
        let project_id = config.resolved_project_id().ok_or_else(|| {
            KvsError::backend(Operation::Open, None, "no datastore project_id configured")
        })?;
        let endpoint = config.resolved_endpoint();
        let transport = HttpTransport::new(
            endpoint.clone(),
            config.access_token.clone(),
            config.timeout(),
        )
        .map_err(|e| KvsError::Backend {
            op: Operation::Open,
            key: None,
            source: e,
        })?;
        debug!("datastore {} project {} kind {}", endpoint, project_id, kind);
        Ok(DatastoreKvsEngine::with_transport(
            kind,
            project_id,
            config.page_size,
            transport,
        ))
    }

    /// Builds an engine over a caller supplied transport.
    pub fn with_transport(
        kind: &str,
        project_id: impl Into<String>,
        page_size: u32,
        transport: impl Transport + 'static,
    ) -> Self {
        DatastoreKvsEngine {
            transport: Box::new(transport),
            project_id: project_id.into(),
            kind: kind.to_owned(),
            page_size: page_size.max(1),
        }
    }

    fn entity_key(&self, key: &str) -> Value {
        json!({
            "partitionId": { "projectId": self.project_id },
            "path": [{ "kind": self.kind, "name": key }],
        })
    }

    fn call(&self, op: Operation, key: Option<&str>, method: &str, body: Value) -> Result<Value> {
        self.transport
            .call(&self.project_id, method, &body)
            .map_err(|e| KvsError::Backend {
                op,
                key: key.map(str::to_owned),
                source: e,
            })
    }

    fn commit(&self, op: Operation, key: &str, mutation: Value) -> Result<()> {
        let body = json!({ "mode": "NON_TRANSACTIONAL", "mutations": [mutation] });
        self.call(op, Some(key), "commit", body)?;
        Ok(())
    }
}

impl KvsEngine for DatastoreKvsEngine {
    /// Upserts a fresh entity; any other properties it had are dropped.
    fn put(&mut self, key: String, value: String) -> Result<()> {
        let mutation = json!({
            "upsert": {
                "key": self.entity_key(&key),
                "properties": {
                    VALUE_FIELD: { "stringValue": value, "excludeFromIndexes": true },
                },
            }
        });
        self.commit(Operation::Put, &key, mutation)
    }

    fn get(&mut self, key: String) -> Result<String> {
        let body = json!({ "keys": [self.entity_key(&key)] });
        let mut attempts = 0;
        let response = loop {
            attempts += 1;
            let raw = self.call(Operation::Get, Some(&key), "lookup", body.clone())?;
            let response: LookupResponse = parse(Operation::Get, Some(&key), raw)?;
            // the server may postpone keys under load; ask again a bounded number of times
            if response.found.is_empty() && !response.deferred.is_empty() {
                if attempts >= MAX_LOOKUP_ATTEMPTS {
                    return Err(KvsError::backend(
                        Operation::Get,
                        Some(&key),
                        format!("lookup still deferred after {} attempts", attempts),
                    ));
                }
                continue;
            }
            break response;
        };

        let Some(found) = response.found.into_iter().next() else {
            return Err(KvsError::KeyNotFound { key });
        };
        let value = found
            .entity
            .properties
            .get(VALUE_FIELD)
            .and_then(|property| property.get("stringValue"))
            .and_then(Value::as_str);
        match value {
            Some(value) => Ok(value.to_owned()),
            None => Err(KvsError::Decode {
                key: Some(key),
                detail: format!("entity has no string '{}' property", VALUE_FIELD),
            }),
        }
    }

    fn delete(&mut self, key: String) -> Result<()> {
        let mutation = json!({ "delete": self.entity_key(&key) });
        self.commit(Operation::Delete, &key, mutation)
    }

    /// Pages through a keys-only query of the kind, one round trip per page.
    /// Entities identified by a numeric id have no key name and are skipped.
    fn keys(&mut self) -> Result<Keys<'_>> {
        Ok(Box::new(KeyPages {
            engine: self,
            buffered: VecDeque::new(),
            cursor: None,
            done: false,
        }))
    }
}

struct KeyPages<'a> {
    engine: &'a DatastoreKvsEngine,
    buffered: VecDeque<String>,
    cursor: Option<String>,
    done: bool,
}

impl KeyPages<'_> {
    fn fetch(&mut self) -> Result<()> {
        let engine = self.engine;
        let mut query = json!({
            "kind": [{ "name": engine.kind }],
            "projection": [{ "property": { "name": "__key__" } }],
            "limit": engine.page_size,
        });
        if let Some(cursor) = &self.cursor {
            query["startCursor"] = json!(cursor);
        }
        let body = json!({
            "partitionId": { "projectId": engine.project_id },
            "query": query,
        });
        let raw = engine.call(Operation::Keys, None, "runQuery", body)?;
        let response: RunQueryResponse = parse(Operation::Keys, None, raw)?;
        let batch = response.batch;

        let received = batch.entity_results.len();
        let before = self.buffered.len();
        self.buffered.extend(
            batch
                .entity_results
                .into_iter()
                .filter_map(|result| result.entity.key.name()),
        );
        let skipped = received - (self.buffered.len() - before);
        if skipped > 0 {
            debug!("skipped {} id-keyed entities of kind {}", skipped, engine.kind);
        }

        let exhausted = batch.more_results == "NO_MORE_RESULTS"
            || (received == 0 && batch.more_results != "NOT_FINISHED");
        match batch.end_cursor {
            Some(cursor) if !exhausted => self.cursor = Some(cursor),
            _ => self.done = true,
        }
        Ok(())
    }
}

impl Iterator for KeyPages<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(key) = self.buffered.pop_front() {
                return Some(Ok(key));
            }
            if self.done {
                return None;
            }
            if let Err(e) = self.fetch() {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::{BTreeMap, HashSet};
    use std::rc::Rc;

    /// The path element of an entity: a key name or a numeric id.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
    enum Ident {
        Name(String),
        Id(i64),
    }

    #[derive(Default)]
    struct FakeState {
        entities: BTreeMap<(String, Ident), Value>,
        calls: Vec<String>,
    }

    /// An in-memory datastore that understands the requests this engine sends.
    #[derive(Clone, Default)]
    struct FakeDatastore(Rc<RefCell<FakeState>>);

    fn ident_of(key: &Value) -> (String, Ident) {
        let element = &key["path"][0];
        let kind = element["kind"].as_str().unwrap().to_owned();
        let ident = match element["name"].as_str() {
            Some(name) => Ident::Name(name.to_owned()),
            None => Ident::Id(element["id"].as_str().unwrap().parse().unwrap()),
        };
        (kind, ident)
    }

    fn key_json(kind: &str, ident: &Ident) -> Value {
        match ident {
            Ident::Name(name) => json!({ "path": [{ "kind": kind, "name": name }] }),
            Ident::Id(id) => json!({ "path": [{ "kind": kind, "id": id.to_string() }] }),
        }
    }

    impl FakeDatastore {
        fn insert_with_id(&self, kind: &str, id: i64, value: &str) {
            self.0.borrow_mut().entities.insert(
                (kind.to_owned(), Ident::Id(id)),
                json!({ VALUE_FIELD: { "stringValue": value } }),
            );
        }

        fn calls(&self, method: &str) -> usize {
            self.0.borrow().calls.iter().filter(|m| *m == method).count()
        }
    }

    impl Transport for FakeDatastore {
        fn call(
            &self,
            project_id: &str,
            method: &str,
            body: &Value,
        ) -> std::result::Result<Value, BackendError> {
            assert_eq!(project_id, "test-project");
            let mut state = self.0.borrow_mut();
            state.calls.push(method.to_owned());
            match method {
                "lookup" => {
                    let id = ident_of(&body["keys"][0]);
                    let found: Vec<Value> = state
                        .entities
                        .get(&id)
                        .map(|props| {
                            json!({ "entity": { "key": key_json(&id.0, &id.1), "properties": props } })
                        })
                        .into_iter()
                        .collect();
                    Ok(json!({ "found": found }))
                }
                "commit" => {
                    let mutation = &body["mutations"][0];
                    if let Some(upsert) = mutation.get("upsert") {
                        let id = ident_of(&upsert["key"]);
                        state.entities.insert(id, upsert["properties"].clone());
                    } else {
                        let id = ident_of(&mutation["delete"]);
                        state.entities.remove(&id);
                    }
                    Ok(json!({}))
                }
                "runQuery" => {
                    let query = &body["query"];
                    let kind = query["kind"][0]["name"].as_str().unwrap();
                    let limit = query["limit"].as_u64().unwrap() as usize;
                    let start: usize = query["startCursor"]
                        .as_str()
                        .map(|c| c.parse().unwrap())
                        .unwrap_or(0);
                    let all: Vec<Value> = state
                        .entities
                        .keys()
                        .filter(|(k, _)| k == kind)
                        .map(|(k, ident)| json!({ "entity": { "key": key_json(k, ident) } }))
                        .collect();
                    let page: Vec<Value> = all.iter().skip(start).take(limit).cloned().collect();
                    let end = start + page.len();
                    let more = if end < all.len() {
                        "MORE_RESULTS_AFTER_LIMIT"
                    } else {
                        "NO_MORE_RESULTS"
                    };
                    Ok(json!({
                        "batch": {
                            "entityResultType": "KEY_ONLY",
                            "entityResults": page,
                            "endCursor": end.to_string(),
                            "moreResults": more,
                        }
                    }))
                }
                other => Err(format!("unexpected method {}", other).into()),
            }
        }
    }

    fn engine(kind: &str, page_size: u32) -> (DatastoreKvsEngine, FakeDatastore) {
        let fake = FakeDatastore::default();
        let engine =
            DatastoreKvsEngine::with_transport(kind, "test-project", page_size, fake.clone());
        (engine, fake)
    }

    fn key_set(engine: &mut DatastoreKvsEngine) -> HashSet<String> {
        engine.keys().unwrap().collect::<Result<_>>().unwrap()
    }

    #[test]
    fn put_get_overwrite_delete() {
        let (mut store, _) = engine("task", 10);
        store.put("user:1".to_owned(), "alice".to_owned()).unwrap();
        assert_eq!(store.get("user:1".to_owned()).unwrap(), "alice");

        store.put("user:1".to_owned(), "bob".to_owned()).unwrap();
        assert_eq!(store.get("user:1".to_owned()).unwrap(), "bob");

        store.delete("user:1".to_owned()).unwrap();
        assert!(store.get("user:1".to_owned()).unwrap_err().is_key_not_found());
        store.delete("user:1".to_owned()).unwrap();
    }

    #[test]
    fn missing_key_is_key_not_found() {
        let (mut store, _) = engine("task", 10);
        match store.get("nope".to_owned()) {
            Err(KvsError::KeyNotFound { key }) => assert_eq!(key, "nope"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn keys_skip_entities_without_a_name() {
        let (mut store, fake) = engine("task", 10);
        store.put("a".to_owned(), "1".to_owned()).unwrap();
        store.put("b".to_owned(), "2".to_owned()).unwrap();
        fake.insert_with_id("task", 5629499534213120, "anonymous");

        let keys = key_set(&mut store);
        assert_eq!(keys, ["a", "b"].iter().map(|s| s.to_string()).collect());
    }

    #[test]
    fn keys_are_scoped_to_the_kind() {
        let (mut tasks, fake) = engine("task", 10);
        let mut notes = DatastoreKvsEngine::with_transport("note", "test-project", 10, fake);
        tasks.put("t".to_owned(), "1".to_owned()).unwrap();
        notes.put("n".to_owned(), "2".to_owned()).unwrap();

        assert_eq!(key_set(&mut tasks), HashSet::from(["t".to_owned()]));
        assert_eq!(key_set(&mut notes), HashSet::from(["n".to_owned()]));
    }

    #[test]
    fn keys_page_lazily_through_cursors() {
        let (mut store, fake) = engine("task", 2);
        for i in 0..5 {
            store.put(format!("k{}", i), "v".to_owned()).unwrap();
        }

        let mut keys = store.keys().unwrap();
        assert!(keys.next().is_some());
        drop(keys);
        assert_eq!(fake.calls("runQuery"), 1);

        let all = key_set(&mut store);
        assert_eq!(all.len(), 5);
        assert_eq!(fake.calls("runQuery"), 4);
    }

    #[test]
    fn keys_are_names_not_values() {
        let (mut store, _) = engine("task", 10);
        store.put("name".to_owned(), "payload".to_owned()).unwrap();
        assert_eq!(key_set(&mut store), HashSet::from(["name".to_owned()]));
    }

    #[test]
    fn non_string_value_is_a_decode_error() {
        let (mut store, fake) = engine("task", 10);
        fake.0.borrow_mut().entities.insert(
            ("task".to_owned(), Ident::Name("n".to_owned())),
            json!({ VALUE_FIELD: { "integerValue": "7" } }),
        );
        let err = store.get("n".to_owned()).unwrap_err();
        assert!(matches!(err, KvsError::Decode { .. }));
    }

    #[test]
    fn lookup_gives_up_when_always_deferred() {
        #[derive(Clone, Default)]
        struct AlwaysDeferred(Rc<RefCell<usize>>);
        impl Transport for AlwaysDeferred {
            fn call(&self, _: &str, _: &str, body: &Value) -> std::result::Result<Value, BackendError> {
                *self.0.borrow_mut() += 1;
                Ok(json!({ "deferred": body["keys"].clone() }))
            }
        }
        let transport = AlwaysDeferred::default();
        let mut store = DatastoreKvsEngine::with_transport("task", "p", 10, transport.clone());
        match store.get("k".to_owned()) {
            Err(KvsError::Backend { op, key, .. }) => {
                assert_eq!(op, Operation::Get);
                assert_eq!(key.as_deref(), Some("k"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(*transport.0.borrow(), MAX_LOOKUP_ATTEMPTS);
    }

    #[test]
    fn transport_errors_carry_the_operation_and_key() {
        struct Down;
        impl Transport for Down {
            fn call(&self, _: &str, _: &str, _: &Value) -> std::result::Result<Value, BackendError> {
                Err("connection refused".into())
            }
        }
        let mut store = DatastoreKvsEngine::with_transport("task", "p", 10, Down);
        match store.put("k".to_owned(), "v".to_owned()) {
            Err(KvsError::Backend { op, key, .. }) => {
                assert_eq!(op, Operation::Put);
                assert_eq!(key.as_deref(), Some("k"));
            }
            other => panic!("unexpected {:?}", other),
        }
        let first = store.keys().unwrap().next().unwrap();
        assert!(matches!(
            first,
            Err(KvsError::Backend {
                op: Operation::Keys,
                ..
            })
        ));
    }

    #[test]
    fn entity_key_name_ignores_numeric_ids() {
        let named: EntityKey =
            serde_json::from_value(json!({ "path": [{ "kind": "task", "name": "x" }] })).unwrap();
        assert_eq!(named.name().as_deref(), Some("x"));
        let numbered: EntityKey =
            serde_json::from_value(json!({ "path": [{ "kind": "task", "id": "42" }] })).unwrap();
        assert_eq!(numbered.name(), None);
    }
}
