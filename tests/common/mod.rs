#![allow(dead_code)]

use bson::{doc, Bson, Document, Timestamp};
use mongo_initial_sync::applier::{AppliedBatch, OplogApplier};
use mongo_initial_sync::executor::{Event, RemoteCommandRequest, RemoteCommandRunner};
use mongo_initial_sync::{
    CollectionBulkLoader, CollectionOptions, DataReplicatorOptions, ErrorCode, Namespace,
    OpTimeWithHash, Result, StorageInterface, SyncError, TaskExecutor,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const SOURCE: &str = "source:27017";

/// Oplog entry with timestamp `time`, hash `time` and an insert into `ns`.
pub fn oplog_insert(time: u32, ns: &str, id: i32) -> Document {
    doc! {
        "ts": Timestamp { time, increment: 1 },
        "h": time as i64,
        "v": 2,
        "op": "i",
        "ns": ns,
        "o": {"_id": id},
    }
}

pub fn oplog_noop(time: u32) -> Document {
    doc! {
        "ts": Timestamp { time, increment: 1 },
        "h": time as i64,
        "v": 2,
        "op": "n",
        "ns": "",
        "o": {"msg": "periodic noop"},
    }
}

pub fn optime(time: u32) -> OpTimeWithHash {
    OpTimeWithHash::new(Timestamp { time, increment: 1 }, time as i64)
}

/// Poll `cond` until it holds, panics after 10 seconds.
pub fn wait_until<F: Fn() -> bool>(cond: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

/// How an injected failure shows up.
#[derive(Debug, Clone, Copy)]
pub enum FakeFailure {
    /// the command never reached the server.
    Transport(ErrorCode),
    /// `{ok: 0, code}` reply.
    Reply(ErrorCode),
}

/// Side effect applied the first time a command is served.
pub enum Trigger {
    AppendOplog(Vec<Document>),
    SetRbid(i64),
}

#[derive(Debug, Clone, Default)]
pub struct FakeCollection {
    pub options: Document,
    pub indexes: Vec<Document>,
    pub docs: Vec<Document>,
    /// reply of `count` instead of the number of documents.
    pub count: Option<i64>,
}

impl FakeCollection {
    pub fn with_docs(docs: Vec<Document>) -> Self {
        FakeCollection {
            indexes: vec![doc! {"v": 2, "key": {"_id": 1}, "name": "_id_"}],
            docs,
            ..Default::default()
        }
    }
}

enum Cursor {
    Data(String, VecDeque<Document>),
    Oplog(String, Timestamp),
}

#[derive(Default)]
struct FakeState {
    databases: BTreeMap<String, BTreeMap<String, FakeCollection>>,
    oplog: Vec<Document>,
    /// oplog cursors report id 0 once they returned this entry.
    oplog_end: Option<Timestamp>,
    cursors: HashMap<i64, Cursor>,
    failures: Vec<(String, FakeFailure)>,
    triggers: Vec<(String, Trigger)>,
    replies: Vec<(String, Document)>,
    blocked: Option<(String, Arc<Event>)>,
}

/// In memory sync source answering the commands of initial sync.
pub struct FakeSyncSource {
    state: Mutex<FakeState>,
    log: Mutex<Vec<Document>>,
    rbid: AtomicI64,
    next_cursor: AtomicI64,
    batch_size: usize,
}

impl FakeSyncSource {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeSyncSource {
            state: Mutex::new(FakeState::default()),
            log: Mutex::new(vec![]),
            rbid: AtomicI64::new(1),
            next_cursor: AtomicI64::new(100),
            batch_size: 2,
        })
    }

    pub fn add_collection(&self, db: &str, coll: &str, collection: FakeCollection) {
        self.state
            .lock()
            .unwrap()
            .databases
            .entry(db.to_string())
            .or_default()
            .insert(coll.to_string(), collection);
    }

    pub fn add_database(&self, db: &str) {
        self.state
            .lock()
            .unwrap()
            .databases
            .entry(db.to_string())
            .or_default();
    }

    pub fn append_oplog(&self, entries: Vec<Document>) {
        self.state.lock().unwrap().oplog.extend(entries);
    }

    pub fn close_oplog_cursors_at(&self, ts: Timestamp) {
        self.state.lock().unwrap().oplog_end = Some(ts);
    }

    /// Fail the next command named `name`, failures of one name are consumed in order.
    pub fn fail_next(&self, name: &str, failure: FakeFailure) {
        self.state
            .lock()
            .unwrap()
            .failures
            .push((name.to_string(), failure));
    }

    /// Answer the next command named `name` with `reply`, ahead of injected failures.
    pub fn script_reply(&self, name: &str, reply: Document) {
        self.state
            .lock()
            .unwrap()
            .replies
            .push((name.to_string(), reply));
    }

    pub fn on_first(&self, name: &str, trigger: Trigger) {
        self.state
            .lock()
            .unwrap()
            .triggers
            .push((name.to_string(), trigger));
    }

    /// Hold every `name` command until the returned event is signaled.
    pub fn block(&self, name: &str) -> Arc<Event> {
        let event = Arc::new(Event::new());
        self.state.lock().unwrap().blocked = Some((name.to_string(), event.clone()));
        event
    }

    /// every command received so far, in order.
    pub fn commands(&self) -> Vec<Document> {
        self.log.lock().unwrap().clone()
    }

    pub fn commands_named(&self, name: &str) -> Vec<Document> {
        self.commands()
            .into_iter()
            .filter(|cmd| cmd.keys().next().map(|k| k.as_str()) == Some(name))
            .collect()
    }

    fn next_cursor_id(&self) -> i64 {
        self.next_cursor.fetch_add(1, Ordering::SeqCst)
    }

    fn serve(&self, db: &str, cmd: &Document) -> Result<Document> {
        let name = cmd.keys().next().cloned().unwrap_or_default();
        let blocked = {
            let state = self.state.lock().unwrap();
            match &state.blocked {
                Some((blocked, event)) if *blocked == name => Some(event.clone()),
                _ => None,
            }
        };
        if let Some(event) = blocked {
            event.wait();
        }

        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.replies.iter().position(|(n, _)| *n == name) {
            return Ok(state.replies.remove(pos).1);
        }
        if let Some(pos) = state.failures.iter().position(|(n, _)| *n == name) {
            let (_, failure) = state.failures.remove(pos);
            return match failure {
                FakeFailure::Transport(code) => Err(SyncError::new(code, "injected failure")),
                FakeFailure::Reply(code) => Ok(doc! {
                    "ok": 0,
                    "code": code.as_i32(),
                    "errmsg": "injected failure",
                }),
            };
        }
        if let Some(pos) = state.triggers.iter().position(|(n, _)| *n == name) {
            match state.triggers.remove(pos).1 {
                Trigger::AppendOplog(entries) => state.oplog.extend(entries),
                Trigger::SetRbid(rbid) => self.rbid.store(rbid, Ordering::SeqCst),
            }
        }

        let reply = match name.as_str() {
            "listDatabases" => {
                let databases: Vec<Bson> = state
                    .databases
                    .keys()
                    .map(|name| Bson::Document(doc! {"name": name.clone(), "sizeOnDisk": 1.0}))
                    .collect();
                doc! {"databases": databases, "ok": 1}
            }
            "replSetGetRBID" => doc! {"rbid": self.rbid.load(Ordering::SeqCst), "ok": 1},
            "listCollections" => {
                let infos: Vec<Bson> = state
                    .databases
                    .get(db)
                    .map(|colls| {
                        colls
                            .iter()
                            .map(|(name, c)| {
                                Bson::Document(doc! {"name": name.clone(), "options": c.options.clone()})
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                cursor_reply(0, &format!("{}.$cmd.listCollections", db), infos, true)
            }
            "count" => {
                let coll = cmd.get_str("count").unwrap_or_default();
                let n = state
                    .databases
                    .get(db)
                    .and_then(|colls| colls.get(coll))
                    .map(|c| c.count.unwrap_or(c.docs.len() as i64))
                    .unwrap_or(0);
                doc! {"n": n, "ok": 1}
            }
            "listIndexes" => {
                let coll = cmd.get_str("listIndexes").unwrap_or_default();
                match state.databases.get(db).and_then(|colls| colls.get(coll)) {
                    Some(c) => {
                        let indexes: Vec<Bson> =
                            c.indexes.iter().cloned().map(Bson::Document).collect();
                        cursor_reply(0, &format!("{}.{}", db, coll), indexes, true)
                    }
                    None => doc! {"ok": 0, "code": 26, "errmsg": "ns does not exist"},
                }
            }
            "find" => self.find(&mut state, db, cmd),
            "getMore" => self.get_more(&mut state, cmd),
            "killCursors" => {
                if let Ok(ids) = cmd.get_array("cursors") {
                    for id in ids {
                        if let Bson::Int64(id) = id {
                            state.cursors.remove(id);
                        }
                    }
                }
                doc! {"ok": 1}
            }
            _ => doc! {"ok": 0, "code": 59, "errmsg": "no such command"},
        };
        Ok(reply)
    }

    fn find(&self, state: &mut FakeState, db: &str, cmd: &Document) -> Document {
        let coll = cmd.get_str("find").unwrap_or_default().to_string();
        let ns = format!("{}.{}", db, coll);
        if ns == "local.oplog.rs" {
            if cmd.get_document("sort").is_ok() {
                let newest: Vec<Bson> = state
                    .oplog
                    .last()
                    .cloned()
                    .map(Bson::Document)
                    .into_iter()
                    .collect();
                return cursor_reply(0, &ns, newest, true);
            }
            let from = cmd
                .get_document("filter")
                .and_then(|f| f.get_document("ts"))
                .and_then(|ts| ts.get_timestamp("$gte"))
                .unwrap_or(Timestamp { time: 0, increment: 0 });
            let batch: Vec<Document> = state
                .oplog
                .iter()
                .filter(|e| e.get_timestamp("ts").map(|ts| ts >= from).unwrap_or(false))
                .cloned()
                .collect();
            return self.oplog_batch(state, &ns, None, batch, true);
        }

        let docs: VecDeque<Document> = state
            .databases
            .get(db)
            .and_then(|colls| colls.get(&coll))
            .map(|c| c.docs.iter().cloned().collect())
            .unwrap_or_default();
        let id = self.next_cursor_id();
        state.cursors.insert(id, Cursor::Data(ns, docs));
        self.data_batch(state, id, true)
    }

    fn get_more(&self, state: &mut FakeState, cmd: &Document) -> Document {
        let id = cmd.get_i64("getMore").unwrap_or_default();
        match state.cursors.get(&id) {
            Some(Cursor::Data(..)) => self.data_batch(state, id, false),
            Some(Cursor::Oplog(ns, last)) => {
                let (ns, last) = (ns.clone(), *last);
                let batch: Vec<Document> = state
                    .oplog
                    .iter()
                    .filter(|e| e.get_timestamp("ts").map(|ts| ts > last).unwrap_or(false))
                    .cloned()
                    .collect();
                if batch.is_empty() {
                    // awaitData
                    thread::sleep(Duration::from_millis(5));
                }
                self.oplog_batch(state, &ns, Some(id), batch, false)
            }
            None => doc! {"ok": 0, "code": 43, "errmsg": "cursor id not found"},
        }
    }

    fn data_batch(&self, state: &mut FakeState, id: i64, first: bool) -> Document {
        let (ns, batch, exhausted) = match state.cursors.get_mut(&id) {
            Some(Cursor::Data(ns, docs)) => {
                let take = self.batch_size.min(docs.len());
                let batch: Vec<Bson> = docs.drain(..take).map(Bson::Document).collect();
                (ns.clone(), batch, docs.is_empty())
            }
            _ => return doc! {"ok": 0, "code": 43, "errmsg": "cursor id not found"},
        };
        if exhausted {
            state.cursors.remove(&id);
            cursor_reply(0, &ns, batch, first)
        } else {
            cursor_reply(id, &ns, batch, first)
        }
    }

    fn oplog_batch(
        &self,
        state: &mut FakeState,
        ns: &str,
        id: Option<i64>,
        batch: Vec<Document>,
        first: bool,
    ) -> Document {
        let last = batch.last().and_then(|e| e.get_timestamp("ts").ok());
        let closed = match (state.oplog_end, last) {
            (Some(end), Some(last)) => last >= end,
            _ => false,
        };
        let docs: Vec<Bson> = batch.into_iter().map(Bson::Document).collect();
        if closed {
            if let Some(id) = id {
                state.cursors.remove(&id);
            }
            return cursor_reply(0, ns, docs, first);
        }
        let id = id.unwrap_or_else(|| self.next_cursor_id());
        let previous = match state.cursors.get(&id) {
            Some(Cursor::Oplog(_, ts)) => *ts,
            _ => Timestamp { time: 0, increment: 0 },
        };
        state
            .cursors
            .insert(id, Cursor::Oplog(ns.to_string(), last.unwrap_or(previous)));
        cursor_reply(id, ns, docs, first)
    }
}

fn cursor_reply(id: i64, ns: &str, docs: Vec<Bson>, first: bool) -> Document {
    let batch_key = if first { "firstBatch" } else { "nextBatch" };
    doc! {
        "cursor": {"id": id, "ns": ns, batch_key: docs},
        "ok": 1,
    }
}

impl RemoteCommandRunner for FakeSyncSource {
    fn run_command(&self, request: &RemoteCommandRequest) -> Result<Document> {
        self.log.lock().unwrap().push(request.cmd.clone());
        self.serve(&request.db_name, &request.cmd)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCollection {
    pub options: Document,
    pub docs: Vec<Document>,
    pub id_index: Option<Document>,
    pub indexes: Vec<Document>,
    pub committed: bool,
}

#[derive(Default)]
pub struct MemoryState {
    pub collections: BTreeMap<Namespace, MemoryCollection>,
    pub initial_sync_flag: bool,
    pub applied_through: Option<OpTimeWithHash>,
    pub bulk_loaders_created: usize,
    pub dropped_databases: usize,
}

/// In memory [StorageInterface].
#[derive(Default)]
pub struct MemoryStorage {
    pub state: Arc<Mutex<MemoryState>>,
}

impl MemoryStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryStorage::default())
    }

    pub fn collection(&self, nss: &Namespace) -> Option<MemoryCollection> {
        self.state.lock().unwrap().collections.get(nss).cloned()
    }

    pub fn oplog(&self) -> Vec<Document> {
        self.collection(&Namespace::oplog())
            .map(|c| c.docs)
            .unwrap_or_default()
    }
}

struct MemoryBulkLoader {
    state: Arc<Mutex<MemoryState>>,
    nss: Namespace,
}

impl CollectionBulkLoader for MemoryBulkLoader {
    fn insert_documents(&mut self, docs: &[Document]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let coll = state.collections.entry(self.nss.clone()).or_default();
        coll.docs.extend_from_slice(docs);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.collections.entry(self.nss.clone()).or_default().committed = true;
        Ok(())
    }
}

impl StorageInterface for MemoryStorage {
    fn create_collection_for_bulk_loading(
        &self,
        nss: &Namespace,
        options: &CollectionOptions,
        id_index_spec: Option<Document>,
        secondary_index_specs: Vec<Document>,
    ) -> Result<Box<dyn CollectionBulkLoader>> {
        let mut state = self.state.lock().unwrap();
        if state.collections.contains_key(nss) {
            return Err(SyncError::new(
                ErrorCode::Other(48),
                format!("collection {} already exists", nss),
            ));
        }
        state.bulk_loaders_created += 1;
        state.collections.insert(
            nss.clone(),
            MemoryCollection {
                options: options.as_document().clone(),
                id_index: id_index_spec,
                indexes: secondary_index_specs,
                ..Default::default()
            },
        );
        Ok(Box::new(MemoryBulkLoader {
            state: self.state.clone(),
            nss: nss.clone(),
        }))
    }

    fn create_collection(&self, nss: &Namespace, options: &CollectionOptions) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.collections.insert(
            nss.clone(),
            MemoryCollection {
                options: options.as_document().clone(),
                committed: true,
                ..Default::default()
            },
        );
        Ok(())
    }

    fn create_oplog(&self, nss: &Namespace) -> Result<()> {
        self.create_collection(nss, &CollectionOptions::default())
    }

    fn drop_collection(&self, nss: &Namespace) -> Result<()> {
        self.state.lock().unwrap().collections.remove(nss);
        Ok(())
    }

    fn drop_replicated_databases(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.collections.retain(|nss, _| nss.db() == "local");
        state.dropped_databases += 1;
        Ok(())
    }

    fn insert_documents(&self, nss: &Namespace, docs: &[Document]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.collections.get_mut(nss) {
            Some(coll) => {
                coll.docs.extend_from_slice(docs);
                Ok(())
            }
            None => Err(SyncError::new(
                ErrorCode::NamespaceNotFound,
                format!("{} does not exist", nss),
            )),
        }
    }

    fn set_initial_sync_flag(&self) -> Result<()> {
        self.state.lock().unwrap().initial_sync_flag = true;
        Ok(())
    }

    fn clear_initial_sync_flag(&self) -> Result<()> {
        self.state.lock().unwrap().initial_sync_flag = false;
        Ok(())
    }

    fn set_applied_through(&self, optime: &OpTimeWithHash) -> Result<()> {
        self.state.lock().unwrap().applied_through = Some(*optime);
        Ok(())
    }
}

/// Applier recording batches and appending them to the local oplog of a [MemoryStorage].
pub struct MockApplier {
    storage: Arc<MemoryStorage>,
    pub batches: Mutex<Vec<Vec<Document>>>,
    failures_left: AtomicUsize,
}

impl MockApplier {
    pub fn new(storage: Arc<MemoryStorage>) -> Arc<Self> {
        Arc::new(MockApplier {
            storage,
            batches: Mutex::new(vec![]),
            failures_left: AtomicUsize::new(0),
        })
    }

    /// Fail the next `count` batches with `OperationFailed`.
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn applied(&self) -> Vec<Vec<Document>> {
        self.batches.lock().unwrap().clone()
    }
}

impl OplogApplier for MockApplier {
    fn apply_batch(&self, ops: &[Document]) -> Result<AppliedBatch> {
        let failures_left = self.failures_left.load(Ordering::SeqCst);
        if failures_left > 0 {
            self.failures_left.store(failures_left - 1, Ordering::SeqCst);
            return Err(SyncError::new(ErrorCode::OperationFailed, "injected apply failure"));
        }
        self.batches.lock().unwrap().push(ops.to_vec());
        self.storage.insert_documents(&Namespace::oplog(), ops)?;
        let last = ops.last().ok_or_else(|| SyncError::new(ErrorCode::BadValue, "empty batch"))?;
        Ok(AppliedBatch {
            last_applied: OpTimeWithHash::from_oplog_entry(last)?,
            fetched_missing_docs: 0,
        })
    }
}

/// Shared fixture of integration tests.
pub struct Context {
    pub source: Arc<FakeSyncSource>,
    pub storage: Arc<MemoryStorage>,
    pub applier: Arc<MockApplier>,
    pub executor: TaskExecutor,
}

impl Context {
    pub fn new() -> Self {
        let source = FakeSyncSource::new();
        let storage = MemoryStorage::new();
        let applier = MockApplier::new(storage.clone());
        let executor = TaskExecutor::new(4, source.clone()).unwrap();
        Context {
            source,
            storage,
            applier,
            executor,
        }
    }

    /// options with short waits.
    pub fn replicator_options(&self) -> DataReplicatorOptions {
        DataReplicatorOptions {
            initial_sync_retry_wait: Duration::from_millis(10),
            sync_source_retry_wait: Duration::from_millis(10),
            num_connect_attempts: 2,
            apply_poll_interval: Duration::from_millis(10),
            ..DataReplicatorOptions::default()
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.executor.shutdown();
    }
}
