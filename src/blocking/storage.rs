use crate::error::{ErrorCode, Result, SyncError};
use crate::namespace::Namespace;
use crate::optime::OpTimeWithHash;
use crate::storage::{CollectionBulkLoader, CollectionOptions, StorageInterface};
use crate::OPLOG_DB;
use bson::{doc, Bson, Document};
use mongodb::error::ErrorKind;
use mongodb::options::UpdateOptions;
use mongodb::sync::{Client, Collection};
use tracing::{debug, info};

/// collection holding the durable initial sync flag and the applied-through position.
const MIN_VALID_COLL: &str = "replset.minvalid";
const INITIAL_SYNC_FLAG_KEY: &str = "doingInitialSync";
const APPLIED_THROUGH_KEY: &str = "begin";
/// documents sent by one `insert_many` of a bulk loader.
const BULK_INSERT_BATCH: usize = 1000;

/// [StorageInterface] writing to the local node through the mongodb driver.
#[derive(Clone)]
pub struct MongoStorage {
    client: Client,
    oplog_size_bytes: i64,
}

impl MongoStorage {
    pub fn new(uri: &str, oplog_size_bytes: i64) -> Result<Self> {
        Ok(MongoStorage {
            client: Client::with_uri_str(uri)?,
            oplog_size_bytes,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn collection(&self, nss: &Namespace) -> Collection<Document> {
        self.client.database(nss.db()).collection(nss.coll())
    }

    fn min_valid(&self) -> Collection<Document> {
        self.client.database(OPLOG_DB).collection(MIN_VALID_COLL)
    }

    fn run_create(&self, nss: &Namespace, options: &Document) -> Result<()> {
        let mut cmd = doc! {"create": nss.coll()};
        for (key, value) in options {
            cmd.insert(key.clone(), value.clone());
        }
        self.client.database(nss.db()).run_command(cmd, None)?;
        Ok(())
    }

    fn update_min_valid(&self, update: Document) -> Result<()> {
        let options = UpdateOptions::builder().upsert(true).build();
        self.min_valid().update_one(doc! {}, update, options)?;
        Ok(())
    }
}

fn insert_in_batches(coll: &Collection<Document>, docs: &[Document]) -> Result<()> {
    for chunk in docs.chunks(BULK_INSERT_BATCH) {
        coll.insert_many(chunk.to_vec(), None)?;
    }
    Ok(())
}

impl StorageInterface for MongoStorage {
    fn create_collection_for_bulk_loading(
        &self,
        nss: &Namespace,
        options: &CollectionOptions,
        id_index_spec: Option<Document>,
        secondary_index_specs: Vec<Document>,
    ) -> Result<Box<dyn CollectionBulkLoader>> {
        let mut create_options = options.as_document().clone();
        if id_index_spec.is_none() {
            create_options.insert("autoIndexId", false);
        }
        self.run_create(nss, &create_options)?;
        debug!(%nss, indexes = secondary_index_specs.len(), "Created collection for bulk loading.");
        let deferred_id_index_spec = id_index_spec.filter(|_| !options.auto_index_id());
        Ok(Box::new(MongoBulkLoader {
            client: self.client.clone(),
            nss: nss.clone(),
            pending: vec![],
            deferred_id_index_spec,
            secondary_index_specs,
        }))
    }

    fn create_collection(&self, nss: &Namespace, options: &CollectionOptions) -> Result<()> {
        self.run_create(nss, options.as_document())
    }

    fn create_oplog(&self, nss: &Namespace) -> Result<()> {
        info!(%nss, size = self.oplog_size_bytes, "Creating the oplog.");
        self.run_create(nss, &doc! {"capped": true, "size": self.oplog_size_bytes})
    }

    fn drop_collection(&self, nss: &Namespace) -> Result<()> {
        let result = self
            .client
            .database(nss.db())
            .run_command(doc! {"drop": nss.coll()}, None);
        match result {
            Ok(_) => Ok(()),
            Err(e) => match e.kind.as_ref() {
                ErrorKind::Command(cmd_err)
                    if ErrorCode::from_i32(cmd_err.code) == ErrorCode::NamespaceNotFound =>
                {
                    Ok(())
                }
                _ => Err(SyncError::from(e)),
            },
        }
    }

    fn drop_replicated_databases(&self) -> Result<()> {
        for name in self.client.list_database_names(None, None)? {
            if name == OPLOG_DB {
                continue;
            }
            info!(db = %name, "Dropping replicated database.");
            self.client.database(&name).drop(None)?;
        }
        Ok(())
    }

    fn insert_documents(&self, nss: &Namespace, docs: &[Document]) -> Result<()> {
        insert_in_batches(&self.collection(nss), docs)
    }

    fn set_initial_sync_flag(&self) -> Result<()> {
        self.update_min_valid(doc! {"$set": {INITIAL_SYNC_FLAG_KEY: true}})
    }

    fn clear_initial_sync_flag(&self) -> Result<()> {
        self.update_min_valid(doc! {"$unset": {INITIAL_SYNC_FLAG_KEY: 1}})
    }

    fn set_applied_through(&self, optime: &OpTimeWithHash) -> Result<()> {
        self.update_min_valid(doc! {"$set": {APPLIED_THROUGH_KEY: Bson::Document(optime.to_document())}})
    }
}

/// Buffer documents of one collection and build its secondary indexes on commit.
struct MongoBulkLoader {
    client: Client,
    nss: Namespace,
    pending: Vec<Document>,
    /// `_id` index of an `autoIndexId: false` collection, built with the secondary indexes.
    deferred_id_index_spec: Option<Document>,
    secondary_index_specs: Vec<Document>,
}

impl MongoBulkLoader {
    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let coll = self.client.database(self.nss.db()).collection(self.nss.coll());
        let docs: Vec<Document> = self.pending.drain(..).collect();
        insert_in_batches(&coll, &docs)
    }
}

impl CollectionBulkLoader for MongoBulkLoader {
    fn insert_documents(&mut self, docs: &[Document]) -> Result<()> {
        self.pending.extend_from_slice(docs);
        if self.pending.len() >= BULK_INSERT_BATCH {
            self.flush()?;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.flush()?;
        if self.deferred_id_index_spec.is_none() && self.secondary_index_specs.is_empty() {
            return Ok(());
        }
        let indexes: Vec<Bson> = self
            .deferred_id_index_spec
            .iter()
            .chain(self.secondary_index_specs.iter())
            .map(|spec| {
                let mut spec = spec.clone();
                spec.remove("ns");
                Bson::Document(spec)
            })
            .collect();
        info!(nss = %self.nss, count = indexes.len(), "Building indexes.");
        self.client.database(self.nss.db()).run_command(
            doc! {"createIndexes": self.nss.coll(), "indexes": indexes},
            None,
        )?;
        Ok(())
    }
}
