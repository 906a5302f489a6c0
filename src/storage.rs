//! Local storage consumed by initial sync.
//!
//! Every method is called from inside a task scheduled on the
//! [TaskExecutor](crate::executor::TaskExecutor), never from a network callback holding a lock.

use crate::error::{ErrorCode, Result, SyncError};
use crate::namespace::Namespace;
use crate::optime::OpTimeWithHash;
use bson::{Bson, Document};

/// Options of a collection as reported by `listCollections`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionOptions {
    options: Document,
}

impl CollectionOptions {
    /// Validate the `options` document of a `listCollections` entry.
    pub fn parse(options: &Document) -> Result<Self> {
        for key in ["autoIndexId", "capped"] {
            match options.get(key) {
                None | Some(Bson::Boolean(_)) => {}
                Some(other) => {
                    return Err(SyncError::new(
                        ErrorCode::BadValue,
                        format!("collection option `{}` must be a boolean, got {}", key, other),
                    ))
                }
            }
        }
        Ok(CollectionOptions {
            options: options.clone(),
        })
    }

    /// false only when the options say `autoIndexId: false`.
    pub fn auto_index_id(&self) -> bool {
        self.options.get_bool("autoIndexId").unwrap_or(true)
    }

    pub fn is_capped(&self) -> bool {
        self.options.get_bool("capped").unwrap_or(false)
    }

    pub fn as_document(&self) -> &Document {
        &self.options
    }
}

/// Receive the documents of one collection, created by
/// [StorageInterface::create_collection_for_bulk_loading].
pub trait CollectionBulkLoader: Send {
    fn insert_documents(&mut self, docs: &[Document]) -> Result<()>;

    /// Build indexes and make the collection visible, called once after the last batch.
    fn commit(&mut self) -> Result<()>;
}

pub trait StorageInterface: Send + Sync {
    /// Create `nss` and return a loader for its documents.
    ///
    /// `id_index_spec` is `None` when the source collection has no `_id` index. With
    /// `autoIndexId: false` in `options` the loader builds it on commit instead of at creation.
    fn create_collection_for_bulk_loading(
        &self,
        nss: &Namespace,
        options: &CollectionOptions,
        id_index_spec: Option<Document>,
        secondary_index_specs: Vec<Document>,
    ) -> Result<Box<dyn CollectionBulkLoader>>;

    fn create_collection(&self, nss: &Namespace, options: &CollectionOptions) -> Result<()>;

    fn create_oplog(&self, nss: &Namespace) -> Result<()>;

    fn drop_collection(&self, nss: &Namespace) -> Result<()>;

    /// Drop every database except `local`.
    fn drop_replicated_databases(&self) -> Result<()>;

    fn insert_documents(&self, nss: &Namespace, docs: &[Document]) -> Result<()>;

    fn set_initial_sync_flag(&self) -> Result<()>;

    fn clear_initial_sync_flag(&self) -> Result<()>;

    fn set_applied_through(&self, optime: &OpTimeWithHash) -> Result<()>;
}
