use super::oplog_bulk::execute_normal_oplogs;
use crate::applier::{must_apply_alone, AppliedBatch, OplogApplier};
use crate::cmd_oplog::CmdOplog;
use crate::error::{ErrorCode, Result, SyncError};
use crate::namespace::Namespace;
use crate::optime::OpTimeWithHash;
use crate::{COMMAND_OP, OP_KEY};
use bson::Document;
use mongodb::sync::Client;
use tracing::{debug, warn};

/// [OplogApplier] replaying entries on the local node through the mongodb driver.
///
/// Every applied batch is appended to the local oplog afterwards.
pub struct MongoOplogApplier {
    client: Client,
    local_oplog_ns: Namespace,
}

impl MongoOplogApplier {
    pub fn new(client: Client, local_oplog_ns: Namespace) -> Self {
        MongoOplogApplier {
            client,
            local_oplog_ns,
        }
    }

    fn apply_alone(&self, entry: &Document) -> Result<()> {
        let cmd = if entry.get_str(OP_KEY)? == COMMAND_OP {
            CmdOplog::from_oplog_doc(entry)?
        } else {
            Some(CmdOplog::from_index_insert(entry)?)
        };
        match cmd {
            Some(cmd) => cmd.apply(&self.client),
            None => {
                warn!(?entry, "Skipping command oplog.");
                Ok(())
            }
        }
    }
}

impl OplogApplier for MongoOplogApplier {
    fn apply_batch(&self, ops: &[Document]) -> Result<AppliedBatch> {
        let last = ops.last().ok_or_else(|| {
            SyncError::new(ErrorCode::IllegalOperation, "cannot apply an empty batch")
        })?;
        let last_applied = OpTimeWithHash::from_oplog_entry(last)?;

        match ops {
            [entry] if must_apply_alone(entry) => self.apply_alone(entry)?,
            _ => execute_normal_oplogs(ops, &self.client)?,
        }

        self.client
            .database(self.local_oplog_ns.db())
            .collection::<Document>(self.local_oplog_ns.coll())
            .insert_many(ops.to_vec(), None)?;
        debug!(count = ops.len(), %last_applied, "Applied oplog batch.");

        Ok(AppliedBatch {
            last_applied,
            fetched_missing_docs: 0,
        })
    }
}
