//! Provide something similar to oplog `bulkWrite` feature.

use crate::error::{ErrorCode, Result, SyncError};
use crate::namespace::Namespace;
use crate::{NAMESPACE_KEY, NOOP_OP, OP_KEY};
use bson::{doc, Bson, Document};
use mongodb::sync::Client as MongoClient;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Execute CRUD `oplogs` against `mongo_conn`, in order.
///
/// Inserts become upserts so replaying an entry twice is harmless. Noop entries are skipped,
/// callers never pass command entries.
pub fn execute_normal_oplogs(oplogs: &[Document], mongo_conn: &MongoClient) -> Result<()> {
    // mongo rust driver doesn't contains `bulkWrite` api, so `update` and `delete` commands
    // are built manually.
    let mut statements: Vec<(Namespace, Document)> = vec![];
    let mut current_op: Option<&str> = None;

    for one_log in oplogs {
        let op = one_log.get_str(OP_KEY)?;
        if op == NOOP_OP {
            continue;
        }
        let nss = Namespace::parse(one_log.get_str(NAMESPACE_KEY)?)?;
        let obj = one_log.get_document("o")?;

        if let Some(current) = current_op {
            if need_to_flush(op, current) {
                flush_oplogs(current, &mut statements, mongo_conn)?;
            }
        }
        current_op = Some(op);

        // mongodb behavior:
        // if update, generate a 'u' oplog.
        // if update with successfully upsert, generate a 'i' oplog.
        // if insert, generate a 'i' oplog.
        // if delete, generate a 'd' oplog.
        let statement = match op {
            "u" => {
                let mut obj = obj.clone();
                let is_update = obj.keys().any(|x| x.starts_with('$'));
                if is_update {
                    // $v is only for mongodb internal usage.
                    obj.remove("$v");
                }
                doc! {
                    "q": {"_id": id_of(one_log.get_document("o2")?)?},
                    "u": obj,
                    "upsert": !is_update,
                }
            }
            "i" => doc! {
                "q": {"_id": id_of(obj)?},
                "u": obj.clone(),
                "upsert": true,
            },
            "d" => doc! {
                "q": {"_id": id_of(obj)?},
                "limit": 1,
            },
            _ => {
                warn!(?one_log, "unknown oplog operation, ignored.");
                continue;
            }
        };
        statements.push((nss, statement));
    }

    if let Some(current) = current_op {
        flush_oplogs(current, &mut statements, mongo_conn)?;
    }
    Ok(())
}

fn id_of(doc: &Document) -> Result<Bson> {
    doc.get("_id").cloned().ok_or_else(|| {
        SyncError::new(
            ErrorCode::NoSuchKey,
            format!("oplog document without `_id`: {}", doc),
        )
    })
}

/// inserts and updates are both sent as `update`, a delete after them (or the other way
/// round) needs a flush.
fn need_to_flush(op: &str, current_op: &str) -> bool {
    let update_ops = ["i", "u"];
    update_ops.contains(&current_op) ^ update_ops.contains(&op)
}

// after flush, `statements` will be empty.
fn flush_oplogs(
    op: &str,
    statements: &mut Vec<(Namespace, Document)>,
    mongo_conn: &MongoClient,
) -> Result<()> {
    if statements.is_empty() {
        return Ok(());
    }
    let (command, statement_key) = if op == "d" {
        ("delete", "deletes")
    } else {
        ("update", "updates")
    };

    let mut coll_ops: HashMap<Namespace, Vec<Document>> = HashMap::new();
    for (nss, statement) in statements.drain(..) {
        coll_ops.entry(nss).or_default().push(statement);
    }

    for (nss, ops) in coll_ops.into_iter() {
        debug!(%nss, operation = %command, count = ops.len(), "Flush oplogs for collection.");
        // `ordered` key default to be true.
        let result = mongo_conn.database(nss.db()).run_command(
            doc! {
                command: nss.coll(),
                statement_key: ops,
            },
            None,
        )?;

        if result.contains_key("writeErrors") {
            return Err(SyncError::ApplyOplogError(result));
        }
    }
    Ok(())
}
