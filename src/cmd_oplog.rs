//! Structured command oplog entries (`op: "c"`) applied against the local node.

use bson::{doc, Bson, Document};
use mongodb::error::{Error as MongoError, ErrorKind, Result as MongoResult};
use mongodb::sync::Client as MongoClient;
use tracing::{info, warn};

use crate::bson_helper::split_namespace;
use crate::error::{ErrorCode, Result, SyncError};
use crate::ADMIN_DB_NAME;

/// collection namespace borrowed from an oplog entry.
#[derive(Debug, PartialEq)]
pub struct CollNs<'a> {
    db_name: &'a str,
    coll_name: &'a str,
}

impl<'a> CollNs<'a> {
    pub fn new(db_name: &'a str, coll_name: &'a str) -> Self {
        CollNs { db_name, coll_name }
    }

    fn parse(ns: &'a str) -> Result<Self> {
        split_namespace(ns)
            .map(|(db, coll)| CollNs::new(db, coll))
            .ok_or_else(|| {
                SyncError::new(
                    ErrorCode::BadValue,
                    format!("invalid namespace in command oplog: {:?}", ns),
                )
            })
    }
}

/// Command oplog entry.
///
/// Use [CmdOplog::from_oplog_doc] to parse an entry, then [apply](CmdOplog::apply) it.
#[derive(Debug, PartialEq)]
pub enum CmdOplog<'a> {
    RenameCollection {
        from: CollNs<'a>,
        to: CollNs<'a>,
        drop_target: bool,
    },
    DropCollection(CollNs<'a>),
    /// create collection with the options of the original `create` command.
    CreateCollection {
        ns: CollNs<'a>,
        options: Document,
    },
    DropDatabase(&'a str),
    DropIndexes {
        ns: CollNs<'a>,
        name: &'a str,
    },
    /// create one index, `spec` holds everything but the `createIndexes` key.
    CreateIndexes {
        ns: CollNs<'a>,
        spec: Document,
    },
}

impl<'a> CmdOplog<'a> {
    /// Parse a command oplog entry.
    ///
    /// It returns None when the command in `doc` can't be recognized.
    ///
    /// # Example
    /// ```
    /// use mongo_initial_sync::cmd_oplog::{CmdOplog, CollNs};
    /// use bson::doc;
    /// let test_doc = doc! {"ns": "a.$cmd", "o": {"renameCollection": "a.b", "to": "a.c"}};
    /// let oplog = CmdOplog::from_oplog_doc(&test_doc).unwrap().unwrap();
    /// assert_eq!(
    ///     oplog,
    ///     CmdOplog::RenameCollection {
    ///         from: CollNs::new("a", "b"),
    ///         to: CollNs::new("a", "c"),
    ///         drop_target: false,
    ///     }
    /// );
    /// ```
    pub fn from_oplog_doc(doc: &'a Document) -> Result<Option<Self>> {
        let obj = doc.get_document("o")?;
        let db = CollNs::parse(doc.get_str("ns")?)?.db_name;

        let cmd = match obj.keys().next() {
            Some(cmd) => cmd.as_str(),
            None => {
                warn!(?doc, "Get an empty command oplog, ignored.");
                return Ok(None);
            }
        };
        let oplog = match cmd {
            // {"renameCollection": "ns", "to": "ns", "dropTarget": false}
            "renameCollection" => CmdOplog::RenameCollection {
                from: CollNs::parse(obj.get_str("renameCollection")?)?,
                to: CollNs::parse(obj.get_str("to")?)?,
                drop_target: obj.get_bool("dropTarget").unwrap_or(false),
            },
            // {"drop": "coll"}
            "drop" => CmdOplog::DropCollection(CollNs::new(db, obj.get_str("drop")?)),
            // {"create": "coll", "capped": true, ...}
            "create" => {
                let mut options = obj.clone();
                options.remove("create");
                CmdOplog::CreateCollection {
                    ns: CollNs::new(db, obj.get_str("create")?),
                    options,
                }
            }
            // {"dropDatabase": 1}
            "dropDatabase" => CmdOplog::DropDatabase(db),
            // {"dropIndexes": "coll", "index": "index_name"}
            "dropIndexes" | "deleteIndexes" => {
                let name = match obj.get_str("index") {
                    Ok(name) => name,
                    Err(err) => {
                        warn!(?obj, ?err, "Failed to access `index` field in dropIndexes command oplog, so the command will be ignored.");
                        return Ok(None);
                    }
                };
                CmdOplog::DropIndexes {
                    ns: CollNs::new(db, obj.get_str(cmd)?),
                    name,
                }
            }
            // {"createIndexes": "coll", "key": {"x": 1}, "name": "x_1", ...}
            "createIndexes" => {
                if obj.get_document("key").is_err() || obj.get_str("name").is_err() {
                    warn!(?obj, "createIndexes command oplog without `key` or `name`, so the command will be ignored.");
                    return Ok(None);
                }
                let mut spec = obj.clone();
                spec.remove("createIndexes");
                CmdOplog::CreateIndexes {
                    ns: CollNs::new(db, obj.get_str("createIndexes")?),
                    spec,
                }
            }
            _ => {
                warn!(?doc, "Get a command which can't be handled.");
                return Ok(None);
            }
        };
        Ok(Some(oplog))
    }

    /// Build the command of an index insert into `<db>.system.indexes`.
    pub fn from_index_insert(doc: &'a Document) -> Result<Self> {
        let spec = doc.get_document("o")?;
        let ns = CollNs::parse(spec.get_str("ns")?)?;
        let mut spec = spec.clone();
        spec.remove("ns");
        Ok(CmdOplog::CreateIndexes { ns, spec })
    }

    /// Apply the command against `mongo_conn`.
    ///
    /// Commands are idempotent: dropping something missing or creating something present is
    /// not an error.
    pub fn apply(self, mongo_conn: &MongoClient) -> Result<()> {
        use CmdOplog::*;
        info!(cmd = ?self, "Applying command oplog.");
        match self {
            DropCollection(ns) => {
                let result = mongo_conn
                    .database(ns.db_name)
                    .run_command(doc! {"drop": ns.coll_name}, None)
                    .map(|_| ());
                tolerate(result, ErrorCode::NamespaceNotFound)
            }
            CreateCollection { ns, options } => {
                let mut cmd = doc! {"create": ns.coll_name};
                for (key, value) in options {
                    cmd.insert(key, value);
                }
                let result = mongo_conn
                    .database(ns.db_name)
                    .run_command(cmd, None)
                    .map(|_| ());
                tolerate(result, ErrorCode::Other(48))
            }
            DropDatabase(db) => mongo_conn.database(db).drop(None).map_err(SyncError::from),
            RenameCollection {
                from,
                to,
                drop_target,
            } => {
                // renameCollection only runs against admin.
                let result = mongo_conn
                    .database(ADMIN_DB_NAME)
                    .run_command(
                        doc! {
                            "renameCollection": format!("{}.{}", from.db_name, from.coll_name),
                            "to": format!("{}.{}", to.db_name, to.coll_name),
                            "dropTarget": drop_target,
                        },
                        None,
                    )
                    .map(|_| ());
                tolerate(result, ErrorCode::NamespaceNotFound)
            }
            DropIndexes { ns, name } => {
                let result = mongo_conn
                    .database(ns.db_name)
                    .run_command(doc! {"dropIndexes": ns.coll_name, "index": name}, None)
                    .map(|_| ());
                tolerate(result, ErrorCode::Other(27))
                    .or_else(|e| match e.code() {
                        ErrorCode::NamespaceNotFound => Ok(()),
                        _ => Err(e),
                    })
            }
            CreateIndexes { ns, spec } => {
                mongo_conn.database(ns.db_name).run_command(
                    doc! {
                        "createIndexes": ns.coll_name,
                        "indexes": [Bson::Document(spec)]
                    },
                    None,
                )?;
                Ok(())
            }
        }
    }
}

/// Turn a command failure with code `code` into success.
fn tolerate(result: MongoResult<()>, code: ErrorCode) -> Result<()> {
    match result {
        Err(e) if command_code(&e) == Some(code) => Ok(()),
        other => other.map_err(SyncError::from),
    }
}

fn command_code(error: &MongoError) -> Option<ErrorCode> {
    match error.kind.as_ref() {
        ErrorKind::Command(err) => Some(ErrorCode::from_i32(err.code)),
        _ => None,
    }
}
