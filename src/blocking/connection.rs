use crate::error::{ErrorCode, Result, SyncError};
use crate::executor::{RemoteCommandRequest, RemoteCommandRunner};
use bson::{doc, Document};
use crossbeam::channel;
use mongodb::error::ErrorKind;
use mongodb::sync::Client;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, trace};

/// Send commands to sync sources through the mongodb driver, one [Client] per target.
///
/// A target is either a full `mongodb://` uri or a bare `host:port`, which gets a direct
/// connection.
#[derive(Default)]
pub struct MongoCommandRunner {
    clients: Mutex<HashMap<String, Client>>,
}

impl MongoCommandRunner {
    pub fn new() -> Self {
        MongoCommandRunner::default()
    }

    fn client(&self, target: &str) -> Result<Client> {
        let mut clients = self.clients.lock().unwrap();
        if let Some(client) = clients.get(target) {
            return Ok(client.clone());
        }
        let uri = if target.starts_with("mongodb://") || target.starts_with("mongodb+srv://") {
            target.to_string()
        } else {
            format!("mongodb://{}/?directConnection=true", target)
        };
        debug!(%target, "Connecting to sync source.");
        let client = Client::with_uri_str(&uri)?;
        clients.insert(target.to_string(), client.clone());
        Ok(client)
    }
}

impl RemoteCommandRunner for MongoCommandRunner {
    /// Command failures come back as `{ok: 0, code, errmsg}` replies, only transport problems
    /// are errors.
    fn run_command(&self, request: &RemoteCommandRequest) -> Result<Document> {
        let client = self.client(&request.target)?;
        let db_name = request.db_name.clone();
        let cmd = request.cmd.clone();
        let run = move || client.database(&db_name).run_command(cmd, None);

        let result = match request.timeout {
            None => run(),
            Some(timeout) => {
                // the driver has no per command deadline.
                let (sender, receiver) = channel::bounded(1);
                std::thread::Builder::new()
                    .name("remote-command".to_string())
                    .spawn(move || {
                        let _ = sender.send(run());
                    })
                    .map_err(|e| SyncError::new(ErrorCode::InternalError, e.to_string()))?;
                match receiver.recv_timeout(timeout) {
                    Ok(result) => result,
                    Err(_) => {
                        return Err(SyncError::new(
                            ErrorCode::NetworkTimeout,
                            format!("{} timed out after {:?}", request, timeout),
                        ))
                    }
                }
            }
        };
        trace!(%request, ok = result.is_ok(), "Remote command returned.");

        match result {
            Ok(reply) => Ok(reply),
            Err(e) => match e.kind.as_ref() {
                ErrorKind::Command(cmd_err) => Ok(doc! {
                    "ok": 0,
                    "code": cmd_err.code,
                    "codeName": cmd_err.code_name.clone(),
                    "errmsg": cmd_err.message.clone(),
                }),
                _ => Err(SyncError::from(e)),
            },
        }
    }
}
