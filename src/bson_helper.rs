use crate::error::{ErrorCode, Result, SyncError};
use bson::document::{ValueAccessError, ValueAccessResult};
use bson::Bson;
use bson::Document;

/// Get an integer value for this `key`, accepting int32, int64 and integral double values.
pub fn get_integer(doc: &Document, key: &str) -> ValueAccessResult<i64> {
    match doc.get(key) {
        Some(&Bson::Int32(v)) => Ok(v as i64),
        Some(&Bson::Int64(v)) => Ok(v),
        Some(&Bson::Double(v)) if v.fract() == 0.0 => Ok(v as i64),
        Some(_) => Err(ValueAccessError::UnexpectedType),
        None => Err(ValueAccessError::NotPresent),
    }
}

/// BSON encoded size of `doc`, in bytes.
pub fn doc_size(doc: &Document) -> usize {
    let mut buf = Vec::new();
    match doc.to_writer(&mut buf) {
        Ok(_) => buf.len(),
        Err(_) => 0,
    }
}

/// Check the `ok` field of a command reply, converting `{ok: 0, code, errmsg}` into an error.
pub fn check_command_response(reply: &Document) -> Result<()> {
    let ok = match reply.get("ok") {
        Some(Bson::Double(v)) => *v != 0.0,
        Some(Bson::Int32(v)) => *v != 0,
        Some(Bson::Int64(v)) => *v != 0,
        Some(Bson::Boolean(v)) => *v,
        _ => {
            return Err(SyncError::new(
                ErrorCode::FailedToParse,
                format!("command reply without an `ok` field: {:?}", reply),
            ))
        }
    };
    if ok {
        return Ok(());
    }

    let code = get_integer(reply, "code")
        .map(|c| ErrorCode::from_i32(c as i32))
        .unwrap_or(ErrorCode::UnknownError);
    let message = reply.get_str("errmsg").unwrap_or("command failed");
    Err(SyncError::new(code, message))
}

/// split a full namespace into database name and collection name.
pub fn split_namespace(ns: &str) -> Option<(&str, &str)> {
    ns.split_once('.')
}

/// name of the command in `cmd`, which is always the first key.
pub fn command_name(cmd: &Document) -> &str {
    cmd.keys().next().map(|k| k.as_str()).unwrap_or("")
}
