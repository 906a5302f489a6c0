mod common;

use bson::{doc, Document, Timestamp};
use common::*;
use mongo_initial_sync::fetcher::FetcherState;
use mongo_initial_sync::oplog_fetcher::EnqueueDocumentsFn;
use mongo_initial_sync::{
    DocumentsInfo, ErrorCode, Namespace, OpTimeWithHash, OplogFetcher, OplogFetcherOptions,
    Result, SyncError,
};
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Started {
    fetcher: OplogFetcher,
    enqueued: Arc<Mutex<Vec<Document>>>,
    done: Receiver<(Result<()>, OpTimeWithHash)>,
}

fn start_fetcher(ctx: &Context, last_fetched: OpTimeWithHash, fail_enqueue: bool) -> Started {
    let enqueued = Arc::new(Mutex::new(vec![]));
    let sink = enqueued.clone();
    let enqueue: EnqueueDocumentsFn = Arc::new(move |docs: &[Document], _info: &DocumentsInfo| {
        if fail_enqueue {
            return Err(SyncError::new(ErrorCode::InternalError, "buffer closed"));
        }
        sink.lock().unwrap().extend_from_slice(docs);
        Ok(())
    });
    let (tx, done) = channel();
    let options = OplogFetcherOptions {
        await_data_timeout: Duration::from_millis(10),
        ..OplogFetcherOptions::default()
    };
    let fetcher = OplogFetcher::new(
        ctx.executor.clone(),
        last_fetched,
        SOURCE,
        Namespace::oplog(),
        options,
        enqueue,
        move |status, last| {
            let _ = tx.send((status, last));
        },
    );
    fetcher.startup().unwrap();
    Started {
        fetcher,
        enqueued,
        done,
    }
}

fn times(docs: &[Document]) -> Vec<u32> {
    docs.iter()
        .map(|d| d.get_timestamp("ts").unwrap().time)
        .collect()
}

#[test]
fn test_fetch_until_cursor_closed() {
    let ctx = Context::new();
    ctx.source
        .append_oplog(vec![oplog_noop(1), oplog_insert(2, "db.c", 1)]);
    ctx.source
        .close_oplog_cursors_at(Timestamp { time: 3, increment: 1 });

    let started = start_fetcher(&ctx, optime(1), false);
    wait_until(|| started.enqueued.lock().unwrap().len() == 1);
    ctx.source.append_oplog(vec![oplog_insert(3, "db.c", 2)]);

    let (status, last) = started.done.recv_timeout(Duration::from_secs(10)).unwrap();
    started.fetcher.join();
    assert!(status.is_ok());
    assert_eq!(last, optime(3));
    assert_eq!(started.fetcher.state(), FetcherState::Complete);
    // the entry matching the start point is not enqueued.
    assert_eq!(times(&started.enqueued.lock().unwrap()), vec![2, 3]);
    assert_eq!(started.fetcher.get_last_op_time_with_hash_fetched(), optime(3));

    let find = &ctx.source.commands_named("find")[0];
    assert!(find.get_bool("tailable").unwrap());
    assert!(find.get_bool("awaitData").unwrap());
    assert!(find.get_bool("oplogReplay").unwrap());
    assert_eq!(
        find.get_document("filter").unwrap(),
        &doc! {"ts": {"$gte": Timestamp { time: 1, increment: 1 }}}
    );
    let get_more = &ctx.source.commands_named("getMore")[0];
    assert_eq!(get_more.get_i64("maxTimeMS").unwrap(), 10);
}

#[test]
fn test_oplog_start_missing() {
    let ctx = Context::new();
    ctx.source.append_oplog(vec![oplog_noop(5), oplog_noop(6)]);

    let started = start_fetcher(&ctx, optime(1), false);
    let (status, last) = started.done.recv_timeout(Duration::from_secs(10)).unwrap();
    started.fetcher.join();

    assert_eq!(status.unwrap_err().code(), ErrorCode::OplogStartMissing);
    assert_eq!(last, optime(1));
    assert!(started.enqueued.lock().unwrap().is_empty());
    // not a fetch error, no restart.
    assert_eq!(ctx.source.commands_named("find").len(), 1);
}

#[test]
fn test_oplog_start_hash_mismatch() {
    let ctx = Context::new();
    let mut rolled_back = oplog_noop(1);
    rolled_back.insert("h", 42_i64);
    ctx.source.append_oplog(vec![rolled_back, oplog_noop(2)]);

    let started = start_fetcher(&ctx, optime(1), false);
    let (status, _) = started.done.recv_timeout(Duration::from_secs(10)).unwrap();
    started.fetcher.join();
    assert_eq!(status.unwrap_err().code(), ErrorCode::OplogStartMissing);
}

#[test]
fn test_restart_counter_reset_after_good_batch() {
    let ctx = Context::new();
    ctx.source.append_oplog(vec![oplog_noop(1), oplog_noop(2)]);
    ctx.source
        .close_oplog_cursors_at(Timestamp { time: 3, increment: 1 });
    // max_restarts is 1, two failures only pass when a good batch comes in between.
    ctx.source
        .fail_next("getMore", FakeFailure::Transport(ErrorCode::HostUnreachable));
    ctx.source
        .fail_next("getMore", FakeFailure::Transport(ErrorCode::SocketException));

    let started = start_fetcher(&ctx, optime(1), false);
    wait_until(|| ctx.source.commands_named("find").len() == 3);
    ctx.source.append_oplog(vec![oplog_noop(3)]);

    let (status, last) = started.done.recv_timeout(Duration::from_secs(10)).unwrap();
    started.fetcher.join();
    assert!(status.is_ok());
    assert_eq!(last, optime(3));
    assert_eq!(started.fetcher.restarts(), 0);
    assert_eq!(times(&started.enqueued.lock().unwrap()), vec![2, 3]);

    // restarted finds resume from the last fetched entry.
    let finds = ctx.source.commands_named("find");
    let resume = finds[2].get_document("filter").unwrap();
    assert_eq!(
        resume,
        &doc! {"ts": {"$gte": Timestamp { time: 2, increment: 1 }}}
    );
    assert_eq!(finds[2].get_i64("maxTimeMS").unwrap(), 2000);
}

#[test]
fn test_out_of_restarts() {
    let ctx = Context::new();
    ctx.source.append_oplog(vec![oplog_noop(1), oplog_noop(2)]);
    ctx.source
        .fail_next("getMore", FakeFailure::Transport(ErrorCode::HostUnreachable));
    ctx.source
        .fail_next("find", FakeFailure::Transport(ErrorCode::HostUnreachable));
    // consumed by the first find of the fetcher.
    ctx.source.script_reply(
        "find",
        doc! {
            "cursor": {
                "id": 7_i64,
                "ns": "local.oplog.rs",
                "firstBatch": [oplog_noop(1), oplog_noop(2)],
            },
            "ok": 1,
        },
    );

    let started = start_fetcher(&ctx, optime(1), false);
    let (status, last) = started.done.recv_timeout(Duration::from_secs(10)).unwrap();
    started.fetcher.join();
    assert_eq!(status.unwrap_err().code(), ErrorCode::HostUnreachable);
    assert_eq!(last, optime(2));
}

#[test]
fn test_enqueue_failure_stops_fetcher() {
    let ctx = Context::new();
    ctx.source.append_oplog(vec![oplog_noop(1), oplog_noop(2)]);

    let started = start_fetcher(&ctx, optime(1), true);
    let (status, _) = started.done.recv_timeout(Duration::from_secs(10)).unwrap();
    started.fetcher.join();
    assert_eq!(status.unwrap_err().code(), ErrorCode::InternalError);
    assert_eq!(ctx.source.commands_named("find").len(), 1);
}

#[test]
fn test_shutdown_cancels_fetcher() {
    let ctx = Context::new();
    ctx.source.append_oplog(vec![oplog_noop(1)]);

    let started = start_fetcher(&ctx, optime(1), false);
    wait_until(|| !ctx.source.commands_named("getMore").is_empty());
    started.fetcher.shutdown();

    let (status, last) = started.done.recv_timeout(Duration::from_secs(10)).unwrap();
    started.fetcher.join();
    assert!(status.unwrap_err().is_canceled());
    assert_eq!(last, optime(1));
    assert!(!started.fetcher.is_active());
}
