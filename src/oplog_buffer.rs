//! Byte bounded FIFO between the oplog fetcher and the apply loop.

use crate::bson_helper::doc_size;
use crate::error::{ErrorCode, Result, SyncError};
use bson::Document;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Blocking queue of fetched oplog entries.
///
/// Capacity is a byte budget. A request larger than the whole budget waits for an empty buffer
/// instead of waiting forever. [shutdown](OplogBuffer::shutdown) drops the contents and wakes
/// every waiter.
#[derive(Debug)]
pub struct OplogBuffer {
    max_size: usize,
    state: Mutex<BufferState>,
    not_empty: Condvar,
    not_full: Condvar,
}

#[derive(Debug, Default)]
struct BufferState {
    queue: VecDeque<(Document, usize)>,
    size: usize,
    in_shutdown: bool,
}

impl BufferState {
    fn has_space(&self, max_size: usize, requested: usize) -> bool {
        self.size + requested.min(max_size) <= max_size
    }

    fn push(&mut self, doc: Document) {
        let size = doc_size(&doc);
        self.size += size;
        self.queue.push_back((doc, size));
    }
}

fn shutdown_error() -> SyncError {
    SyncError::new(ErrorCode::ShutdownInProgress, "oplog buffer is shut down")
}

impl OplogBuffer {
    pub fn new(max_size: usize) -> Self {
        OplogBuffer {
            max_size,
            state: Mutex::new(BufferState::default()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Accept entries again after a [shutdown](Self::shutdown).
    pub fn startup(&self) {
        self.state.lock().unwrap().in_shutdown = false;
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.in_shutdown = true;
        state.queue.clear();
        state.size = 0;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().unwrap().in_shutdown
    }

    /// Push `doc`, blocking while the buffer is full.
    pub fn push(&self, doc: Document) -> Result<()> {
        let requested = doc_size(&doc);
        let mut state = self.state.lock().unwrap();
        while !state.in_shutdown && !state.has_space(self.max_size, requested) {
            state = self.not_full.wait(state).unwrap();
        }
        if state.in_shutdown {
            return Err(shutdown_error());
        }
        state.push(doc);
        self.not_empty.notify_all();
        Ok(())
    }

    /// Push `doc` when it fits, returns false otherwise.
    pub fn try_push(&self, doc: Document) -> bool {
        let requested = doc_size(&doc);
        let mut state = self.state.lock().unwrap();
        if state.in_shutdown || state.size + requested > self.max_size {
            return false;
        }
        state.push(doc);
        self.not_empty.notify_all();
        true
    }

    /// Push `doc` without looking at the capacity.
    pub fn push_even_if_full(&self, doc: Document) {
        let mut state = self.state.lock().unwrap();
        if state.in_shutdown {
            return;
        }
        state.push(doc);
        self.not_empty.notify_all();
    }

    /// Push every entry of `docs` without blocking, callers reserve room with
    /// [wait_for_space](Self::wait_for_space) first.
    pub fn push_all_non_blocking<I>(&self, docs: I)
    where
        I: IntoIterator<Item = Document>,
    {
        let mut state = self.state.lock().unwrap();
        if state.in_shutdown {
            return;
        }
        for doc in docs {
            state.push(doc);
        }
        self.not_empty.notify_all();
    }

    /// Block until `size` more bytes fit.
    pub fn wait_for_space(&self, size: usize) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        while !state.in_shutdown && !state.has_space(self.max_size, size) {
            state = self.not_full.wait(state).unwrap();
        }
        if state.in_shutdown {
            return Err(shutdown_error());
        }
        Ok(())
    }

    /// Block at most `timeout` until `size` more bytes fit, returns whether they do.
    pub fn wait_for_space_timeout(&self, size: usize, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while !state.in_shutdown && !state.has_space(self.max_size, size) {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            state = self.not_full.wait_timeout(state, deadline - now).unwrap().0;
        }
        if state.in_shutdown {
            return Err(shutdown_error());
        }
        Ok(true)
    }

    pub fn try_pop(&self) -> Option<Document> {
        let mut state = self.state.lock().unwrap();
        let (doc, size) = state.queue.pop_front()?;
        state.size -= size;
        self.not_full.notify_all();
        Some(doc)
    }

    pub fn peek(&self) -> Option<Document> {
        let state = self.state.lock().unwrap();
        state.queue.front().map(|(doc, _)| doc.clone())
    }

    /// Block at most `timeout` for an entry, returns whether the buffer holds one.
    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap();
        let (state, _) = self
            .not_empty
            .wait_timeout_while(state, timeout, |s| s.queue.is_empty() && !s.in_shutdown)
            .unwrap();
        !state.queue.is_empty()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.queue.clear();
        state.size = 0;
        self.not_full.notify_all();
    }

    pub fn count(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// bytes currently buffered.
    pub fn size(&self) -> usize {
        self.state.lock().unwrap().size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use std::sync::Arc;
    use std::thread;

    fn entry(i: i32) -> Document {
        doc! {"i": i}
    }

    #[test]
    fn test_fifo_order() {
        let buffer = OplogBuffer::new(1024);
        for i in 0..5 {
            buffer.push(entry(i)).unwrap();
        }
        assert_eq!(buffer.count(), 5);
        assert_eq!(buffer.size(), 5 * doc_size(&entry(0)));
        assert_eq!(buffer.peek().unwrap(), entry(0));
        for i in 0..5 {
            assert_eq!(buffer.try_pop().unwrap(), entry(i));
        }
        assert!(buffer.try_pop().is_none());
        assert!(buffer.peek().is_none());
        assert_eq!(buffer.size(), 0);
    }

    #[test]
    fn test_try_push_respects_capacity() {
        let one = doc_size(&entry(0));
        let buffer = OplogBuffer::new(one * 2);
        assert!(buffer.try_push(entry(1)));
        assert!(buffer.try_push(entry(2)));
        assert!(!buffer.try_push(entry(3)));
        buffer.push_even_if_full(entry(3));
        assert_eq!(buffer.count(), 3);
        assert!(buffer.size() > buffer.max_size());
    }

    #[test]
    fn test_wait_for_space_blocks_until_pop() {
        let one = doc_size(&entry(0));
        let buffer = Arc::new(OplogBuffer::new(one * 2));
        buffer.push_all_non_blocking(vec![entry(1), entry(2)]);
        assert!(!buffer
            .wait_for_space_timeout(one, Duration::from_millis(20))
            .unwrap());

        let consumer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                buffer.try_pop()
            })
        };
        buffer.wait_for_space(one).unwrap();
        assert!(buffer.size() + one <= buffer.max_size());
        assert_eq!(consumer.join().unwrap().unwrap(), entry(1));
    }

    #[test]
    fn test_oversized_request_waits_for_empty_buffer() {
        let one = doc_size(&entry(0));
        let buffer = OplogBuffer::new(one);
        buffer.push(entry(1)).unwrap();
        assert!(!buffer
            .wait_for_space_timeout(one * 10, Duration::from_millis(10))
            .unwrap());
        buffer.clear();
        assert!(buffer
            .wait_for_space_timeout(one * 10, Duration::from_millis(10))
            .unwrap());
    }

    #[test]
    fn test_shutdown_wakes_waiters() {
        let one = doc_size(&entry(0));
        let buffer = Arc::new(OplogBuffer::new(one));
        buffer.push(entry(1)).unwrap();

        let producer = {
            let buffer = buffer.clone();
            thread::spawn(move || buffer.wait_for_space(one))
        };
        thread::sleep(Duration::from_millis(20));
        buffer.shutdown();
        let err = producer.join().unwrap().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ShutdownInProgress);
        assert!(buffer.is_empty());
        assert!(buffer.push(entry(2)).is_err());

        buffer.startup();
        buffer.push(entry(2)).unwrap();
        assert!(buffer.wait_for_data(Duration::from_millis(1)));
    }

    #[test]
    fn test_wait_for_data() {
        let buffer = Arc::new(OplogBuffer::new(1024));
        assert!(!buffer.wait_for_data(Duration::from_millis(5)));
        let producer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                buffer.push(entry(7)).unwrap();
            })
        };
        assert!(buffer.wait_for_data(Duration::from_secs(5)));
        producer.join().unwrap();
        assert_eq!(buffer.try_pop().unwrap(), entry(7));
    }
}
