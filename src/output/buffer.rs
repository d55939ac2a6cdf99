//! Bounded ring buffer with independent cursors.
//!
//! Every entry gets a sequence number. A reader remembers the next sequence it wants and the
//! sequence that was next when the reader was created: anything before that mark was already
//! buffered and is delivered in batches flagged `buffered`, anything after it is live. A batch
//! never mixes the two. Readers that fall behind far enough for their entries to be overwritten
//! skip forward to the oldest retained entry.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, WaystationError};

#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    pub entries: Vec<T>,
    /// Written before the reader was created.
    pub buffered: bool,
}

#[derive(Debug)]
struct Ring<T> {
    entries: VecDeque<T>,
    /// Sequence number of `entries[0]`.
    first_seq: u64,
    closed: bool,
}

impl<T> Ring<T> {
    fn next_seq(&self) -> u64 {
        self.first_seq + self.entries.len() as u64
    }
}

#[derive(Debug)]
pub struct OutputBuffer<T> {
    ring: Mutex<Ring<T>>,
    capacity: usize,
    /// Bumped on every write and on close.
    tail: watch::Sender<u64>,
}

enum Poll<T> {
    Ready(Batch<T>),
    Empty,
    Drained,
}

impl<T: Clone> OutputBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(Ring {
                entries: VecDeque::new(),
                first_seq: 0,
                closed: false,
            }),
            capacity: capacity.max(1),
            tail: watch::channel(0).0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append one entry, discarding the oldest if the buffer is full. Writes after close are
    /// dropped.
    pub fn write(&self, entry: T) {
        self.write_all(std::iter::once(entry));
    }

    pub fn write_all(&self, entries: impl IntoIterator<Item = T>) {
        let next = {
            let mut ring = self.ring.lock();
            if ring.closed {
                return;
            }
            for entry in entries {
                ring.entries.push_back(entry);
                if ring.entries.len() > self.capacity {
                    ring.entries.pop_front();
                    ring.first_seq += 1;
                }
            }
            ring.next_seq()
        };
        self.tail.send_replace(next);
    }

    /// Mark the buffer finished. Readers drain what is left and then see the end.
    pub fn close(&self) {
        self.ring.lock().closed = true;
        self.tail.send_modify(|_| {});
    }

    pub fn is_closed(&self) -> bool {
        self.ring.lock().closed
    }

    pub fn len(&self) -> usize {
        self.ring.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the retained entries, oldest first.
    pub fn contents(&self) -> Vec<T> {
        self.ring.lock().entries.iter().cloned().collect()
    }

    /// A reader positioned at the oldest retained entry.
    pub fn reader(self: &Arc<Self>) -> Reader<T> {
        let rx = self.tail.subscribe();
        let ring = self.ring.lock();
        Reader {
            buffer: Arc::clone(self),
            cursor: ring.first_seq,
            live_from: ring.next_seq(),
            rx,
        }
    }

    fn poll(&self, cursor: &mut u64, live_from: u64, max: usize) -> Poll<T> {
        let ring = self.ring.lock();
        if *cursor < ring.first_seq {
            *cursor = ring.first_seq;
        }
        let next = ring.next_seq();
        if *cursor >= next {
            return if ring.closed { Poll::Drained } else { Poll::Empty };
        }

        let buffered = *cursor < live_from;
        let mut end = next.min(cursor.saturating_add(max.max(1) as u64));
        if buffered {
            end = end.min(live_from);
        }
        let from = (*cursor - ring.first_seq) as usize;
        let to = (end - ring.first_seq) as usize;
        let entries = ring.entries.range(from..to).cloned().collect();
        *cursor = end;
        Poll::Ready(Batch { entries, buffered })
    }
}

#[derive(Debug)]
pub struct Reader<T> {
    buffer: Arc<OutputBuffer<T>>,
    cursor: u64,
    live_from: u64,
    rx: watch::Receiver<u64>,
}

impl<T: Clone> Reader<T> {
    /// Up to `max` unread entries, or `None` if nothing is available right now.
    pub fn try_read(&mut self, max: usize) -> Option<Batch<T>> {
        match self.buffer.poll(&mut self.cursor, self.live_from, max) {
            Poll::Ready(batch) => Some(batch),
            Poll::Empty | Poll::Drained => None,
        }
    }

    /// Up to `max` unread entries, waiting for a write if there are none. Returns `Ok(None)` once
    /// the buffer is closed and drained.
    pub async fn read(&mut self, max: usize, cancel: &CancellationToken) -> Result<Option<Batch<T>>> {
        loop {
            let _ = self.rx.borrow_and_update();
            match self.buffer.poll(&mut self.cursor, self.live_from, max) {
                Poll::Ready(batch) => return Ok(Some(batch)),
                Poll::Drained => return Ok(None),
                Poll::Empty => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(WaystationError::Cancelled),
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Resolve on the next write or close. Returns at once if the buffer is already closed.
    pub async fn wait(&mut self) {
        if self.buffer.is_closed() {
            return;
        }
        let _ = self.rx.changed().await;
    }

    /// Closed and nothing left to read.
    pub fn is_finished(&self) -> bool {
        let ring = self.buffer.ring.lock();
        ring.closed && self.cursor.max(ring.first_seq) >= ring.next_seq()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn overflow_keeps_last_capacity_entries() {
        let buffer = Arc::new(OutputBuffer::new(4));
        buffer.write_all(0..7);

        let mut reader = buffer.reader();
        let batch = reader.try_read(100).unwrap();
        assert_eq!(batch.entries, vec![3, 4, 5, 6]);
        assert!(batch.buffered);
        assert!(reader.try_read(100).is_none());
    }

    #[test]
    fn buffered_and_live_batches_do_not_mix() {
        let buffer = Arc::new(OutputBuffer::new(10));
        buffer.write_all(["a", "b"]);
        let mut reader = buffer.reader();
        buffer.write_all(["c", "d"]);

        let first = reader.try_read(10).unwrap();
        assert_eq!(first.entries, vec!["a", "b"]);
        assert!(first.buffered);

        let second = reader.try_read(10).unwrap();
        assert_eq!(second.entries, vec!["c", "d"]);
        assert!(!second.buffered);
    }

    #[test]
    fn readers_have_independent_cursors() {
        let buffer = Arc::new(OutputBuffer::new(10));
        buffer.write_all([1, 2, 3]);
        let mut a = buffer.reader();
        let mut b = buffer.reader();

        assert_eq!(a.try_read(2).unwrap().entries, vec![1, 2]);
        assert_eq!(b.try_read(10).unwrap().entries, vec![1, 2, 3]);
        assert_eq!(a.try_read(10).unwrap().entries, vec![3]);
    }

    #[test]
    fn lagging_reader_skips_overwritten_entries() {
        let buffer = Arc::new(OutputBuffer::new(2));
        let mut reader = buffer.reader();
        buffer.write_all([1, 2, 3, 4, 5]);
        assert_eq!(reader.try_read(10).unwrap().entries, vec![4, 5]);
    }

    #[tokio::test]
    async fn read_blocks_until_write() {
        let buffer = Arc::new(OutputBuffer::new(8));
        let mut reader = buffer.reader();
        let writer = Arc::clone(&buffer);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.write("late");
        });

        let cancel = CancellationToken::new();
        let batch = reader.read(8, &cancel).await.unwrap().unwrap();
        assert_eq!(batch.entries, vec!["late"]);
        assert!(!batch.buffered);
    }

    #[tokio::test]
    async fn closed_buffer_drains_then_ends() {
        let buffer = Arc::new(OutputBuffer::new(8));
        buffer.write(1);
        buffer.close();
        buffer.write(2);

        let cancel = CancellationToken::new();
        let mut reader = buffer.reader();
        assert_eq!(reader.read(8, &cancel).await.unwrap().unwrap().entries, vec![1]);
        assert!(reader.read(8, &cancel).await.unwrap().is_none());
        assert!(reader.is_finished());
    }

    #[tokio::test]
    async fn cancel_unblocks_read() {
        let buffer: Arc<OutputBuffer<u32>> = Arc::new(OutputBuffer::new(8));
        let mut reader = buffer.reader();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            reader.read(8, &cancel).await,
            Err(WaystationError::Cancelled)
        ));
    }
}
