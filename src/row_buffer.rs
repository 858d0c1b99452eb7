//! Bounded single-producer / multi-consumer row queue.
//!
//! [`RowBuffer`] is the only structure shared between the reader and the
//! processors of a load. It is a fixed-size circular array of row slots with a
//! parallel array of optional group-hash strings, guarded by one mutex and two
//! condition variables (not-full for the producer, not-empty for consumers).
//!
//! # Termination
//! - [`RowBuffer::mark_finished`] ends the stream: consumers drain what is
//!   left, then [`RowBuffer::get`] returns `None`.
//! - [`RowBuffer::cancel`] also ends the stream but drops queued rows, so
//!   consumers stop at their next `get`.
//! - Either way every blocked caller is woken and further `put`s fail with
//!   [`LoadError::Cancelled`] instead of blocking.
//!
//! # Group hashes
//! A consumer normally reads through a [`RowConsumer`], which remembers the
//! group hash of the row it returned last. The hash stays valid until the
//! next `get` on that consumer.

use crate::error::{LoadError, Result};
use crate::row::Row;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

struct BufferState<T> {
    slots: Vec<Option<T>>,
    hashes: Vec<Option<String>>,
    input: usize,
    output: usize,
    size: usize,
    finished: bool,
    cancelled: bool,
}

/// Fixed-capacity circular row buffer.
pub struct RowBuffer<T = Row> {
    capacity: usize,
    state: Mutex<BufferState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> RowBuffer<T> {
    /// Create a buffer holding at most `capacity` rows.
    ///
    /// # Errors
    /// A zero capacity is a [`LoadError::Capacity`] error.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(LoadError::Capacity(
                "row buffer capacity must be positive".into(),
            ));
        }
        Ok(Self {
            capacity,
            state: Mutex::new(BufferState {
                slots: (0..capacity).map(|_| None).collect(),
                hashes: vec![None; capacity],
                input: 0,
                output: 0,
                size: 0,
                finished: false,
                cancelled: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        })
    }

    // Nothing panics while the lock is held, so a poisoned state is still
    // consistent.
    fn lock(&self) -> MutexGuard<'_, BufferState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a row, blocking while the buffer is full.
    ///
    /// # Errors
    /// Returns [`LoadError::Cancelled`] once the buffer is finished, whether
    /// that happened before the call or while it was waiting for space.
    pub fn put(&self, row: T, group_hash: Option<String>) -> Result<()> {
        let mut st = self.lock();
        while st.size == self.capacity && !st.finished {
            st = self
                .not_full
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if st.finished {
            return Err(LoadError::Cancelled);
        }
        let at = st.input;
        st.slots[at] = Some(row);
        st.hashes[at] = group_hash;
        st.input = (at + 1) % self.capacity;
        st.size += 1;
        drop(st);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove the oldest row together with its group hash.
    ///
    /// Blocks while the buffer is empty and not finished. Returns `None`
    /// exactly when the buffer is empty and finished.
    pub fn get(&self) -> Option<(T, Option<String>)> {
        let mut st = self.lock();
        while st.size == 0 && !st.finished {
            st = self
                .not_empty
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if st.size == 0 {
            return None;
        }
        let at = st.output;
        let row = st.slots[at].take();
        let hash = st.hashes[at].take();
        st.output = (at + 1) % self.capacity;
        st.size -= 1;
        drop(st);
        self.not_full.notify_one();
        row.map(|r| (r, hash))
    }

    /// A consumer handle that remembers the last row's group hash.
    pub fn consumer(&self) -> RowConsumer<'_, T> {
        RowConsumer {
            buffer: self,
            group_hash: None,
        }
    }

    /// End the stream. Idempotent; wakes every waiter.
    pub fn mark_finished(&self) {
        let mut st = self.lock();
        st.finished = true;
        drop(st);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// End the stream and discard queued rows.
    pub fn cancel(&self) {
        let mut st = self.lock();
        st.finished = true;
        st.cancelled = true;
        for slot in &mut st.slots {
            *slot = None;
        }
        for hash in &mut st.hashes {
            *hash = None;
        }
        st.size = 0;
        st.output = st.input;
        drop(st);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Rows currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Per-thread reading handle over a [`RowBuffer`].
pub struct RowConsumer<'a, T = Row> {
    buffer: &'a RowBuffer<T>,
    group_hash: Option<String>,
}

impl<T> RowConsumer<'_, T> {
    /// Next row, or `None` at end of stream.
    pub fn get(&mut self) -> Option<T> {
        match self.buffer.get() {
            Some((row, hash)) => {
                self.group_hash = hash;
                Some(row)
            }
            None => {
                self.group_hash = None;
                None
            }
        }
    }

    /// Group hash of the row returned by the last [`get`](Self::get).
    #[must_use]
    pub fn group_hash(&self) -> Option<&str> {
        self.group_hash.as_deref()
    }

    /// The buffer this consumer reads from.
    #[must_use]
    pub fn buffer(&self) -> &RowBuffer<T> {
        self.buffer
    }
}

/// Marks a buffer finished when dropped, so a producer ends the stream on
/// every exit path.
pub struct FinishGuard<'a, T> {
    buffer: &'a RowBuffer<T>,
}

impl<'a, T> FinishGuard<'a, T> {
    pub fn new(buffer: &'a RowBuffer<T>) -> Self {
        Self { buffer }
    }
}

impl<T> Drop for FinishGuard<'_, T> {
    fn drop(&mut self) {
        self.buffer.mark_finished();
    }
}
