//! Capacity-bounded staging buffer shared by the writer and the reader
//!
//! A [`BufferedBatch`] is a preallocated slot array with a write cursor,
//! guarded by a single lock. The same type backs the writer's outbound
//! batch and the reader's pending acknowledgements; only the sentinel
//! returned when full differs (see [`BatchRole`]).
//!
//! Flushing is serialized under the batch lock: [`BufferedBatch::drain`]
//! returns a guard that keeps the lock for the duration of the broker
//! call, and the cursor is reset only when the caller confirms success
//! with [`BatchDrain::commit`]. Dropping the guard leaves every staged
//! message in place for the next attempt.
//!
//! A sealed batch rejects further appends with [`Error::Closed`]. The flag
//! lives under the same lock, so an append that was waiting on a final
//! flush observes it.

use crate::error::{Error, Result};
use crate::message::Message;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, MutexGuard};

/// Which component owns a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchRole {
    Writer,
    Reader,
}

impl BatchRole {
    fn full_error(self) -> Error {
        match self {
            BatchRole::Writer => Error::WriterBufferFull,
            BatchRole::Reader => Error::ReaderBufferFull,
        }
    }

    fn closed_error(self) -> Error {
        match self {
            BatchRole::Writer => Error::Closed("writer"),
            BatchRole::Reader => Error::Closed("reader"),
        }
    }
}

struct Slots {
    messages: Vec<Message>,
    sealed: bool,
}

pub struct BufferedBatch {
    role: BatchRole,
    capacity: usize,
    /// Slots `[0, len)` are staged; `len` is the cursor
    slots: Mutex<Slots>,
    /// Mirror of the cursor for lock-free stats reads; written under the lock only
    staged: AtomicUsize,
}

impl BufferedBatch {
    pub fn new(role: BatchRole, capacity: usize) -> Self {
        Self {
            role,
            capacity,
            slots: Mutex::new(Slots {
                messages: Vec::with_capacity(capacity),
                sealed: false,
            }),
            staged: AtomicUsize::new(0),
        }
    }

    /// Stage a message at the cursor.
    ///
    /// Returns the role's buffer-full error without touching the batch when
    /// every slot is taken, and [`Error::Closed`] once the batch is sealed.
    pub async fn append(&self, message: Message) -> Result<()> {
        let mut slots = self.slots.lock().await;
        if slots.sealed {
            return Err(self.role.closed_error());
        }
        if slots.messages.len() >= self.capacity {
            return Err(self.role.full_error());
        }
        slots.messages.push(message);
        self.staged.store(slots.messages.len(), Ordering::Release);
        Ok(())
    }

    /// Lock the batch for a flush or commit.
    ///
    /// Concurrent appends wait until the returned guard is dropped.
    pub async fn drain(&self) -> BatchDrain<'_> {
        BatchDrain {
            slots: self.slots.lock().await,
            staged: &self.staged,
        }
    }

    /// Number of staged messages
    pub fn len(&self) -> usize {
        self.staged.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reject all further appends. Staged messages stay in place.
    pub async fn seal(&self) {
        self.slots.lock().await.sealed = true;
    }

    pub async fn is_sealed(&self) -> bool {
        self.slots.lock().await.sealed
    }

    /// Copy of the staged messages in append order
    pub async fn snapshot(&self) -> Vec<Message> {
        self.slots.lock().await.messages.clone()
    }
}

impl std::fmt::Debug for BufferedBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedBatch")
            .field("role", &self.role)
            .field("capacity", &self.capacity)
            .field("staged", &self.len())
            .finish()
    }
}

/// Exclusive view of a batch during a flush or commit
pub struct BatchDrain<'a> {
    slots: MutexGuard<'a, Slots>,
    staged: &'a AtomicUsize,
}

impl BatchDrain<'_> {
    /// Staged messages, oldest first
    pub fn messages(&self) -> &[Message] {
        &self.slots.messages
    }

    pub fn len(&self) -> usize {
        self.slots.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.messages.is_empty()
    }

    /// Seal the batch without releasing the lock, so no append can slip in
    /// between this final drain and the owner's close.
    pub fn seal(&mut self) {
        self.slots.sealed = true;
    }

    /// Reset the cursor. Call only after the broker confirmed the batch.
    pub fn commit(mut self) {
        self.slots.messages.clear();
        self.staged.store(0, Ordering::Release);
    }
}
