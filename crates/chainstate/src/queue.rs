//! Blocking work queue connecting pipeline stages.
//!
//! `completed` closes the queue and lets consumers drain what is left;
//! `terminate` discards pending items and wakes every consumer at once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

pub struct WorkQueue<T> {
    sender: RwLock<Option<Sender<T>>>,
    receiver: Receiver<T>,
    terminated: AtomicBool,
    pushed: AtomicU64,
    popped: AtomicU64,
}

impl<T> WorkQueue<T> {
    pub fn bounded(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        Self::from_parts(sender, receiver)
    }

    pub fn unbounded() -> Self {
        let (sender, receiver) = unbounded();
        Self::from_parts(sender, receiver)
    }

    fn from_parts(sender: Sender<T>, receiver: Receiver<T>) -> Self {
        Self {
            sender: RwLock::new(Some(sender)),
            receiver,
            terminated: AtomicBool::new(false),
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
        }
    }

    /// Blocks while the queue is full. Returns the item if the queue is
    /// already closed.
    pub fn push(&self, item: T) -> Result<(), T> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(item);
        }
        let sender = match self
            .sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(sender) => sender.clone(),
            None => return Err(item),
        };
        sender.send(item).map_err(|err| err.into_inner())?;
        self.pushed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Next item, or `None` once the queue is closed and drained, or
    /// terminated.
    pub fn pop(&self) -> Option<T> {
        if self.terminated.load(Ordering::Acquire) {
            return None;
        }
        let item = self.receiver.recv().ok()?;
        if self.terminated.load(Ordering::Acquire) {
            return None;
        }
        self.popped.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    pub fn completed(&self) {
        self.sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
        while self.receiver.try_recv().is_ok() {}
        self.completed();
        while self.receiver.try_recv().is_ok() {}
    }

    pub fn is_closed(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
            || self
                .sender
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .is_none()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn popped(&self) -> u64 {
        self.popped.load(Ordering::Relaxed)
    }
}
