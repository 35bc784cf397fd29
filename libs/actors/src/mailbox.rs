//! Priority Mailbox
//!
//! Three bounded FIFO queues (high, medium, low) per object plus a wake-up
//! flag the worker blocks on.
//!
//! # Overflow policy
//!
//! `push` never blocks and never fails. When a queue grows past its capacity
//! it is first compacted: entries sharing a [`CompactionKey`] collapse to the
//! most recently pushed one, survivors keep their relative order. If the
//! queue is still over capacity the oldest `overflow_drop` entries are
//! discarded and counted as lost.
//!
//! # Ordering
//!
//! Strict priority between classes, FIFO inside a class. A sustained stream
//! of high priority traffic starves the lower classes.

use parking_lot::{Condvar, Mutex};
use plant_config::RuntimeConfig;
use plant_types::{CompactionKey, Message, Priority};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Snapshot of one priority class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub priority: Priority,
    pub len: usize,
    pub capacity: usize,
    /// Largest length ever observed after a push
    pub max_len: usize,
    pub lost: u64,
}

/// What happened to a queue during one push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PushOutcome {
    /// Superseded entries removed by compaction
    pub compacted: usize,
    /// Oldest entries discarded after compaction
    pub dropped: usize,
}

#[derive(Debug, Default)]
struct QueueInner {
    entries: VecDeque<Arc<Message>>,
    max_len: usize,
}

/// Bounded FIFO for one priority class
#[derive(Debug)]
pub struct MessageQueue {
    priority: Priority,
    capacity: usize,
    overflow_drop: usize,
    inner: Mutex<QueueInner>,
    lost: AtomicU64,
}

impl MessageQueue {
    pub fn new(priority: Priority, capacity: usize, overflow_drop: usize) -> Self {
        Self {
            priority,
            capacity: capacity.max(1),
            overflow_drop: overflow_drop.max(1),
            inner: Mutex::new(QueueInner::default()),
            lost: AtomicU64::new(0),
        }
    }

    pub fn push(&self, msg: Arc<Message>) -> PushOutcome {
        let mut outcome = PushOutcome::default();
        let mut inner = self.inner.lock();
        inner.entries.push_back(msg);

        if inner.entries.len() > self.capacity {
            let before = inner.entries.len();
            compact(&mut inner.entries);
            outcome.compacted = before - inner.entries.len();

            let len = inner.entries.len();
            if len > self.capacity {
                let k = self.overflow_drop.max(len - self.capacity).min(len);
                inner.entries.drain(..k);
                outcome.dropped = k;
                self.lost.fetch_add(k as u64, Ordering::Relaxed);
            }
        }

        let len = inner.entries.len();
        if len > inner.max_len {
            inner.max_len = len;
        }
        outcome
    }

    pub fn pop(&self) -> Option<Arc<Message>> {
        self.inner.lock().entries.pop_front()
    }

    pub fn front(&self) -> Option<Arc<Message>> {
        self.inner.lock().entries.front().cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages discarded so far; never decreases
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            priority: self.priority,
            len: inner.entries.len(),
            capacity: self.capacity,
            max_len: inner.max_len,
            lost: self.lost(),
        }
    }
}

/// Keep the newest entry per compaction key, preserving push order.
fn compact(entries: &mut VecDeque<Arc<Message>>) {
    let mut seen: HashSet<CompactionKey> = HashSet::with_capacity(entries.len());
    let mut survivors: Vec<Arc<Message>> = Vec::with_capacity(entries.len());
    for msg in entries.drain(..).rev() {
        if seen.insert(msg.compaction_key()) {
            survivors.push(msg);
        }
    }
    entries.extend(survivors.into_iter().rev());
}

/// Per-object mailbox: one queue per priority class and a wake-up signal
#[derive(Debug)]
pub struct Mailbox {
    high: MessageQueue,
    medium: MessageQueue,
    low: MessageQueue,
    wakeup: Mutex<bool>,
    wakeup_cv: Condvar,
}

impl Mailbox {
    pub fn new(capacity: usize, overflow_drop: usize) -> Self {
        Self {
            high: MessageQueue::new(Priority::High, capacity, overflow_drop),
            medium: MessageQueue::new(Priority::Medium, capacity, overflow_drop),
            low: MessageQueue::new(Priority::Low, capacity, overflow_drop),
            wakeup: Mutex::new(false),
            wakeup_cv: Condvar::new(),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.mailbox_capacity, config.overflow_drop())
    }

    pub fn queue(&self, priority: Priority) -> &MessageQueue {
        match priority {
            Priority::High => &self.high,
            Priority::Medium => &self.medium,
            Priority::Low => &self.low,
        }
    }

    /// Enqueue by priority and wake a blocked `wait`
    pub fn push(&self, msg: impl Into<Arc<Message>>) -> PushOutcome {
        let msg = msg.into();
        let priority = msg.priority();
        let outcome = self.queue(priority).push(msg);

        if outcome.dropped > 0 {
            warn!(
                priority = %priority,
                compacted = outcome.compacted,
                dropped = outcome.dropped,
                lost = self.queue(priority).lost(),
                "Mailbox overflow: oldest messages dropped"
            );
        } else if outcome.compacted > 0 {
            debug!(
                priority = %priority,
                compacted = outcome.compacted,
                "Mailbox compacted superseded messages"
            );
        }

        self.cancel_wait();
        outcome
    }

    /// Highest priority message, earliest first within a class
    pub fn pop(&self) -> Option<Arc<Message>> {
        Priority::DESCENDING
            .iter()
            .find_map(|p| self.queue(*p).pop())
    }

    /// Message `pop` would return, without removing it
    pub fn top(&self) -> Option<Arc<Message>> {
        Priority::DESCENDING
            .iter()
            .find_map(|p| self.queue(*p).front())
    }

    /// Pop a message, blocking up to `timeout` (`None` = until woken) when
    /// all queues are empty.
    pub fn wait(&self, timeout: Option<Duration>) -> Option<Arc<Message>> {
        if let Some(msg) = self.pop() {
            return Some(msg);
        }

        let mut woken = self.wakeup.lock();
        match timeout {
            Some(timeout) => {
                self.wakeup_cv
                    .wait_while_for(&mut woken, |woken| !*woken, timeout);
            }
            None => {
                self.wakeup_cv.wait_while(&mut woken, |woken| !*woken);
            }
        }
        *woken = false;
        drop(woken);

        self.pop()
    }

    /// Unblock a pending or the next `wait` immediately
    pub fn cancel_wait(&self) {
        let mut woken = self.wakeup.lock();
        *woken = true;
        self.wakeup_cv.notify_all();
    }

    pub fn len(&self) -> usize {
        self.high.len() + self.medium.len() + self.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.high.capacity()
    }

    pub fn lost(&self) -> u64 {
        self.high.lost() + self.medium.lost() + self.low.lost()
    }

    /// Stats per class, highest priority first
    pub fn stats(&self) -> Vec<QueueStats> {
        Priority::DESCENDING
            .iter()
            .map(|p| self.queue(*p).stats())
            .collect()
    }
}
