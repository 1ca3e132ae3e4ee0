//! Outbound delivery queue.
//!
//! Entries are served by priority (higher value first) and, inside one
//! priority, in submission order. A message id can be queued at most once;
//! it stays reserved until its entry is delivered, dropped after its last
//! retry, or purged as expired.

use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashSet, VecDeque},
    time::Duration,
};

use ds::{Priority, Shipment};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::{cache::ThanosCache, config::ClientConfig, protocol::MessageRef};

#[derive(Debug, Clone)]
pub struct QueueEntry {
    shipment: Shipment,
    message: MessageRef,
    seq: u64,
    attempts: u32,
    enqueued_at: u64,
    not_before: u64,
}

impl QueueEntry {
    pub fn shipment(&self) -> &Shipment {
        &self.shipment
    }

    pub fn message(&self) -> &MessageRef {
        &self.message
    }

    pub fn priority(&self) -> Priority {
        self.shipment.priority
    }

    /// Failed push attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: u64,
    pub expiry: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration, expiry: Duration) -> Self {
        Self {
            max_retries,
            retry_delay: retry_delay.as_millis() as u64,
            expiry: expiry.as_millis() as u64,
        }
    }
}

impl From<&ClientConfig> for RetryPolicy {
    fn from(config: &ClientConfig) -> Self {
        Self::new(
            config.max_retries,
            config.retry_delay,
            config.shipment_expiry,
        )
    }
}

#[derive(Debug)]
pub enum RetryOutcome {
    Requeued,
    /// Out of retries; the entry has left the queue.
    Exhausted(QueueEntry),
}

#[derive(Debug, Default)]
struct QueueInner {
    lanes: BTreeMap<Reverse<Priority>, VecDeque<QueueEntry>>,
    /// Ids of every entry still owned by the queue, including ones handed out by `next`.
    reserved: HashSet<String>,
    next_seq: u64,
}

impl QueueInner {
    fn waiting(&self) -> usize {
        self.lanes.values().map(VecDeque::len).sum()
    }
}

pub struct DeliveryQueue {
    inner: Mutex<QueueInner>,
    policy: RetryPolicy,
}

impl DeliveryQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            policy,
        }
    }

    /// Queue a shipment. Returns false if the message is already queued.
    pub fn append(&self, message: MessageRef, shipment: Shipment, now: u64) -> bool {
        let mut inner = self.inner.lock();
        if !inner.reserved.insert(message.id.clone()) {
            debug!("Message {} already queued", message.id);
            return false;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let entry = QueueEntry {
            shipment,
            message,
            seq,
            attempts: 0,
            enqueued_at: now,
            not_before: now,
        };
        inner
            .lanes
            .entry(Reverse(entry.priority()))
            .or_default()
            .push_back(entry);
        true
    }

    /// Take the first due entry. Its id stays reserved until
    /// [`complete`](Self::complete) or an exhausted [`retry`](Self::retry).
    pub fn next(&self, now: u64) -> Option<QueueEntry> {
        let mut inner = self.inner.lock();
        for lane in inner.lanes.values_mut() {
            if let Some(pos) = lane.iter().position(|e| e.not_before <= now) {
                return lane.remove(pos);
            }
        }
        None
    }

    /// Release a delivered entry.
    pub fn complete(&self, entry: &QueueEntry) {
        self.inner.lock().reserved.remove(&entry.message.id);
    }

    /// Record a failed push and put the entry back in its original position,
    /// or give up once the retry budget is spent.
    pub fn retry(&self, mut entry: QueueEntry, now: u64) -> RetryOutcome {
        entry.attempts += 1;
        let mut inner = self.inner.lock();
        if entry.attempts > self.policy.max_retries {
            inner.reserved.remove(&entry.message.id);
            warn!(
                "Giving up on {} after {} attempts",
                entry.message.id, entry.attempts
            );
            return RetryOutcome::Exhausted(entry);
        }
        entry.not_before = now.saturating_add(self.policy.retry_delay);
        let lane = inner.lanes.entry(Reverse(entry.priority())).or_default();
        let pos = lane.partition_point(|e| e.seq < entry.seq);
        lane.insert(pos, entry);
        RetryOutcome::Requeued
    }

    /// Drop entries older than the expiry and hand them back for failure reporting.
    pub fn purge(&self, now: u64) -> Vec<QueueEntry> {
        let mut inner = self.inner.lock();
        let expiry = self.policy.expiry;
        let mut expired = Vec::new();
        for lane in inner.lanes.values_mut() {
            let (keep, gone): (VecDeque<_>, VecDeque<_>) = lane
                .drain(..)
                .partition(|e| now.saturating_sub(e.enqueued_at) <= expiry);
            *lane = keep;
            expired.extend(gone);
        }
        inner.lanes.retain(|_, lane| !lane.is_empty());
        for entry in &expired {
            inner.reserved.remove(&entry.message.id);
        }
        if !expired.is_empty() {
            debug!("Purged {} expired shipments", expired.len());
        }
        expired
    }

    /// Drop everything without reporting. Returns how many entries were waiting.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.waiting();
        inner.lanes.clear();
        inner.reserved.clear();
        dropped
    }

    /// Entries waiting to be served.
    pub fn len(&self) -> usize {
        self.inner.lock().waiting()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.inner.lock().reserved.contains(message_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Queued,
    Sent,
    Failed(String),
}

/// Last known status per message id, bounded by half-eviction.
pub struct DeliveryTracker {
    statuses: ThanosCache<String, DeliveryStatus>,
}

impl DeliveryTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            statuses: ThanosCache::new(capacity),
        }
    }

    /// Record `status`. A finished delivery (sent or failed) never goes back to queued.
    pub fn mark(&self, message: &MessageRef, status: DeliveryStatus) -> bool {
        let queued = status == DeliveryStatus::Queued;
        self.statuses
            .insert_unless(message.id.clone(), status, |current| {
                queued && *current != DeliveryStatus::Queued
            })
    }

    pub fn status(&self, message: &MessageRef) -> Option<DeliveryStatus> {
        self.statuses.get(&message.id)
    }

    pub fn reduce_memory(&self) -> usize {
        self.statuses.reduce_memory()
    }
}
