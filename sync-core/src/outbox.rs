//! Outbox of unpushed datawallet modifications.
//!
//! Modifications flow through the outbox in this order:
//! 1. `enqueue()` - a local mutation was recorded
//! 2. `take_batch()` - moved to pending while a push is in flight
//! 3. `ack()` - the backbone accepted the push, the records are gone
//!
//! If the push fails, `nack_all()` moves pending records back to the front
//! of the queue in their original order. Every record carries a sequence
//! number so the outbox can be rebuilt from persisted records in the order
//! they were recorded.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tether_sync_types::{DatawalletModification, ModificationId};

/// A modification waiting to be pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedModification {
    /// Position in recording order.
    pub sequence: u64,
    /// The modification.
    pub modification: DatawalletModification,
}

impl QueuedModification {
    /// Local id of the wrapped modification.
    pub fn local_id(&self) -> &ModificationId {
        &self.modification.local_id
    }
}

/// Ordered queue of unpushed modifications with pending tracking.
#[derive(Debug, Default)]
pub struct Outbox {
    /// Records waiting to be pushed.
    queue: VecDeque<QueuedModification>,
    /// Records handed out by `take_batch` and not yet acknowledged, by sequence.
    pending: BTreeMap<u64, QueuedModification>,
    /// Sequence number of the next enqueued record.
    next_sequence: u64,
}

impl Outbox {
    /// An empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an outbox from persisted records.
    pub fn restore(mut records: Vec<QueuedModification>) -> Self {
        records.sort_by_key(|r| r.sequence);
        let next_sequence = records.last().map(|r| r.sequence + 1).unwrap_or(0);
        Self {
            queue: records.into(),
            pending: BTreeMap::new(),
            next_sequence,
        }
    }

    /// Add a modification to the end of the queue.
    ///
    /// Returns the queued record, for persistence.
    pub fn enqueue(&mut self, modification: DatawalletModification) -> QueuedModification {
        let record = QueuedModification {
            sequence: self.next_sequence,
            modification,
        };
        self.next_sequence += 1;
        self.queue.push_back(record.clone());
        record
    }

    /// Move up to `max` records (all when `None`) from the queue to pending.
    pub fn take_batch(&mut self, max: Option<usize>) -> Vec<QueuedModification> {
        let count = max.unwrap_or(self.queue.len()).min(self.queue.len());
        let batch: Vec<_> = self.queue.drain(..count).collect();
        for record in &batch {
            self.pending.insert(record.sequence, record.clone());
        }
        batch
    }

    /// Forget pending records the backbone accepted.
    pub fn ack(&mut self, local_ids: &[ModificationId]) {
        self.pending
            .retain(|_, record| !local_ids.contains(record.local_id()));
    }

    /// Return every pending record to the front of the queue.
    pub fn nack_all(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for (_, record) in pending.into_iter().rev() {
            self.queue.push_front(record);
        }
    }

    /// Whether `local_id` is pending.
    pub fn is_pending(&self, local_id: &ModificationId) -> bool {
        self.pending.values().any(|r| r.local_id() == local_id)
    }

    /// Number of queued records (not including pending).
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued or pending.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.pending.is_empty()
    }

    /// Number of pending records.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
