//! Per-document FIFO of operations waiting to be flushed.

use crate::{error::Result, EditorOperation, Error, Version};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Ordered operations for one document.
///
/// Insertion order is causal order: drains come off the head, failed batches
/// go back on the head, new edits go on the tail.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationQueue {
    ops: VecDeque<EditorOperation>,
    /// Highest version ever enqueued, survives drains
    high_water: Version,
}

impl OperationQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a queue from persisted operations, oldest first.
    pub fn from_operations(ops: Vec<EditorOperation>) -> Result<Self> {
        let mut queue = Self::new();
        for op in ops {
            queue.push(op)?;
        }
        Ok(queue)
    }

    /// Append an operation to the tail.
    ///
    /// Versions must strictly increase across pushes.
    pub fn push(&mut self, op: EditorOperation) -> Result<()> {
        self.check_order(&op)?;
        self.high_water = op.version;
        self.ops.push_back(op);
        Ok(())
    }

    /// Check an operation would be accepted by [`OperationQueue::push`].
    pub fn check_order(&self, op: &EditorOperation) -> Result<()> {
        if op.version <= self.high_water {
            return Err(Error::OutOfOrderOperation {
                op_id: op.id.clone(),
                version: op.version,
                last: self.high_water,
            });
        }
        Ok(())
    }

    /// Remove and return up to `max` operations from the head.
    pub fn drain(&mut self, max: usize) -> Vec<EditorOperation> {
        let count = max.min(self.ops.len());
        self.ops.drain(..count).collect()
    }

    /// Put a batch back at the head, keeping its internal order.
    pub fn requeue_front(&mut self, batch: Vec<EditorOperation>) {
        for op in batch.into_iter().rev() {
            self.ops.push_front(op);
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Highest version ever enqueued.
    pub fn high_water(&self) -> Version {
        self.high_water
    }

    /// Iterate queued operations, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &EditorOperation> {
        self.ops.iter()
    }

    /// Remove everything, returning the operations in order.
    pub fn take_all(&mut self) -> Vec<EditorOperation> {
        self.ops.drain(..).collect()
    }
}
