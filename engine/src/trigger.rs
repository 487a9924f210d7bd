//! Flush trigger policy - decides when a queue should be sent.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default queue length that triggers a flush.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default interval of the periodic flush.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Why a flush was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FlushReason {
    /// The queue reached the batch size
    BatchThreshold,
    /// The periodic timer fired with a non-empty queue
    Periodic,
    /// A caller asked for it (save now, navigate away, idle)
    Explicit,
    /// Scheduled after a failed flush
    Retry { attempt: u32 },
    /// Connectivity came back
    Reconnect,
}

/// When to flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Queue length that triggers a flush; also the max batch sent at once
    pub batch_size: usize,
    /// How often non-empty queues are flushed regardless of size
    pub interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            interval: DEFAULT_SYNC_INTERVAL,
        }
    }
}

impl FlushPolicy {
    pub fn new(batch_size: usize, interval: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            interval,
        }
    }

    /// Evaluated after every enqueue.
    pub fn on_enqueue(&self, queue_len: usize) -> Option<FlushReason> {
        (queue_len >= self.batch_size).then_some(FlushReason::BatchThreshold)
    }

    /// Evaluated on every periodic tick.
    pub fn on_tick(&self, queue_len: usize) -> Option<FlushReason> {
        (queue_len > 0).then_some(FlushReason::Periodic)
    }

    /// Evaluated after a successful flush, in case the queue is still full.
    pub fn after_flush(&self, queue_len: usize) -> Option<FlushReason> {
        self.on_enqueue(queue_len)
    }
}
