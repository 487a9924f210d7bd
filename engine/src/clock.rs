//! Operation clock for stamping local edits with monotonic versions.
//!
//! Each device keeps one clock. Versions only move forward, which is what the
//! queue relies on to reject out-of-order operations.

use crate::{DeviceId, Version};
use serde::{Deserialize, Serialize};

/// A per-device counter that hands out operation versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationClock {
    /// Device the clock belongs to
    pub device_id: DeviceId,
    /// Last version handed out
    pub counter: Version,
}

impl OperationClock {
    /// Create a new clock for a device, starting at counter 0.
    pub fn new(device_id: impl Into<DeviceId>) -> Self {
        Self {
            device_id: device_id.into(),
            counter: 0,
        }
    }

    /// Create a clock with a specific counter value.
    pub fn with_counter(device_id: impl Into<DeviceId>, counter: Version) -> Self {
        Self {
            device_id: device_id.into(),
            counter,
        }
    }

    /// Advance the clock and return the new version.
    pub fn tick(&mut self) -> Version {
        self.counter += 1;
        self.counter
    }

    /// Move the clock to at least `seen`.
    /// Used when a persisted queue is restored.
    pub fn observe(&mut self, seen: Version) {
        self.counter = self.counter.max(seen);
    }
}
