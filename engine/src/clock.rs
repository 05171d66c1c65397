//! Global sync clock.
//!
//! Every node keeps one monotonically increasing counter. Rows record the
//! value of the counter at their last write (`updated_at_sync_tick`), and
//! watermarks are plain counter values compared with `>=`.
//!
//! Sessions never take a single increment. They "tick, tock" the clock: the
//! counter advances by two, the session keeps the `tick` as its watermark and
//! any write landing during the session is stamped at `tock` or later. A later
//! snapshot starting from the session's `tick` therefore cannot miss a write
//! that committed while the session was running.

use crate::Tick;
use serde::{Deserialize, Serialize};

/// The two values produced by a tick-tock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickTock {
    /// Reserved for the caller; nothing else is stamped with it.
    pub tick: Tick,
    /// The value subsequent writes are stamped with.
    pub tock: Tick,
}

impl TickTock {
    /// Derive the pair from the counter value after a `+2` increment.
    pub fn from_incremented(value: Tick) -> Self {
        Self {
            tick: value - 1,
            tock: value,
        }
    }
}

/// An in-process sync clock.
///
/// Storage backends that keep the counter in a database compute the same
/// values with [`TickTock::from_incremented`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncClock {
    current: Tick,
}

impl SyncClock {
    /// Create a clock starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock at a specific value.
    pub fn starting_at(current: Tick) -> Self {
        Self { current }
    }

    /// The tick new writes are stamped with.
    pub fn current(&self) -> Tick {
        self.current
    }

    /// Advance by two and return both halves.
    pub fn tick_tock(&mut self) -> TickTock {
        self.current += 2;
        TickTock::from_incremented(self.current)
    }

    /// Ensure the clock is at least `other`. Used when importing state.
    pub fn merge(&mut self, other: Tick) {
        self.current = self.current.max(other);
    }
}

/// Whether a row last written at `updated_at` must be captured by a snapshot
/// starting at `since`. Inclusive, so a retry at the same watermark never
/// loses the boundary row.
pub fn is_changed_since(updated_at: Tick, since: Tick) -> bool {
    updated_at >= since
}
