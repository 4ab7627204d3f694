//! Simulation time arithmetic.
//!
//! The world advances in discrete ticks; `ticks_per_day` ticks form one day.
//! The persisted tick counter records *completed* ticks, so a freshly created
//! simulation sits at tick 0, day 0. While a tick executes it is identified
//! by its 1-based *executing index* (`completed + 1`); day-start work (labor
//! matching, wage payment, education) runs when the executing index is the
//! first tick of its day.

use serde::{Deserialize, Serialize};

/// Tick/day arithmetic for one simulation.
///
/// # Example
/// ```
/// use econ_simulator_core_rs::TimeManager;
///
/// let time = TimeManager::new(3);
/// assert_eq!(time.day_of(6), 2);
/// assert!(time.is_day_boundary(3));
/// assert_eq!(time.tick_in_day(4), 1); // tick 4 opens day 1
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeManager {
    ticks_per_day: u64,
}

impl TimeManager {
    /// # Panics
    /// Panics if `ticks_per_day` is zero; configuration validation rejects
    /// that value before any `TimeManager` is built.
    pub fn new(ticks_per_day: u64) -> Self {
        assert!(ticks_per_day > 0, "ticks_per_day must be positive");
        Self { ticks_per_day }
    }

    /// Day a completed-tick counter belongs to: `tick / ticks_per_day`.
    pub fn day_of(&self, tick: u64) -> u64 {
        tick / self.ticks_per_day
    }

    /// A simulation is at a day boundary when its completed-tick counter is
    /// a multiple of `ticks_per_day` (including tick 0). Script code updates
    /// are only permitted here.
    pub fn is_day_boundary(&self, tick: u64) -> bool {
        tick % self.ticks_per_day == 0
    }

    /// 1-based executing index for the tick that moves the world off
    /// `completed_tick`.
    pub fn executing_index(&self, completed_tick: u64) -> u64 {
        completed_tick + 1
    }

    /// 1-based position of an executing index within its day.
    ///
    /// The first tick of every day returns 1, which gates labor clearing,
    /// wage payment and education progress.
    pub fn tick_in_day(&self, tick_index: u64) -> u64 {
        debug_assert!(tick_index > 0, "executing indices are 1-based");
        ((tick_index - 1) % self.ticks_per_day) + 1
    }

    pub fn ticks_per_day(&self) -> u64 {
        self.ticks_per_day
    }
}
