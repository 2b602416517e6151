//! Lamport logical time.

use parking_lot::Mutex;

/// A Lamport clock: a monotone `u64` advanced by local events and by
/// observing remote timestamps.
///
/// The sequence of values returned by [`tick`](Clock::tick) is strictly
/// increasing. After [`observe(t)`](Clock::observe), every subsequent tick
/// exceeds `t`. All operations take the internal lock, so concurrent callers
/// see a total order on ticks.
#[derive(Debug, Default)]
pub struct Clock {
    time: Mutex<u64>,
}

impl Clock {
    /// Creates a clock starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a clock resuming from a previously persisted time.
    pub fn with_time(time: u64) -> Self {
        Clock {
            time: Mutex::new(time),
        }
    }

    /// Advances the clock by one and returns the new time.
    ///
    /// Call before every local mutation.
    pub fn tick(&self) -> u64 {
        let mut time = self.time.lock();
        *time += 1;
        *time
    }

    /// Merges a remote timestamp: sets the clock to `max(local, remote) + 1`
    /// and returns the new time.
    ///
    /// Call when absorbing remote state, before the state itself is merged.
    pub fn observe(&self, remote: u64) -> u64 {
        let mut time = self.time.lock();
        if remote > *time {
            *time = remote;
        }
        *time += 1;
        *time
    }

    /// Returns the current time without advancing.
    pub fn now(&self) -> u64 {
        *self.time.lock()
    }
}

impl Clone for Clock {
    fn clone(&self) -> Self {
        Clock::with_time(self.now())
    }
}
