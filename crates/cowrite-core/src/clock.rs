//! Lamport clock.
//!
//! A monotonic counter providing the causal-advancement half of character
//! ordering. Ticks on every local edit; observes every remote operation so
//! the local clock always dominates everything this replica has seen.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LamportClock {
    time: u64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self { time: 0 }
    }

    pub fn with_time(time: u64) -> Self {
        Self { time }
    }

    pub fn time(&self) -> u64 {
        self.time
    }

    /// Advance for a local event and return the new time.
    pub fn tick(&mut self) -> u64 {
        self.time += 1;
        self.time
    }

    /// Advance past a remote timestamp: `max(local, remote) + 1`.
    pub fn observe(&mut self, remote: u64) -> u64 {
        self.time = self.time.max(remote) + 1;
        self.time
    }

    /// Take the later of two clocks without ticking. Used on snapshot restore.
    pub fn merge(&mut self, other: u64) {
        self.time = self.time.max(other);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_is_strictly_monotonic() {
        let mut clock = LamportClock::new();
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);
        assert_eq!(clock.time(), 2);
    }

    #[test]
    fn observe_dominates_remote() {
        let mut clock = LamportClock::with_time(3);
        assert_eq!(clock.observe(10), 11);
        // A stale remote still advances the clock.
        assert_eq!(clock.observe(2), 12);
    }

    #[test]
    fn merge_never_goes_backwards() {
        let mut clock = LamportClock::with_time(7);
        clock.merge(3);
        assert_eq!(clock.time(), 7);
        clock.merge(9);
        assert_eq!(clock.time(), 9);
    }
}
