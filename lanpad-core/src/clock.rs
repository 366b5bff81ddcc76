//! Lamport clock for identifier allocation.

/// Process-wide logical clock.
///
/// `tick()` returns `max(local, observed) + 1`; `observe()` folds in any
/// remote counter so the next local tick is strictly greater. A counter of
/// `u64::MAX` can never be followed, so remote counters must pass
/// [`LamportClock::can_follow`] before they are observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LamportClock {
    value: u64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self { value: 0 }
    }

    /// Advance and return the new counter, or `None` once exhausted.
    pub fn tick(&mut self) -> Option<u64> {
        self.value = self.value.checked_add(1)?;
        Some(self.value)
    }

    /// Whether a local tick is still possible after observing `remote`.
    pub fn can_follow(remote: u64) -> bool {
        remote < u64::MAX
    }

    /// Fold in a counter seen on a remote operation.
    pub fn observe(&mut self, remote: u64) {
        if remote > self.value {
            self.value = remote;
        }
    }

    /// Current value without advancing.
    pub fn current(&self) -> u64 {
        self.value
    }
}
