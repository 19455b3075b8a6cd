//! Atomic counters backing the flow-control stats surface.
//!
//! Monotonic counters live outside the per-destination state lock so that
//! operational tooling can read them without contending with senders.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter for monotonic metrics.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter starting at 0.
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by n.
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Reset to 0 and return the previous value.
    pub fn reset(&self) -> u64 {
        self.value.swap(0, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_operations() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);

        counter.inc();
        counter.add(4);
        assert_eq!(counter.get(), 5);

        assert_eq!(counter.reset(), 5);
        assert_eq!(counter.get(), 0);
    }
}
