use std::sync::atomic::{AtomicU64, Ordering};

use super::{LogicalClock, Timestamp};

/// Scalar Lamport clock.
///
/// Every operation returns a value strictly greater than anything this clock
/// has returned before, so it is safe to share between threads. The one
/// exception is `u64::MAX`, where the clock stops instead of wrapping.
#[derive(Debug, Default)]
pub struct LamportClock {
    time: AtomicU64,
}

impl LamportClock {
    pub fn new(time: Timestamp) -> Self {
        Self {
            time: AtomicU64::new(time),
        }
    }

    // Sets the clock to `f(local) + 1` atomically, pinned at u64::MAX
    fn advance<F: Fn(Timestamp) -> Timestamp>(&self, f: F) -> Timestamp {
        // fetch_update retries on contention, the closure never bails
        let prev = self
            .time
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |local| {
                Some(f(local).saturating_add(1))
            })
            .unwrap_or_else(|local| local);
        f(prev).saturating_add(1)
    }
}

impl LogicalClock for LamportClock {
    fn tick(&self) -> Timestamp {
        self.advance(|local| local)
    }

    fn observe(&self, external: Timestamp) -> Timestamp {
        self.advance(|local| local.max(external))
    }

    fn time(&self) -> Timestamp {
        self.time.load(Ordering::SeqCst)
    }
}
