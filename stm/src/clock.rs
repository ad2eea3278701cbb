// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};

/// Global clock ordering all committing writer transactions.
///
/// Transactions snapshot the clock at begin and compare ownership-record
/// versions against the snapshot; each writer commit advances the clock by
/// exactly one and stamps every released record with the ticket it drew.
#[derive(Default, Debug)]
pub struct GlobalClock {
    now: AtomicU64,
}

impl GlobalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value, with acquire ordering so that everything published
    /// before the last advance is visible to the caller.
    pub fn snapshot(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    /// Draws the next commit ticket. Two committers never share one.
    pub fn advance(&self) -> u64 {
        self.now.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::GlobalClock;
    use std::sync::Arc;
    use threadpool::ThreadPool;

    #[test]
    fn test_advance_is_monotone() {
        let clock = GlobalClock::new();
        assert_eq!(clock.snapshot(), 0);
        assert_eq!(clock.advance(), 1);
        assert_eq!(clock.advance(), 2);
        assert_eq!(clock.snapshot(), 2);
    }

    #[test]
    fn test_tickets_are_unique_across_threads() {
        let clock = Arc::new(GlobalClock::new());
        let pool = ThreadPool::new(8);
        let rounds = 1000;

        for _ in 0..8 {
            let clock = clock.clone();
            pool.execute(move || {
                let mut last = 0;
                for _ in 0..rounds {
                    let ticket = clock.advance();
                    assert!(ticket > last);
                    last = ticket;
                }
            });
        }
        pool.join();

        assert_eq!(clock.snapshot(), 8 * rounds);
    }
}
