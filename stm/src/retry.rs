// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Condition-wait on transactional reads.
//!
//! A retrying transaction publishes a wait handle describing the stripes
//! it read, rolls itself back, and parks. A committing writer whose
//! acquired stripes overlap a published handle wakes that waiter, which
//! then reruns its body. Parking is bounded so that a lost wakeup can only
//! ever cost one timeout, never liveness.

use crate::bloom::Filter;
use crate::config::RetryChoice;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long the sleep policy naps before rerunning.
pub(crate) const RETRY_SLEEP_MICROS: u64 = 50;

/// Upper bound on a single park before the waiter rechecks on its own.
const MAX_PARK: Duration = Duration::from_millis(50);

/// One thread's published read set and parking spot. The handle is owned
/// by its thread for life and reset before every wait.
pub(crate) struct WaitHandle {
    filter: Filter,
    stripes: Mutex<Vec<usize>>,
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl WaitHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            filter: Filter::new(),
            stripes: Mutex::new(Vec::new()),
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    pub fn reset(&self) {
        self.filter.clear();
        self.stripes.lock().clear();
        *self.signaled.lock() = false;
    }

    pub fn insert(&self, stripe: usize) {
        self.filter.insert(stripe);
        self.stripes.lock().push(stripe);
    }

    fn matches(&self, policy: RetryChoice, touched: &Filter, touched_stripes: &[usize]) -> bool {
        match policy {
            RetryChoice::Sleep => false,
            RetryChoice::Bloom => self.filter.intersects(touched),
            RetryChoice::VisRead => {
                // the sketch prefilters, the exact list decides
                if !self.filter.intersects(touched) {
                    return false;
                }
                let mine = self.stripes.lock();
                touched_stripes.iter().any(|stripe| mine.contains(stripe))
            }
        }
    }

    pub fn wake(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_all();
    }

    /// Park until woken or until the bound elapses.
    pub fn park(&self) {
        let deadline = Instant::now() + MAX_PARK;
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                break;
            }
        }
    }
}

/// Process-wide list of parked waiters.
pub(crate) struct RetryTable {
    policy: RetryChoice,
    waiters: Mutex<Vec<Arc<WaitHandle>>>,
}

impl RetryTable {
    pub fn new(policy: RetryChoice) -> Self {
        Self {
            policy,
            waiters: Mutex::new(Vec::new()),
        }
    }

    pub fn policy(&self) -> RetryChoice {
        self.policy
    }

    pub fn publish(&self, handle: &Arc<WaitHandle>) {
        if self.policy != RetryChoice::Sleep {
            self.waiters.lock().push(handle.clone());
        }
    }

    pub fn withdraw(&self, handle: &Arc<WaitHandle>) {
        if self.policy != RetryChoice::Sleep {
            self.waiters
                .lock()
                .retain(|waiter| !Arc::ptr_eq(waiter, handle));
        }
    }

    /// Called by a committing writer with the stripes it released. Wakes
    /// every waiter whose published read set intersects them.
    pub fn notify(&self, touched_stripes: &[usize]) {
        if self.policy == RetryChoice::Sleep {
            return;
        }
        let waiters: Vec<Arc<WaitHandle>> = {
            let guard = self.waiters.lock();
            if guard.is_empty() {
                return;
            }
            guard.clone()
        };
        let touched = Filter::new();
        for &stripe in touched_stripes {
            touched.insert(stripe);
        }
        for waiter in waiters {
            if waiter.matches(self.policy, &touched, touched_stripes) {
                waiter.wake();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_notify_wakes_intersecting_waiter() {
        let table = RetryTable::new(RetryChoice::Bloom);
        let handle = WaitHandle::new();
        handle.reset();
        handle.insert(42);
        table.publish(&handle);

        let parked = handle.clone();
        let waiter = thread::spawn(move || {
            let started = Instant::now();
            parked.park();
            started.elapsed()
        });

        // give the waiter a moment to park, then commit stripe 42
        thread::sleep(Duration::from_millis(5));
        table.notify(&[42]);

        let waited = waiter.join().unwrap();
        assert!(waited < MAX_PARK);
        table.withdraw(&handle);
    }

    #[test]
    fn test_disjoint_commit_times_out() {
        let table = RetryTable::new(RetryChoice::VisRead);
        let handle = WaitHandle::new();
        handle.reset();
        handle.insert(7);
        table.publish(&handle);

        table.notify(&[8, 9]);
        let started = Instant::now();
        handle.park();
        assert!(started.elapsed() >= MAX_PARK - Duration::from_millis(5));
        table.withdraw(&handle);
    }
}
