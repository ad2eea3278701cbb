// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicUsize, Ordering};

const MAX_WAIT_UNITS: usize = 10;

/// [`Breaker`] is kind of a circuit-breaker and busy keeper for short
/// delays on spin loops on the CPU. Each call to [`Self::spin`] doubles the
/// busy period until the breaker trips, at which point the caller has to
/// give up on waiting and resolve the situation another way.
#[derive(Default, Debug)]
pub struct Breaker {
    unit: AtomicUsize,
}

impl Breaker {
    /// Keeps the CPU busy for an exponentially growing number of wait
    /// units, hinting the processor that this is a spin loop. Returns
    /// `Err(())` once the maximum number of escalations is reached.
    pub fn spin(&self) -> Result<(), ()> {
        match self.unit.load(Ordering::Acquire) {
            unit if unit <= MAX_WAIT_UNITS => {
                for _ in 0..(1 << unit) {
                    core::hint::spin_loop();
                }
                self.unit.store(unit + 1, Ordering::Release);
                Ok(())
            }
            _ => Err(()),
        }
    }

    /// Resets the breaker to the shortest wait.
    pub fn reset(&self) {
        self.unit.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_trips_after_escalation() {
        let breaker = Breaker::default();
        let mut spins = 0;
        while breaker.spin().is_ok() {
            spins += 1;
        }
        assert_eq!(spins, MAX_WAIT_UNITS + 1);

        breaker.reset();
        assert!(breaker.spin().is_ok());
    }
}
