// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Ownership records.
//!
//! Every word of shared memory hashes onto a stripe, and every stripe is
//! guarded by one ownership record: a single atomic word that either holds
//! the stripe's version number or marks the stripe as locked by the
//! registry slot of the owning thread. The low bit discriminates the two
//! shapes; the payload lives in the remaining bits.

use std::sync::atomic::{AtomicU64, Ordering};

const LOCKED_BIT: u64 = 1;

/// The decoded shape of an ownership record.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OrecState {
    /// Unlocked, last written by the commit that drew this version.
    Version(u64),
    /// Locked by the thread registered at this slot.
    Owned(usize),
}

/// One ownership record. Values in version shape only ever grow, except
/// while displaced by a locked shape that is released at a higher version.
#[derive(Default)]
pub struct Orec {
    word: AtomicU64,
}

impl Orec {
    pub fn load(&self) -> OrecState {
        decode(self.word.load(Ordering::Acquire))
    }

    /// CAS from version shape at `expected` into locked-by-`owner`.
    /// Fails if any writer intervened since `expected` was observed.
    pub fn try_lock(&self, expected: u64, owner: usize) -> bool {
        self.word
            .compare_exchange(
                expected << 1,
                ((owner as u64) << 1) | LOCKED_BIT,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Store a new version, releasing the lock. Only the owner calls this.
    pub fn release(&self, version: u64) {
        self.word.store(version << 1, Ordering::Release);
    }
}

fn decode(word: u64) -> OrecState {
    if word & LOCKED_BIT == 0 {
        OrecState::Version(word >> 1)
    } else {
        OrecState::Owned((word >> 1) as usize)
    }
}

/// Fixed table of ownership records, indexed by an address hash.
pub struct OrecTable {
    stripes: Box<[Orec]>,
    mask: usize,
}

impl OrecTable {
    /// `len` must be a power of two.
    pub fn new(len: usize) -> Self {
        assert!(len.is_power_of_two());
        let stripes = (0..len).map(|_| Orec::default()).collect::<Vec<_>>();
        Self {
            stripes: stripes.into_boxed_slice(),
            mask: len - 1,
        }
    }

    /// Stripe index for an address. Pure function of the address.
    pub fn index_of(&self, addr: usize) -> usize {
        let word = addr >> 3;
        (word ^ (word >> 13)) & self.mask
    }

    pub fn at(&self, index: usize) -> &Orec {
        &self.stripes[index]
    }

    pub fn for_addr(&self, addr: usize) -> (usize, &Orec) {
        let index = self.index_of(addr);
        (index, &self.stripes[index])
    }

    pub fn len(&self) -> usize {
        self.stripes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use threadpool::ThreadPool;

    #[test]
    fn test_lock_release_cycle() {
        let orec = Orec::default();
        assert_eq!(orec.load(), OrecState::Version(0));

        assert!(orec.try_lock(0, 7));
        assert_eq!(orec.load(), OrecState::Owned(7));

        // a second locker must fail while the record is owned
        assert!(!orec.try_lock(0, 9));

        orec.release(5);
        assert_eq!(orec.load(), OrecState::Version(5));

        // stale expected version no longer wins
        assert!(!orec.try_lock(0, 9));
        assert!(orec.try_lock(5, 9));
    }

    #[test]
    fn test_single_winner_under_contention() {
        let orec = Arc::new(Orec::default());
        let pool = ThreadPool::new(8);
        let winners = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        for me in 0..8 {
            let orec = orec.clone();
            let winners = winners.clone();
            pool.execute(move || {
                if orec.try_lock(0, me) {
                    winners.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            });
        }
        pool.join();

        assert_eq!(winners.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_table_maps_addresses_stably() {
        let table = OrecTable::new(1 << 10);
        let addr = 0xdead_bee8usize;
        let (a, _) = table.for_addr(addr);
        let (b, _) = table.for_addr(addr);
        assert_eq!(a, b);
        assert!(a < table.len());
    }
}
