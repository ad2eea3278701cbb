// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! A small fixed-size sketch over ownership-record indices. Writers insert
//! the stripes they touched, waiters and the single-writer token publish
//! theirs, and intersection tests decide who has to be woken or held back.

use std::sync::atomic::{AtomicU64, Ordering};

const FILTER_WORDS: usize = 16;
const FILTER_BITS: usize = FILTER_WORDS * 64;

/// Two independent probes per inserted index keep the false positive rate
/// low for the set sizes produced by a single transaction.
fn probes(index: usize) -> (usize, usize) {
    let h = (index as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    let a = (h >> 32) as usize % FILTER_BITS;
    let b = h as usize % FILTER_BITS;
    (a, b)
}

/// A concurrently readable Bloom filter of stripe indices.
#[derive(Default)]
pub(crate) struct Filter {
    words: [AtomicU64; FILTER_WORDS],
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, index: usize) {
        let (a, b) = probes(index);
        self.words[a / 64].fetch_or(1 << (a % 64), Ordering::Release);
        self.words[b / 64].fetch_or(1 << (b % 64), Ordering::Release);
    }

    pub fn contains(&self, index: usize) -> bool {
        let (a, b) = probes(index);
        let wa = self.words[a / 64].load(Ordering::Acquire);
        let wb = self.words[b / 64].load(Ordering::Acquire);
        wa & (1 << (a % 64)) != 0 && wb & (1 << (b % 64)) != 0
    }

    /// True if any bit is set in both filters. A `true` may be spurious,
    /// a `false` never is.
    pub fn intersects(&self, other: &Filter) -> bool {
        for (mine, theirs) in self.words.iter().zip(other.words.iter()) {
            if mine.load(Ordering::Acquire) & theirs.load(Ordering::Acquire) != 0 {
                return true;
            }
        }
        false
    }

    pub fn clear(&self) {
        for word in &self.words {
            word.store(0, Ordering::Release);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| w.load(Ordering::Acquire) == 0)
    }
}
