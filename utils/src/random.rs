// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use rand::distributions::{Distribution, Standard};

// Random value for `T`.
pub fn random<T>() -> T
where
    Standard: Distribution<T>,
{
    rand::random()
}

// Random bool.
pub fn coinflip() -> bool {
    random()
}

// Random usize in range 0..upper_bound (excluding the upper bound).
pub fn usize(upper_bound: usize) -> usize {
    random::<usize>() % upper_bound
}

// Random string of printable ascii with the given length.
pub fn string(len: usize) -> String {
    (0..len).map(|_| (b' ' + random::<u8>() % 95) as char).collect()
}
