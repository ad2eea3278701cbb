// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Weft
//!
//! An orec-based, word-level software transactional memory runtime.
//!
//! Shared memory is striped over a fixed table of ownership records, each
//! an atomic word that is either a version number or a lock naming its
//! owner. Threads run blocks of reads and writes as optimistic
//! transactions against a global clock: reads are validated against the
//! transaction's snapshot (and the snapshot extended instead of aborting
//! when possible), writes acquire stripes eagerly or at commit, and
//! updates go through a redo or undo log depending on the configured
//! mode. Conflicts are handed to a pluggable contention manager; blocked
//! work can park on its read set with `retry`; a single transaction at a
//! time may become inevitable and perform irrevocable effects.
//!
//! ```
//! use weft_stm::{Config, Runtime};
//!
//! let runtime = Runtime::init(Config::default());
//! let mut thread = runtime.thread_init();
//!
//! let counter = runtime.share(0usize);
//! thread
//!     .transaction(|tx| {
//!         let value = tx.open_read(&counter)?;
//!         tx.open_write(&counter, value + 1)
//!     })
//!     .unwrap();
//!
//! let mut reader = runtime.thread_init();
//! let seen = reader.transaction(|tx| tx.open_read(&counter)).unwrap();
//! assert_eq!(seen, 1);
//! ```

pub mod breaker;
pub mod clock;
pub mod cm;
pub mod config;
pub mod errors;
pub mod handle;

mod alloc;
mod bloom;
mod descriptor;
mod fence;
mod inev;
mod logs;
mod orec;
mod retry;
mod runtime;

pub use breaker::Breaker;
pub use clock::GlobalClock;
pub use cm::{ConflictKind, ContentionManager, Peer, Resolution};
pub use config::{CmChoice, Config, InevChoice, Mode, PrivChoice, RetryChoice};
pub use descriptor::{Status, TxStats};
pub use errors::{RuntimeError, TxError};
pub use handle::{SharedHandle, UnprotectedHandle, Word};
pub use runtime::{Runtime, Strategy, Thread, Tx};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_thread_counter() {
        let runtime = Runtime::default();
        let mut thread = runtime.thread_init();
        let cell = runtime.share(0usize);

        for _ in 0..10 {
            thread
                .transaction(|tx| {
                    let value = tx.open_read(&cell)?;
                    tx.open_write(&cell, value + 1)
                })
                .unwrap();
        }

        let seen = thread.transaction(|tx| tx.open_read(&cell)).unwrap();
        assert_eq!(seen, 10);
        assert_eq!(thread.stats().commits, 11);
    }

    #[test]
    fn test_read_only_transaction_leaves_clock_alone() {
        let runtime = Runtime::default();
        let mut thread = runtime.thread_init();
        let cell = runtime.share(7usize);

        let before = runtime.clock();
        let seen = thread.transaction(|tx| tx.open_read(&cell)).unwrap();
        assert_eq!(seen, 7);
        assert_eq!(runtime.clock(), before);
    }

    #[test]
    fn test_write_then_read_sees_own_write() {
        for mode in ["ee", "el", "ll"] {
            let config = Config {
                mode: mode.parse().unwrap(),
                ..Config::default()
            };
            let runtime = Runtime::init(config);
            let mut thread = runtime.thread_init();
            let cell = runtime.share(1usize);

            let seen = thread
                .transaction(|tx| {
                    tx.open_write(&cell, 2)?;
                    tx.open_read(&cell)
                })
                .unwrap();
            assert_eq!(seen, 2, "mode {}", mode);
        }
    }
}
