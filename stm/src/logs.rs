// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Per-transaction logs. All four are owned exclusively by their thread and
//! never synchronized; they reserve a small capacity up front and grow as
//! needed, up to a hard bound that turns a runaway transaction into an
//! abort instead of unbounded memory growth.

use crate::errors::TxError;
use std::collections::HashMap;

const INITIAL_LOG_CAPACITY: usize = 64;
const MAX_LOG_ENTRIES: usize = 1 << 22;

#[derive(Clone, Copy, Debug)]
pub(crate) struct ReadEntry {
    pub orec: usize,
    pub version: u64,
}

/// Append-only record of `(stripe, version observed)` pairs. May contain
/// duplicates; validation tolerates them.
pub(crate) struct ReadLog {
    entries: Vec<ReadEntry>,
}

impl ReadLog {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(INITIAL_LOG_CAPACITY),
        }
    }

    pub fn push(&mut self, orec: usize, version: u64) -> Result<(), TxError> {
        if self.entries.len() >= MAX_LOG_ENTRIES {
            return Err(TxError::Capacity);
        }
        self.entries.push(ReadEntry { orec, version });
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReadEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct WriteEntry {
    pub addr: usize,
    pub value: usize,
}

/// Redo log: at most one entry per address. A later write to a logged
/// address updates the entry in place, so replay order is first-write
/// order.
pub(crate) struct WriteLog {
    entries: Vec<WriteEntry>,
    index: HashMap<usize, usize>,
}

impl WriteLog {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(INITIAL_LOG_CAPACITY),
            index: HashMap::with_capacity(INITIAL_LOG_CAPACITY),
        }
    }

    pub fn record(&mut self, addr: usize, value: usize) -> Result<(), TxError> {
        if let Some(&at) = self.index.get(&addr) {
            self.entries[at].value = value;
            return Ok(());
        }
        if self.entries.len() >= MAX_LOG_ENTRIES {
            return Err(TxError::Capacity);
        }
        self.index.insert(addr, self.entries.len());
        self.entries.push(WriteEntry { addr, value });
        Ok(())
    }

    pub fn lookup(&self, addr: usize) -> Option<usize> {
        self.index.get(&addr).map(|&at| self.entries[at].value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct UndoEntry {
    pub addr: usize,
    pub prior: usize,
}

/// Undo log for in-place updates: `(address, prior value)`, replayed in
/// reverse on abort.
pub(crate) struct UndoLog {
    entries: Vec<UndoEntry>,
}

impl UndoLog {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(INITIAL_LOG_CAPACITY),
        }
    }

    pub fn push(&mut self, addr: usize, prior: usize) -> Result<(), TxError> {
        if self.entries.len() >= MAX_LOG_ENTRIES {
            return Err(TxError::Capacity);
        }
        self.entries.push(UndoEntry { addr, prior });
        Ok(())
    }

    pub fn iter_rev(&self) -> impl Iterator<Item = &UndoEntry> {
        self.entries.iter().rev()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct LockEntry {
    pub orec: usize,
    pub prior: u64,
}

/// Ownership records acquired by this transaction, with the version each
/// one displaced. Also serves as duplicate detection: a stripe is acquired
/// at most once per transaction.
pub(crate) struct LockList {
    entries: Vec<LockEntry>,
}

impl LockList {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(INITIAL_LOG_CAPACITY),
        }
    }

    pub fn push(&mut self, orec: usize, prior: u64) -> Result<(), TxError> {
        if self.entries.len() >= MAX_LOG_ENTRIES {
            return Err(TxError::Capacity);
        }
        self.entries.push(LockEntry { orec, prior });
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &LockEntry> {
        self.entries.iter()
    }

    pub fn holds(&self, orec: usize) -> bool {
        self.entries.iter().any(|entry| entry.orec == orec)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_log_keeps_first_write_order() {
        let mut log = WriteLog::new();
        log.record(0x10, 1).unwrap();
        log.record(0x20, 2).unwrap();
        log.record(0x10, 3).unwrap();

        assert_eq!(log.lookup(0x10), Some(3));
        assert_eq!(log.lookup(0x20), Some(2));
        assert_eq!(log.lookup(0x30), None);

        let order: Vec<usize> = log.iter().map(|e| e.addr).collect();
        assert_eq!(order, vec![0x10, 0x20]);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_read_log_tolerates_duplicates() {
        let mut log = ReadLog::new();
        log.push(4, 10).unwrap();
        log.push(4, 10).unwrap();
        assert_eq!(log.len(), 2);

        log.clear();
        assert!(log.is_empty());
    }

    #[test]
    fn test_undo_log_replays_in_reverse() {
        let mut log = UndoLog::new();
        log.push(0x10, 1).unwrap();
        log.push(0x10, 2).unwrap();

        let priors: Vec<usize> = log.iter_rev().map(|e| e.prior).collect();
        assert_eq!(priors, vec![2, 1]);
    }

    #[test]
    fn test_lock_list_detects_duplicates() {
        let mut locks = LockList::new();
        locks.push(9, 0).unwrap();
        assert!(locks.holds(9));
        assert!(!locks.holds(10));
    }
}
