// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The per-thread transaction descriptor and the barriers that make up the
//! transaction state machine: begin, transactional read and write, commit,
//! abort, retry, and the inevitable fast path.
//!
//! The descriptor is split in two. [`TxShared`] is the part peers may
//! touch: the status word (the CAS `ACTIVE -> ABORTED` is the single
//! linearization point of a remote kill), the inevitability flag, the
//! epoch, and the published contention priority. Everything else, the logs
//! in particular, belongs to the owning thread alone.

use crate::alloc::TxAlloc;
use crate::breaker::Breaker;
use crate::cm::{ConflictKind, ContentionManager, Peer, Resolution};
use crate::config::{InevChoice, Mode, PrivChoice, RetryChoice};
use crate::errors::TxError;
use crate::logs::{LockList, ReadLog, UndoLog, WriteLog};
use crate::orec::OrecState;
use crate::retry::{WaitHandle, RETRY_SLEEP_MICROS};
use crate::runtime::RuntimeInner;
use log::*;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATUS_ACTIVE: usize = 0;
const STATUS_COMMITTED: usize = 1;
const STATUS_ABORTED: usize = 2;

/// Transaction status as seen by every thread.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Status {
    Active,
    Committed,
    Aborted,
}

fn decode_status(raw: usize) -> Status {
    match raw {
        STATUS_ACTIVE => Status::Active,
        STATUS_COMMITTED => Status::Committed,
        _ => Status::Aborted,
    }
}

/// The peer-visible slice of a thread descriptor.
pub(crate) struct TxShared {
    slot: usize,
    status: AtomicUsize,
    inevitable: AtomicBool,
    /// Odd while the thread is inside a transaction. Advanced on entry and
    /// exit; the reclaimer and the fences compare snapshots of it.
    epoch: AtomicU64,
    priority: AtomicU64,
}

impl TxShared {
    pub fn new(slot: usize) -> Self {
        Self {
            slot,
            status: AtomicUsize::new(STATUS_COMMITTED),
            inevitable: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            priority: AtomicU64::new(0),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn status(&self) -> Status {
        decode_status(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: Status) {
        let raw = match status {
            Status::Active => STATUS_ACTIVE,
            Status::Committed => STATUS_COMMITTED,
            Status::Aborted => STATUS_ABORTED,
        };
        self.status.store(raw, Ordering::Release);
    }

    /// `ACTIVE -> COMMITTED`. Fails when a peer got its abort in first.
    pub fn try_commit(&self) -> bool {
        self.status
            .compare_exchange(
                STATUS_ACTIVE,
                STATUS_COMMITTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// `ACTIVE -> ABORTED` by the owner. False when a peer won the race.
    pub fn self_abort(&self) -> bool {
        self.status
            .compare_exchange(
                STATUS_ACTIVE,
                STATUS_ABORTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// `ACTIVE -> ABORTED` by a peer. An inevitable victim is refused.
    pub fn remote_abort(&self) -> bool {
        if self.is_inevitable() {
            return false;
        }
        self.status
            .compare_exchange(
                STATUS_ACTIVE,
                STATUS_ABORTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn is_inevitable(&self) -> bool {
        self.inevitable.load(Ordering::SeqCst)
    }

    pub fn set_inevitable(&self, inevitable: bool) {
        self.inevitable.store(inevitable, Ordering::SeqCst);
    }

    pub fn enter_epoch(&self) {
        let prior = self.epoch.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prior % 2 == 0, "entered an epoch twice");
    }

    pub fn leave_epoch(&self) {
        let prior = self.epoch.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prior % 2 == 1, "left an epoch twice");
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn priority(&self) -> u64 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: u64) {
        self.priority.store(priority, Ordering::Relaxed);
    }
}

/// Lifetime counters for one thread.
#[derive(Clone, Copy, Default, Debug)]
pub struct TxStats {
    pub commits: u64,
    pub aborts: u64,
    pub retries: u64,
    pub restarts: u64,
}

/// Loads a word of shared memory.
///
/// # Safety
/// `addr` must point at a live, word-aligned allocation.
unsafe fn load_word(addr: usize) -> usize {
    (*(addr as *const AtomicUsize)).load(Ordering::Acquire)
}

/// Stores a word of shared memory.
///
/// # Safety
/// Same contract as [`load_word`], plus the caller must hold the stripe or
/// otherwise have exclusive rights to the word.
unsafe fn store_word(addr: usize, value: usize) {
    (*(addr as *const AtomicUsize)).store(value, Ordering::Release);
}

/// How often a finishing transaction sweeps the limbo list.
const COLLECT_INTERVAL: u32 = 64;

pub(crate) struct Descriptor {
    pub(crate) shared: Arc<TxShared>,
    cm: Box<dyn ContentionManager>,
    reads: ReadLog,
    writes: WriteLog,
    undo: UndoLog,
    locks: LockList,
    pub(crate) alloc: TxAlloc,
    retry_handle: Arc<WaitHandle>,
    start_time: u64,
    priv_snapshot: u64,
    pub(crate) nesting_depth: usize,
    pub(crate) stats: TxStats,
    finished: u32,
}

impl Descriptor {
    pub fn new(shared: Arc<TxShared>, cm: Box<dyn ContentionManager>) -> Self {
        Self {
            shared,
            cm,
            reads: ReadLog::new(),
            writes: WriteLog::new(),
            undo: UndoLog::new(),
            locks: LockList::new(),
            alloc: TxAlloc::new(),
            retry_handle: WaitHandle::new(),
            start_time: 0,
            priv_snapshot: 0,
            nesting_depth: 0,
            stats: TxStats::default(),
            finished: 0,
        }
    }

    pub fn stats(&self) -> TxStats {
        self.stats
    }

    pub fn is_inevitable(&self) -> bool {
        self.shared.is_inevitable()
    }

    /// Aborted-by-peer discovery point; every barrier starts here.
    fn check_self(&self) -> Result<(), TxError> {
        if self.shared.status() == Status::Aborted {
            Err(TxError::Aborted)
        } else {
            Ok(())
        }
    }

    pub fn begin(&mut self, rt: &RuntimeInner) {
        rt.inev.enter_tx();
        self.shared.enter_epoch();
        self.shared.set_status(Status::Active);
        self.start_time = rt.clock.snapshot();
        self.priv_snapshot = rt.privatizer.now();
        self.nesting_depth = 1;
        let ticket = rt.tickets.fetch_add(1, Ordering::Relaxed) + 1;
        self.cm.on_begin(Peer::new(&self.shared), ticket);
        trace!(
            "slot {} begins at time {}",
            self.shared.slot(),
            self.start_time
        );
    }

    /// Transactional read of one word.
    ///
    /// # Safety
    /// `addr` must point at a live, word-aligned allocation that is only
    /// ever accessed through this runtime (or is provably private).
    pub unsafe fn read_word(&mut self, rt: &RuntimeInner, addr: usize) -> Result<usize, TxError> {
        self.check_self()?;

        if self.is_inevitable() {
            return Ok(self.read_inevitable(rt, addr));
        }

        // read-your-own-write out of the redo log
        if rt.config.mode.lazy_update() {
            if let Some(value) = self.writes.lookup(addr) {
                return Ok(value);
            }
        }

        let (stripe, orec) = rt.orecs.for_addr(addr);
        let breaker = Breaker::default();
        loop {
            match orec.load() {
                OrecState::Owned(owner) if owner == self.shared.slot() => {
                    // stripe already acquired by us; memory is current
                    return Ok(load_word(addr));
                }
                OrecState::Owned(owner) => {
                    self.resolve_conflict(rt, ConflictKind::Raw, owner, &breaker)?;
                }
                OrecState::Version(observed) => {
                    let value = load_word(addr);
                    if orec.load() != OrecState::Version(observed) {
                        // a writer slipped in between the two checks
                        self.cm.on_contention();
                        continue;
                    }
                    if observed > self.start_time {
                        // newer than our snapshot: extend, then look again
                        self.extend(rt)?;
                        continue;
                    }
                    self.reads.push(stripe, observed)?;
                    return Ok(value);
                }
            }
        }
    }

    /// Transactional write of one word.
    ///
    /// # Safety
    /// Same contract as [`Self::read_word`].
    pub unsafe fn write_word(
        &mut self,
        rt: &RuntimeInner,
        addr: usize,
        value: usize,
    ) -> Result<(), TxError> {
        self.check_self()?;

        if self.is_inevitable() {
            return self.write_inevitable(rt, addr, value);
        }

        match rt.config.mode {
            Mode::LazyLazy => self.writes.record(addr, value),
            Mode::EagerLazy => {
                self.acquire(rt, addr)?;
                self.writes.record(addr, value)
            }
            Mode::EagerEager => {
                self.acquire(rt, addr)?;
                self.undo.push(addr, load_word(addr))?;
                store_word(addr, value);
                Ok(())
            }
        }
    }

    /// Reads by the single writer skip logging and validation, but still
    /// respect stripes held by ordinary writers: any such owner is killed
    /// and waited out, so the token holder never observes a half-applied
    /// update.
    unsafe fn read_inevitable(&self, rt: &RuntimeInner, addr: usize) -> usize {
        let (_, orec) = rt.orecs.for_addr(addr);
        loop {
            match orec.load() {
                OrecState::Owned(owner) if owner == self.shared.slot() => {
                    return load_word(addr);
                }
                OrecState::Owned(owner) => {
                    if let Some(other) = rt.registry.get(owner) {
                        other.remote_abort();
                    }
                    core::hint::spin_loop();
                }
                OrecState::Version(observed) => {
                    let value = load_word(addr);
                    if orec.load() == OrecState::Version(observed) {
                        return value;
                    }
                }
            }
        }
    }

    /// The inevitable transaction still acquires stripes so concurrent
    /// readers keep seeing consistent versions, but it updates in place
    /// and keeps no undo: it can never be rolled back. Owners in the way
    /// are killed; their rollback hands the stripe back.
    unsafe fn write_inevitable(
        &mut self,
        rt: &RuntimeInner,
        addr: usize,
        value: usize,
    ) -> Result<(), TxError> {
        let (stripe, orec) = rt.orecs.for_addr(addr);
        if !self.locks.holds(stripe) {
            loop {
                match orec.load() {
                    OrecState::Owned(owner) if owner == self.shared.slot() => break,
                    OrecState::Owned(owner) => {
                        if let Some(other) = rt.registry.get(owner) {
                            other.remote_abort();
                        }
                        core::hint::spin_loop();
                    }
                    OrecState::Version(observed) => {
                        if orec.try_lock(observed, self.shared.slot()) {
                            self.locks.push(stripe, observed)?;
                            break;
                        }
                    }
                }
            }
            rt.inev.note_write(stripe);
        }
        store_word(addr, value);
        Ok(())
    }

    /// Acquire the stripe guarding `addr` for writing.
    fn acquire(&mut self, rt: &RuntimeInner, addr: usize) -> Result<(), TxError> {
        let (stripe, orec) = rt.orecs.for_addr(addr);
        let breaker = Breaker::default();
        loop {
            match orec.load() {
                OrecState::Owned(owner) if owner == self.shared.slot() => return Ok(()),
                OrecState::Owned(owner) => {
                    self.resolve_conflict(rt, ConflictKind::Waw, owner, &breaker)?;
                }
                OrecState::Version(observed) => {
                    if observed > self.start_time {
                        self.extend(rt)?;
                        continue;
                    }
                    if orec.try_lock(observed, self.shared.slot()) {
                        self.locks.push(stripe, observed)?;
                        return Ok(());
                    }
                    self.cm.on_contention();
                }
            }
        }
    }

    /// Enforce the contention manager's verdict against the owner of a
    /// locked stripe. `Ok(())` means "look at the stripe again".
    fn resolve_conflict(
        &mut self,
        rt: &RuntimeInner,
        kind: ConflictKind,
        owner_slot: usize,
        breaker: &Breaker,
    ) -> Result<(), TxError> {
        self.check_self()?;

        let other = match rt.registry.get(owner_slot) {
            Some(shared) => shared,
            None => {
                // owner already unregistered; the stripe is settling
                core::hint::spin_loop();
                return Ok(());
            }
        };

        if other.is_inevitable() {
            // the token holder always wins; wait it out
            if breaker.spin().is_err() {
                breaker.reset();
                std::thread::yield_now();
            }
            return Ok(());
        }

        if other.status() != Status::Active {
            // owner is mid-cleanup, its locks are about to be released
            self.cm.on_contention();
            if breaker.spin().is_err() {
                return Err(TxError::Conflict);
            }
            return Ok(());
        }

        let verdict = match kind {
            ConflictKind::Raw => self.cm.on_raw(Peer::new(&self.shared), Peer::new(&other)),
            ConflictKind::Waw => self.cm.on_waw(Peer::new(&self.shared), Peer::new(&other)),
            ConflictKind::War => self.cm.on_war(Peer::new(&self.shared), Peer::new(&other)),
        };
        match verdict {
            Resolution::AbortSelf => Err(TxError::Conflict),
            Resolution::AbortOther => {
                if other.remote_abort() {
                    debug!(
                        "slot {} kills slot {} over {:?}",
                        self.shared.slot(),
                        owner_slot,
                        kind
                    );
                } else {
                    // lost the race; reinspect the stripe
                    self.cm.on_contention();
                }
                Ok(())
            }
            Resolution::Wait => {
                self.cm.on_contention();
                if breaker.spin().is_err() {
                    // waited long enough, yield instead of livelocking
                    Err(TxError::Conflict)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Check every logged read against the table: its stripe must still
    /// show the recorded version, or be locked by us.
    fn validate(&self, rt: &RuntimeInner) -> Result<(), TxError> {
        for entry in self.reads.iter() {
            match rt.orecs.at(entry.orec).load() {
                OrecState::Version(version) if version == entry.version => {}
                OrecState::Owned(owner) if owner == self.shared.slot() => {}
                _ => return Err(TxError::Conflict),
            }
        }
        Ok(())
    }

    /// Timestamp extension: move the snapshot forward instead of aborting
    /// a read that is still consistent under the newer clock.
    fn extend(&mut self, rt: &RuntimeInner) -> Result<(), TxError> {
        let now = rt.clock.snapshot();
        self.validate(rt)?;
        trace!(
            "slot {} extends {} -> {}",
            self.shared.slot(),
            self.start_time,
            now
        );
        self.start_time = now;
        Ok(())
    }

    pub fn try_commit(&mut self, rt: &RuntimeInner) -> Result<(), TxError> {
        if self.is_inevitable() {
            return self.commit_inevitable(rt);
        }
        self.check_self()?;

        if self.writes.is_empty() && self.locks.is_empty() && self.undo.is_empty() {
            // read-only: one validation, no clock advance
            self.validate(rt)?;
            if !self.shared.try_commit() {
                return Err(TxError::Aborted);
            }
            trace!("slot {} commits read-only", self.shared.slot());
            self.finish(rt, Status::Committed);
            return Ok(());
        }

        if rt.config.mode.lazy_acquire() {
            let pending: Vec<usize> = self.writes.iter().map(|entry| entry.addr).collect();
            for addr in pending {
                self.acquire(rt, addr)?;
            }
        }

        let stripes: Vec<usize> = self.locks.iter().map(|entry| entry.orec).collect();
        rt.inev.gate_writer(&self.shared, &stripes);

        let end_time = rt.clock.advance();
        let privatized = rt.config.privatization == PrivChoice::Nonblocking
            && rt.privatizer.now() != self.priv_snapshot;
        if end_time != self.start_time + 1 || privatized {
            if let Err(err) = self.validate(rt) {
                rt.inev.writer_done();
                return Err(err);
            }
        }

        // linearization: after this CAS no peer can abort us
        if !self.shared.try_commit() {
            rt.inev.writer_done();
            return Err(TxError::Aborted);
        }

        if rt.config.mode.lazy_update() {
            for entry in self.writes.iter() {
                // Safety: addresses were vetted by the write barrier and
                // every touched stripe is locked by us.
                unsafe { store_word(entry.addr, entry.value) };
            }
        }
        for entry in self.locks.iter() {
            rt.orecs.at(entry.orec).release(end_time);
        }
        rt.inev.writer_done();

        debug!(
            "slot {} commits {} stripes at time {}",
            self.shared.slot(),
            stripes.len(),
            end_time
        );
        rt.retries.notify(&stripes);
        self.finish(rt, Status::Committed);
        Ok(())
    }

    fn commit_inevitable(&mut self, rt: &RuntimeInner) -> Result<(), TxError> {
        let stripes: Vec<usize> = self.locks.iter().map(|entry| entry.orec).collect();
        if !stripes.is_empty() {
            let end_time = rt.clock.advance();
            for entry in self.locks.iter() {
                rt.orecs.at(entry.orec).release(end_time);
            }
            debug!(
                "slot {} commits inevitably at time {}",
                self.shared.slot(),
                end_time
            );
        }
        self.shared.set_status(Status::Committed);
        rt.retries.notify(&stripes);
        rt.inev.release(&self.shared);
        self.finish(rt, Status::Committed);
        Ok(())
    }

    /// Roll the attempt back: restore memory, hand stripes back unchanged,
    /// tear down this attempt's allocations.
    pub fn rollback(&mut self, rt: &RuntimeInner) {
        if self.is_inevitable() {
            // an inevitable transaction updates in place and keeps no
            // undo; bailing out of one is a contract violation by the
            // body, and the only consistent exit is to commit what
            // happened so far and hand the token back
            error!(
                "slot {} tried to abort while inevitable; committing instead",
                self.shared.slot()
            );
            let _ = self.commit_inevitable(rt);
            return;
        }
        for entry in self.undo.iter_rev() {
            // Safety: the write barrier vetted the address and we still
            // hold the stripe.
            unsafe { store_word(entry.addr, entry.prior) };
        }
        for entry in self.locks.iter() {
            rt.orecs.at(entry.orec).release(entry.prior);
        }
        self.shared.self_abort();
        debug!("slot {} aborts", self.shared.slot());
        self.finish(rt, Status::Aborted);
    }

    /// The transaction cannot proceed with the values it read: publish a
    /// wait handle over the read set, roll back, park until a committing
    /// writer touches one of those stripes, then let the caller rerun.
    pub fn do_retry(&mut self, rt: &RuntimeInner) {
        if self.is_inevitable() {
            // same contract violation as an inevitable abort
            self.rollback(rt);
            return;
        }
        if rt.retries.policy() == RetryChoice::Sleep {
            let undisturbed = self.shared.self_abort();
            self.rollback_for_retry(rt);
            if undisturbed {
                self.stats.retries += 1;
                std::thread::sleep(Duration::from_micros(RETRY_SLEEP_MICROS));
            } else {
                self.stats.aborts += 1;
                self.cm.on_abort(Peer::new(&self.shared));
            }
            return;
        }

        let handle = self.retry_handle.clone();
        handle.reset();
        for entry in self.reads.iter() {
            handle.insert(entry.orec);
        }
        for entry in self.locks.iter() {
            handle.insert(entry.orec);
        }
        for entry in self.writes.iter() {
            handle.insert(rt.orecs.index_of(entry.addr));
        }

        // order matters: publish first, then check staleness, then roll
        // back, then flip the status so a late wakeup is never lost
        rt.retries.publish(&handle);
        let fresh = self.validate(rt).is_ok();
        let undisturbed = self.shared.self_abort();
        self.rollback_for_retry(rt);

        if fresh && undisturbed {
            self.stats.retries += 1;
            debug!("slot {} parks on its read set", self.shared.slot());
            handle.park();
        } else {
            self.stats.aborts += 1;
            self.cm.on_abort(Peer::new(&self.shared));
        }
        rt.retries.withdraw(&handle);
    }

    /// Shared tail of the retry paths: undo, release, clean up, but leave
    /// the retry/abort accounting to the caller.
    fn rollback_for_retry(&mut self, rt: &RuntimeInner) {
        for entry in self.undo.iter_rev() {
            // Safety: as in `rollback`.
            unsafe { store_word(entry.addr, entry.prior) };
        }
        for entry in self.locks.iter() {
            rt.orecs.at(entry.orec).release(entry.prior);
        }
        self.alloc.abort();
        rt.inev.exit_tx();
        self.shared.leave_epoch();
        self.reset_logs();
        self.sweep(rt);
    }

    pub fn try_inevitable(&mut self, rt: &RuntimeInner) -> bool {
        if self.is_inevitable() {
            return true;
        }
        if rt.inev.policy() == InevChoice::None {
            return false;
        }
        // only before the first read or write, and only at the outermost
        // nesting level
        if self.nesting_depth > 1
            || !self.reads.is_empty()
            || !self.writes.is_empty()
            || !self.undo.is_empty()
            || !self.locks.is_empty()
        {
            return false;
        }
        rt.inev.try_acquire(&self.shared, &rt.registry)
    }

    /// Common epilogue of commit and abort.
    fn finish(&mut self, rt: &RuntimeInner, outcome: Status) {
        match outcome {
            Status::Committed => {
                self.alloc.commit(&rt.reclaimer, &rt.registry);
                self.cm.on_commit(Peer::new(&self.shared));
                self.stats.commits += 1;
            }
            Status::Aborted => {
                self.alloc.abort();
                self.cm.on_abort(Peer::new(&self.shared));
                self.stats.aborts += 1;
            }
            Status::Active => unreachable!("transactions never finish active"),
        }
        rt.inev.exit_tx();
        self.shared.leave_epoch();
        self.reset_logs();
        self.sweep(rt);
    }

    fn reset_logs(&mut self) {
        self.reads.clear();
        self.writes.clear();
        self.undo.clear();
        self.locks.clear();
        self.nesting_depth = 0;
    }

    fn sweep(&mut self, rt: &RuntimeInner) {
        self.finished = self.finished.wrapping_add(1);
        if self.finished % COLLECT_INTERVAL == 0 {
            rt.reclaimer.collect();
        }
    }
}
