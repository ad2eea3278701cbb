// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The runtime facade: process-wide state, thread bootstrap, and the
//! re-execution loop that gives transactions their rollback semantics.
//!
//! All global metadata (the ownership-record table, the clock, the
//! registry, the inevitability token) hangs off a [`Runtime`] value
//! created by [`Runtime::init`]; there are no hidden singletons, so tests
//! can spin up as many independent runtimes as they like.

use crate::alloc::{block_alloc, block_release, Reclaimer};
use crate::breaker::Breaker;
use crate::clock::GlobalClock;
use crate::cm;
use crate::config::{Config, PrivChoice};
use crate::descriptor::{Descriptor, TxShared, TxStats};
use crate::errors::{RuntimeError, TxError};
use crate::fence::{quiesce, PrivClock};
use crate::handle::{SharedHandle, Word};
use crate::inev::Inevitability;
use crate::orec::OrecTable;
use crate::retry::RetryTable;
use log::*;
use parking_lot::RwLock;
use std::mem;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// Registry of every participating thread's shared descriptor slice.
/// Slots are reused; an ownership record in locked shape names its owner
/// by slot.
pub(crate) struct Registry {
    slots: RwLock<Vec<Option<Arc<TxShared>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self) -> Arc<TxShared> {
        let mut slots = self.slots.write();
        let slot = slots.iter().position(Option::is_none).unwrap_or_else(|| {
            slots.push(None);
            slots.len() - 1
        });
        let shared = Arc::new(TxShared::new(slot));
        slots[slot] = Some(shared.clone());
        shared
    }

    pub fn unregister(&self, slot: usize) {
        self.slots.write()[slot] = None;
    }

    pub fn get(&self, slot: usize) -> Option<Arc<TxShared>> {
        self.slots.read().get(slot).and_then(Clone::clone)
    }

    /// Every thread currently inside a transaction, with the epoch it
    /// published on entry.
    pub fn in_flight(&self) -> Vec<(Arc<TxShared>, u64)> {
        self.slots
            .read()
            .iter()
            .flatten()
            .filter_map(|shared| {
                let epoch = shared.epoch();
                (epoch % 2 == 1).then(|| (shared.clone(), epoch))
            })
            .collect()
    }
}

pub(crate) struct RuntimeInner {
    pub(crate) config: Config,
    pub(crate) orecs: OrecTable,
    pub(crate) clock: GlobalClock,
    pub(crate) tickets: AtomicU64,
    pub(crate) registry: Registry,
    pub(crate) inev: Inevitability,
    pub(crate) retries: RetryTable,
    pub(crate) reclaimer: Reclaimer,
    pub(crate) privatizer: PrivClock,
}

/// Handle to one software transactional memory instance.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::init(Config::default())
    }
}

impl Runtime {
    /// Set up the ownership-record table, the clock, the reclaimer and the
    /// policy subsystems.
    pub fn init(config: Config) -> Self {
        info!(
            "runtime starts: mode {}, cm {}, inev {}, priv {}, retry {}",
            config.mode, config.cm, config.inev, config.privatization, config.retry
        );
        let orecs = OrecTable::new(config.stripes);
        let inev = Inevitability::new(config.inev);
        let retries = RetryTable::new(config.retry);
        Self {
            inner: Arc::new(RuntimeInner {
                orecs,
                clock: GlobalClock::new(),
                tickets: AtomicU64::new(0),
                registry: Registry::new(),
                inev,
                retries,
                reclaimer: Reclaimer::new(),
                privatizer: PrivClock::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Current clock value; useful for assertions and diagnostics.
    pub fn clock(&self) -> u64 {
        self.inner.clock.snapshot()
    }

    /// Register the calling thread and hand it its descriptor.
    pub fn thread_init(&self) -> Thread {
        let shared = self.inner.registry.register();
        let desc = Descriptor::new(shared, cm::make(self.inner.config.cm));
        Thread {
            rt: self.inner.clone(),
            desc,
        }
    }

    /// Like [`Self::thread_init`] but with a per-thread contention policy.
    /// Only honored when the runtime was configured without a static
    /// policy; otherwise the configured one wins.
    pub fn thread_init_with_cm(&self, name: &str) -> Result<Thread, RuntimeError> {
        let manager = cm::by_name(name).ok_or_else(|| RuntimeError::Config {
            what: "contention manager",
            value: name.to_string(),
        })?;
        if self.inner.config.static_cm {
            warn!(
                "static contention management configured, ignoring per-thread `{}`",
                name
            );
            return Ok(self.thread_init());
        }
        let shared = self.inner.registry.register();
        Ok(Thread {
            rt: self.inner.clone(),
            desc: Descriptor::new(shared, manager),
        })
    }

    /// Privatization barrier, per the configured policy.
    pub fn fence(&self) {
        match self.inner.config.privatization {
            PrivChoice::TFence | PrivChoice::VFence => quiesce(&self.inner.registry),
            PrivChoice::Nonblocking => self.inner.privatizer.bump(),
            PrivChoice::Logic => {}
        }
    }

    /// Blocking fence regardless of the configured policy; code that is
    /// about to read privatized data in place calls this.
    pub fn acquire_fence(&self) {
        quiesce(&self.inner.registry);
    }

    /// Blocking fence run before handing privately written data back to
    /// the shared space.
    pub fn release_fence(&self) {
        quiesce(&self.inner.registry);
    }

    /// Allocate a shared word outside any transaction.
    pub fn share<T: Word>(&self, value: T) -> SharedHandle<T> {
        let ptr = block_alloc(mem::size_of::<usize>()) as *mut usize;
        // Safety: freshly allocated, exclusively ours until published.
        unsafe { ptr.write(value.into_word()) };
        SharedHandle::from_ptr(ptr)
    }

    /// Privatize and release a shared word. The caller must have stopped
    /// publishing the handle; the fence makes sure no in-flight
    /// transaction is still using it.
    pub fn reclaim<T: Word>(&self, handle: SharedHandle<T>) {
        self.acquire_fence();
        // Safety: the handle came from `share`/`alloc_shared` and after
        // the fence no transaction still holds a reference.
        unsafe { block_release(handle.as_ptr() as *mut u8) };
    }

    /// Deferred frees not yet returned to the system allocator.
    pub fn pending_reclaims(&self) -> usize {
        self.inner.reclaimer.pending()
    }
}

/// What to do when a transaction attempt fails.
pub enum Strategy {
    /// Rerun until the transaction commits.
    Retry,
    /// Rerun, but give up once the breaker trips.
    RetryWithBreaker(Breaker),
    /// Report the first failure to the caller.
    Abort,
}

/// A registered thread. Created by [`Runtime::thread_init`]; dropping it
/// (or calling [`Self::shutdown`]) unregisters the thread and flushes its
/// deferred frees.
pub struct Thread {
    rt: Arc<RuntimeInner>,
    desc: Descriptor,
}

impl Thread {
    /// Run `body` as an atomic transaction, rerunning it for as long as it
    /// keeps conflicting.
    pub fn transaction<T, F>(&mut self, body: F) -> Result<T, RuntimeError>
    where
        F: FnMut(&mut Tx<'_>) -> Result<T, TxError>,
    {
        self.transaction_with_strategy(body, Strategy::Retry)
    }

    /// Run `body` under an explicit failure strategy.
    pub fn transaction_with_strategy<T, F>(
        &mut self,
        mut body: F,
        strategy: Strategy,
    ) -> Result<T, RuntimeError>
    where
        F: FnMut(&mut Tx<'_>) -> Result<T, TxError>,
    {
        let Self { rt, desc } = self;
        let rt: &RuntimeInner = &**rt;
        let mut attempts = 0usize;
        loop {
            attempts += 1;
            if attempts > 1 {
                desc.stats.restarts += 1;
            }
            desc.begin(rt);
            let outcome = {
                let mut tx = Tx {
                    rt,
                    desc: &mut *desc,
                };
                body(&mut tx)
            };
            match outcome {
                Ok(value) => match desc.try_commit(rt) {
                    Ok(()) => return Ok(value),
                    Err(_) => desc.rollback(rt),
                },
                Err(TxError::Retry) => desc.do_retry(rt),
                Err(_) => desc.rollback(rt),
            }
            match &strategy {
                Strategy::Retry => {}
                Strategy::RetryWithBreaker(breaker) => {
                    if breaker.spin().is_err() {
                        return Err(RuntimeError::Exhausted(attempts));
                    }
                }
                Strategy::Abort => return Err(RuntimeError::Exhausted(attempts)),
            }
        }
    }

    pub fn stats(&self) -> TxStats {
        self.desc.stats()
    }

    /// Privatization barrier; see [`Runtime::fence`].
    pub fn fence(&self) {
        match self.rt.config.privatization {
            PrivChoice::TFence | PrivChoice::VFence => quiesce(&self.rt.registry),
            PrivChoice::Nonblocking => self.rt.privatizer.bump(),
            PrivChoice::Logic => {}
        }
    }

    pub fn acquire_fence(&self) {
        quiesce(&self.rt.registry);
    }

    pub fn release_fence(&self) {
        quiesce(&self.rt.registry);
    }

    /// Unregister and report this thread's lifetime counters.
    pub fn shutdown(self) {
        let stats = self.desc.stats();
        info!(
            "slot {} shuts down: commits {}, aborts {}, retries {}, restarts {}",
            self.desc.shared.slot(),
            stats.commits,
            stats.aborts,
            stats.retries,
            stats.restarts
        );
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if self.desc.nesting_depth != 0 {
            // dropped mid-transaction, most likely during an unwind; the
            // slot is reclaimed but its last attempt is simply discarded
            warn!(
                "slot {} dropped inside a transaction",
                self.desc.shared.slot()
            );
        }
        self.rt.registry.unregister(self.desc.shared.slot());
        self.rt.reclaimer.collect();
    }
}

/// The active use of a thread's descriptor between begin and commit.
/// All barriers run through this handle; it never leaves the body closure.
pub struct Tx<'a> {
    pub(crate) rt: &'a RuntimeInner,
    pub(crate) desc: &'a mut Descriptor,
}

impl Tx<'_> {
    /// Transactional load of one shared word.
    ///
    /// # Safety
    /// `addr` must point at a live, word-aligned allocation accessed only
    /// through this runtime while shared.
    pub unsafe fn read_word(&mut self, addr: *const usize) -> Result<usize, TxError> {
        self.desc.read_word(self.rt, addr as usize)
    }

    /// Transactional store of one shared word.
    ///
    /// # Safety
    /// Same contract as [`Self::read_word`].
    pub unsafe fn write_word(&mut self, addr: *mut usize, value: usize) -> Result<(), TxError> {
        self.desc.write_word(self.rt, addr as usize, value)
    }

    /// Allocate inside the transaction. On abort the block is torn down
    /// with the attempt; on commit it belongs to the program.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        self.desc.alloc.alloc(size)
    }

    /// Free inside the transaction. Deferred until commit, then released
    /// once every concurrent transaction has moved on.
    ///
    /// # Safety
    /// `ptr` must come from [`Self::alloc`] or [`Self::alloc_shared`] and
    /// must not be used afterwards.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        self.desc.alloc.free(ptr)
    }

    /// Block until some word this transaction has read changes, then
    /// rerun the body.
    pub fn retry<T>(&mut self) -> Result<T, TxError> {
        Err(TxError::Retry)
    }

    /// Abort this attempt and rerun the body.
    pub fn abort<T>(&mut self) -> Result<T, TxError> {
        Err(TxError::Conflict)
    }

    /// Try to become the process-wide inevitable transaction. Succeeds at
    /// most for one transaction at a time, and only before the first read
    /// or write of the attempt.
    pub fn try_inevitable(&mut self) -> bool {
        self.desc.try_inevitable(self.rt)
    }

    pub fn is_inevitable(&self) -> bool {
        self.desc.is_inevitable()
    }

    /// Flat nesting: the inner body joins the current transaction; its
    /// conflicts abort the outermost one.
    pub fn transaction<T, F>(&mut self, body: F) -> Result<T, TxError>
    where
        F: FnOnce(&mut Self) -> Result<T, TxError>,
    {
        self.desc.nesting_depth += 1;
        let result = body(self);
        self.desc.nesting_depth -= 1;
        result
    }

    /// Open a shared word for reading; the read is logged and validated
    /// like any other.
    pub fn open_read<T: Word>(&mut self, handle: &SharedHandle<T>) -> Result<T, TxError> {
        // Safety: the handle owns a live runtime-allocated word.
        let word = unsafe { self.desc.read_word(self.rt, handle.as_ptr() as usize) }?;
        Ok(T::from_word(word))
    }

    /// Open a shared word for writing; the write is logged or applied per
    /// the configured mode.
    pub fn open_write<T: Word>(&mut self, handle: &SharedHandle<T>, value: T) -> Result<(), TxError> {
        // Safety: as in `open_read`.
        unsafe {
            self.desc
                .write_word(self.rt, handle.as_ptr() as usize, value.into_word())
        }
    }

    /// Allocate and initialize a shared word owned by this transaction
    /// until commit.
    pub fn alloc_shared<T: Word>(&mut self, value: T) -> SharedHandle<T> {
        let ptr = self.desc.alloc.alloc(mem::size_of::<usize>()) as *mut usize;
        // Safety: fresh allocation, private until the transaction commits.
        unsafe { ptr.write(value.into_word()) };
        SharedHandle::from_ptr(ptr)
    }

    /// Transactionally free a shared word.
    pub fn free_shared<T: Word>(&mut self, handle: SharedHandle<T>) {
        // Safety: handles wrap runtime-allocated words.
        unsafe { self.desc.alloc.free(handle.as_ptr() as *mut u8) }
    }
}
