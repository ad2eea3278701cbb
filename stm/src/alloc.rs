// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Transactional allocation and epoch-based reclamation.
//!
//! Allocations made inside a transaction belong to it until commit and are
//! torn down on abort. Frees are deferred: at commit they move to a limbo
//! list stamped with the epochs of every thread that was inside a
//! transaction at that moment, and the backing memory is released only once
//! each of those threads has moved on. No transaction can therefore ever
//! dereference a word that has been handed back to the system allocator.

use crate::runtime::Registry;
use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::mem;
use std::sync::Arc;

use log::*;
use parking_lot::Mutex;

const HEADER: usize = mem::size_of::<usize>();
const ALIGN: usize = mem::align_of::<usize>();

/// One block obtained from [`TxAlloc::alloc`]. `base` points at the hidden
/// size header, `total` covers header plus payload.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Allocation {
    base: usize,
    total: usize,
}

impl Allocation {
    fn layout(&self) -> Layout {
        // total/ALIGN were validated when the block was created
        Layout::from_size_align(self.total, ALIGN).expect("allocation layout")
    }

    /// # Safety
    /// The block must have come from [`TxAlloc::alloc`] and must not be
    /// referenced afterwards.
    unsafe fn release(self) {
        dealloc(self.base as *mut u8, self.layout());
    }
}

/// Per-thread allocation state: what this transaction allocated and what it
/// asked to free.
pub(crate) struct TxAlloc {
    new_list: Vec<Allocation>,
    free_list: Vec<Allocation>,
}

/// Allocate `size` zeroed bytes, word aligned, preceded by a hidden size
/// header so that a free needs nothing but the pointer.
pub(crate) fn block_alloc(size: usize) -> *mut u8 {
    let total = HEADER + size.max(1);
    let layout = Layout::from_size_align(total, ALIGN).expect("allocation layout");
    // Safety: layout has non-zero size.
    let base = unsafe { alloc_zeroed(layout) };
    if base.is_null() {
        handle_alloc_error(layout);
    }
    unsafe {
        (base as *mut usize).write(total);
    }
    unsafe { base.add(HEADER) }
}

/// Rebuild the [`Allocation`] record of a block from its header.
///
/// # Safety
/// `ptr` must have come from [`block_alloc`].
pub(crate) unsafe fn block_of(ptr: *mut u8) -> Allocation {
    let base = ptr.sub(HEADER);
    let total = (base as *const usize).read();
    Allocation {
        base: base as usize,
        total,
    }
}

/// Immediately return a block to the system allocator.
///
/// # Safety
/// `ptr` must have come from [`block_alloc`] and no thread may still
/// reference it.
pub(crate) unsafe fn block_release(ptr: *mut u8) {
    block_of(ptr).release();
}

impl TxAlloc {
    pub fn new() -> Self {
        Self {
            new_list: Vec::new(),
            free_list: Vec::new(),
        }
    }

    /// Allocate within the transaction; the block is torn down if the
    /// transaction aborts.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        let ptr = block_alloc(size);
        // Safety: just allocated by `block_alloc`.
        self.new_list.push(unsafe { block_of(ptr) });
        ptr
    }

    /// Defer the free of a block until the owning transaction commits.
    ///
    /// # Safety
    /// `ptr` must have come from [`Self::alloc`] or [`block_alloc`].
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        self.free_list.push(block_of(ptr));
    }

    /// The transaction committed: its allocations now belong to the
    /// program, its frees go to the limbo list.
    pub fn commit(&mut self, reclaimer: &Reclaimer, registry: &Registry) {
        self.new_list.clear();
        if !self.free_list.is_empty() {
            reclaimer.defer(mem::take(&mut self.free_list), registry);
        }
    }

    /// The transaction aborted: frees are cancelled, fresh allocations are
    /// torn down right away since no other thread can have seen them.
    pub fn abort(&mut self) {
        self.free_list.clear();
        for allocation in self.new_list.drain(..) {
            // Safety: the allocation never escaped the aborted transaction.
            unsafe { allocation.release() };
        }
    }

    pub fn is_clean(&self) -> bool {
        self.new_list.is_empty() && self.free_list.is_empty()
    }
}

struct Limbo {
    blocks: Vec<Allocation>,
    /// Threads that were inside a transaction when the free was stamped,
    /// with the epoch each one published at that time.
    stamped: Vec<(Arc<crate::descriptor::TxShared>, u64)>,
}

impl Limbo {
    fn reclaimable(&self) -> bool {
        self.stamped
            .iter()
            .all(|(shared, epoch)| shared.epoch() != *epoch)
    }
}

/// Process-wide limbo list of deferred frees.
pub(crate) struct Reclaimer {
    limbo: Mutex<Vec<Limbo>>,
}

impl Reclaimer {
    pub fn new() -> Self {
        Self {
            limbo: Mutex::new(Vec::new()),
        }
    }

    /// Stamp a batch of freed blocks with the current in-flight epochs.
    pub fn defer(&self, blocks: Vec<Allocation>, registry: &Registry) {
        let stamped = registry.in_flight();
        self.limbo.lock().push(Limbo { blocks, stamped });
    }

    /// Release every limbo batch whose stamped threads have all advanced.
    pub fn collect(&self) {
        let ready: Vec<Limbo> = {
            let mut limbo = self.limbo.lock();
            let mut ready = Vec::new();
            limbo.retain_mut(|entry| {
                if entry.reclaimable() {
                    ready.push(Limbo {
                        blocks: mem::take(&mut entry.blocks),
                        stamped: Vec::new(),
                    });
                    false
                } else {
                    true
                }
            });
            ready
        };
        for entry in ready {
            trace!("reclaiming {} deferred blocks", entry.blocks.len());
            for allocation in entry.blocks {
                // Safety: every stamped thread has left the transaction it
                // was in when the block became unreachable.
                unsafe { allocation.release() };
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.limbo.lock().iter().map(|e| e.blocks.len()).sum()
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        // Teardown: all threads are gone, everything left is safe to free.
        for entry in self.limbo.get_mut().drain(..) {
            for allocation in entry.blocks {
                unsafe { allocation.release() };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_zeroed_and_word_aligned() {
        let mut alloc = TxAlloc::new();
        let ptr = alloc.alloc(64);
        assert_eq!(ptr as usize % ALIGN, 0);
        for offset in 0..8 {
            let word = unsafe { (ptr as *const usize).add(offset).read() };
            assert_eq!(word, 0);
        }
        // tear down as if the transaction aborted
        alloc.abort();
        assert!(alloc.is_clean());
    }

    #[test]
    fn test_abort_cancels_frees() {
        let mut alloc = TxAlloc::new();
        let ptr = alloc.alloc(8);
        unsafe { alloc.free(ptr) };
        assert!(!alloc.is_clean());
        alloc.abort();
        assert!(alloc.is_clean());
    }
}
