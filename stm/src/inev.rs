// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Single-writer inevitability.
//!
//! At most one transaction process-wide holds the token; while it does it
//! can never be aborted, its reads skip logging and validation, and it may
//! perform irrevocable effects. The configured policy decides how ordinary
//! transactions are kept out of its way: admission control at begin,
//! draining at acquisition, or gates at the writer commit point.

use crate::bloom::Filter;
use crate::config::InevChoice;
use crate::descriptor::{Status, TxShared};
use crate::fence::wait_while;
use crate::runtime::Registry;
use log::*;
use std::sync::atomic::{AtomicUsize, Ordering};

const TOKEN_FREE: usize = 0;

pub(crate) struct Inevitability {
    policy: InevChoice,
    /// Registry slot of the holder plus one, or [`TOKEN_FREE`].
    token: AtomicUsize,
    /// Transactions admitted at begin and not yet finished.
    active: AtomicUsize,
    /// Writer commits currently between their gate and their release.
    committing: AtomicUsize,
    /// Stripes written by the current holder, published under the Bloom
    /// policy so that only truly conflicting committers are held back.
    writes: Filter,
}

impl Inevitability {
    pub fn new(policy: InevChoice) -> Self {
        Self {
            policy,
            token: AtomicUsize::new(TOKEN_FREE),
            active: AtomicUsize::new(0),
            committing: AtomicUsize::new(0),
            writes: Filter::new(),
        }
    }

    pub fn policy(&self) -> InevChoice {
        self.policy
    }

    /// Admission at transaction begin. Under the read-write-lock and
    /// drain policies a new transaction is the read side and waits out a
    /// token holder.
    pub fn enter_tx(&self) {
        if matches!(self.policy, InevChoice::Grl | InevChoice::Drain) {
            loop {
                wait_while(|| self.token.load(Ordering::SeqCst) != TOKEN_FREE);
                self.active.fetch_add(1, Ordering::SeqCst);
                if self.token.load(Ordering::SeqCst) == TOKEN_FREE {
                    return;
                }
                // lost the race against an acquiring holder, back out
                self.active.fetch_sub(1, Ordering::SeqCst);
            }
        }
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn exit_tx(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Try to take the token for `me`. Returns false when the policy
    /// forbids it or another holder exists.
    pub fn try_acquire(&self, me: &TxShared, registry: &Registry) -> bool {
        if self.policy == InevChoice::None {
            return false;
        }
        if self
            .token
            .compare_exchange(
                TOKEN_FREE,
                me.slot() + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return false;
        }

        match self.policy {
            InevChoice::Grl => {
                // everyone admitted before us drains; nobody new gets in
                wait_while(|| self.active.load(Ordering::SeqCst) > 1);
            }
            InevChoice::Drain => {
                // every transaction in flight right now finishes before we
                // proceed; admission keeps later ones out
                let snapshot = registry.in_flight();
                for (shared, epoch) in snapshot {
                    if shared.slot() == me.slot() {
                        continue;
                    }
                    wait_while(|| shared.epoch() == epoch);
                }
            }
            InevChoice::Gwl | InevChoice::Bloom => {
                self.writes.clear();
                wait_while(|| self.committing.load(Ordering::SeqCst) > 0);
            }
            InevChoice::None => unreachable!(),
        }

        me.set_inevitable(true);
        debug!("slot {} becomes inevitable ({})", me.slot(), self.policy);
        true
    }

    pub fn release(&self, me: &TxShared) {
        me.set_inevitable(false);
        self.writes.clear();
        self.token.store(TOKEN_FREE, Ordering::SeqCst);
    }

    /// The holder records a stripe it is about to write.
    pub fn note_write(&self, stripe: usize) {
        if self.policy == InevChoice::Bloom {
            self.writes.insert(stripe);
        }
    }

    /// An ordinary writer announces its commit. Blocks while a token
    /// holder must be kept ahead of us; afterwards the caller is counted
    /// as committing until [`Self::writer_done`].
    ///
    /// The wait gives up as soon as `me` loses its active status: the
    /// holder kills stripe owners that stand in its way, and a killed
    /// victim must fall through to its commit CAS to discover that.
    pub fn gate_writer(&self, me: &TxShared, stripes: &[usize]) {
        loop {
            self.committing.fetch_add(1, Ordering::SeqCst);
            let held = self.token.load(Ordering::SeqCst) != TOKEN_FREE;
            let blocked = match self.policy {
                InevChoice::Gwl => held,
                InevChoice::Bloom => {
                    held && stripes.iter().any(|&stripe| self.writes.contains(stripe))
                }
                InevChoice::None | InevChoice::Grl | InevChoice::Drain => false,
            };
            if !blocked || me.status() != Status::Active {
                return;
            }
            self.committing.fetch_sub(1, Ordering::SeqCst);
            wait_while(|| {
                self.token.load(Ordering::SeqCst) != TOKEN_FREE
                    && me.status() == Status::Active
            });
        }
    }

    pub fn writer_done(&self) {
        self.committing.fetch_sub(1, Ordering::SeqCst);
    }
}
