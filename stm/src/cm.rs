// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Contention management.
//!
//! When a transaction runs into a stripe owned by a peer, the conflict is
//! handed to a pluggable policy which answers with one of three verdicts:
//! yield, wait, or kill the peer. The runtime enforces the verdict; the
//! policy only decides. Policies communicate across threads through a
//! single published priority word per transaction.

use crate::config::CmChoice;
use crate::descriptor::TxShared;
use lazy_static::lazy_static;
use std::collections::HashMap;

/// What kind of access collided with the owner's.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConflictKind {
    /// Read found the stripe locked by a writer.
    Raw,
    /// Write found the stripe locked by a writer.
    Waw,
    /// Write found the stripe claimed by a reader.
    War,
}

/// The policy's answer to a conflict.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Resolution {
    /// The calling transaction aborts itself.
    AbortSelf,
    /// The calling transaction kills the owner and proceeds.
    AbortOther,
    /// Back off briefly and look at the stripe again.
    Wait,
}

/// A peer transaction as visible to a contention manager: its published
/// priority and whether it holds the inevitability token.
pub struct Peer<'a> {
    shared: &'a TxShared,
}

impl<'a> Peer<'a> {
    pub(crate) fn new(shared: &'a TxShared) -> Self {
        Self { shared }
    }

    pub fn priority(&self) -> u64 {
        self.shared.priority()
    }

    pub fn set_priority(&self, priority: u64) {
        self.shared.set_priority(priority);
    }

    pub fn is_inevitable(&self) -> bool {
        self.shared.is_inevitable()
    }
}

/// Hooks a contention manager exposes to the runtime. `on_raw`, `on_waw`
/// and `on_war` default to a single `on_conflict` decision; policies that
/// care about the access kind override them individually.
///
/// A policy may answer `Wait` indefinitely: the runtime bounds the total
/// back-off per conflict and converts an exhausted wait into a self-abort.
pub trait ContentionManager: Send {
    fn on_begin(&mut self, me: Peer<'_>, ticket: u64) {
        let _ = (me, ticket);
    }

    fn on_commit(&mut self, me: Peer<'_>) {
        let _ = me;
    }

    fn on_abort(&mut self, me: Peer<'_>) {
        let _ = me;
    }

    /// Called each time the runtime retries a contended access.
    fn on_contention(&mut self) {}

    fn on_conflict(&mut self, kind: ConflictKind, me: Peer<'_>, other: Peer<'_>) -> Resolution;

    fn on_raw(&mut self, me: Peer<'_>, other: Peer<'_>) -> Resolution {
        self.on_conflict(ConflictKind::Raw, me, other)
    }

    fn on_waw(&mut self, me: Peer<'_>, other: Peer<'_>) -> Resolution {
        self.on_conflict(ConflictKind::Waw, me, other)
    }

    fn on_war(&mut self, me: Peer<'_>, other: Peer<'_>) -> Resolution {
        self.on_conflict(ConflictKind::War, me, other)
    }
}

/// Always kills the owner.
pub struct Aggressive;

impl ContentionManager for Aggressive {
    fn on_conflict(&mut self, _: ConflictKind, _: Peer<'_>, _: Peer<'_>) -> Resolution {
        Resolution::AbortOther
    }
}

/// Always yields.
pub struct Timid;

impl ContentionManager for Timid {
    fn on_conflict(&mut self, _: ConflictKind, _: Peer<'_>, _: Peer<'_>) -> Resolution {
        Resolution::AbortSelf
    }
}

const POLITE_MAX_ATTEMPTS: u32 = 8;

/// Exponential back-off, yielding once its patience runs out.
pub struct Polite {
    attempts: u32,
}

impl Polite {
    pub fn new() -> Self {
        Self { attempts: 0 }
    }
}

impl ContentionManager for Polite {
    fn on_begin(&mut self, _: Peer<'_>, _: u64) {
        self.attempts = 0;
    }

    fn on_contention(&mut self) {
        self.attempts += 1;
    }

    fn on_conflict(&mut self, _: ConflictKind, _: Peer<'_>, _: Peer<'_>) -> Resolution {
        if self.attempts >= POLITE_MAX_ATTEMPTS {
            Resolution::AbortSelf
        } else {
            Resolution::Wait
        }
    }
}

/// Priority grows with every abort and resets on commit, so a transaction
/// that keeps losing eventually gets to win.
pub struct Polka {
    boosts: u64,
}

impl Polka {
    pub fn new() -> Self {
        Self { boosts: 0 }
    }
}

impl ContentionManager for Polka {
    fn on_begin(&mut self, me: Peer<'_>, _: u64) {
        me.set_priority(self.boosts);
    }

    fn on_commit(&mut self, me: Peer<'_>) {
        self.boosts = 0;
        me.set_priority(0);
    }

    fn on_abort(&mut self, _: Peer<'_>) {
        self.boosts += 1;
    }

    fn on_conflict(&mut self, _: ConflictKind, me: Peer<'_>, other: Peer<'_>) -> Resolution {
        if me.priority() >= other.priority() {
            Resolution::AbortOther
        } else {
            Resolution::Wait
        }
    }
}

/// Like [`Polka`] but priority is never surrendered: it accumulates over
/// the whole lifetime of the thread.
pub struct Karma {
    karma: u64,
}

impl Karma {
    pub fn new() -> Self {
        Self { karma: 0 }
    }
}

impl ContentionManager for Karma {
    fn on_begin(&mut self, me: Peer<'_>, _: u64) {
        me.set_priority(self.karma);
    }

    fn on_abort(&mut self, _: Peer<'_>) {
        self.karma += 1;
    }

    fn on_conflict(&mut self, _: ConflictKind, me: Peer<'_>, other: Peer<'_>) -> Resolution {
        self.karma += 1;
        me.set_priority(self.karma);
        if me.priority() >= other.priority() {
            Resolution::AbortOther
        } else {
            Resolution::Wait
        }
    }
}

/// Oldest transaction wins: the begin ticket is the priority, so a
/// long-running transaction cannot be starved by younger ones.
pub struct Greedy;

impl ContentionManager for Greedy {
    fn on_begin(&mut self, me: Peer<'_>, ticket: u64) {
        me.set_priority(u64::MAX - ticket);
    }

    fn on_conflict(&mut self, _: ConflictKind, me: Peer<'_>, other: Peer<'_>) -> Resolution {
        if me.priority() > other.priority() {
            Resolution::AbortOther
        } else {
            Resolution::Wait
        }
    }
}

type Builder = fn() -> Box<dyn ContentionManager>;

fn build_aggressive() -> Box<dyn ContentionManager> {
    Box::new(Aggressive)
}

fn build_timid() -> Box<dyn ContentionManager> {
    Box::new(Timid)
}

fn build_polite() -> Box<dyn ContentionManager> {
    Box::new(Polite::new())
}

fn build_polka() -> Box<dyn ContentionManager> {
    Box::new(Polka::new())
}

fn build_karma() -> Box<dyn ContentionManager> {
    Box::new(Karma::new())
}

fn build_greedy() -> Box<dyn ContentionManager> {
    Box::new(Greedy)
}

lazy_static! {
    static ref POLICIES: HashMap<&'static str, Builder> = {
        let mut map: HashMap<&'static str, Builder> = HashMap::new();
        map.insert("aggressive", build_aggressive);
        map.insert("timid", build_timid);
        map.insert("polite", build_polite);
        map.insert("polka", build_polka);
        map.insert("karma", build_karma);
        map.insert("greedy", build_greedy);
        map
    };
}

/// Build a policy by name, as the thread bootstrap accepts it.
pub(crate) fn by_name(name: &str) -> Option<Box<dyn ContentionManager>> {
    POLICIES
        .get(name.to_ascii_lowercase().as_str())
        .map(|build| build())
}

pub(crate) fn make(choice: CmChoice) -> Box<dyn ContentionManager> {
    by_name(&choice.to_string()).expect("every selectable policy is registered")
}
