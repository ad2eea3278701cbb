// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration: acquire/update mode, contention management,
//! inevitability, privatization and retry policies. Every selector parses
//! from the flag strings accepted by the command line tooling built on top
//! of this crate.

use crate::errors::RuntimeError;
use std::fmt;
use std::str::FromStr;

/// When ownership records are acquired and when memory is updated.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    /// Acquire at first write, update memory in place with an undo log.
    EagerEager,
    /// Acquire at first write, buffer updates in a redo log until commit.
    EagerLazy,
    /// Acquire at commit, buffer updates in a redo log until commit.
    LazyLazy,
}

impl Mode {
    pub fn lazy_update(&self) -> bool {
        !matches!(self, Mode::EagerEager)
    }

    pub fn lazy_acquire(&self) -> bool {
        matches!(self, Mode::LazyLazy)
    }
}

impl FromStr for Mode {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ee" => Ok(Mode::EagerEager),
            "el" => Ok(Mode::EagerLazy),
            "ll" => Ok(Mode::LazyLazy),
            _ => Err(RuntimeError::Config {
                what: "acquire/update mode",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::EagerEager => "ee",
            Mode::EagerLazy => "el",
            Mode::LazyLazy => "ll",
        })
    }
}

/// Contention manager selection.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CmChoice {
    Aggressive,
    Polite,
    Polka,
    Karma,
    Timid,
    Greedy,
}

impl FromStr for CmChoice {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aggressive" => Ok(CmChoice::Aggressive),
            "polite" => Ok(CmChoice::Polite),
            "polka" => Ok(CmChoice::Polka),
            "karma" => Ok(CmChoice::Karma),
            "timid" => Ok(CmChoice::Timid),
            "greedy" => Ok(CmChoice::Greedy),
            _ => Err(RuntimeError::Config {
                what: "contention manager",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for CmChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CmChoice::Aggressive => "Aggressive",
            CmChoice::Polite => "Polite",
            CmChoice::Polka => "Polka",
            CmChoice::Karma => "Karma",
            CmChoice::Timid => "Timid",
            CmChoice::Greedy => "Greedy",
        })
    }
}

/// How a transaction becomes inevitable, if at all.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InevChoice {
    /// Inevitability disabled; `try_inevitable` always fails.
    None,
    /// Global read-write lock: ordinary transactions take the read side at
    /// begin, the inevitable transaction the write side.
    Grl,
    /// Global write lock: ordinary writers are held at their commit point
    /// while the token is taken.
    Gwl,
    /// Token plus drain: all in-flight transactions finish before the
    /// inevitable one proceeds.
    Drain,
    /// The inevitable transaction publishes a write sketch and only
    /// conflicting committers are held back.
    Bloom,
}

impl FromStr for InevChoice {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(InevChoice::None),
            "grl" => Ok(InevChoice::Grl),
            "gwl" => Ok(InevChoice::Gwl),
            "drain" => Ok(InevChoice::Drain),
            "bloom" => Ok(InevChoice::Bloom),
            _ => Err(RuntimeError::Config {
                what: "inevitability policy",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for InevChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InevChoice::None => "none",
            InevChoice::Grl => "GRL",
            InevChoice::Gwl => "GWL",
            InevChoice::Drain => "Drain",
            InevChoice::Bloom => "Bloom",
        })
    }
}

/// How post-transaction code is guaranteed to see privatized state.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PrivChoice {
    /// Transactional fence: wait until every in-flight transaction ends.
    TFence,
    /// Validation fence: wait until every in-flight transaction has
    /// revalidated or ended.
    VFence,
    /// No delay; privatizers bump a counter that committers validate
    /// against.
    Nonblocking,
    /// Program logic (barriers, fork/join) is trusted to be sufficient.
    Logic,
}

impl FromStr for PrivChoice {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tfence" => Ok(PrivChoice::TFence),
            "vfence" => Ok(PrivChoice::VFence),
            "nonblocking" => Ok(PrivChoice::Nonblocking),
            "logic" => Ok(PrivChoice::Logic),
            _ => Err(RuntimeError::Config {
                what: "privatization policy",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for PrivChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PrivChoice::TFence => "tfence",
            PrivChoice::VFence => "vfence",
            PrivChoice::Nonblocking => "nonblocking",
            PrivChoice::Logic => "logic",
        })
    }
}

/// How a retrying transaction waits for one of its reads to change.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RetryChoice {
    /// Sleep briefly and restart, without any wakeup bookkeeping.
    Sleep,
    /// Park on a Bloom sketch of the read set; committers wake
    /// intersecting waiters.
    Bloom,
    /// Park on the exact stripe list of the read set.
    VisRead,
}

impl FromStr for RetryChoice {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sleep" => Ok(RetryChoice::Sleep),
            "bloom" => Ok(RetryChoice::Bloom),
            "visread" => Ok(RetryChoice::VisRead),
            _ => Err(RuntimeError::Config {
                what: "retry policy",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for RetryChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RetryChoice::Sleep => "sleep",
            RetryChoice::Bloom => "bloom",
            RetryChoice::VisRead => "visread",
        })
    }
}

/// Everything [`crate::Runtime::init`] needs to wire a runtime together.
#[derive(Clone, Debug)]
pub struct Config {
    pub mode: Mode,
    pub cm: CmChoice,
    pub inev: InevChoice,
    pub privatization: PrivChoice,
    pub retry: RetryChoice,
    /// When set, every thread uses `cm`; otherwise
    /// [`crate::Runtime::thread_init_with_cm`] may pick per thread.
    pub static_cm: bool,
    /// Number of ownership-record stripes. Must be a power of two.
    pub stripes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::LazyLazy,
            cm: CmChoice::Polka,
            inev: InevChoice::None,
            privatization: PrivChoice::TFence,
            retry: RetryChoice::Sleep,
            static_cm: true,
            stripes: 1 << 20,
        }
    }
}

impl Config {
    /// Parse a configuration from the flag strings of the original command
    /// line surface.
    pub fn parse(
        cm: &str,
        mode: &str,
        inev: &str,
        privatization: &str,
        retry: &str,
    ) -> Result<Self, RuntimeError> {
        Ok(Self {
            mode: mode.parse()?,
            cm: cm.parse()?,
            inev: inev.parse()?,
            privatization: privatization.parse()?,
            retry: retry.parse()?,
            ..Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_strings_roundtrip() {
        for s in ["ee", "el", "ll"] {
            let mode: Mode = s.parse().unwrap();
            assert_eq!(mode.to_string(), s);
        }
        assert!("eager".parse::<Mode>().is_err());
    }

    #[test]
    fn test_cm_names_are_case_insensitive() {
        assert_eq!("polka".parse::<CmChoice>().unwrap(), CmChoice::Polka);
        assert_eq!("POLITE".parse::<CmChoice>().unwrap(), CmChoice::Polite);
        assert!("Eruption".parse::<CmChoice>().is_err());
    }

    #[test]
    fn test_full_parse() {
        let config = Config::parse("Karma", "ee", "GRL", "tfence", "bloom").unwrap();
        assert_eq!(config.mode, Mode::EagerEager);
        assert_eq!(config.cm, CmChoice::Karma);
        assert_eq!(config.inev, InevChoice::Grl);
        assert_eq!(config.privatization, PrivChoice::TFence);
        assert_eq!(config.retry, RetryChoice::Bloom);
    }

    #[test]
    fn test_unknown_value_reports_selector() {
        let err = Config::parse("Polka", "ll", "irl", "tfence", "sleep").unwrap_err();
        assert_eq!(
            err,
            RuntimeError::Config {
                what: "inevitability policy",
                value: "irl".to_string()
            }
        );
    }
}
