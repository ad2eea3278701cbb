// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use rand::{distributions::Bernoulli, prelude::Distribution};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use threadpool::ThreadPool;
use weft_stm::{Breaker, CmChoice, Config, InevChoice, PrivChoice, RetryChoice, Runtime, Strategy};

#[allow(unused_imports)]
use log::*;

fn init_logging() {
    #[cfg(feature = "verbose")]
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

fn small_config() -> Config {
    Config {
        stripes: 1 << 14,
        ..Config::default()
    }
}

#[test]
fn test_every_contention_policy_preserves_exactness() {
    init_logging();

    const THREADS: usize = 4;
    const PER_THREAD: usize = 500;

    let policies = [
        CmChoice::Aggressive,
        CmChoice::Polite,
        CmChoice::Polka,
        CmChoice::Karma,
        CmChoice::Timid,
        CmChoice::Greedy,
    ];

    for cm in policies {
        let runtime = Runtime::init(Config {
            cm,
            ..small_config()
        });
        let counter = runtime.share(0usize);
        let pool = ThreadPool::new(THREADS);

        for _ in 0..THREADS {
            let runtime = runtime.clone();
            pool.execute(move || {
                // sprinkle read-only transactions between the increments
                let reads = Bernoulli::new(0.2).unwrap();
                let mut thread = runtime.thread_init();
                for _ in 0..PER_THREAD {
                    if reads.sample(&mut rand::thread_rng()) {
                        thread
                            .transaction(|tx| tx.open_read(&counter).map(|_| ()))
                            .unwrap();
                    }
                    thread
                        .transaction(|tx| {
                            let value = tx.open_read(&counter)?;
                            tx.open_write(&counter, value + 1)
                        })
                        .unwrap();
                }
            });
        }
        pool.join();
        assert_eq!(pool.panic_count(), 0);

        let mut main = runtime.thread_init();
        let total = main.transaction(|tx| tx.open_read(&counter)).unwrap();
        assert_eq!(total, THREADS * PER_THREAD, "cm {}", cm);
    }
}

#[test]
fn test_retry_wakes_up_on_write() {
    init_logging();

    for retry in [RetryChoice::Sleep, RetryChoice::Bloom, RetryChoice::VisRead] {
        let runtime = Runtime::init(Config {
            retry,
            ..small_config()
        });
        let cell = runtime.share(0usize);

        let rt_waiter = runtime.clone();
        let waiter = std::thread::spawn(move || {
            let mut thread = rt_waiter.thread_init();
            let started = Instant::now();
            let seen = thread
                .transaction(|tx| {
                    let value = tx.open_read(&cell)?;
                    if value == 0 {
                        return tx.retry();
                    }
                    Ok(value)
                })
                .unwrap();
            (seen, started.elapsed(), thread.stats().retries)
        });

        std::thread::sleep(Duration::from_millis(20));
        let mut writer = runtime.thread_init();
        writer.transaction(|tx| tx.open_write(&cell, 42)).unwrap();

        let (seen, latency, retries) = waiter.join().unwrap();
        assert_eq!(seen, 42, "retry {}", retry);
        assert!(latency < Duration::from_secs(5), "retry {}", retry);
        assert!(retries >= 1, "retry {}", retry);
    }
}

#[test]
fn test_retry_with_stale_read_restarts_immediately() {
    init_logging();

    let runtime = Runtime::init(Config {
        retry: RetryChoice::Bloom,
        ..small_config()
    });
    let cell = runtime.share(0usize);

    // the writer commits between the waiter's read and its retry; the
    // handle validation must turn the park into an immediate rerun
    let mut thread = runtime.thread_init();
    let mut first_attempt = true;
    let started = Instant::now();
    let seen = thread
        .transaction(|tx| {
            let value = tx.open_read(&cell)?;
            if first_attempt {
                first_attempt = false;
                // simulate the lost race: the cell changes under us
                let mut writer = runtime.thread_init();
                writer.transaction(|tx2| tx2.open_write(&cell, 9)).unwrap();
                return tx.retry();
            }
            Ok(value)
        })
        .unwrap();
    assert_eq!(seen, 9);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_inevitability_is_mutually_exclusive() {
    init_logging();

    const THREADS: usize = 4;
    const PER_THREAD: usize = 200;

    for inev in [
        InevChoice::Grl,
        InevChoice::Gwl,
        InevChoice::Drain,
        InevChoice::Bloom,
    ] {
        let runtime = Runtime::init(Config {
            inev,
            ..small_config()
        });
        let counter = runtime.share(0usize);
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let granted = Arc::new(AtomicUsize::new(0));
        let pool = ThreadPool::new(THREADS);

        for _ in 0..THREADS {
            let runtime = runtime.clone();
            let inside = inside.clone();
            let peak = peak.clone();
            let granted = granted.clone();
            pool.execute(move || {
                let mut thread = runtime.thread_init();
                for _ in 0..PER_THREAD {
                    thread
                        .transaction(|tx| {
                            if tx.try_inevitable() {
                                let depth = inside.fetch_add(1, Ordering::SeqCst) + 1;
                                peak.fetch_max(depth, Ordering::SeqCst);
                                granted.fetch_add(1, Ordering::SeqCst);
                                let value = tx.open_read(&counter)?;
                                tx.open_write(&counter, value + 1)?;
                                inside.fetch_sub(1, Ordering::SeqCst);
                                Ok(())
                            } else {
                                let value = tx.open_read(&counter)?;
                                tx.open_write(&counter, value + 1)
                            }
                        })
                        .unwrap();
                }
            });
        }
        pool.join();
        assert_eq!(pool.panic_count(), 0);

        assert!(peak.load(Ordering::SeqCst) <= 1, "inev {}", inev);
        assert!(granted.load(Ordering::SeqCst) > 0, "inev {}", inev);

        let mut main = runtime.thread_init();
        let total = main.transaction(|tx| tx.open_read(&counter)).unwrap();
        assert_eq!(total, THREADS * PER_THREAD, "inev {}", inev);
    }
}

#[test]
fn test_inevitability_denied_after_first_read() {
    init_logging();

    let runtime = Runtime::init(Config {
        inev: InevChoice::Grl,
        ..small_config()
    });
    let cell = runtime.share(0usize);
    let mut thread = runtime.thread_init();

    let granted = thread
        .transaction(|tx| {
            let _ = tx.open_read(&cell)?;
            Ok(tx.try_inevitable())
        })
        .unwrap();
    assert!(!granted);

    // disabled policy never grants, even pre-read
    let runtime = Runtime::init(small_config());
    let mut thread = runtime.thread_init();
    let granted = thread.transaction(|tx| Ok(tx.try_inevitable())).unwrap();
    assert!(!granted);
}

#[test]
fn test_privatization_fences_run_alongside_writers() {
    init_logging();

    const THREADS: usize = 4;
    const PER_THREAD: usize = 500;

    for privatization in [
        PrivChoice::TFence,
        PrivChoice::VFence,
        PrivChoice::Nonblocking,
        PrivChoice::Logic,
    ] {
        let runtime = Runtime::init(Config {
            privatization,
            ..small_config()
        });
        let counter = runtime.share(0usize);
        let pool = ThreadPool::new(THREADS);

        for _ in 0..THREADS {
            let runtime = runtime.clone();
            pool.execute(move || {
                let mut thread = runtime.thread_init();
                for _ in 0..PER_THREAD {
                    thread
                        .transaction(|tx| {
                            let value = tx.open_read(&counter)?;
                            tx.open_write(&counter, value + 1)
                        })
                        .unwrap();
                }
            });
        }

        // privatize concurrently with the writers
        for _ in 0..50 {
            runtime.fence();
        }
        runtime.acquire_fence();
        runtime.release_fence();

        pool.join();
        assert_eq!(pool.panic_count(), 0);

        // after the last fence, direct reads through an unprotected
        // handle are stable
        runtime.acquire_fence();
        let total = counter.unprotected().get();
        assert_eq!(total, THREADS * PER_THREAD, "priv {}", privatization);
    }
}

#[test]
fn test_bounded_strategies_give_up() {
    init_logging();

    let runtime = Runtime::init(small_config());
    let mut thread = runtime.thread_init();

    let result = thread.transaction_with_strategy(|tx| tx.abort::<()>(), Strategy::Abort);
    assert!(matches!(result, Err(weft_stm::RuntimeError::Exhausted(1))));

    let result = thread.transaction_with_strategy(
        |tx| tx.abort::<()>(),
        Strategy::RetryWithBreaker(Breaker::default()),
    );
    match result {
        Err(weft_stm::RuntimeError::Exhausted(attempts)) => assert!(attempts > 1),
        other => panic!("expected exhaustion, got {:?}", other.err()),
    }
}

#[test]
fn test_per_thread_policy_selection() {
    init_logging();

    let runtime = Runtime::init(Config {
        static_cm: false,
        ..small_config()
    });
    assert!(runtime.thread_init_with_cm("Karma").is_ok());
    assert!(runtime.thread_init_with_cm("Whpolka").is_err());

    // with a static policy the override is ignored but still validated
    let runtime = Runtime::init(small_config());
    assert!(runtime.thread_init_with_cm("Timid").is_ok());
    assert!(runtime.thread_init_with_cm("Eruption").is_err());
}
