// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use criterion::{criterion_group, criterion_main, Criterion};
use weft_stm::{Config, Runtime};

fn bench_uncontended_increment(c: &mut Criterion) {
    let runtime = Runtime::init(Config {
        stripes: 1 << 14,
        ..Config::default()
    });
    let cell = runtime.share(0usize);
    let mut thread = runtime.thread_init();

    c.bench_function("uncontended_increment", |b| {
        b.iter(|| {
            thread
                .transaction(|tx| {
                    let value = tx.open_read(&cell)?;
                    tx.open_write(&cell, value + 1)
                })
                .unwrap()
        })
    });
}

fn bench_read_only(c: &mut Criterion) {
    let runtime = Runtime::init(Config {
        stripes: 1 << 14,
        ..Config::default()
    });
    let cells: Vec<_> = (0..32).map(|i| runtime.share(i as usize)).collect();
    let mut thread = runtime.thread_init();

    c.bench_function("read_only_scan", |b| {
        b.iter(|| {
            thread
                .transaction(|tx| {
                    let mut sum = 0usize;
                    for cell in &cells {
                        sum = sum.wrapping_add(tx.open_read(cell)?);
                    }
                    Ok(sum)
                })
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_uncontended_increment, bench_read_only);
criterion_main!(benches);
