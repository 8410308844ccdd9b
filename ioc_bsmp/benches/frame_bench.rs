//! Framing and checksum micro-benchmarks.
//!
//! The poll loop frames and validates one package per variable-group
//! exchange per device per scan cycle, so these paths run continuously.

use criterion::{Criterion, criterion_group, criterion_main};
use ioc_bsmp::{Message, Package};
use std::hint::black_box;

fn bench_frame(c: &mut Criterion) {
    let payload: Vec<u8> = (0..64).collect();
    let message = Message::new(0x13, payload).unwrap();
    let stream = Package::new(1, message.clone()).stream();

    c.bench_function("package_new_64b", |b| {
        b.iter(|| Package::new(black_box(1), black_box(message.clone())))
    });

    c.bench_function("package_parse_64b", |b| {
        b.iter(|| Package::parse(black_box(&stream)).unwrap())
    });

    c.bench_function("verify_checksum_64b", |b| {
        b.iter(|| Package::verify_checksum(black_box(&stream)))
    });
}

criterion_group!(benches, bench_frame);
criterion_main!(benches);
