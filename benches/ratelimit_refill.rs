//! Throughput of the global/receiver bucket accounting under a steady
//! stream of reads, adapted from Cyclone's benches/ layout convention.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use relay_conn::ratelimit::{GlobalBucket, ReceiverBucket};

fn bench_global_bucket(c: &mut Criterion) {
    c.bench_function("global_bucket_consume_refill", |b| {
        b.iter(|| {
            let mut bucket = GlobalBucket::new(8192);
            for _ in 0..1000 {
                bucket.consume(black_box(103));
                if bucket.level() == 0 {
                    bucket.refill();
                }
            }
            black_box(bucket.level());
        });
    });
}

fn bench_receiver_clamp(c: &mut Criterion) {
    c.bench_function("receiver_bucket_clamp", |b| {
        b.iter(|| {
            let mut level = 0i64;
            for d in 0..1000 {
                level = ReceiverBucket::clamp(level + black_box(d % 37) - 10, 2000);
            }
            black_box(level);
        });
    });
}

criterion_group!(benches, bench_global_bucket, bench_receiver_clamp);
criterion_main!(benches);
