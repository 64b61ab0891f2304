//! Pool allocation benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use jobgraph_core::pool::Pool;

fn bench_get_put(c: &mut Criterion) {
    c.bench_function("pool_get_put", |b| {
        let mut pool: Pool<u64> = Pool::new(64);
        b.iter(|| {
            let id = pool.get().unwrap();
            *pool.at_mut(id) = black_box(42);
            pool.put(id);
        });
    });
}

fn bench_burst(c: &mut Criterion) {
    c.bench_function("pool_burst_256", |b| {
        let mut pool: Pool<u64> = Pool::new(64);
        let mut ids = Vec::with_capacity(256);
        b.iter(|| {
            for _ in 0..256 {
                ids.push(pool.get().unwrap());
            }
            for id in ids.drain(..) {
                pool.put(id);
            }
        });
    });
}

criterion_group!(benches, bench_get_put, bench_burst);
criterion_main!(benches);
