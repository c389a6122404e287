use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;

use tcpool::{Pool, PoolConfig};

const OPS: u64 = 100_000;

/// Thread-local front door alloc/free throughput.
fn tcpool_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = tcpool::allocate(size).unwrap();
      black_box(ptr);
      tcpool::deallocate(ptr, size).unwrap();
    }
  }
}

/// Alloc/free in bursts deep enough to move batches between tiers.
fn tcpool_burst(pool: &Arc<Pool>, size: usize) {
  let mut cache = pool.thread_cache();
  let mut held = Vec::with_capacity(1024);
  for _ in 0..OPS / 1024 {
    for _ in 0..1024 {
      held.push(cache.allocate(size).unwrap());
    }
    for ptr in held.drain(..) {
      unsafe { cache.deallocate(black_box(ptr), size).unwrap() };
    }
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

fn benchmark_malloc_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("malloc_throughput");
  let pool = Arc::new(Pool::new(PoolConfig::default()));

  for size in [16, 64, 256, 1024, 4096] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("tcpool", size), &size, |b, &size| {
      b.iter(|| tcpool_malloc_free(size))
    });

    group.bench_with_input(BenchmarkId::new("tcpool_burst", size), &size, |b, &size| {
      b.iter(|| tcpool_burst(&pool, size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_malloc_throughput);
criterion_main!(benches);
