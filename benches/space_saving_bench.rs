//! Benchmarks for the Space-Saving heavy-hitter tracker.

use criterion::{black_box, BenchmarkId, Criterion, Throughput};

use sinkhole::metrics::SpaceSaving;

fn bench_space_saving(c: &mut Criterion) {
    let mut group = c.benchmark_group("space_saving");
    group.throughput(Throughput::Elements(1));

    // Hot key: tracked, far from the minimum
    let tracker = SpaceSaving::new(20);
    for _ in 0..1_000 {
        tracker.add("hot.example.com.");
    }
    for i in 0..20 {
        tracker.add(&format!("filler{i}.example.com."));
    }
    group.bench_function(BenchmarkId::new("add", "tracked_key"), |b| {
        b.iter(|| tracker.add(black_box("hot.example.com.")))
    });

    // Cold keys: every add evicts the minimum
    let tracker = SpaceSaving::new(20);
    let mut counter = 0u64;
    group.bench_function(BenchmarkId::new("add", "evicting_key"), |b| {
        b.iter(|| {
            counter += 1;
            tracker.add(black_box(&format!("cold{counter}.example.com.")));
        })
    });

    let tracker = SpaceSaving::new(20);
    for i in 0..10_000 {
        tracker.add(&format!("key{}.example.com.", i % 50));
    }
    group.bench_function("top_n", |b| b.iter(|| tracker.top_n(black_box(20))));

    group.finish();
}

fn main() {
    let mut criterion = Criterion::default().configure_from_args();
    bench_space_saving(&mut criterion);
    criterion.final_summary();
}
