//! Benchmarks for blocklist domain lookup.
//!
//! Measures how quickly we can check if a domain is blocked.

use criterion::{black_box, BenchmarkId, Criterion, Throughput};

use sinkhole::filter::{Blocklist, DEFAULT_FP_RATE};

fn bench_is_blocked(c: &mut Criterion) {
    let domains: Vec<String> = (0..100_000)
        .map(|i| format!("blocked{i}.example.com"))
        .chain(["doubleclick.net".to_owned()])
        .collect();
    let blocklist = Blocklist::new(&domains, DEFAULT_FP_RATE);

    let mut group = c.benchmark_group("blocklist");

    // Benchmark exact match (blocked domain)
    group.throughput(Throughput::Elements(1));
    group.bench_function(BenchmarkId::new("is_blocked", "exact_match"), |b| {
        b.iter(|| blocklist.is_blocked(black_box("doubleclick.net.")))
    });

    // Benchmark apex match (blocked via eTLD+1)
    group.bench_function(BenchmarkId::new("is_blocked", "apex_match"), |b| {
        b.iter(|| blocklist.is_blocked(black_box("ads.tracking.doubleclick.net.")))
    });

    // Benchmark miss (not blocked)
    group.bench_function(BenchmarkId::new("is_blocked", "miss"), |b| {
        b.iter(|| blocklist.is_blocked(black_box("www.google.com.")))
    });

    // Benchmark deep subdomain miss
    group.bench_function(BenchmarkId::new("is_blocked", "deep_miss"), |b| {
        b.iter(|| blocklist.is_blocked(black_box("a.b.c.d.e.f.example.org.")))
    });

    group.finish();
}

fn main() {
    let mut criterion = Criterion::default().configure_from_args();
    bench_is_blocked(&mut criterion);
    criterion.final_summary();
}
