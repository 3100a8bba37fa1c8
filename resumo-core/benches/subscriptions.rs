//! Benchmarks for the subscription tables.
//!
//! Run with: cargo bench -p resumo-core --bench subscriptions

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use resumo_core::reactive::{Subscriber, SubscriptionManager};
use resumo_core::value::{Target, TargetId};
use resumo_core::Document;
use std::hint::black_box;

fn hosts(doc: &Document, n: usize) -> Vec<Subscriber> {
    (0..n)
        .map(|_| Subscriber::Host(doc.create_element("div")))
        .collect()
}

/// A manager where each of `hosts` reads key `k{i % 8}` of `target`.
fn populated(target: TargetId, hosts: &[Subscriber]) -> SubscriptionManager {
    let subs = SubscriptionManager::new();
    for (i, host) in hosts.iter().enumerate() {
        subs.add_sub(target, host.clone(), Some(&format!("k{}", i % 8)));
    }
    subs
}

fn bench_add_sub(c: &mut Criterion) {
    let mut group = c.benchmark_group("subs/add");
    let doc = Document::new();

    for n in [16, 256, 4096] {
        group.throughput(Throughput::Elements(n as u64));
        let hosts = hosts(&doc, n);
        group.bench_with_input(BenchmarkId::new("keyed", n), &hosts, |b, hosts| {
            b.iter(|| {
                let target = Target::object().id();
                black_box(populated(target, hosts))
            })
        });
    }

    group.finish();
}

fn bench_notify(c: &mut Criterion) {
    let mut group = c.benchmark_group("subs/notify");
    let doc = Document::new();

    for n in [16, 256, 4096] {
        let target = Target::object().id();
        let subs = populated(target, &hosts(&doc, n));
        group.bench_with_input(BenchmarkId::new("one_key", n), &(), |b, _| {
            b.iter(|| black_box(subs.notify_subs(target, Some("k3"))))
        });
        group.bench_with_input(BenchmarkId::new("whole_object", n), &(), |b, _| {
            b.iter(|| black_box(subs.notify_subs(target, None)))
        });
    }

    group.finish();
}

fn bench_clear_sub(c: &mut Criterion) {
    let mut group = c.benchmark_group("subs/clear");
    let doc = Document::new();

    for targets in [1, 32, 512] {
        let host = hosts(&doc, 1).remove(0);
        group.bench_with_input(BenchmarkId::new("targets", targets), &targets, |b, &targets| {
            b.iter(|| {
                let subs = SubscriptionManager::new();
                for _ in 0..targets {
                    subs.add_sub(Target::object().id(), host.clone(), Some("value"));
                }
                subs.clear_sub(host.id());
                black_box(subs)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_add_sub, bench_notify, bench_clear_sub);
criterion_main!(benches);
