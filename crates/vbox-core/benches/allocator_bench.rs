//! Criterion benchmarks for host-port allocation and redirect decoding.
//!
//! Allocation runs once per auto-allocated NAT rule, but on a host with many
//! machines the used-port snapshot can hold thousands of entries.
//!
//! Run with:
//! ```bash
//! cargo bench --package vbox-core --bench allocator_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use vbox_core::{
    decode_adapter_redirect, select_available_port, HostIpScope, PortAllocatorOptions, UsedPort,
};

// ── Fixture builders ──────────────────────────────────────────────────────────

/// `n` used ports packed from 20000 upward, alternating wildcard and loopback.
fn dense_used_ports(n: u16) -> Vec<UsedPort> {
    (0..n)
        .map(|i| UsedPort::new(20000 + i, if i % 2 == 0 { "" } else { "127.0.0.1" }))
        .collect()
}

// ── Benchmarks: select_available_port ─────────────────────────────────────────

fn bench_select_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_available_port");

    for &count in &[0u16, 100, 1000, 10000] {
        let used = dense_used_ports(count);
        let opts = PortAllocatorOptions::default();

        group.bench_with_input(BenchmarkId::new("any_scope_used", count), &used, |b, used| {
            b.iter(|| select_available_port(black_box(used), black_box(&opts)))
        });
    }

    group.finish();
}

fn bench_select_exact_scope(c: &mut Criterion) {
    let used = dense_used_ports(1000);
    let opts = PortAllocatorOptions {
        host_ip: "192.168.1.10".to_string(),
        scope: HostIpScope::Exact,
        ..Default::default()
    };

    c.bench_function("select_available_port/exact_scope_1000", |b| {
        b.iter(|| select_available_port(black_box(&used), black_box(&opts)))
    });
}

// ── Benchmarks: redirect decoding ─────────────────────────────────────────────

fn bench_decode_redirect(c: &mut Criterion) {
    c.bench_function("decode_adapter_redirect", |b| {
        b.iter(|| decode_adapter_redirect(black_box("ssh,1,127.0.0.1,2222,10.0.2.15,22")))
    });
}

criterion_group!(
    benches,
    bench_select_scaling,
    bench_select_exact_scope,
    bench_decode_redirect
);
criterion_main!(benches);
