//! Hook overhead benchmark
//!
//! Measures the cost the monitor adds to every instrumented call. The hot
//! path is:
//!
//! 1. `on_enter` - timestamp store into the calling thread's slot
//! 2. `on_exit` - threshold check, invocation count bump, timestamp clear
//!
//! # Run Instructions
//!
//! ```bash
//! cargo bench --bench hook_overhead
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::time::Duration;
use straggler::config::MonitorConfig;
use straggler::monitor::StragglerMonitor;
use straggler::report::MemorySink;

fn bench_monitor(config: MonitorConfig) -> StragglerMonitor {
    let config = MonitorConfig {
        autostart_scanner: false,
        ..config
    };
    StragglerMonitor::with_sink(config, Arc::new(MemorySink::new())).unwrap()
}

/// Benchmark: one enter/exit pair on a site that never trips its threshold
fn bench_enter_exit(c: &mut Criterion) {
    let monitor = bench_monitor(MonitorConfig::default());
    let site = monitor
        .register_call_site("bench_fn", Duration::from_secs(60), &[])
        .unwrap()
        .unwrap();
    monitor.on_thread_start(0).unwrap();

    c.bench_function("hook_enter_exit", |b| {
        b.iter(|| {
            monitor.on_enter(black_box(site), 0);
            monitor.on_exit(black_box(site), 0);
        });
    });
}

/// Benchmark: enter/exit with the exit-time check disabled
fn bench_enter_exit_no_check(c: &mut Criterion) {
    let monitor = bench_monitor(MonitorConfig {
        check_on_exit: false,
        ..Default::default()
    });
    let site = monitor
        .register_call_site("bench_fn", Duration::from_secs(60), &[])
        .unwrap()
        .unwrap();
    monitor.on_thread_start(0).unwrap();

    c.bench_function("hook_enter_exit_no_check", |b| {
        b.iter(|| {
            monitor.on_enter(black_box(site), 0);
            monitor.on_exit(black_box(site), 0);
        });
    });
}

/// Benchmark: nested-call recording inside an outstanding call
fn bench_nested_recording(c: &mut Criterion) {
    let mut group = c.benchmark_group("nested_recording");

    for nested in [1usize, 8, 64] {
        let monitor = bench_monitor(MonitorConfig::default());
        let site = monitor
            .register_call_site("outer", Duration::from_secs(60), &["inner".to_string()])
            .unwrap()
            .unwrap();
        monitor.on_thread_start(0).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(nested), &nested, |b, &n| {
            b.iter(|| {
                monitor.on_enter(site, 0);
                for _ in 0..n {
                    monitor.on_nested_enter(0, black_box("inner"));
                    monitor.on_nested_exit(0, black_box("inner"));
                }
                monitor.on_exit(site, 0);
            });
        });
    }

    group.finish();
}

/// Benchmark: one scanner pass over many idle threads
fn bench_scan_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan_pass");

    for threads in [32usize, 256, 1024] {
        let monitor = bench_monitor(MonitorConfig::default());
        monitor
            .register_call_site("bench_fn", Duration::from_secs(60), &[])
            .unwrap();
        for tid in 0..threads {
            monitor.on_thread_start(tid).unwrap();
        }

        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, _| {
            b.iter(|| black_box(monitor.scan_once()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_enter_exit,
    bench_enter_exit_no_check,
    bench_nested_recording,
    bench_scan_pass
);
criterion_main!(benches);
