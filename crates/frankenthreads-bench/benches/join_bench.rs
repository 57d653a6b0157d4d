//! Thread-record arena and join fast paths.

use std::sync::atomic::AtomicU32;

use criterion::{Criterion, criterion_group, criterion_main};
use frankenthreads_core::ThreadTable;
use frankenthreads_core::futex::{Futex, WaitOutcome};
use frankenthreads_core::time::Deadline;

/// Never sleeps; the benched paths never need to.
struct SpinFutex;

impl Futex for SpinFutex {
    fn wait(&self, _: &AtomicU32, _: u32, _: Option<&Deadline>, _: bool) -> WaitOutcome {
        WaitOutcome::Interrupted
    }

    fn wake(&self, _: &AtomicU32, _: u32, _: bool) -> usize {
        0
    }
}

fn bench_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("thread_table");
    let table = ThreadTable::new(SpinFutex, 256);

    group.bench_function("register_exit_join", |b| {
        b.iter(|| {
            let id = table.register().unwrap();
            table.on_exit(id, 7).unwrap();
            criterion::black_box(table.join(id).unwrap());
        });
    });

    let running = table.register().unwrap();
    group.bench_function("try_join_busy", |b| {
        b.iter(|| criterion::black_box(table.try_join(running).is_err()));
    });

    group.bench_function("register_detach_exit", |b| {
        b.iter(|| {
            let id = table.register().unwrap();
            table.detach(id).unwrap();
            table.on_exit(id, 0).unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_join);
criterion_main!(benches);
