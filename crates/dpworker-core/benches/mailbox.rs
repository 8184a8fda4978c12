use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use criterion::{criterion_group, criterion_main, Criterion};
use dpworker_core::{mailbox, Envelope, JobHandle, JobStatus, Mempool, Outcome, Work};

fn bench_roundtrip(c: &mut Criterion) {
    let (mut dispatch, mut worker) = mailbox();
    let stop = Arc::new(AtomicBool::new(false));

    let worker_stop = stop.clone();
    let echo = thread::spawn(move || {
        while let Some(env) = worker.recv(&worker_stop) {
            let handle = match env.work {
                Work::Resume(h) => h,
                Work::Packet(_) => JobHandle::new(0, 0),
            };
            let out = Outcome {
                timestamp: env.timestamp,
                class: env.class,
                handle,
                status: JobStatus::Finished,
            };
            if worker.complete(out, &worker_stop).is_err() {
                break;
            }
        }
    });

    c.bench_function("mailbox_roundtrip", |b| {
        b.iter(|| {
            let mut env = Envelope::resume(JobHandle::new(1, 1), 0, 0);
            while let Err(back) = dispatch.submit(env) {
                env = back;
            }
            loop {
                if let Some(out) = dispatch.poll() {
                    break out;
                }
                std::hint::spin_loop();
            }
        })
    });

    stop.store(true, Ordering::Relaxed);
    let _ = echo.join();
}

fn bench_pool(c: &mut Criterion) {
    let pool = Mempool::new("bench", 1024, 64).unwrap();
    c.bench_function("mempool_acquire_release", |b| {
        b.iter(|| {
            let buf = pool.acquire().unwrap();
            drop(buf);
        })
    });
}

criterion_group!(benches, bench_roundtrip, bench_pool);
criterion_main!(benches);
