use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use mthread_rt::{Butex, RuntimeConfigBuilder, Runtime};

/// Spawns a task per iteration and joins it immediately, the cheapest possible round trip
/// through the scheduler: slot acquire, stack acquire (or downgrade), one context switch in,
/// one context switch out, slot release.
fn spawn_join(c: &mut Criterion) {
    let _rt = Runtime::start(RuntimeConfigBuilder::new().worker_count(2).build());

    c.bench_function("spawn_join", |b| {
        b.iter(|| {
            let tid = mthread_rt::spawn(None, || {}).expect("spawn");
            mthread_rt::join(black_box(tid)).expect("join");
        });
    });
}

/// Two tasks hand a `Butex` back and forth, the same shape as the ping-pong scenario this
/// crate's test suite checks for correctness (`tests/scenarios.rs`), here used to measure
/// round-trip wake latency rather than just correctness.
fn ping_pong(c: &mut Criterion) {
    let _rt = Runtime::start(RuntimeConfigBuilder::new().worker_count(2).build());

    c.bench_function("ping_pong_1k", |b| {
        b.iter(|| {
            let ball: Arc<Butex> = Arc::new(Butex::new());

            let ball2 = ball.clone();
            let responder = mthread_rt::spawn(None, move || {
                let mut expected = 0;
                loop {
                    match ball2.wait(expected, None) {
                        Ok(()) => {}
                        Err(mthread_rt::SchedError::WouldBlock) => {}
                        Err(_) => break,
                    }
                    let value = ball2.load();
                    if value >= 2_000 {
                        break;
                    }
                    expected = value + 1;
                    ball2.store(expected);
                    ball2.wake_one();
                }
            })
            .expect("spawn responder");

            let mut expected = 1;
            ball.store(expected);
            ball.wake_one();
            loop {
                match ball.wait(expected, None) {
                    Ok(()) => {}
                    Err(mthread_rt::SchedError::WouldBlock) => {}
                    Err(_) => break,
                }
                let value = ball.load();
                if value >= 2_000 {
                    break;
                }
                expected = value + 1;
                ball.store(expected);
                ball.wake_one();
            }

            mthread_rt::join(black_box(responder)).expect("join responder");
        });
    });
}

criterion_group!(benches, spawn_join, ping_pong);
criterion_main!(benches);
