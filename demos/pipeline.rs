//! A small work pipeline: several producers feed jobs through the queue to
//! several workers, with blocking handoff on both sides.
//!
//! Run with: `cargo run --example pipeline`

use std::sync::Arc;
use std::thread;
use turnstile::MpmcQueue;

const PRODUCERS: usize = 4;
const WORKERS: usize = 4;
const JOBS_PER_PRODUCER: usize = 25_000;

fn main() {
    turnstile::trace::init_tracing();

    let queue = Arc::new(MpmcQueue::new(256));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..JOBS_PER_PRODUCER {
                    queue.blocking_write((p * JOBS_PER_PRODUCER + i) as u64);
                }
            })
        })
        .collect();

    let workers: Vec<_> = (0..WORKERS)
        .map(|_| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut sum = 0u64;
                for _ in 0..(PRODUCERS * JOBS_PER_PRODUCER / WORKERS) {
                    sum += queue.blocking_read();
                }
                sum
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }
    let total: u64 = workers.into_iter().map(|w| w.join().unwrap()).sum();

    let jobs = (PRODUCERS * JOBS_PER_PRODUCER) as u64;
    let expected = jobs * (jobs - 1) / 2;
    println!("dispatched {jobs} jobs, checksum {total} (expected {expected})");
    assert_eq!(total, expected);
}
