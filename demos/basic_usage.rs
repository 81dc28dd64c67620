//! Basic usage of the bounded MPMC queue.
//!
//! Run with: `cargo run --example basic_usage`

use std::time::{Duration, Instant};
use turnstile::MpmcQueue;

fn main() {
    turnstile::trace::init_tracing();

    let queue = MpmcQueue::new(4);

    // Non-blocking writes fail once the ring is full and hand the value
    // back.
    for i in 0..4 {
        assert!(queue.write(i).is_ok());
    }
    match queue.write(99) {
        Ok(()) => unreachable!("queue was full"),
        Err(err) => println!("rejected: {} ({})", err, 99),
    }

    let stats = queue.stats();
    println!(
        "capacity={} size={} full={}",
        stats.capacity, stats.size, stats.is_full
    );

    // Drain and observe the deadline path on the now-empty queue.
    while let Some(value) = queue.read() {
        println!("read {value}");
    }
    let start = Instant::now();
    let missing = queue.read_until(Instant::now() + Duration::from_millis(50));
    println!(
        "read_until on empty queue -> {:?} after {:?}",
        missing,
        start.elapsed()
    );
}
