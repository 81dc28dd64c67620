//! Property-based tests for the MPMC queue using proptest
//!
//! These tests verify that the queue maintains its invariants under
//! arbitrary capacities, operation mixes, and thread counts.

use super::mpmc::compute_stride;
use super::*;
use crate::WriteError;
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

proptest! {
    /// Single-threaded pushes drain back out in FIFO order with the exact
    /// same multiset of values.
    #[test]
    fn prop_fifo_and_multiset_preserved(
        capacity in 1usize..64,
        values in prop::collection::vec(any::<i32>(), 0..64)
    ) {
        let queue = MpmcQueue::new(capacity);
        let mut accepted = Vec::new();

        for &value in &values {
            match queue.write(value) {
                Ok(()) => accepted.push(value),
                Err(WriteError::Full(v)) => prop_assert_eq!(v, value),
                Err(other) => prop_assert!(false, "unexpected error {:?}", other),
            }
        }

        prop_assert!(accepted.len() <= capacity);
        for expected in accepted {
            prop_assert_eq!(queue.read(), Some(expected));
        }
        prop_assert_eq!(queue.read(), None);
    }

    /// size() tracks pushes minus pops exactly when there is no concurrency.
    #[test]
    fn prop_size_matches_operation_count(
        capacity in 1usize..32,
        ops in prop::collection::vec(prop::bool::weighted(0.6), 1..200)
    ) {
        let queue = MpmcQueue::new(capacity);
        let mut expected_len: isize = 0;
        let mut counter = 0;

        for &should_push in &ops {
            if should_push {
                if queue.write(counter).is_ok() {
                    expected_len += 1;
                }
                counter += 1;
            } else if queue.read().is_some() {
                expected_len -= 1;
            }

            prop_assert_eq!(queue.size(), expected_len);
            prop_assert!(queue.size() <= capacity as isize);
        }
    }

    /// The chosen stride is always coprime with the capacity, so the
    /// ticket walk is a permutation of the ring.
    #[test]
    fn prop_stride_coprime(capacity in 1usize..4096) {
        let stride = compute_stride(capacity);
        prop_assert_eq!(gcd(stride, capacity), 1);
    }

    /// One full turn cycle of tickets touches every slot exactly once.
    #[test]
    fn prop_full_cycle_covers_all_slots(capacity in 1usize..512) {
        let stride = compute_stride(capacity);
        let mut seen = vec![false; capacity];
        for ticket in 0..capacity as u64 {
            let idx = (ticket.wrapping_mul(stride as u64) % capacity as u64) as usize;
            prop_assert!(!seen[idx]);
            seen[idx] = true;
        }
        prop_assert!(seen.iter().all(|&s| s));
    }
}

proptest! {
    // Concurrent cases are expensive; keep the case count low, as the
    // interesting variation is in the schedule rather than the input.
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Tokens sent equals tokens received for arbitrary producer/consumer
    /// counts and capacities, including capacity 1.
    #[test]
    fn prop_concurrent_sum_preserved(
        capacity in 1usize..32,
        threads in 1usize..4,
        per_thread in 1usize..100
    ) {
        let queue = Arc::new(MpmcQueue::new(capacity));
        let mut handles = Vec::new();

        for t in 0..threads {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for i in 0..per_thread {
                    queue.blocking_write((t * per_thread + i) as u64);
                }
            }));
        }

        let mut consumers = Vec::new();
        for _ in 0..threads {
            let queue = Arc::clone(&queue);
            consumers.push(thread::spawn(move || {
                (0..per_thread).map(|_| queue.blocking_read()).sum::<u64>()
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        let received: u64 = consumers.into_iter().map(|c| c.join().unwrap()).sum();

        let total = (threads * per_thread) as u64;
        prop_assert_eq!(received, total * (total - 1) / 2);
        prop_assert!(queue.is_empty());
    }
}
