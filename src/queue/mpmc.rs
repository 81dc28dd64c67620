//! Multi-Producer, Multi-Consumer (MPMC) bounded queue
//!
//! A contiguous ring of single-element slots, each pairing one payload cell
//! with one [`TurnSequencer`]. Two atomic 64-bit counters dispense tickets;
//! a ticket decomposes into a slot index and an expected turn at that slot.
//!
//! ## Memory Ordering Model
//!
//! ```text
//! Producer (enqueue)                 Consumer (dequeue)
//! ------------------                 ------------------
//! wait_for_turn(2k)                  wait_for_turn(2k + 1)
//! store payload                      move payload out
//! complete_turn(2k)  --Release-->      --Acquire-- (sequencer state)
//! ```
//!
//! Payload visibility is synchronized by the sequencer's `complete_turn`
//! release/acquire edge, not by the ticket counters. Ticket counter loads
//! that precede a decision use `Acquire`; the ticket-advancing CAS is
//! `AcqRel` on success.
//!
//! ## Ticket distribution
//!
//! Consecutive tickets land `stride` slots apart, where `stride` is a small
//! prime coprime with the capacity. Neighboring producers therefore touch
//! distinct cache lines instead of racing on adjacent slots. Padding slots
//! at both ends of the ring insulate it from adjacent allocations.

use crate::futex::Deadline;
use crate::sequencer::{TryWaitResult, TurnSequencer};
use crate::trace::debug;
use crate::util::{CachePadded, CACHE_LINE_SIZE};
use crate::WriteError;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Once every `ADAPTATION_FREQ` tickets the sequencer wait probes with a
/// longer spin, to re-estimate the adaptive spin cutoff.
const ADAPTATION_FREQ: u64 = 128;

/// A single-element queue: one payload cell guarded by one sequencer.
///
/// Turn numbering interleaves the two roles: turn `2k` grants enqueue
/// rights to the k-th producer that reaches this slot, turn `2k + 1`
/// grants dequeue rights to the k-th consumer.
struct Slot<T> {
    sequencer: TurnSequencer,
    contents: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: the payload cell is single-writer single-reader per turn phase;
// the sequencer's complete_turn edge publishes every write before the
// matching dequeue turn can begin.
unsafe impl<T: Send> Send for Slot<T> {}
unsafe impl<T: Send> Sync for Slot<T> {}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            sequencer: TurnSequencer::new(0),
            contents: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    fn enqueue(&self, turn: u32, spin_cutoff: &AtomicU32, update_spin_cutoff: bool, value: T) {
        self.sequencer
            .wait_for_turn(turn.wrapping_mul(2), spin_cutoff, update_spin_cutoff);
        unsafe {
            (*self.contents.get()).write(value);
        }
        self.sequencer.complete_turn(turn.wrapping_mul(2));
    }

    fn dequeue(&self, turn: u32, spin_cutoff: &AtomicU32, update_spin_cutoff: bool) -> T {
        self.sequencer.wait_for_turn(
            turn.wrapping_mul(2).wrapping_add(1),
            spin_cutoff,
            update_spin_cutoff,
        );
        // SAFETY: the enqueue for this turn completed before our turn was
        // granted, so the cell holds an initialized value that no other
        // thread may touch until we complete the turn.
        let value = unsafe { (*self.contents.get()).assume_init_read() };
        self.sequencer
            .complete_turn(turn.wrapping_mul(2).wrapping_add(1));
        value
    }

    fn may_enqueue(&self, turn: u32) -> bool {
        self.sequencer.is_turn(turn.wrapping_mul(2))
    }

    fn may_dequeue(&self, turn: u32) -> bool {
        self.sequencer.is_turn(turn.wrapping_mul(2).wrapping_add(1))
    }

    /// Returns false iff the wait timed out. A `Past` result reports true:
    /// the turn has already arrived and gone, so an attempt would not block.
    fn try_wait_for_enqueue_turn_until(
        &self,
        turn: u32,
        spin_cutoff: &AtomicU32,
        update_spin_cutoff: bool,
        deadline: Deadline,
    ) -> bool {
        self.sequencer.try_wait_for_turn(
            turn.wrapping_mul(2),
            spin_cutoff,
            update_spin_cutoff,
            Some(deadline),
        ) != TryWaitResult::TimedOut
    }

    fn try_wait_for_dequeue_turn_until(
        &self,
        turn: u32,
        spin_cutoff: &AtomicU32,
        update_spin_cutoff: bool,
        deadline: Deadline,
    ) -> bool {
        self.sequencer.try_wait_for_turn(
            turn.wrapping_mul(2).wrapping_add(1),
            spin_cutoff,
            update_spin_cutoff,
            Some(deadline),
        ) != TryWaitResult::TimedOut
    }
}

/// A bounded multi-producer, multi-consumer queue
///
/// The queue is created with a fixed capacity and never resizes. Producers
/// and consumers coordinate through per-slot turn sequencing: the k-th
/// successful push is delivered to the k-th successful pop, regardless of
/// scheduling (FIFO by ticket).
///
/// # Operations
///
/// | Operation | Behavior when not ready |
/// |-----------|-------------------------|
/// | [`write`](Self::write) / [`read`](Self::read) | return immediately |
/// | [`blocking_write`](Self::blocking_write) / [`blocking_read`](Self::blocking_read) | park until the slot's turn |
/// | [`write_until`](Self::write_until) / [`read_until`](Self::read_until) | park up to an absolute deadline |
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use std::thread;
/// use turnstile::MpmcQueue;
///
/// let queue = Arc::new(MpmcQueue::new(64));
///
/// let producer = thread::spawn({
///     let queue = Arc::clone(&queue);
///     move || {
///         for i in 0..100 {
///             queue.blocking_write(i);
///         }
///     }
/// });
///
/// let consumer = thread::spawn({
///     let queue = Arc::clone(&queue);
///     move || (0..100).map(|_| queue.blocking_read()).sum::<i32>()
/// });
///
/// producer.join().unwrap();
/// assert_eq!(consumer.join().unwrap(), 4950);
/// ```
///
/// # Destruction
///
/// Dropping the queue assumes quiescence: no thread may still be parked in
/// a blocking operation. Elements still in flight are dropped with the
/// queue.
pub struct MpmcQueue<T> {
    capacity: usize,

    /// Coprime step decorrelating consecutive tickets from consecutive
    /// slots.
    stride: usize,

    /// `capacity + 2 * SLOT_PADDING` slots; the padding slots at each end
    /// are never indexed and exist only to absorb false sharing with
    /// neighboring allocations.
    slots: Box<[Slot<T>]>,

    /// Enqueuers get tickets from here.
    push_ticket: CachePadded<AtomicU64>,

    /// Dequeuers get tickets from here.
    pop_ticket: CachePadded<AtomicU64>,

    /// How long to spin before parking when the assigned slot is not ready
    /// on enqueue, adaptively re-estimated every `ADAPTATION_FREQ` tickets.
    push_spin_cutoff: CachePadded<AtomicU32>,

    /// The adaptive spin cutoff for the dequeue side.
    ///
    /// This is the last field: `CachePadded`'s size is a whole number of
    /// cache lines, so it doubles as the trailing pad that keeps the
    /// struct's tail off a neighbor's line.
    pop_spin_cutoff: CachePadded<AtomicU32>,
}

impl<T> MpmcQueue<T> {
    const SLOT_PADDING: usize = (CACHE_LINE_SIZE - 1) / core::mem::size_of::<Slot<T>>() + 1;

    /// Create a queue with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0. Capacity 1 is legal and behaves as a
    /// rendezvous with at most one in-flight element.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "queue capacity must be at least 1");

        let stride = compute_stride(capacity);
        let slot_count = capacity + 2 * Self::SLOT_PADDING;
        let slots: Box<[Slot<T>]> = (0..slot_count).map(|_| Slot::new()).collect();

        debug!(capacity, stride, "created bounded mpmc queue");

        Self {
            capacity,
            stride,
            slots,
            push_ticket: CachePadded::new(AtomicU64::new(0)),
            pop_ticket: CachePadded::new(AtomicU64::new(0)),
            push_spin_cutoff: CachePadded::new(AtomicU32::new(0)),
            pop_spin_cutoff: CachePadded::new(AtomicU32::new(0)),
        }
    }

    /// The fixed capacity the queue was created with.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Linearizable snapshot of the number of elements in the queue.
    ///
    /// May be negative when pending pops outstrip completed pushes. The
    /// result equals `pushes - pops` at some instant during the call: the
    /// snapshot retries until one counter is seen unchanged across a read
    /// of the other, and linearizes at the stable read.
    pub fn size(&self) -> isize {
        let mut pushes = self.push_ticket.load(Ordering::Acquire); // A
        let mut pops = self.pop_ticket.load(Ordering::Acquire); // B
        loop {
            let next_pushes = self.push_ticket.load(Ordering::Acquire); // C
            if pushes == next_pushes {
                // push_ticket didn't change from A (or the previous C) to
                // C, so we can linearize at B (or D)
                return pushes.wrapping_sub(pops) as i64 as isize;
            }
            pushes = next_pushes;
            let next_pops = self.pop_ticket.load(Ordering::Acquire); // D
            if pops == next_pops {
                // pop_ticket didn't change from B (or the previous D), so
                // we can linearize at C
                return pushes.wrapping_sub(pops) as i64 as isize;
            }
            pops = next_pops;
        }
    }

    /// True when [`size`](Self::size) observes no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() <= 0
    }

    /// True when [`size`](Self::size) observes a full queue.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.size() >= self.capacity as isize
    }

    /// A point-in-time snapshot for monitoring call sites.
    pub fn stats(&self) -> QueueStats {
        let size = self.size();
        QueueStats {
            capacity: self.capacity,
            size,
            is_empty: size <= 0,
            is_full: size >= self.capacity as isize,
        }
    }

    /// Non-blocking write.
    ///
    /// Fails with [`WriteError::Full`] if no slot is immediately ready; a
    /// failed attempt consumes no ticket and is unobservable to other
    /// threads.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use turnstile::{MpmcQueue, WriteError};
    ///
    /// let queue = MpmcQueue::new(2);
    /// assert!(queue.write(1).is_ok());
    /// assert!(queue.write(2).is_ok());
    /// assert_eq!(queue.write(3), Err(WriteError::Full(3)));
    /// ```
    pub fn write(&self, value: T) -> Result<(), WriteError<T>> {
        match self.try_obtain_ready_push_ticket() {
            // The ticket is pre-validated: enqueue will not block.
            Some(ticket) => {
                self.enqueue_with_ticket(ticket, value);
                Ok(())
            }
            None => Err(WriteError::Full(value)),
        }
    }

    /// Non-blocking read. Returns `None` if no element is immediately
    /// ready.
    pub fn read(&self) -> Option<T> {
        let ticket = self.try_obtain_ready_pop_ticket()?;
        Some(self.dequeue_with_ticket(ticket))
    }

    /// Write, parking until the assigned slot's turn arrives.
    pub fn blocking_write(&self, value: T) {
        let ticket = self.push_ticket.fetch_add(1, Ordering::AcqRel);
        self.enqueue_with_ticket(ticket, value);
    }

    /// Read, parking until the assigned slot's turn arrives.
    pub fn blocking_read(&self) -> T {
        let ticket = self.pop_ticket.fetch_add(1, Ordering::AcqRel);
        self.dequeue_with_ticket(ticket)
    }

    /// Write with an absolute deadline.
    ///
    /// Returns [`WriteError::Timeout`] if the queue stayed full past the
    /// deadline. On success the write may still briefly park while the
    /// preceding consumer of its slot finishes.
    pub fn write_until(
        &self,
        deadline: impl Into<Deadline>,
        value: T,
    ) -> Result<(), WriteError<T>> {
        let deadline = deadline.into();
        loop {
            match self.try_obtain_promised_push_ticket() {
                Ok(ticket) => {
                    self.enqueue_with_ticket(ticket, value);
                    return Ok(());
                }
                Err(ticket) => {
                    // The queue was full at `ticket`. We did not reserve it,
                    // so wait for its turn to come around and then
                    // re-attempt a reservation from scratch.
                    let ready = self.slots[self.idx(ticket)].try_wait_for_enqueue_turn_until(
                        self.turn(ticket),
                        &self.push_spin_cutoff,
                        ticket % ADAPTATION_FREQ == 0,
                        deadline,
                    );
                    if !ready {
                        return Err(WriteError::Timeout(value));
                    }
                }
            }
        }
    }

    /// Read with an absolute deadline. Returns `None` if the queue stayed
    /// empty past the deadline.
    pub fn read_until(&self, deadline: impl Into<Deadline>) -> Option<T> {
        let deadline = deadline.into();
        loop {
            match self.try_obtain_promised_pop_ticket() {
                Ok(ticket) => return Some(self.dequeue_with_ticket(ticket)),
                Err(ticket) => {
                    let ready = self.slots[self.idx(ticket)].try_wait_for_dequeue_turn_until(
                        self.turn(ticket),
                        &self.pop_spin_cutoff,
                        ticket % ADAPTATION_FREQ == 0,
                        deadline,
                    );
                    if !ready {
                        return None;
                    }
                }
            }
        }
    }

    /// Slot index for `ticket`: a stride walk through the ring, offset past
    /// the leading padding slots.
    #[inline]
    fn idx(&self, ticket: u64) -> usize {
        (ticket.wrapping_mul(self.stride as u64) % self.capacity as u64) as usize
            + Self::SLOT_PADDING
    }

    /// The turn to use at the slot `ticket` maps to.
    #[inline]
    fn turn(&self, ticket: u64) -> u32 {
        (ticket / self.capacity as u64) as u32
    }

    /// Obtain a push ticket whose slot is immediately ready, or report
    /// failure without consuming a ticket.
    fn try_obtain_ready_push_ticket(&self) -> Option<u64> {
        let mut ticket = self.push_ticket.load(Ordering::Acquire); // A
        loop {
            if !self.slots[self.idx(ticket)].may_enqueue(self.turn(ticket)) {
                // Enqueuing at this ticket would block, but it might no
                // longer be the next ticket. Recheck the dispenser: if it
                // moved, retry with the fresh ticket.
                let prev = ticket;
                ticket = self.push_ticket.load(Ordering::Acquire); // B
                if prev == ticket {
                    // may_enqueue was bracketed by two identical reads, so
                    // the slot is genuinely not ready for us.
                    return None;
                }
            } else {
                match self.push_ticket.compare_exchange(
                    ticket,
                    ticket + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Some(ticket),
                    Err(observed) => ticket = observed,
                }
            }
        }
    }

    /// Obtain a push ticket that can be satisfied once all in-progress pops
    /// complete, or report the observed ticket when the queue is full.
    ///
    /// Ignores per-slot readiness: the granted ticket may block briefly on
    /// the slot's sequencer while the preceding pop finishes. Fullness
    /// linearizes at the `pop_ticket` load.
    fn try_obtain_promised_push_ticket(&self) -> Result<u64, u64> {
        let mut num_pushes = self.push_ticket.load(Ordering::Acquire); // A
        loop {
            let ticket = num_pushes;
            let num_pops = self.pop_ticket.load(Ordering::Acquire); // B
            // n is negative when pops are pending.
            let n = num_pushes.wrapping_sub(num_pops) as i64;
            if n >= self.capacity as i64 {
                // Full, linearize at B. A stale read at A only understates
                // num_pushes, which makes the real value even worse.
                return Err(ticket);
            }
            match self.push_ticket.compare_exchange(
                num_pushes,
                num_pushes + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(ticket),
                Err(observed) => num_pushes = observed,
            }
        }
    }

    /// Obtain a pop ticket whose slot is immediately ready, or report
    /// failure without consuming a ticket.
    fn try_obtain_ready_pop_ticket(&self) -> Option<u64> {
        let mut ticket = self.pop_ticket.load(Ordering::Acquire);
        loop {
            if !self.slots[self.idx(ticket)].may_dequeue(self.turn(ticket)) {
                let prev = ticket;
                ticket = self.pop_ticket.load(Ordering::Acquire);
                if prev == ticket {
                    return None;
                }
            } else {
                match self.pop_ticket.compare_exchange(
                    ticket,
                    ticket + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Some(ticket),
                    Err(observed) => ticket = observed,
                }
            }
        }
    }

    /// Obtain a pop ticket whose corresponding push ticket has been handed
    /// out (though possibly not yet completed), or report the observed
    /// ticket when the queue is empty.
    ///
    /// This is what makes `read_until` reliable: if an enqueue has
    /// succeeded, a promised pop ticket for it will be granted, even if the
    /// caller then has to wait for the enqueuer to finish inside the queue.
    fn try_obtain_promised_pop_ticket(&self) -> Result<u64, u64> {
        let mut num_pops = self.pop_ticket.load(Ordering::Acquire); // A
        loop {
            let ticket = num_pops;
            let num_pushes = self.push_ticket.load(Ordering::Acquire); // B
            if num_pops >= num_pushes {
                // Empty, or empty with pending pops. Linearize at B; a
                // stale read at A only makes the >= hold harder.
                return Err(ticket);
            }
            match self.pop_ticket.compare_exchange(
                num_pops,
                num_pops + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(ticket),
                Err(observed) => num_pops = observed,
            }
        }
    }

    fn enqueue_with_ticket(&self, ticket: u64, value: T) {
        self.slots[self.idx(ticket)].enqueue(
            self.turn(ticket),
            &self.push_spin_cutoff,
            ticket % ADAPTATION_FREQ == 0,
            value,
        );
    }

    fn dequeue_with_ticket(&self, ticket: u64) -> T {
        self.slots[self.idx(ticket)].dequeue(
            self.turn(ticket),
            &self.pop_spin_cutoff,
            ticket % ADAPTATION_FREQ == 0,
        )
    }
}

impl<T> core::fmt::Debug for MpmcQueue<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MpmcQueue")
            .field("capacity", &self.capacity)
            .field("stride", &self.stride)
            .field("push_ticket", &self.push_ticket.load(Ordering::Relaxed))
            .field("pop_ticket", &self.pop_ticket.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T> Drop for MpmcQueue<T> {
    fn drop(&mut self) {
        // Exclusive access; callers must have quiesced. Tickets in
        // [pop_ticket, push_ticket) hold initialized elements.
        let pushes = self.push_ticket.load(Ordering::Relaxed);
        let pops = self.pop_ticket.load(Ordering::Relaxed);
        let in_flight = pushes.wrapping_sub(pops) as i64;
        let mut ticket = pops;
        for _ in 0..in_flight.max(0) {
            let idx = self.idx(ticket);
            unsafe {
                (*self.slots[idx].contents.get()).assume_init_drop();
            }
            ticket = ticket.wrapping_add(1);
        }
    }
}

/// Point-in-time queue statistics, from [`MpmcQueue::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Maximum number of elements the queue can hold.
    pub capacity: usize,
    /// Snapshot of the current element count; may be transiently negative.
    pub size: isize,
    /// Whether the queue was empty at the snapshot.
    pub is_empty: bool,
    /// Whether the queue was full at the snapshot.
    pub is_full: bool,
}

/// Pick the stride that maximizes the ring distance between consecutive
/// tickets, from a fixed list of small primes. Strides that divide the
/// capacity (or are divided by it) are discarded, so the result is always
/// coprime with the capacity and the stride walk visits every slot.
pub(crate) fn compute_stride(capacity: usize) -> usize {
    const SMALL_PRIMES: [usize; 9] = [2, 3, 5, 7, 11, 13, 17, 19, 23];

    let mut best_stride = 1;
    let mut best_sep = 1;
    for stride in SMALL_PRIMES {
        if stride % capacity == 0 || capacity % stride == 0 {
            continue;
        }
        let sep = stride % capacity;
        let sep = sep.min(capacity - sep);
        if sep > best_sep {
            best_stride = stride;
            best_sep = sep;
        }
    }
    best_stride
}

#[cfg(all(test, not(loom)))]
mod unit_tests {
    use super::*;

    fn gcd(a: usize, b: usize) -> usize {
        if b == 0 {
            a
        } else {
            gcd(b, a % b)
        }
    }

    #[test]
    fn test_stride_coprime_with_capacity() {
        for capacity in 1..=512 {
            let stride = compute_stride(capacity);
            assert_eq!(
                gcd(stride, capacity),
                1,
                "stride {} not coprime with capacity {}",
                stride,
                capacity
            );
        }
    }

    #[test]
    fn test_stride_walk_covers_every_slot() {
        for capacity in [1usize, 2, 3, 7, 10, 128, 1000] {
            let queue: MpmcQueue<u8> = MpmcQueue::new(capacity);
            let mut seen = vec![false; capacity];
            for ticket in 0..capacity as u64 {
                let idx = queue.idx(ticket) - MpmcQueue::<u8>::SLOT_PADDING;
                assert!(!seen[idx], "ticket collision at capacity {}", capacity);
                seen[idx] = true;
            }
            assert!(seen.iter().all(|&s| s));
        }
    }

    #[test]
    fn test_slot_padding_covers_cache_line() {
        assert!(MpmcQueue::<u8>::SLOT_PADDING * core::mem::size_of::<Slot<u8>>() >= CACHE_LINE_SIZE);
        assert!(
            MpmcQueue::<[u8; 4096]>::SLOT_PADDING >= 1,
            "at least one padding slot regardless of payload size"
        );
    }

    #[test]
    fn test_turn_mapping() {
        let queue: MpmcQueue<u8> = MpmcQueue::new(4);
        assert_eq!(queue.turn(0), 0);
        assert_eq!(queue.turn(3), 0);
        assert_eq!(queue.turn(4), 1);
        assert_eq!(queue.turn(11), 2);
    }

    #[test]
    #[should_panic(expected = "capacity must be at least 1")]
    fn test_zero_capacity_panics() {
        let _ = MpmcQueue::<u8>::new(0);
    }
}
