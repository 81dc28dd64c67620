//! # Turnstile
//!
//! A bounded, lock-free multi-producer multi-consumer queue for fixed-size
//! elements, coordinated by per-slot *turn sequencers* and a futex-style
//! address wait primitive.
//!
//! ## Features
//!
//! - **MPMC Queue**: fixed-capacity ring of single-element slots with
//!   wait-free ticket acquisition and FIFO-by-ticket delivery
//! - **Turn Sequencer**: a compact 32-bit atomic protocol serializing access
//!   to a resource by monotonically increasing turns, reusable on its own
//! - **Futex Wait Primitive**: address-keyed park/wake with 32-bit channel
//!   masks and absolute deadlines, with a portable fallback off Linux
//!
//! ## Quick Start
//!
//! ```rust
//! use turnstile::MpmcQueue;
//!
//! let queue = MpmcQueue::new(128);
//! queue.blocking_write(42);
//! assert_eq!(queue.blocking_read(), 42);
//! ```
//!
//! ## Thread Safety
//!
//! [`MpmcQueue`] is `Send + Sync` for `Send` payloads and may be shared
//! freely across threads (typically via `Arc`). There are no locks anywhere:
//! all coordination happens through atomics and the sequencer protocol, and
//! threads only sleep in the kernel when their slot's turn has genuinely not
//! arrived yet.
//!
//! ## Performance
//!
//! The design is tuned for modern multi-core processors:
//!
//! - Hot counters and every slot live on their own cache line, with padding
//!   slots insulating the ring from neighboring allocations
//! - Consecutive tickets are spread across the ring by a stride coprime with
//!   the capacity, decorrelating ticket order from memory order
//! - Waiters record their presence in the sequencer state so the completion
//!   hot path is a single CAS with no syscall when nobody is parked
//! - An adaptive spin cutoff bounds busy-waiting before threads park

pub mod futex;
pub mod queue;
pub mod sequencer;
pub mod trace;

pub use crate::futex::{Deadline, FutexResult};
pub use crate::queue::{MpmcQueue, QueueStats};
pub use crate::sequencer::{TryWaitResult, TurnSequencer};

/// Common utilities and helper types
pub mod util {
    /// Cache line size used to separate hot atomics.
    ///
    /// This is the *destructive interference* size: 128 bytes except on
    /// arm and s390x where 64 is accurate.
    pub const CACHE_LINE_SIZE: usize =
        if cfg!(any(target_arch = "arm", target_arch = "s390x")) {
            64
        } else {
            128
        };

    /// Pads and aligns a value to the destructive interference size so that
    /// two `CachePadded` values never share a cache line.
    #[cfg_attr(any(target_arch = "arm", target_arch = "s390x"), repr(align(64)))]
    #[cfg_attr(not(any(target_arch = "arm", target_arch = "s390x")), repr(align(128)))]
    #[derive(Debug, Default)]
    pub struct CachePadded<T> {
        value: T,
    }

    impl<T> CachePadded<T> {
        /// Create a new cache-padded value
        #[inline]
        pub const fn new(value: T) -> Self {
            Self { value }
        }

        /// Get the inner value
        #[inline]
        pub fn into_inner(self) -> T {
            self.value
        }
    }

    impl<T> core::ops::Deref for CachePadded<T> {
        type Target = T;

        #[inline]
        fn deref(&self) -> &T {
            &self.value
        }
    }

    impl<T> core::ops::DerefMut for CachePadded<T> {
        #[inline]
        fn deref_mut(&mut self) -> &mut T {
            &mut self.value
        }
    }
}

/// Error returned by non-blocking and deadline write operations.
///
/// The rejected value is handed back in the error so callers of non-`Copy`
/// payload types can retry without cloning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError<T> {
    /// The queue was full at the linearization point.
    Full(T),
    /// The deadline expired before a slot became available.
    Timeout(T),
}

impl<T> WriteError<T> {
    /// Recover the value that could not be enqueued.
    pub fn into_inner(self) -> T {
        match self {
            WriteError::Full(value) | WriteError::Timeout(value) => value,
        }
    }
}

impl<T> core::fmt::Display for WriteError<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            WriteError::Full(_) => write!(f, "queue is full"),
            WriteError::Timeout(_) => write!(f, "write timed out"),
        }
    }
}

impl<T: core::fmt::Debug> std::error::Error for WriteError<T> {}
