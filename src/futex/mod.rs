//! Address-keyed wait/wake primitive with 32-bit channel masks.
//!
//! This is a thin wrapper over the kernel futex facility: given a 32-bit
//! atomic word, a caller parks iff the word still holds an expected value,
//! and is woken by wakes whose mask intersects its own. The mask turns one
//! futex word into 32 logical wakeup channels, which the turn sequencer
//! uses to avoid waking threads whose turn has not come.
//!
//! On Linux this maps directly to `FUTEX_WAIT_BITSET` / `FUTEX_WAKE_BITSET`
//! with `FUTEX_PRIVATE_FLAG`. Elsewhere the same semantics are emulated
//! with a table of address-hashed condvar buckets; emulated waiters may see
//! extra spurious wakeups, which callers must already tolerate.

use std::sync::atomic::AtomicU32;
use std::time::{Instant, SystemTime};

/// Outcome of a [`futex_wait`] / [`futex_wait_until`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutexResult {
    /// The word did not hold the expected value at the kernel check.
    ValueChanged,
    /// Woken by a matching wake, or a spurious wakeup.
    Awoken,
    /// Woken by an interrupting signal.
    Interrupted,
    /// The deadline expired.
    TimedOut,
}

/// An absolute deadline in either the steady or the system timebase.
///
/// The kernel wait runs against a single clock, so the deadline is
/// converted on entry: system-clock deadlines use the realtime clock
/// directly, steady deadlines become absolute monotonic times by taking
/// the delta through `now()` of each clock.
#[derive(Debug, Clone, Copy)]
pub enum Deadline {
    /// A monotonic-clock time point; immune to wall-clock adjustments.
    Steady(Instant),
    /// A wall-clock time point.
    System(SystemTime),
}

impl From<Instant> for Deadline {
    fn from(when: Instant) -> Self {
        Deadline::Steady(when)
    }
}

impl From<SystemTime> for Deadline {
    fn from(when: SystemTime) -> Self {
        Deadline::System(when)
    }
}

/// Park until woken, with no deadline.
///
/// Blocks the calling thread while `*futex == expected`, until a
/// [`futex_wake`] on the same address with an intersecting mask arrives.
/// Returns [`FutexResult::ValueChanged`] without blocking if the word has
/// already moved on.
pub fn futex_wait(futex: &AtomicU32, expected: u32, wait_mask: u32) -> FutexResult {
    let rv = platform::wait(futex, expected, None, wait_mask);
    debug_assert!(rv != FutexResult::TimedOut);
    rv
}

/// Park until woken or the absolute deadline expires.
pub fn futex_wait_until(
    futex: &AtomicU32,
    expected: u32,
    deadline: Deadline,
    wait_mask: u32,
) -> FutexResult {
    platform::wait(futex, expected, Some(deadline), wait_mask)
}

/// Wake up to `count` waiters parked on `futex` whose wait mask intersects
/// `wake_mask`. Returns the number of waiters woken.
///
/// Errors are swallowed: a wake may be guarding the futex's own
/// destruction, so failure must not propagate.
pub fn futex_wake(futex: &AtomicU32, count: i32, wake_mask: u32) -> usize {
    platform::wake(futex, count, wake_mask)
}

#[cfg(target_os = "linux")]
mod platform {
    use super::{Deadline, FutexResult};
    use std::ptr;
    use std::sync::atomic::AtomicU32;
    use std::time::{Duration, Instant, UNIX_EPOCH};

    fn timespec_add(base: libc::timespec, delta: Duration) -> libc::timespec {
        let mut sec = base.tv_sec.saturating_add(delta.as_secs() as libc::time_t);
        let mut nsec = base.tv_nsec + delta.subsec_nanos() as libc::c_long;
        if nsec >= 1_000_000_000 {
            sec = sec.saturating_add(1);
            nsec -= 1_000_000_000;
        }
        libc::timespec {
            tv_sec: sec,
            tv_nsec: nsec,
        }
    }

    pub(super) fn wait(
        futex: &AtomicU32,
        expected: u32,
        deadline: Option<Deadline>,
        wait_mask: u32,
    ) -> FutexResult {
        let mut op = libc::FUTEX_WAIT_BITSET | libc::FUTEX_PRIVATE_FLAG;
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let mut timeout: *const libc::timespec = ptr::null();

        match deadline {
            None => {}
            Some(Deadline::System(when)) => {
                // FUTEX_WAIT_BITSET takes an absolute timeout; against the
                // realtime clock when FUTEX_CLOCK_REALTIME is set.
                op |= libc::FUTEX_CLOCK_REALTIME;
                let epoch = when
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::ZERO);
                ts = timespec_add(
                    libc::timespec {
                        tv_sec: 0,
                        tv_nsec: 0,
                    },
                    epoch,
                );
                timeout = &ts;
            }
            Some(Deadline::Steady(when)) => {
                // Instant has no observable epoch, so rebuild the deadline
                // as an absolute CLOCK_MONOTONIC time via the delta from now.
                let delta = when.saturating_duration_since(Instant::now());
                let mut now = libc::timespec {
                    tv_sec: 0,
                    tv_nsec: 0,
                };
                unsafe {
                    libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now);
                }
                ts = timespec_add(now, delta);
                timeout = &ts;
            }
        }

        let rv = unsafe {
            libc::syscall(
                libc::SYS_futex,
                futex.as_ptr(),
                op,
                expected,
                timeout,
                ptr::null::<u32>(),
                wait_mask,
            )
        };

        if rv == 0 {
            return FutexResult::Awoken;
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::ETIMEDOUT) => {
                debug_assert!(!timeout.is_null());
                FutexResult::TimedOut
            }
            Some(libc::EINTR) => FutexResult::Interrupted,
            Some(libc::EWOULDBLOCK) => FutexResult::ValueChanged,
            // EINVAL, EACCES, or EFAULT. Report ValueChanged so the caller
            // re-reads the word and re-decides instead of aborting; at worst
            // the caller degrades into a spin loop.
            _ => FutexResult::ValueChanged,
        }
    }

    pub(super) fn wake(futex: &AtomicU32, count: i32, wake_mask: u32) -> usize {
        let rv = unsafe {
            libc::syscall(
                libc::SYS_futex,
                futex.as_ptr(),
                libc::FUTEX_WAKE_BITSET | libc::FUTEX_PRIVATE_FLAG,
                count,
                ptr::null::<libc::timespec>(),
                ptr::null::<u32>(),
                wake_mask,
            )
        };
        if rv < 0 {
            // A failed wake may be racing the waiter's teardown; the waiter
            // is gone either way.
            return 0;
        }
        rv as usize
    }
}

#[cfg(not(target_os = "linux"))]
mod platform {
    use super::{Deadline, FutexResult};
    use parking_lot::{Condvar, Mutex};
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::time::{Instant, SystemTime};

    struct Waiter {
        id: u64,
        addr: usize,
        mask: u32,
        woken: bool,
    }

    struct Bucket {
        waiters: Mutex<Vec<Waiter>>,
        condvar: Condvar,
    }

    const BUCKET_COUNT: usize = 64;
    const BUCKET_INIT: Bucket = Bucket {
        waiters: Mutex::new(Vec::new()),
        condvar: Condvar::new(),
    };
    static BUCKETS: [Bucket; BUCKET_COUNT] = [BUCKET_INIT; BUCKET_COUNT];
    static NEXT_ID: AtomicU64 = AtomicU64::new(0);

    fn bucket_for(addr: usize) -> &'static Bucket {
        // The word is 4-byte aligned; drop the dead bits before hashing.
        &BUCKETS[(addr >> 2) % BUCKET_COUNT]
    }

    fn deadline_as_instant(deadline: Deadline) -> Option<Instant> {
        match deadline {
            Deadline::Steady(when) => Some(when),
            // Condvar timeouts run on the steady clock; convert by delta
            // through now of each clock, clamping past deadlines to now.
            Deadline::System(when) => {
                let now = Instant::now();
                match when.duration_since(SystemTime::now()) {
                    Ok(delta) => now.checked_add(delta),
                    Err(_) => Some(now),
                }
            }
        }
    }

    pub(super) fn wait(
        futex: &AtomicU32,
        expected: u32,
        deadline: Option<Deadline>,
        wait_mask: u32,
    ) -> FutexResult {
        let addr = futex.as_ptr() as usize;
        let bucket = bucket_for(addr);
        let until = deadline.and_then(deadline_as_instant);

        let mut waiters = bucket.waiters.lock();
        // Checked under the bucket lock: wake also holds it, so a wake
        // issued after this check cannot be missed.
        if futex.load(Ordering::Acquire) != expected {
            return FutexResult::ValueChanged;
        }
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        waiters.push(Waiter {
            id,
            addr,
            mask: wait_mask,
            woken: false,
        });

        loop {
            let timed_out = match until {
                None => {
                    bucket.condvar.wait(&mut waiters);
                    false
                }
                Some(when) => bucket.condvar.wait_until(&mut waiters, when).timed_out(),
            };
            let Some(pos) = waiters.iter().position(|w| w.id == id) else {
                // Entry vanished; only a wake removes other threads' state.
                return FutexResult::Awoken;
            };
            if waiters[pos].woken {
                waiters.swap_remove(pos);
                return FutexResult::Awoken;
            }
            if timed_out {
                waiters.swap_remove(pos);
                return FutexResult::TimedOut;
            }
            // Condvar-level spurious wakeup; keep waiting.
        }
    }

    pub(super) fn wake(futex: &AtomicU32, count: i32, wake_mask: u32) -> usize {
        let addr = futex.as_ptr() as usize;
        let bucket = bucket_for(addr);
        let mut waiters = bucket.waiters.lock();
        let mut woken = 0usize;
        for w in waiters.iter_mut() {
            if woken >= count.max(0) as usize {
                break;
            }
            if w.addr == addr && w.mask & wake_mask != 0 && !w.woken {
                w.woken = true;
                woken += 1;
            }
        }
        if woken > 0 {
            bucket.condvar.notify_all();
        }
        woken
    }
}
