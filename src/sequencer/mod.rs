//! Turn sequencer: serializes access to a resource by monotonically
//! increasing turns.
//!
//! A single 32-bit atomic word encodes `(current_turn << 6) | waiter_delta`.
//! The high 26 bits hold the shifted turn that is allowed to run next; the
//! low 6 bits hold a saturating count of how far ahead the furthest
//! observed waiter is. Because waiters announce themselves in the word,
//! [`TurnSequencer::complete_turn`] can skip the wake syscall entirely when
//! nobody is parked, leaving a single CAS on the hot path.
//!
//! Parked waiters subscribe to one of 32 futex channels selected by
//! `turn % 32`, so completing turn `T` only wakes threads interested in
//! `T + 1` (plus every 32nd turn beyond, which re-register on wakeup).
//!
//! Turn arithmetic is wrapping throughout: turns live in a 26-bit space and
//! "behind" is decided by an unsigned half-range comparison, so the
//! protocol keeps working across wraparound.

use crate::futex::{futex_wait, futex_wait_until, futex_wake, Deadline, FutexResult};
use crate::trace::trace;
use std::sync::atomic::{AtomicU32, Ordering};

/// Outcome of [`TurnSequencer::try_wait_for_turn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryWaitResult {
    /// The turn arrived; the caller now owns the resource until it calls
    /// [`TurnSequencer::complete_turn`].
    Success,
    /// The requested turn already fully elapsed before the caller arrived.
    Past,
    /// The deadline expired before the turn arrived.
    TimedOut,
}

/// Bits stolen from the turn to record the delta between the current turn
/// and the furthest waiter. Waiters more than 63 turns ahead saturate the
/// field; the channel bitmask still wakes them every 32 turns and they
/// re-register with an accurate delta.
const TURN_SHIFT: u32 = 6;
const WAITERS_MASK: u32 = (1 << TURN_SHIFT) - 1;

/// The minimum spin duration that the adaptation will select.
const MIN_SPIN_LIMIT: u32 = 200;

/// The maximum spin duration that the adaptation will select, also used
/// when probing for a new data point.
const MAX_SPIN_LIMIT: u32 = 20_000;

/// Serializes threads by turn number over a single 32-bit atomic.
///
/// Turn `t` may proceed once every turn before it has been completed;
/// completing turn `t` hands the resource to turn `t + 1`.
///
/// ```rust
/// use std::sync::atomic::AtomicU32;
/// use turnstile::TurnSequencer;
///
/// let seq = TurnSequencer::new(0);
/// let spin_cutoff = AtomicU32::new(0);
/// seq.wait_for_turn(0, &spin_cutoff, false);
/// // ... exclusive access for turn 0 ...
/// seq.complete_turn(0);
/// assert!(seq.is_turn(1));
/// ```
#[derive(Debug)]
pub struct TurnSequencer {
    state: AtomicU32,
}

impl TurnSequencer {
    /// Create a sequencer whose next turn to run is `first_turn`.
    pub fn new(first_turn: u32) -> Self {
        Self {
            state: AtomicU32::new(encode(first_turn.wrapping_shl(TURN_SHIFT), 0)),
        }
    }

    /// Returns true iff `turn` is the turn currently allowed to run.
    #[inline]
    pub fn is_turn(&self, turn: u32) -> bool {
        let state = self.state.load(Ordering::Acquire);
        decode_current_sturn(state) == turn.wrapping_shl(TURN_SHIFT)
    }

    /// Block until `turn` arrives.
    ///
    /// `spin_cutoff` is shared adaptive state: the number of spin
    /// iterations to burn before parking. When `update_spin_cutoff` is set
    /// the call probes with the maximum budget and folds the observation
    /// back into the cutoff.
    pub fn wait_for_turn(&self, turn: u32, spin_cutoff: &AtomicU32, update_spin_cutoff: bool) {
        let rv = self.try_wait_for_turn(turn, spin_cutoff, update_spin_cutoff, None);
        debug_assert!(rv == TryWaitResult::Success);
    }

    /// Block until `turn` arrives, the deadline expires, or the turn is
    /// found to have already passed.
    ///
    /// With `deadline == None` this never returns [`TryWaitResult::TimedOut`].
    pub fn try_wait_for_turn(
        &self,
        turn: u32,
        spin_cutoff: &AtomicU32,
        update_spin_cutoff: bool,
        deadline: Option<Deadline>,
    ) -> TryWaitResult {
        let prev_thresh = spin_cutoff.load(Ordering::Relaxed);
        let effective_spin_cutoff = if update_spin_cutoff || prev_thresh == 0 {
            MAX_SPIN_LIMIT
        } else {
            prev_thresh
        };

        let sturn = turn.wrapping_shl(TURN_SHIFT);
        let mut tries: u32 = 0;
        loop {
            let state = self.state.load(Ordering::Acquire);
            let current_sturn = decode_current_sturn(state);
            if current_sturn == sturn {
                break;
            }

            if sturn.wrapping_sub(current_sturn) >= u32::MAX / 2 {
                // turn is in the past
                return TryWaitResult::Past;
            }

            if tries < effective_spin_cutoff {
                tries += 1;
                std::hint::spin_loop();
                continue;
            }

            let current_max_waiter_delta = decode_max_waiters_delta(state);
            let our_waiter_delta = sturn.wrapping_sub(current_sturn) >> TURN_SHIFT;
            let new_state = if our_waiter_delta <= current_max_waiter_delta {
                // Someone ahead of us is already recorded; no update needed.
                state
            } else {
                let encoded = encode(current_sturn, our_waiter_delta);
                if encoded != state
                    && self
                        .state
                        .compare_exchange(state, encoded, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                {
                    // Lost the race against a completion or a further
                    // waiter; re-evaluate from the top.
                    continue;
                }
                encoded
            };

            trace!(turn, state = new_state, "parking until turn arrives");
            match deadline {
                None => {
                    futex_wait(&self.state, new_state, futex_channel(turn));
                }
                Some(when) => {
                    let rv = futex_wait_until(&self.state, new_state, when, futex_channel(turn));
                    if rv == FutexResult::TimedOut {
                        return TryWaitResult::TimedOut;
                    }
                }
            }
        }

        if update_spin_cutoff || prev_thresh == 0 {
            // Hitting the cap means spinning was pointless; otherwise allow
            // twice the observed requirement to absorb variance.
            let target = if tries >= MAX_SPIN_LIMIT {
                MIN_SPIN_LIMIT
            } else {
                (tries.saturating_mul(2)).clamp(MIN_SPIN_LIMIT, MAX_SPIN_LIMIT)
            };
            if prev_thresh == 0 {
                // Bootstrap on first use.
                spin_cutoff.store(target, Ordering::Relaxed);
            } else {
                // Exponential moving average with alpha 1/8; a lost CAS
                // just means another probe got there first.
                let adjusted =
                    (prev_thresh as i64 + (target as i64 - prev_thresh as i64) / 8) as u32;
                let _ = spin_cutoff.compare_exchange(
                    prev_thresh,
                    adjusted,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
            }
        }

        TryWaitResult::Success
    }

    /// Finish `turn` and hand the resource to `turn + 1`, waking its
    /// waiters if any announced themselves.
    pub fn complete_turn(&self, turn: u32) {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            let max_waiter_delta = decode_max_waiters_delta(state);
            let new_state = encode(
                turn.wrapping_add(1).wrapping_shl(TURN_SHIFT),
                max_waiter_delta.saturating_sub(1),
            );
            match self.state.compare_exchange(
                state,
                new_state,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if max_waiter_delta != 0 {
                        futex_wake(
                            &self.state,
                            i32::MAX,
                            futex_channel(turn.wrapping_add(1)),
                        );
                    }
                    break;
                }
                // A waiter updated the delta bits concurrently; retry with
                // the fresh value.
                Err(observed) => state = observed,
            }
        }
    }
}

#[inline]
fn encode(current_sturn: u32, max_waiter_delta: u32) -> u32 {
    current_sturn | max_waiter_delta.min(WAITERS_MASK)
}

#[inline]
fn decode_max_waiters_delta(state: u32) -> u32 {
    state & WAITERS_MASK
}

#[inline]
fn decode_current_sturn(state: u32) -> u32 {
    state & !WAITERS_MASK
}

/// Bitmask to pass to futex wait/wake when communicating about `turn`.
#[inline]
fn futex_channel(turn: u32) -> u32 {
    1u32 << (turn & 31)
}
