//! Queue implementations
//!
//! This module provides the bounded MPMC queue built from single-element
//! slots, each guarded by a [`crate::TurnSequencer`].
//!
//! ## Design
//!
//! Two monotonic 64-bit ticket dispensers (push and pop) map each ticket to
//! a `(slot, turn)` pair. The slot's sequencer then serializes producers
//! and consumers per slot: even turns grant enqueue rights, odd turns grant
//! dequeue rights. See [`mpmc`] for the full protocol.

pub mod mpmc;

pub use mpmc::{MpmcQueue, QueueStats};


#[cfg(all(test, not(loom)))]
mod proptests;

#[cfg(all(test, loom))]
mod loom_tests;
