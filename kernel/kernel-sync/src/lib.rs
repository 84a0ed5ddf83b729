//! # Kernel synchronization primitives
//!
//! Two spin locks, nothing more:
//!
//! - [`SpinLock`] — a classic TATAS lock around owned data, with an RAII
//!   guard. `try_lock` is first-class: lock-ordering rules elsewhere in the
//!   kernel require non-blocking acquisition of inner locks.
//! - [`BitSpin`] — the same discipline squeezed into **one bit** of a shared
//!   atomic word, for structures whose flag word doubles as their lock
//!   (a page descriptor, typically).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod bit_spin;
mod spin_lock;

pub use bit_spin::BitSpin;
pub use spin_lock::{SpinLock, SpinLockGuard};
