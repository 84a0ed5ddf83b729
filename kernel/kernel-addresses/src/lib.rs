//! # Typed memory addresses
//!
//! Tiny `u64` newtypes that carry intent: a [`PhysicalAddress`] names a byte
//! of host RAM, a [`VirtualAddress`] names a byte of some address space.
//! Keeping them as distinct types prevents accidental VA↔PA mix-ups in code
//! that shuttles both around (reverse mapping does, constantly).
//!
//! Page geometry is fixed at 4 KiB; the reverse-map core never deals in huge
//! pages.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod physical_address;
mod virtual_address;

pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// Base-page shift: 4 KiB pages.
pub const PAGE_SHIFT: u32 = 12;

/// Base-page size in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two; no runtime checks are performed.
///
/// ```rust
/// # use kernel_addresses::align_down;
/// assert_eq!(align_down(0, 4096), 0);
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two and `x + (a - 1)` must not overflow.
///
/// ```rust
/// # use kernel_addresses::align_up;
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// assert_eq!(align_up(4097, 4096), 8192);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}
