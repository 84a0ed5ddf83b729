use core::hint::spin_loop;
use core::sync::atomic::{AtomicU64, Ordering};

/// A spin lock occupying a single bit of a shared atomic word.
///
/// Useful when a structure already carries an atomic flag word and cannot
/// afford a separate lock field. The remaining bits of the word stay usable
/// for ordinary flags: `fetch_or`/`fetch_and` on other bits compose freely
/// with the lock bit.
///
/// The caller picks one `mask` bit per word and must use the same mask for
/// `lock`/`try_lock`/`unlock`. There is no guard here; owners of the word
/// wrap these calls in their own RAII type so the lock bit's meaning stays
/// with the structure that defines it.
pub struct BitSpin;

impl BitSpin {
    /// Spin until the `mask` bit is acquired.
    #[inline]
    pub fn lock(word: &AtomicU64, mask: u64) {
        while word.fetch_or(mask, Ordering::Acquire) & mask != 0 {
            while word.load(Ordering::Relaxed) & mask != 0 {
                spin_loop();
            }
        }
    }

    /// One non-blocking attempt; `true` if the bit was acquired.
    #[inline]
    #[must_use]
    pub fn try_lock(word: &AtomicU64, mask: u64) -> bool {
        word.fetch_or(mask, Ordering::Acquire) & mask == 0
    }

    /// Release the `mask` bit.
    ///
    /// # Safety
    /// The caller must currently hold the bit acquired via
    /// [`lock`](Self::lock) or [`try_lock`](Self::try_lock) with the same
    /// `mask`; releasing a bit someone else holds breaks mutual exclusion.
    #[inline]
    pub unsafe fn unlock(word: &AtomicU64, mask: u64) {
        word.fetch_and(!mask, Ordering::Release);
    }
}
