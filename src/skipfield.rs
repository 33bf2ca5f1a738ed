//! Skipfield word trait: the compile-time width dial for the jump-counting
//! skipfield.
//!
//! Every block pairs its element array with a parallel array of unsigned
//! words. A live slot holds `0`; a contiguous run of erased slots of length
//! `L` (a skipblock) holds `L` at both of its endpoints, so traversal can
//! hop an entire run by reading a single word. The word's maximum value
//! doubles as the "none" sentinel for the intrusive free list threaded
//! through erased slots, which is why a block can never hold more than
//! `MAX` slots.
//!
//! `u16` is the default (fewer, larger blocks); `u8` trades block size for
//! lower per-block overhead; `u32` allows very large blocks for huge
//! populations.

/// An unsigned skipfield word.
///
/// Implemented for `u8`, `u16` and `u32`. The maximum value is reserved as
/// the free-list "none" sentinel, so valid slot indices are
/// `0..Self::NONE`.
pub trait SkipWord: Copy + Eq + 'static {
    /// Sentinel value: "no free-list entry" / end of the free list.
    const NONE: Self;

    /// The zero word marking a live slot.
    const ZERO: Self;

    /// Returns `true` if this is the sentinel value.
    #[inline]
    fn is_none(self) -> bool {
        self == Self::NONE
    }

    /// Widens the word to a usize index or run length.
    fn as_usize(self) -> usize;

    /// Narrows a usize known to fit the word.
    fn from_usize(val: usize) -> Self;
}

macro_rules! impl_skip_word_for_unsigned {
    ($($ty:ty),*) => {
        $(
            impl SkipWord for $ty {
                const NONE: Self = <$ty>::MAX;
                const ZERO: Self = 0;

                #[inline]
                fn as_usize(self) -> usize {
                    self as usize
                }

                #[inline]
                fn from_usize(val: usize) -> Self {
                    debug_assert!(val <= <$ty>::MAX as usize);
                    val as Self
                }
            }
        )*
    };
}

impl_skip_word_for_unsigned!(u8, u16, u32);

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! test_skip_word_sentinel {
        ($($ty:ty => $name:ident),*) => {
            $(
                #[test]
                fn $name() {
                    assert!(<$ty>::NONE.is_none());
                    assert!(!(0 as $ty).is_none());
                    assert_eq!(<$ty>::ZERO.as_usize(), 0);
                    assert_eq!(<$ty>::from_usize(<$ty>::MAX as usize - 1).as_usize(),
                        <$ty>::MAX as usize - 1);
                }
            )*
        };
    }

    test_skip_word_sentinel!(
        u8 => u8_sentinel,
        u16 => u16_sentinel,
        u32 => u32_sentinel
    );
}
