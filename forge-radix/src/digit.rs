//! Digit extraction.
//!
//! A digit is a fixed-width slice of a key examined by one LSD pass:
//! `(key >> shift) & mask`. Every kernel recomputes digits from the key it
//! holds; nothing digit-shaped is cached across kernel boundaries.

use serde::{Deserialize, Serialize};

/// Key width in bits. Keys are unsigned 32-bit.
pub const KEY_BITS: u32 = 32;

/// Bits consumed per pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DigitWidth {
    /// 4-bit digits, 16 buckets, 8 passes.
    Four,
    /// 8-bit digits, 256 buckets, 4 passes.
    Eight,
}

impl DigitWidth {
    #[inline]
    pub const fn bits(self) -> u32 {
        match self {
            DigitWidth::Four => 4,
            DigitWidth::Eight => 8,
        }
    }

    /// Number of distinct digit values.
    #[inline]
    pub const fn radix(self) -> u32 {
        1 << self.bits()
    }

    #[inline]
    pub const fn mask(self) -> u32 {
        self.radix() - 1
    }

    /// Passes needed to cover all key bits.
    #[inline]
    pub const fn passes(self) -> u32 {
        KEY_BITS / self.bits()
    }

    /// Shift of pass `pass`, least significant digit first.
    #[inline]
    pub const fn shift(self, pass: u32) -> u32 {
        pass * self.bits()
    }
}

/// `(key >> shift) & mask`.
#[inline]
pub const fn extract_digit(key: u32, shift: u32, mask: u32) -> u32 {
    (key >> shift) & mask
}

/// Digit of `key` for pass `pass` at width `width`.
#[inline]
pub const fn digit_for_pass(key: u32, width: DigitWidth, pass: u32) -> u32 {
    extract_digit(key, width.shift(pass), width.mask())
}
