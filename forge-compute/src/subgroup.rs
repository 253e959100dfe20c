//! Subgroup (warp / wavefront / SIMD-group) primitives.
//!
//! A subgroup is the set of lanes that execute in lock-step inside a work
//! group. Its width is a property of the hardware and of the compiled
//! pipeline, so kernels must read it at run time and never assume 32.
//!
//! Ballots are represented as a [`LaneMask`] of two 32-bit words. Widths up to
//! 32 only ever touch the low word; 64-wide subgroups spill into the high word
//! and every mask operation merges the two explicitly.

use std::ops::Range;

/// Widest subgroup the lane mask representation can hold.
pub const MAX_SUBGROUP_WIDTH: u32 = 64;
/// Narrowest subgroup a device may report.
pub const MIN_SUBGROUP_WIDTH: u32 = 4;

/// Whether `width` is a subgroup width the runtime can represent.
pub fn is_valid_width(width: u32) -> bool {
    width.is_power_of_two() && (MIN_SUBGROUP_WIDTH..=MAX_SUBGROUP_WIDTH).contains(&width)
}

/// One bit per lane of a subgroup, up to 64 lanes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct LaneMask {
    words: [u32; 2],
}

/// Mask with the low `n` bits of a 32-bit word set (`n` in 0..=32).
#[inline]
fn low_bits(n: u32) -> u32 {
    if n >= 32 {
        u32::MAX
    } else {
        (1u32 << n) - 1
    }
}

impl LaneMask {
    pub const EMPTY: LaneMask = LaneMask { words: [0, 0] };

    /// Mask with the first `width` lanes set.
    pub fn full(width: u32) -> Self {
        debug_assert!(width <= MAX_SUBGROUP_WIDTH);
        let lo = low_bits(width.min(32));
        let hi = low_bits(width.saturating_sub(32));
        Self { words: [lo, hi] }
    }

    pub fn words(&self) -> [u32; 2] {
        self.words
    }

    #[inline]
    pub fn set(&mut self, lane: u32) {
        debug_assert!(lane < MAX_SUBGROUP_WIDTH);
        self.words[(lane / 32) as usize] |= 1 << (lane % 32);
    }

    #[inline]
    pub fn contains(&self, lane: u32) -> bool {
        lane < MAX_SUBGROUP_WIDTH && self.words[(lane / 32) as usize] & (1 << (lane % 32)) != 0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words == [0, 0]
    }

    /// Number of set lanes.
    #[inline]
    pub fn count(&self) -> u32 {
        self.words[0].count_ones() + self.words[1].count_ones()
    }

    /// Number of set lanes strictly below `lane`.
    #[inline]
    pub fn count_below(&self, lane: u32) -> u32 {
        if lane <= 32 {
            (self.words[0] & low_bits(lane)).count_ones()
        } else {
            self.words[0].count_ones() + (self.words[1] & low_bits(lane - 32)).count_ones()
        }
    }

    /// Lowest set lane, if any.
    #[inline]
    pub fn first(&self) -> Option<u32> {
        if self.words[0] != 0 {
            Some(self.words[0].trailing_zeros())
        } else if self.words[1] != 0 {
            Some(32 + self.words[1].trailing_zeros())
        } else {
            None
        }
    }

    #[inline]
    pub fn and(self, other: LaneMask) -> LaneMask {
        LaneMask {
            words: [self.words[0] & other.words[0], self.words[1] & other.words[1]],
        }
    }

    /// Complement restricted to the first `width` lanes.
    #[inline]
    pub fn not_within(self, width: u32) -> LaneMask {
        let full = LaneMask::full(width);
        LaneMask {
            words: [!self.words[0] & full.words[0], !self.words[1] & full.words[1]],
        }
    }
}

/// A subgroup inside a work group: lanes `first_lane..first_lane + width`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subgroup {
    pub index: u32,
    pub first_lane: u32,
    pub width: u32,
}

impl Subgroup {
    /// Group-relative lane ids of this subgroup.
    pub fn lanes(&self) -> Range<u32> {
        self.first_lane..self.first_lane + self.width
    }

    /// Ballot: bit `i` set when `pred(i)` holds for subgroup lane `i`.
    pub fn ballot(&self, mut pred: impl FnMut(u32) -> bool) -> LaneMask {
        let mut mask = LaneMask::EMPTY;
        for lane in 0..self.width {
            if pred(lane) {
                mask.set(lane);
            }
        }
        mask
    }

    /// In-place exclusive prefix sum across the lanes' values. Returns the total.
    ///
    /// `values` holds one value per subgroup lane; it may be shorter than the
    /// width for a trailing partial subgroup.
    pub fn exclusive_add(&self, values: &mut [u32]) -> u32 {
        debug_assert!(values.len() <= self.width as usize);
        let mut sum = 0u32;
        for v in values.iter_mut() {
            let tmp = *v;
            *v = sum;
            sum = sum.wrapping_add(tmp);
        }
        sum
    }

    /// Sum of the lanes' values.
    pub fn reduce_add(&self, values: &[u32]) -> u32 {
        debug_assert!(values.len() <= self.width as usize);
        values.iter().fold(0u32, |acc, &v| acc.wrapping_add(v))
    }
}

/// Number of subgroups of `width` lanes needed to cover `group_size` lanes.
#[inline]
pub fn subgroup_count(group_size: u32, width: u32) -> u32 {
    group_size.div_ceil(width)
}
