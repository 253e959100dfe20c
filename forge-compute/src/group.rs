//! Per-group execution context.
//!
//! Lanes of a group are executed as lock-step phases: every loop over
//! `lanes()` inside a kernel runs to completion for all lanes before the next
//! statement, which is exactly what a full group barrier guarantees on real
//! hardware. Kernels must therefore never carry state from one lane to the
//! next inside a phase except through shared memory or subgroup primitives.

use std::ops::Range;

use crate::subgroup::{subgroup_count, Subgroup};

/// Group-local (threadgroup / workgroup) memory with a hard size bound.
pub struct SharedMemory {
    words: Vec<u32>,
}

impl SharedMemory {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            words: vec![0; len],
        }
    }

    /// Allocated size in words. Kernels must never address past it.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> u32 {
        self.words[index]
    }

    #[inline]
    pub fn set(&mut self, index: usize, value: u32) {
        self.words[index] = value;
    }

    /// Shared-memory atomic add. Returns the previous value.
    #[inline]
    pub fn atomic_add(&mut self, index: usize, value: u32) -> u32 {
        let old = self.words[index];
        self.words[index] = old.wrapping_add(value);
        old
    }

    pub fn fill(&mut self, range: Range<usize>, value: u32) {
        self.words[range].fill(value);
    }

    pub fn slice(&self, range: Range<usize>) -> &[u32] {
        &self.words[range]
    }
}

/// Everything a kernel instance can observe about its own group.
pub struct GroupContext {
    group_id: u32,
    group_count: u32,
    group_size: u32,
    subgroup_width: u32,
    shared: SharedMemory,
}

impl GroupContext {
    pub(crate) fn new(
        group_id: u32,
        group_count: u32,
        group_size: u32,
        subgroup_width: u32,
        shared_words: usize,
    ) -> Self {
        Self {
            group_id,
            group_count,
            group_size,
            subgroup_width,
            shared: SharedMemory::new(shared_words),
        }
    }

    pub fn group_id(&self) -> u32 {
        self.group_id
    }

    pub fn group_count(&self) -> u32 {
        self.group_count
    }

    pub fn group_size(&self) -> u32 {
        self.group_size
    }

    /// Native subgroup width this group is executing with.
    pub fn subgroup_width(&self) -> u32 {
        self.subgroup_width
    }

    pub fn subgroup_count(&self) -> u32 {
        subgroup_count(self.group_size, self.subgroup_width)
    }

    pub fn lanes(&self) -> Range<u32> {
        0..self.group_size
    }

    pub fn shared(&self) -> &SharedMemory {
        &self.shared
    }

    pub fn shared_mut(&mut self) -> &mut SharedMemory {
        &mut self.shared
    }

    /// Subgroups of this group in lane order. The last one may be partial
    /// when the width does not divide the group size.
    pub fn subgroups(&self) -> impl Iterator<Item = Subgroup> + '_ {
        (0..self.subgroup_count()).map(move |index| self.subgroup(index))
    }

    fn subgroup(&self, index: u32) -> Subgroup {
        let first_lane = index * self.subgroup_width;
        Subgroup {
            index,
            first_lane,
            width: self.subgroup_width.min(self.group_size - first_lane),
        }
    }

    /// Group-wide exclusive prefix sum over one value per lane.
    ///
    /// Each subgroup scans its lanes and writes its total into the spine,
    /// `subgroup_count()` shared words starting at `spine_at`. The spine is
    /// scanned in place and every lane adds its subgroup's base back.
    /// Returns the group total.
    ///
    /// # Panics
    ///
    /// If the spine does not fit the group's shared memory, the same way an
    /// out-of-bounds shared access faults a kernel on hardware.
    pub fn exclusive_scan(&mut self, values: &mut [u32], spine_at: usize) -> u32 {
        debug_assert_eq!(values.len(), self.group_size as usize);
        let count = self.subgroup_count();
        let spine = spine_at..spine_at + count as usize;
        assert!(
            spine.end <= self.shared.len(),
            "scan spine {spine:?} exceeds {} shared words",
            self.shared.len()
        );
        for index in 0..count {
            let sg = self.subgroup(index);
            let lanes = sg.first_lane as usize..(sg.first_lane + sg.width) as usize;
            let total = sg.exclusive_add(&mut values[lanes]);
            self.shared.set(spine_at + index as usize, total);
        }
        // barrier; first subgroup scans the spine
        let mut carry = 0u32;
        for slot in spine {
            let total = self.shared.get(slot);
            self.shared.set(slot, carry);
            carry = carry.wrapping_add(total);
        }
        // barrier; every lane adds its subgroup's base
        for index in 0..count {
            let sg = self.subgroup(index);
            let base = self.shared.get(spine_at + index as usize);
            for lane in sg.lanes() {
                let v = &mut values[lane as usize];
                *v = v.wrapping_add(base);
            }
        }
        carry
    }

    /// Group-wide sum over one value per lane.
    pub fn reduce_add(&self, values: &[u32]) -> u32 {
        debug_assert_eq!(values.len(), self.group_size as usize);
        self.subgroups()
            .map(|sg| sg.reduce_add(&values[sg.first_lane as usize..(sg.first_lane + sg.width) as usize]))
            .fold(0u32, |acc, v| acc.wrapping_add(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subgroups_cover_group() {
        let ctx = GroupContext::new(0, 1, 256, 32, 0);
        let sgs: Vec<_> = ctx.subgroups().collect();
        assert_eq!(sgs.len(), 8);
        assert_eq!(sgs[7].first_lane, 224);
        assert_eq!(sgs[7].width, 32);
    }

    #[test]
    fn test_subgroups_wider_than_group() {
        let ctx = GroupContext::new(0, 1, 32, 64, 0);
        let sgs: Vec<_> = ctx.subgroups().collect();
        assert_eq!(sgs.len(), 1);
        assert_eq!(sgs[0].width, 32);
    }

    #[test]
    fn test_exclusive_scan_matches_sequential() {
        for width in [4, 8, 16, 32, 64] {
            let mut ctx = GroupContext::new(0, 1, 256, width, 2 + 256 / width as usize);
            let mut values: Vec<u32> = (0..256).map(|i| (i * 7 + 3) % 11).collect();
            let expected: Vec<u32> = values
                .iter()
                .scan(0u32, |acc, &v| {
                    let out = *acc;
                    *acc += v;
                    Some(out)
                })
                .collect();
            let total: u32 = values.iter().sum();
            assert_eq!(ctx.exclusive_scan(&mut values, 2), total, "width {width}");
            assert_eq!(values, expected, "width {width}");
            assert_eq!(ctx.shared().get(2), 0, "spine starts at zero");
        }
    }

    #[test]
    #[should_panic(expected = "scan spine")]
    fn test_exclusive_scan_spine_must_fit_shared_memory() {
        // 16 subgroups of 16 lanes need 16 spine words; only 8 are allocated.
        let mut ctx = GroupContext::new(0, 1, 256, 16, 8);
        let mut values = vec![1u32; 256];
        ctx.exclusive_scan(&mut values, 0);
    }

    #[test]
    fn test_reduce_add() {
        let ctx = GroupContext::new(0, 1, 128, 16, 0);
        let values = vec![2u32; 128];
        assert_eq!(ctx.reduce_add(&values), 256);
    }

    #[test]
    fn test_shared_memory_ops() {
        let mut ctx = GroupContext::new(3, 4, 64, 8, 8);
        assert_eq!(ctx.group_id(), 3);
        assert_eq!(ctx.group_count(), 4);
        let shared = ctx.shared_mut();
        assert_eq!(shared.len(), 8);
        assert_eq!(shared.atomic_add(2, 5), 0);
        assert_eq!(shared.atomic_add(2, 1), 5);
        shared.fill(4..8, 9);
        assert_eq!(shared.slice(0..8), &[0, 0, 6, 0, 9, 9, 9, 9]);
    }
}
