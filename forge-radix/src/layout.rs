//! Partition geometry and per-kernel shared-memory requirements.

use forge_compute::subgroup_count;
use serde::{Deserialize, Serialize};

use crate::digit::DigitWidth;
use crate::error::Stage;

/// Lanes per group for every sort kernel.
pub const GROUP_SIZE: u32 = 256;

/// How a design cuts the input into partitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortLayout {
    pub digit: DigitWidth,
    /// Keys each lane handles per partition.
    pub rows_per_lane: u32,
    pub group_size: u32,
}

impl SortLayout {
    pub const fn new(digit: DigitWidth, rows_per_lane: u32) -> Self {
        Self {
            digit,
            rows_per_lane,
            group_size: GROUP_SIZE,
        }
    }

    /// Keys per partition.
    #[inline]
    pub const fn partition_size(&self) -> u32 {
        self.rows_per_lane * self.group_size
    }

    #[inline]
    pub const fn radix(&self) -> u32 {
        self.digit.radix()
    }

    #[inline]
    pub const fn passes(&self) -> u32 {
        self.digit.passes()
    }

    /// Partitions covering `n` keys.
    pub fn partitions(&self, n: usize) -> u32 {
        n.div_ceil(self.partition_size() as usize) as u32
    }

    /// Entries of the digit-major histogram table for `n` keys.
    pub fn table_len(&self, n: usize) -> usize {
        self.radix() as usize * self.partitions(n) as usize
    }

    /// Shared words `stage` needs when its subgroups are `width` lanes wide.
    ///
    /// Narrower subgroups mean more per-subgroup slots, so the requirement
    /// only grows as the width shrinks.
    pub fn required_words(&self, stage: Stage, width: u32) -> usize {
        let subgroups = subgroup_count(self.group_size, width) as usize;
        let radix = self.radix() as usize;
        let partition = self.partition_size() as usize;
        match stage {
            Stage::Histogram => subgroups * radix,
            Stage::ScanReduce | Stage::ScanSpine | Stage::ScanAddBack | Stage::LookbackScan => {
                subgroups
            }
            Stage::Scatter => 2 * partition + radix + subgroups,
            Stage::GlobalHistogram => self.passes() as usize * radix,
            Stage::DigitBase => radix + subgroups,
            Stage::OneSweep => subgroups * radix + 2 * radix,
            Stage::Reset => 0,
        }
    }
}
