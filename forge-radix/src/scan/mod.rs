//! Prefix scan engine: global scatter offsets from the digit-major histogram table.
//!
//! The table holds `count[digit * partitions + partition]`, so one flat
//! exclusive scan over it yields, for every (digit, partition) pair, the
//! number of keys with a smaller digit plus the keys of that digit in
//! earlier partitions: exactly the global scatter base. Scans run out of
//! place into the offsets table.

use std::fmt;

use forge_compute::{Device, DispatchInfo};
use serde::{Deserialize, Serialize};

use crate::arena::SortScratch;
use crate::compat::KernelSet;
use crate::error::Stage;
use crate::layout::GROUP_SIZE;

pub mod lookback;
pub mod model;
pub mod two_level;

pub use lookback::{LookbackScan, SpinPolicy};
pub use two_level::TwoLevelScan;

/// Items each lane handles in one scan block.
pub const SCAN_ROWS: u32 = 4;
/// Base scan block: one group, four items per lane.
pub const SCAN_BLOCK: u32 = GROUP_SIZE * SCAN_ROWS;
/// Capacity of the reduced table scanned by the single spine group.
pub const MAX_SPINE_BLOCKS: usize = 1024;

/// Scan blocks the lookback strategy uses for a table of `len` entries.
pub fn lookback_blocks(len: usize) -> usize {
    len.div_ceil(SCAN_BLOCK as usize)
}

/// Which scan strategy a multi-pass engine uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
    /// Reduce, spine scan, add-back: three dispatches.
    #[default]
    TwoLevel,
    /// Single dispatch with decoupled lookback.
    Lookback,
}

impl ScanKind {
    pub fn name(self) -> &'static str {
        match self {
            ScanKind::TwoLevel => "two_level",
            ScanKind::Lookback => "lookback",
        }
    }
}

impl fmt::Display for ScanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A way of turning the histogram table into global exclusive offsets.
///
/// Selected once per engine; reads `scratch.counts()` and writes
/// `scratch.offsets()` over `scratch.table_len()` entries.
pub trait ScanStrategy: fmt::Debug + Send + Sync {
    fn kind(&self) -> ScanKind;

    fn compute_global_offsets(
        &self,
        device: &Device,
        kernels: &KernelSet,
        scratch: &SortScratch<'_>,
    ) -> Vec<(Stage, DispatchInfo)>;
}

/// Build the strategy for `kind`.
pub fn strategy_for(kind: ScanKind, policy: SpinPolicy) -> Box<dyn ScanStrategy> {
    match kind {
        ScanKind::TwoLevel => Box::new(TwoLevelScan),
        ScanKind::Lookback => Box::new(LookbackScan::new(policy)),
    }
}
