//! Single-pass scan with decoupled lookback.
//!
//! Each partition owns one row of status cells (one cell per column, a
//! column being a digit in the fused OneSweep kernel or the whole block in
//! [`LookbackScan`]). A cell packs a 2-bit flag with a 30-bit count:
//!
//! ```text
//!  31 30 29                                   0
//! [flag ][              count                  ]
//! ```
//!
//! Row 0 is a seed row preset to `INCLUSIVE(0)`; partition `p` publishes
//! row `p + 1`. A partition publishes its local aggregate as `AGGREGATE`,
//! walks backwards over its predecessors' cells accumulating their values
//! until it meets an `INCLUSIVE` cell, then publishes its own inclusive
//! prefix. Cell writes go through [`publish`], which only ever advances the
//! flag, so `NOT_READY -> AGGREGATE -> INCLUSIVE` is the only possible order.
//!
//! # Forward progress
//!
//! Waiting on a `NOT_READY` predecessor is only safe if that predecessor is
//! guaranteed to run. Two mechanisms make this hold on any scheduler:
//! partitions are handed out by an atomic ticket taken when a group starts,
//! so a group only ever waits on groups that have already started; and the
//! polling loop is bounded by [`SpinPolicy::spin_limit`], after which the
//! waiting group recomputes the predecessor's aggregate from the source
//! data (read-only for the duration of the pass) and continues without it.
//! The fast path still assumes the hardware keeps started groups resident
//! and scheduled; fallback counts are reported so platforms where that
//! fails show up in diagnostics instead of hanging.

use std::hint::spin_loop;
use std::thread;

use forge_compute::{Device, DeviceBuffer, DispatchInfo, GroupContext};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::two_level::{block_scan_into, block_sum};
use super::{lookback_blocks, ScanKind, ScanStrategy, SCAN_BLOCK};
use crate::arena::SortScratch;
use crate::compat::{Gate, KernelSet};
use crate::error::Stage;
use crate::params::ScanParams;

pub const FLAG_SHIFT: u32 = 30;
/// Largest count a cell can hold.
pub const VALUE_MASK: u32 = (1 << FLAG_SHIFT) - 1;

/// Publication state of a status cell.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CellFlag {
    NotReady = 0,
    Aggregate = 1,
    Inclusive = 2,
}

#[inline]
pub const fn pack(flag: CellFlag, value: u32) -> u32 {
    ((flag as u32) << FLAG_SHIFT) | (value & VALUE_MASK)
}

#[inline]
pub const fn unpack(cell: u32) -> (CellFlag, u32) {
    let flag = match cell >> FLAG_SHIFT {
        1 => CellFlag::Aggregate,
        2 => CellFlag::Inclusive,
        _ => CellFlag::NotReady,
    };
    (flag, cell & VALUE_MASK)
}

/// Storage for lookback status cells.
pub trait StatusCells {
    /// Acquire load of cell `index`.
    fn load_cell(&self, index: usize) -> u32;

    /// Acquire/release compare-and-swap of cell `index`.
    fn compare_exchange_cell(&self, index: usize, current: u32, new: u32) -> Result<u32, u32>;
}

impl StatusCells for DeviceBuffer {
    #[inline]
    fn load_cell(&self, index: usize) -> u32 {
        self.load_acquire(index)
    }

    #[inline]
    fn compare_exchange_cell(&self, index: usize, current: u32, new: u32) -> Result<u32, u32> {
        self.compare_exchange(index, current, new)
    }
}

/// Publish `(flag, value)` into cell `index` unless the cell already has
/// an equal or later flag. Returns whether this call wrote the cell.
pub fn publish<C: StatusCells + ?Sized>(cells: &C, index: usize, flag: CellFlag, value: u32) -> bool {
    let desired = pack(flag, value);
    let mut current = cells.load_cell(index);
    loop {
        if unpack(current).0 >= flag {
            return false;
        }
        match cells.compare_exchange_cell(index, current, desired) {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
}

/// Outcome of inspecting one predecessor cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkStep {
    /// Absorbed an aggregate; the next predecessor is up.
    Continue,
    /// The predecessor has published nothing yet.
    Stalled,
    /// Met an inclusive prefix; carries the exclusive prefix of the walker.
    Resolved(u32),
}

/// Backward walk of one partition over one column, resumable one cell at a time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LookbackWalker {
    partition: u32,
    column: usize,
    columns: usize,
    /// Row of the cell inspected next.
    row: usize,
    exclusive: u32,
}

impl LookbackWalker {
    pub fn new(partition: u32, column: usize, columns: usize) -> Self {
        Self {
            partition,
            column,
            columns,
            row: partition as usize,
            exclusive: 0,
        }
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Row of the cell inspected next. Always below the walker's own row.
    pub fn row(&self) -> usize {
        self.row
    }

    pub fn cell_index(&self) -> usize {
        self.row * self.columns + self.column
    }

    /// Partition owning the cell inspected next; `None` at the seed row.
    pub fn pending_partition(&self) -> Option<u32> {
        self.row.checked_sub(1).map(|p| p as u32)
    }

    /// Sum absorbed so far.
    pub fn exclusive(&self) -> u32 {
        self.exclusive
    }

    pub fn step<C: StatusCells + ?Sized>(&mut self, cells: &C) -> WalkStep {
        match unpack(cells.load_cell(self.cell_index())) {
            (CellFlag::Inclusive, value) => WalkStep::Resolved(self.exclusive + value),
            (CellFlag::Aggregate, value) => {
                self.absorb(value);
                WalkStep::Continue
            }
            (CellFlag::NotReady, _) => WalkStep::Stalled,
        }
    }

    /// Take `aggregate` as the pending predecessor's contribution and move past it.
    pub fn absorb(&mut self, aggregate: u32) {
        debug_assert!(self.row > 0, "absorbed past the seed row");
        self.exclusive += aggregate;
        self.row -= 1;
    }
}

/// Bounded polling policy for lookback waits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpinPolicy {
    /// Consecutive stalls on one cell before recomputing the predecessor.
    pub spin_limit: u32,
    /// Yield the worker every this many stalls (0 never yields).
    pub yield_every: u32,
    /// Publish recomputed aggregates so other waiters can use them.
    pub publish_fallback: bool,
}

impl Default for SpinPolicy {
    fn default() -> Self {
        Self {
            spin_limit: 1 << 14,
            yield_every: 64,
            publish_fallback: true,
        }
    }
}

/// What a stalled walker should do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StallAction {
    Spin,
    Yield,
    Fallback,
}

/// Stall counter for one cell at a time.
#[derive(Clone, Debug)]
pub struct Poller {
    policy: SpinPolicy,
    stalls: u32,
}

impl Poller {
    pub fn new(policy: SpinPolicy) -> Self {
        Self { policy, stalls: 0 }
    }

    pub fn on_stall(&mut self) -> StallAction {
        self.stalls += 1;
        if self.stalls > self.policy.spin_limit {
            self.stalls = 0;
            StallAction::Fallback
        } else if self.policy.yield_every > 0 && self.stalls % self.policy.yield_every == 0 {
            StallAction::Yield
        } else {
            StallAction::Spin
        }
    }

    pub fn on_progress(&mut self) {
        self.stalls = 0;
    }
}

/// Per-group lookback counters, flushed into the stats buffer once.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LookbackStats {
    pub fallbacks: u32,
    pub stalls: u32,
}

impl LookbackStats {
    pub fn flush(&self, stats: &DeviceBuffer) {
        if self.fallbacks > 0 {
            stats.fetch_add(0, self.fallbacks);
        }
        if self.stalls > 0 {
            stats.fetch_add(1, self.stalls);
        }
    }
}

/// Drive `walker` to its exclusive prefix.
///
/// `recompute(q)` must return partition `q`'s aggregate for the walker's column.
pub fn resolve_exclusive<C: StatusCells + ?Sized>(
    cells: &C,
    walker: &mut LookbackWalker,
    policy: SpinPolicy,
    stats: &mut LookbackStats,
    mut recompute: impl FnMut(u32) -> u32,
) -> u32 {
    let mut poller = Poller::new(policy);
    loop {
        match walker.step(cells) {
            WalkStep::Resolved(exclusive) => return exclusive,
            WalkStep::Continue => poller.on_progress(),
            WalkStep::Stalled => {
                stats.stalls += 1;
                match poller.on_stall() {
                    StallAction::Spin => spin_loop(),
                    StallAction::Yield => thread::yield_now(),
                    StallAction::Fallback => {
                        let Some(pred) = walker.pending_partition() else {
                            return walker.exclusive();
                        };
                        let aggregate = recompute(pred);
                        if policy.publish_fallback {
                            publish(cells, walker.cell_index(), CellFlag::Aggregate, aggregate);
                        }
                        walker.absorb(aggregate);
                        stats.fallbacks += 1;
                    }
                }
            }
        }
    }
}

/// Reset `rows x columns` cells for a new pass: row 0 seeded `INCLUSIVE(0)`,
/// every other cell `NOT_READY`. Also rewinds the partition ticket.
pub(crate) struct ResetKernel<'a> {
    pub gate: Gate<'a>,
    pub cells: &'a DeviceBuffer,
    pub columns: usize,
    pub len: usize,
    pub ticket: &'a DeviceBuffer,
}

impl ResetKernel<'_> {
    pub fn run(&self, ctx: &mut GroupContext) {
        if self.gate.admit(ctx).is_none() {
            return;
        }
        let group = ctx.group_size() as usize;
        let base = ctx.group_id() as usize * group;
        for lane in ctx.lanes() {
            let index = base + lane as usize;
            if index < self.len {
                let seed = if index < self.columns {
                    pack(CellFlag::Inclusive, 0)
                } else {
                    pack(CellFlag::NotReady, 0)
                };
                self.cells.store(index, seed);
            }
            if index == 0 {
                self.ticket.store(0, 0);
            }
        }
    }
}

/// Dispatch the reset kernel over `rows x columns` cells.
pub(crate) fn reset_lookback(
    device: &Device,
    kernels: &KernelSet,
    scratch: &SortScratch<'_>,
    rows: usize,
    columns: usize,
) -> (Stage, DispatchInfo) {
    let len = rows * columns;
    let kernel = ResetKernel {
        gate: kernels.gate(Stage::Reset, scratch.status()),
        cells: scratch.cells(),
        columns,
        len,
        ticket: scratch.ticket(),
    };
    let groups = len.div_ceil(kernels.layout().group_size as usize).max(1) as u32;
    (
        Stage::Reset,
        kernels.dispatch(device, Stage::Reset, groups, |ctx| kernel.run(ctx)),
    )
}

/// Decoupled-lookback scan over the flat histogram table, one column per row.
#[derive(Clone, Copy, Debug, Default)]
pub struct LookbackScan {
    policy: SpinPolicy,
}

impl LookbackScan {
    pub fn new(policy: SpinPolicy) -> Self {
        Self { policy }
    }
}

impl ScanStrategy for LookbackScan {
    fn kind(&self) -> ScanKind {
        ScanKind::Lookback
    }

    fn compute_global_offsets(
        &self,
        device: &Device,
        kernels: &KernelSet,
        scratch: &SortScratch<'_>,
    ) -> Vec<(Stage, DispatchInfo)> {
        let params = ScanParams::new(scratch.table_len(), SCAN_BLOCK);
        let blocks = lookback_blocks(scratch.table_len());
        debug!(entries = params.element_count, blocks, "lookback scan");

        let reset = reset_lookback(device, kernels, scratch, blocks + 1, 1);
        let kernel = LookbackScanKernel {
            gate: kernels.gate(Stage::LookbackScan, scratch.status()),
            params,
            policy: self.policy,
            counts: scratch.counts(),
            offsets: scratch.offsets(),
            cells: scratch.cells(),
            ticket: scratch.ticket(),
            stats: scratch.stats(),
        };
        let scan = kernels.dispatch(device, Stage::LookbackScan, params.block_count, |ctx| {
            kernel.run(ctx)
        });
        let (fallbacks, _) = scratch.lookback_stats();
        if fallbacks > 0 {
            warn!(fallbacks, "lookback scan fell back to recomputing predecessors");
        }
        vec![reset, (Stage::LookbackScan, scan)]
    }
}

struct LookbackScanKernel<'a> {
    gate: Gate<'a>,
    params: ScanParams,
    policy: SpinPolicy,
    counts: &'a DeviceBuffer,
    offsets: &'a DeviceBuffer,
    cells: &'a DeviceBuffer,
    ticket: &'a DeviceBuffer,
    stats: &'a DeviceBuffer,
}

impl LookbackScanKernel<'_> {
    fn run(&self, ctx: &mut GroupContext) {
        if self.gate.admit(ctx).is_none() {
            return;
        }
        let block = self.ticket.fetch_add(0, 1);
        if block >= self.params.block_count {
            return;
        }
        let aggregate = block_sum(ctx, self.counts, self.params.block_range(block));
        publish(self.cells, block as usize + 1, CellFlag::Aggregate, aggregate);

        let mut stats = LookbackStats::default();
        let mut walker = LookbackWalker::new(block, 0, 1);
        let exclusive = resolve_exclusive(self.cells, &mut walker, self.policy, &mut stats, |pred| {
            block_sum(ctx, self.counts, self.params.block_range(pred))
        });
        publish(
            self.cells,
            block as usize + 1,
            CellFlag::Inclusive,
            exclusive + aggregate,
        );
        stats.flush(self.stats);

        block_scan_into(
            ctx,
            self.counts,
            self.offsets,
            self.params.block_range(block),
            exclusive,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        assert_eq!(unpack(pack(CellFlag::Aggregate, 17)), (CellFlag::Aggregate, 17));
        assert_eq!(
            unpack(pack(CellFlag::Inclusive, VALUE_MASK)),
            (CellFlag::Inclusive, VALUE_MASK)
        );
        assert_eq!(unpack(0), (CellFlag::NotReady, 0));
        assert_eq!(pack(CellFlag::Inclusive, 0), 2 << 30);
    }

    #[test]
    fn test_publish_only_advances() {
        let cells = DeviceBuffer::new("cells", 1);
        assert!(publish(&cells, 0, CellFlag::Aggregate, 5));
        assert!(!publish(&cells, 0, CellFlag::Aggregate, 9));
        assert_eq!(unpack(cells.load(0)), (CellFlag::Aggregate, 5));
        assert!(publish(&cells, 0, CellFlag::Inclusive, 12));
        assert!(!publish(&cells, 0, CellFlag::Aggregate, 5));
        assert_eq!(unpack(cells.load(0)), (CellFlag::Inclusive, 12));
    }

    #[test]
    fn test_walker_accumulates_until_inclusive() {
        // rows: seed, p0 inclusive 3, p1 aggregate 4, p2 aggregate 5
        let cells = DeviceBuffer::with_data(
            "cells",
            &[
                pack(CellFlag::Inclusive, 0),
                pack(CellFlag::Inclusive, 3),
                pack(CellFlag::Aggregate, 4),
                pack(CellFlag::Aggregate, 5),
            ],
        );
        let mut walker = LookbackWalker::new(3, 0, 1);
        assert_eq!(walker.step(&cells), WalkStep::Continue);
        assert_eq!(walker.step(&cells), WalkStep::Continue);
        assert_eq!(walker.pending_partition(), Some(0));
        assert_eq!(walker.step(&cells), WalkStep::Resolved(12));
    }

    #[test]
    fn test_walker_stalls_on_not_ready() {
        let cells = DeviceBuffer::with_data("cells", &[pack(CellFlag::Inclusive, 0), 0]);
        let mut walker = LookbackWalker::new(1, 0, 1);
        assert_eq!(walker.step(&cells), WalkStep::Stalled);
        assert_eq!(walker.exclusive(), 0);
        walker.absorb(7);
        assert_eq!(walker.step(&cells), WalkStep::Resolved(7));
    }

    #[test]
    fn test_poller_policy() {
        let mut poller = Poller::new(SpinPolicy {
            spin_limit: 4,
            yield_every: 2,
            publish_fallback: false,
        });
        let actions: Vec<_> = (0..5).map(|_| poller.on_stall()).collect();
        assert_eq!(
            actions,
            vec![
                StallAction::Spin,
                StallAction::Yield,
                StallAction::Spin,
                StallAction::Yield,
                StallAction::Fallback
            ]
        );
        poller.on_progress();
        assert_eq!(poller.on_stall(), StallAction::Spin);
    }

    #[test]
    fn test_resolve_with_fallback_publishes() {
        // p1 never publishes; p2 must recompute it.
        let cells = DeviceBuffer::with_data(
            "cells",
            &[pack(CellFlag::Inclusive, 0), pack(CellFlag::Inclusive, 10), 0],
        );
        let policy = SpinPolicy {
            spin_limit: 0,
            yield_every: 0,
            publish_fallback: true,
        };
        let mut stats = LookbackStats::default();
        let mut walker = LookbackWalker::new(2, 0, 1);
        let exclusive = resolve_exclusive(&cells, &mut walker, policy, &mut stats, |pred| {
            assert_eq!(pred, 1);
            6
        });
        assert_eq!(exclusive, 16);
        assert_eq!(stats, LookbackStats { fallbacks: 1, stalls: 1 });
        assert_eq!(unpack(cells.load(2)), (CellFlag::Aggregate, 6));
    }
}
