//! Two-level block scan: reduce, spine, add-back.
//!
//! Three dispatches, ordered by the device sync point between them:
//! 1. `scan_reduce`: group `b` sums block `b` into `reduced[b]`;
//! 2. `scan_spine`: a single group exclusive-scans `reduced`;
//! 3. `scan_add_back`: group `b` scans its block with a running carry and
//!    adds `reduced[b]`, writing the offsets table.
//!
//! Blocks start at [`SCAN_BLOCK`] entries and grow so the spine never has
//! more than [`MAX_SPINE_BLOCKS`] entries.

use forge_compute::{Device, DeviceBuffer, DispatchInfo, GroupContext};
use tracing::debug;

use super::{ScanKind, ScanStrategy, MAX_SPINE_BLOCKS, SCAN_BLOCK};
use crate::arena::SortScratch;
use crate::compat::{Gate, KernelSet};
use crate::error::Stage;
use crate::params::ScanParams;

/// Block size keeping the block count within the spine capacity.
pub fn block_size_for(len: usize) -> u32 {
    let base = SCAN_BLOCK as usize;
    let base_blocks = len.div_ceil(base).max(1);
    (base * base_blocks.div_ceil(MAX_SPINE_BLOCKS)) as u32
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TwoLevelScan;

impl ScanStrategy for TwoLevelScan {
    fn kind(&self) -> ScanKind {
        ScanKind::TwoLevel
    }

    fn compute_global_offsets(
        &self,
        device: &Device,
        kernels: &KernelSet,
        scratch: &SortScratch<'_>,
    ) -> Vec<(Stage, DispatchInfo)> {
        let params = ScanParams::new(scratch.table_len(), block_size_for(scratch.table_len()));
        debug!(
            entries = params.element_count,
            block_size = params.block_size,
            blocks = params.block_count,
            "two-level scan"
        );
        let status = scratch.status();
        let counts = scratch.counts();
        let reduced = scratch.reduced();
        let offsets = scratch.offsets();

        let reduce = ReduceKernel {
            gate: kernels.gate(Stage::ScanReduce, status),
            params,
            counts,
            reduced,
        };
        let spine = SpineKernel {
            gate: kernels.gate(Stage::ScanSpine, status),
            params,
            reduced,
        };
        let add_back = AddBackKernel {
            gate: kernels.gate(Stage::ScanAddBack, status),
            params,
            counts,
            reduced,
            offsets,
        };

        vec![
            (
                Stage::ScanReduce,
                kernels.dispatch(device, Stage::ScanReduce, params.block_count, |ctx| {
                    reduce.run(ctx)
                }),
            ),
            (
                Stage::ScanSpine,
                kernels.dispatch(device, Stage::ScanSpine, 1, |ctx| spine.run(ctx)),
            ),
            (
                Stage::ScanAddBack,
                kernels.dispatch(device, Stage::ScanAddBack, params.block_count, |ctx| {
                    add_back.run(ctx)
                }),
            ),
        ]
    }
}

/// Sum of `src[range]`, lanes striding through the block.
pub(crate) fn block_sum(ctx: &GroupContext, src: &DeviceBuffer, range: std::ops::Range<usize>) -> u32 {
    let group = ctx.group_size() as usize;
    let mut sums = vec![0u32; group];
    for (i, index) in range.enumerate() {
        sums[i % group] += src.load(index);
    }
    ctx.reduce_add(&sums)
}

/// Exclusive scan of `src[range]` into `dst[range]`, starting from `carry`.
///
/// The block is walked one group-wide chunk at a time, the chunk total
/// carried into the next chunk. The scan spine lives at the start of shared
/// memory.
pub(crate) fn block_scan_into(
    ctx: &mut GroupContext,
    src: &DeviceBuffer,
    dst: &DeviceBuffer,
    range: std::ops::Range<usize>,
    mut carry: u32,
) {
    let group = ctx.group_size() as usize;
    let mut values = vec![0u32; group];
    let mut chunk = range.start;
    while chunk < range.end {
        let live = (range.end - chunk).min(group);
        for (lane, value) in values.iter_mut().enumerate() {
            *value = if lane < live { src.load(chunk + lane) } else { 0 };
        }
        let total = ctx.exclusive_scan(&mut values, 0);
        for (lane, &value) in values.iter().enumerate().take(live) {
            dst.store(chunk + lane, carry + value);
        }
        carry += total;
        chunk += group;
    }
}

struct ReduceKernel<'a> {
    gate: Gate<'a>,
    params: ScanParams,
    counts: &'a DeviceBuffer,
    reduced: &'a DeviceBuffer,
}

impl ReduceKernel<'_> {
    fn run(&self, ctx: &mut GroupContext) {
        if self.gate.admit(ctx).is_none() {
            return;
        }
        let block = ctx.group_id();
        let total = block_sum(ctx, self.counts, self.params.block_range(block));
        self.reduced.store(block as usize, total);
    }
}

struct SpineKernel<'a> {
    gate: Gate<'a>,
    params: ScanParams,
    reduced: &'a DeviceBuffer,
}

impl SpineKernel<'_> {
    fn run(&self, ctx: &mut GroupContext) {
        if self.gate.admit(ctx).is_none() {
            return;
        }
        let group = ctx.group_size() as usize;
        let blocks = self.params.block_count as usize;
        let per_lane = blocks.div_ceil(group).max(1);
        let owned = |lane: usize| (lane * per_lane).min(blocks)..((lane + 1) * per_lane).min(blocks);

        let mut sums: Vec<u32> = (0..group)
            .map(|lane| owned(lane).map(|i| self.reduced.load(i)).sum())
            .collect();
        ctx.exclusive_scan(&mut sums, 0);
        // barrier
        for (lane, &base) in sums.iter().enumerate() {
            let mut running = base;
            for i in owned(lane) {
                let value = self.reduced.load(i);
                self.reduced.store(i, running);
                running += value;
            }
        }
    }
}

struct AddBackKernel<'a> {
    gate: Gate<'a>,
    params: ScanParams,
    counts: &'a DeviceBuffer,
    reduced: &'a DeviceBuffer,
    offsets: &'a DeviceBuffer,
}

impl AddBackKernel<'_> {
    fn run(&self, ctx: &mut GroupContext) {
        if self.gate.admit(ctx).is_none() {
            return;
        }
        let block = ctx.group_id();
        let carry = self.reduced.load(block as usize);
        block_scan_into(
            ctx,
            self.counts,
            self.offsets,
            self.params.block_range(block),
            carry,
        );
    }
}
