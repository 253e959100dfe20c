//! Digit histogram builder.
//!
//! `digit_histogram` runs one group per partition. Every subgroup counts its
//! lanes' keys into a private slice of shared memory (`subgroups x radix`
//! slots, addressed with the runtime width), then the group reduces the
//! subgroup slices into one column of the digit-major table:
//! `counts[digit * partitions + partition]`.
//!
//! `global_histogram` and `digit_base` serve OneSweep, which needs the
//! per-pass digit bases up front: one dispatch counts every pass's digits,
//! one single-group dispatch turns the counts into exclusive bases.

use forge_compute::{Device, DeviceBuffer, DispatchInfo, GroupContext, Subgroup};

use crate::arena::SortScratch;
use crate::compat::{Gate, KernelSet};
use crate::digit::extract_digit;
use crate::error::Stage;
use crate::params::SortParams;

/// Fill the histogram table for pass `params.pass`.
pub fn build_histograms(
    device: &Device,
    kernels: &KernelSet,
    scratch: &SortScratch<'_>,
    params: SortParams,
) -> (Stage, DispatchInfo) {
    let kernel = HistogramKernel {
        gate: kernels.gate(Stage::Histogram, scratch.status()),
        params,
        keys: scratch.src_keys(),
        counts: scratch.counts(),
    };
    (
        Stage::Histogram,
        kernels.dispatch(device, Stage::Histogram, params.partition_count, |ctx| {
            kernel.run(ctx)
        }),
    )
}

/// Count every pass's digits into `scratch.digit_base()`, then scan them into
/// per-pass exclusive digit bases.
pub fn build_digit_bases(
    device: &Device,
    kernels: &KernelSet,
    scratch: &SortScratch<'_>,
    params: SortParams,
) -> Vec<(Stage, DispatchInfo)> {
    let histogram = GlobalHistogramKernel {
        gate: kernels.gate(Stage::GlobalHistogram, scratch.status()),
        params,
        keys: scratch.src_keys(),
        global: scratch.digit_base(),
    };
    let base = DigitBaseKernel {
        gate: kernels.gate(Stage::DigitBase, scratch.status()),
        global: scratch.digit_base(),
    };
    vec![
        (
            Stage::GlobalHistogram,
            kernels.dispatch(
                device,
                Stage::GlobalHistogram,
                params.partition_count,
                |ctx| histogram.run(ctx),
            ),
        ),
        (
            Stage::DigitBase,
            kernels.dispatch(device, Stage::DigitBase, 1, |ctx| base.run(ctx)),
        ),
    ]
}

/// Index of key `row`/`lane` of the partition starting at `start`.
#[inline]
fn strided_index(start: usize, row: usize, group: usize, lane: usize) -> usize {
    start + row * group + lane
}

pub(crate) struct HistogramKernel<'a> {
    pub gate: Gate<'a>,
    pub params: SortParams,
    pub keys: &'a DeviceBuffer,
    pub counts: &'a DeviceBuffer,
}

impl HistogramKernel<'_> {
    pub fn run(&self, ctx: &mut GroupContext) {
        let Some(geo) = self.gate.admit(ctx) else {
            return;
        };
        let layout = self.gate.layout;
        let radix = layout.radix() as usize;
        let mask = layout.digit.mask();
        let n = self.params.key_count as usize;
        let partitions = self.params.partition_count as usize;
        let partition = ctx.group_id() as usize;
        let group = ctx.group_size() as usize;
        let start = partition * layout.partition_size() as usize;
        let slots = geo.subgroups as usize * radix;
        let subgroups: Vec<Subgroup> = ctx.subgroups().collect();

        ctx.shared_mut().fill(0..slots, 0);
        // barrier
        for sg in &subgroups {
            let slot = sg.index as usize * radix;
            for row in 0..layout.rows_per_lane as usize {
                let row_start = strided_index(start, row, group, sg.first_lane as usize);
                let live = sg.ballot(|lane| row_start + (lane as usize) < n);
                if live.is_empty() {
                    break;
                }
                let shared = ctx.shared_mut();
                for lane in 0..sg.width {
                    if live.contains(lane) {
                        let key = self.keys.load(row_start + lane as usize);
                        let digit = extract_digit(key, self.params.shift, mask) as usize;
                        shared.atomic_add(slot + digit, 1);
                    }
                }
            }
        }
        // barrier; lanes stride over digits and sum the subgroup slices
        let shared = ctx.shared();
        for lane in 0..group {
            let mut digit = lane;
            while digit < radix {
                let total: u32 = (0..subgroups.len())
                    .map(|s| shared.get(s * radix + digit))
                    .sum();
                self.counts.store(digit * partitions + partition, total);
                digit += group;
            }
        }
    }
}

pub(crate) struct GlobalHistogramKernel<'a> {
    pub gate: Gate<'a>,
    pub params: SortParams,
    pub keys: &'a DeviceBuffer,
    pub global: &'a DeviceBuffer,
}

impl GlobalHistogramKernel<'_> {
    pub fn run(&self, ctx: &mut GroupContext) {
        if self.gate.admit(ctx).is_none() {
            return;
        }
        let layout = self.gate.layout;
        let digit = layout.digit;
        let radix = layout.radix() as usize;
        let passes = layout.passes() as usize;
        let n = self.params.key_count as usize;
        let group = ctx.group_size() as usize;
        let start = ctx.group_id() as usize * layout.partition_size() as usize;
        let slots = passes * radix;

        let shared = ctx.shared_mut();
        shared.fill(0..slots, 0);
        for row in 0..layout.rows_per_lane as usize {
            for lane in 0..group {
                let index = strided_index(start, row, group, lane);
                if index >= n {
                    continue;
                }
                let key = self.keys.load(index);
                for pass in 0..passes {
                    let d = extract_digit(key, digit.shift(pass as u32), digit.mask()) as usize;
                    shared.atomic_add(pass * radix + d, 1);
                }
            }
        }
        // barrier
        for slot in 0..slots {
            let count = shared.get(slot);
            if count > 0 {
                self.global.fetch_add(slot, count);
            }
        }
    }
}

pub(crate) struct DigitBaseKernel<'a> {
    pub gate: Gate<'a>,
    pub global: &'a DeviceBuffer,
}

impl DigitBaseKernel<'_> {
    pub fn run(&self, ctx: &mut GroupContext) {
        if self.gate.admit(ctx).is_none() {
            return;
        }
        let layout = self.gate.layout;
        let radix = layout.radix() as usize;
        let group = ctx.group_size() as usize;
        debug_assert!(radix <= group);

        // shared: [counts; radix] [spine; subgroups]
        let mut values = vec![0u32; group];
        for pass in 0..layout.passes() as usize {
            let base = pass * radix;
            for d in 0..radix {
                let count = self.global.load(base + d);
                ctx.shared_mut().set(d, count);
            }
            // barrier
            for (lane, value) in values.iter_mut().enumerate() {
                *value = if lane < radix { ctx.shared().get(lane) } else { 0 };
            }
            ctx.exclusive_scan(&mut values, radix);
            for (d, &value) in values.iter().enumerate().take(radix) {
                self.global.store(base + d, value);
            }
        }
    }
}
