//! Split scatter for the multi-pass designs.
//!
//! One group per partition. The partition is staged in shared memory, then
//! stably ordered by digit with one split per digit bit: every lane owns
//! `rows_per_lane` consecutive elements, counts its zeros, and a group-wide
//! exclusive scan of those counts places each element. After the splits the
//! element at local position `i` with digit `d` is the `i - start[d]`-th key
//! of that digit in the partition, so its global destination is
//! `offsets[d * partitions + p] + i - start[d]`.

use forge_compute::{Device, DeviceBuffer, DispatchInfo, GroupContext};

use crate::arena::SortScratch;
use crate::compat::{Gate, KernelSet};
use crate::digit::extract_digit;
use crate::error::Stage;
use crate::params::SortParams;

/// Scatter the source ping buffers into the destination buffers for one pass.
pub fn scatter_partitions(
    device: &Device,
    kernels: &KernelSet,
    scratch: &SortScratch<'_>,
    params: SortParams,
) -> (Stage, DispatchInfo) {
    let kernel = SplitScatterKernel {
        gate: kernels.gate(Stage::Scatter, scratch.status()),
        params,
        src_keys: scratch.src_keys(),
        src_payloads: scratch.src_payloads(),
        dst_keys: scratch.dst_keys(),
        dst_payloads: scratch.dst_payloads(),
        offsets: scratch.offsets(),
    };
    (
        Stage::Scatter,
        kernels.dispatch(device, Stage::Scatter, params.partition_count, |ctx| {
            kernel.run(ctx)
        }),
    )
}

struct SplitScatterKernel<'a> {
    gate: Gate<'a>,
    params: SortParams,
    src_keys: &'a DeviceBuffer,
    src_payloads: &'a DeviceBuffer,
    dst_keys: &'a DeviceBuffer,
    dst_payloads: &'a DeviceBuffer,
    offsets: &'a DeviceBuffer,
}

impl SplitScatterKernel<'_> {
    fn run(&self, ctx: &mut GroupContext) {
        if self.gate.admit(ctx).is_none() {
            return;
        }
        let layout = self.gate.layout;
        let radix = layout.radix() as usize;
        let bits = layout.digit.bits();
        let mask = layout.digit.mask();
        let shift = self.params.shift;
        let rows = layout.rows_per_lane as usize;
        let group = ctx.group_size() as usize;
        let part = layout.partition_size() as usize;
        let partition = ctx.group_id() as usize;
        let partitions = self.params.partition_count as usize;
        let start = partition * part;
        let count = part.min(self.params.key_count as usize - start);

        // shared: [keys; part] [payloads; part] [digit starts; radix] [spine; subgroups]
        let payloads_at = part;
        let starts_at = 2 * part;
        let spine_at = starts_at + radix;
        let digit_of = |key: u32| extract_digit(key, shift, mask) as usize;

        let shared = ctx.shared_mut();
        for row in 0..rows {
            for lane in 0..group {
                let i = row * group + lane;
                if i < count {
                    shared.set(i, self.src_keys.load(start + i));
                    shared.set(payloads_at + i, self.src_payloads.load(start + i));
                }
            }
        }
        shared.fill(starts_at..starts_at + radix, 0);
        for i in 0..count {
            let d = digit_of(shared.get(i));
            shared.atomic_add(starts_at + d, 1);
        }
        // barrier; digit counts become digit starts in place
        let mut counts: Vec<u32> = (0..group)
            .map(|lane| {
                if lane < radix {
                    ctx.shared().get(starts_at + lane)
                } else {
                    0
                }
            })
            .collect();
        ctx.exclusive_scan(&mut counts, spine_at);
        for (d, &start) in counts.iter().enumerate().take(radix) {
            ctx.shared_mut().set(starts_at + d, start);
        }

        let owned = |lane: usize| (lane * rows).min(count)..((lane + 1) * rows).min(count);
        for bit in 0..bits {
            let is_set = |key: u32| (digit_of(key) >> bit) & 1 == 1;
            let mut zeros: Vec<u32> = (0..group)
                .map(|lane| {
                    owned(lane)
                        .filter(|&i| !is_set(ctx.shared().get(i)))
                        .count() as u32
                })
                .collect();
            let total_zeros = ctx.exclusive_scan(&mut zeros, spine_at);

            // each lane holds its elements and their new slots in registers
            let shared = ctx.shared();
            let mut moves: Vec<(usize, u32, u32)> = Vec::with_capacity(count);
            for (lane, &zero_base) in zeros.iter().enumerate() {
                let range = owned(lane);
                let mut next_zero = zero_base;
                let mut next_one = total_zeros + (range.start as u32 - zero_base);
                for i in range {
                    let key = shared.get(i);
                    let payload = shared.get(payloads_at + i);
                    let slot = if is_set(key) {
                        next_one += 1;
                        next_one - 1
                    } else {
                        next_zero += 1;
                        next_zero - 1
                    };
                    moves.push((slot as usize, key, payload));
                }
            }
            // barrier
            let shared = ctx.shared_mut();
            for (slot, key, payload) in moves {
                shared.set(slot, key);
                shared.set(payloads_at + slot, payload);
            }
        }

        // barrier; coalesced writes of the digit-ordered tile
        let shared = ctx.shared();
        for row in 0..rows {
            for lane in 0..group {
                let i = row * group + lane;
                if i >= count {
                    continue;
                }
                let key = shared.get(i);
                let d = digit_of(key);
                let base = self.offsets.load(d * partitions + partition);
                let dst = (base + (i as u32 - shared.get(starts_at + d))) as usize;
                self.dst_keys.store(dst, key);
                self.dst_payloads.store(dst, shared.get(payloads_at + i));
            }
        }
    }
}
