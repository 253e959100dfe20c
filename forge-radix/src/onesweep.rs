//! OneSweep: ranking, lookback and scatter fused into one dispatch per pass.
//!
//! Partitions are claimed through the atomic ticket, so a partition only ever
//! waits on partitions whose groups are already running. Each subgroup owns
//! a contiguous chunk of `rows_per_lane x width` keys and ranks them with a
//! warp-level multisplit: one ballot per digit bit narrows every lane's mask
//! down to the lanes holding the same digit, and `count_below` on that mask
//! is the lane's rank among equal digits in the row. Chunks are visited in
//! input order, so ranks are stable.
//!
//! Shared memory: `[subgroups x radix counters][radix aggregates][radix exclusive]`.
//!
//! The global destination of a key with digit `d` is
//! `digit_base[pass][d] + lookback_exclusive[d] + subgroup_prefix[d] + rank`.

use std::collections::HashMap;

use forge_compute::{Device, DeviceBuffer, DispatchInfo, GroupContext, LaneMask, Subgroup};
use tracing::warn;

use crate::arena::SortScratch;
use crate::compat::{Gate, KernelSet};
use crate::digit::extract_digit;
use crate::error::Stage;
use crate::params::SortParams;
use crate::scan::lookback::{
    publish, reset_lookback, resolve_exclusive, CellFlag, LookbackStats, LookbackWalker,
    SpinPolicy,
};

/// Run one fused OneSweep pass. Digit bases must already be in
/// `scratch.digit_base()`.
pub fn onesweep_pass(
    device: &Device,
    kernels: &KernelSet,
    scratch: &SortScratch<'_>,
    params: SortParams,
    policy: SpinPolicy,
) -> Vec<(Stage, DispatchInfo)> {
    let radix = kernels.layout().radix() as usize;
    let reset = reset_lookback(
        device,
        kernels,
        scratch,
        params.partition_count as usize + 1,
        radix,
    );
    let (fallbacks_before, _) = scratch.lookback_stats();
    let kernel = OneSweepKernel {
        gate: kernels.gate(Stage::OneSweep, scratch.status()),
        params,
        policy,
        src_keys: scratch.src_keys(),
        src_payloads: scratch.src_payloads(),
        dst_keys: scratch.dst_keys(),
        dst_payloads: scratch.dst_payloads(),
        digit_base: scratch.digit_base(),
        cells: scratch.cells(),
        ticket: scratch.ticket(),
        stats: scratch.stats(),
    };
    let sweep = kernels.dispatch(device, Stage::OneSweep, params.partition_count, |ctx| {
        kernel.run(ctx)
    });
    let (fallbacks, _) = scratch.lookback_stats();
    if fallbacks > fallbacks_before {
        warn!(
            pass = params.pass,
            fallbacks = fallbacks - fallbacks_before,
            "onesweep lookback fell back to recomputing predecessors"
        );
    }
    vec![reset, (Stage::OneSweep, sweep)]
}

/// A key after ranking, held in registers until the scatter.
struct Ranked {
    key: u32,
    payload: u32,
    digit: usize,
    subgroup: usize,
    rank: u32,
}

struct OneSweepKernel<'a> {
    gate: Gate<'a>,
    params: SortParams,
    policy: SpinPolicy,
    src_keys: &'a DeviceBuffer,
    src_payloads: &'a DeviceBuffer,
    dst_keys: &'a DeviceBuffer,
    dst_payloads: &'a DeviceBuffer,
    digit_base: &'a DeviceBuffer,
    cells: &'a DeviceBuffer,
    ticket: &'a DeviceBuffer,
    stats: &'a DeviceBuffer,
}

impl OneSweepKernel<'_> {
    fn digit(&self, key: u32) -> usize {
        extract_digit(key, self.params.shift, self.gate.layout.digit.mask()) as usize
    }

    fn partition_range(&self, partition: u32) -> std::ops::Range<usize> {
        let size = self.gate.layout.partition_size() as usize;
        let n = self.params.key_count as usize;
        let start = (partition as usize * size).min(n);
        start..(start + size).min(n)
    }

    /// Digit counts of partition `q`, recomputed from the source keys.
    fn recount(&self, partition: u32) -> Vec<u32> {
        let mut counts = vec![0u32; self.gate.layout.radix() as usize];
        for i in self.partition_range(partition) {
            counts[self.digit(self.src_keys.load(i))] += 1;
        }
        counts
    }

    fn run(&self, ctx: &mut GroupContext) {
        let Some(geo) = self.gate.admit(ctx) else {
            return;
        };
        let partition = self.ticket.fetch_add(0, 1);
        if partition >= self.params.partition_count {
            return;
        }
        let layout = self.gate.layout;
        let radix = layout.radix() as usize;
        let bits = layout.digit.bits();
        let rows = layout.rows_per_lane as usize;
        let range = self.partition_range(partition);
        let subgroups: Vec<Subgroup> = ctx.subgroups().collect();
        let counters = geo.subgroups as usize * radix;
        let aggregates_at = counters;
        let exclusive_at = counters + radix;

        ctx.shared_mut().fill(0..counters + 2 * radix, 0);
        // barrier
        let mut ranked: Vec<Ranked> = Vec::with_capacity(range.len());
        for sg in &subgroups {
            let slot = sg.index as usize * radix;
            let chunk = range.start + sg.first_lane as usize * rows;
            for row in 0..rows {
                let row_start = chunk + row * sg.width as usize;
                let live = sg.ballot(|lane| row_start + (lane as usize) < range.end);
                if live.is_empty() {
                    break;
                }
                let lanes: Vec<(u32, u32, usize)> = (0..sg.width)
                    .filter(|&lane| live.contains(lane))
                    .map(|lane| {
                        let key = self.src_keys.load(row_start + lane as usize);
                        let payload = self.src_payloads.load(row_start + lane as usize);
                        (key, payload, self.digit(key))
                    })
                    .collect();
                let digit_of = |lane: u32| lanes[lane as usize].2;
                let bit_votes: Vec<LaneMask> = (0..bits)
                    .map(|bit| sg.ballot(|lane| live.contains(lane) && (digit_of(lane) >> bit) & 1 == 1))
                    .collect();
                let peers: Vec<LaneMask> = (0..lanes.len() as u32)
                    .map(|lane| {
                        bit_votes.iter().enumerate().fold(live, |eq, (bit, &votes)| {
                            if (digit_of(lane) >> bit) & 1 == 1 {
                                eq.and(votes)
                            } else {
                                eq.and(votes.not_within(sg.width))
                            }
                        })
                    })
                    .collect();

                let shared = ctx.shared();
                for (lane, &(key, payload, digit)) in lanes.iter().enumerate() {
                    let rank = shared.get(slot + digit) + peers[lane].count_below(lane as u32);
                    ranked.push(Ranked {
                        key,
                        payload,
                        digit,
                        subgroup: sg.index as usize,
                        rank,
                    });
                }
                // the lowest lane of each peer set bumps the shared counter
                let shared = ctx.shared_mut();
                for (lane, &(_, _, digit)) in lanes.iter().enumerate() {
                    if peers[lane].first() == Some(lane as u32) {
                        shared.atomic_add(slot + digit, peers[lane].count());
                    }
                }
            }
        }

        // barrier; scan counters across subgroups, one digit per lane
        let shared = ctx.shared_mut();
        for digit in 0..radix {
            let mut running = 0u32;
            for s in 0..subgroups.len() {
                let count = shared.get(s * radix + digit);
                shared.set(s * radix + digit, running);
                running += count;
            }
            shared.set(aggregates_at + digit, running);
        }

        let row = partition as usize + 1;
        for digit in 0..radix {
            let aggregate = ctx.shared().get(aggregates_at + digit);
            publish(self.cells, row * radix + digit, CellFlag::Aggregate, aggregate);
        }

        let mut stats = LookbackStats::default();
        let mut recounted: HashMap<u32, Vec<u32>> = HashMap::new();
        for digit in 0..radix {
            let aggregate = ctx.shared().get(aggregates_at + digit);
            let mut walker = LookbackWalker::new(partition, digit, radix);
            let exclusive =
                resolve_exclusive(self.cells, &mut walker, self.policy, &mut stats, |pred| {
                    recounted.entry(pred).or_insert_with(|| self.recount(pred))[digit]
                });
            publish(
                self.cells,
                row * radix + digit,
                CellFlag::Inclusive,
                exclusive + aggregate,
            );
            ctx.shared_mut().set(exclusive_at + digit, exclusive);
        }
        stats.flush(self.stats);

        // barrier
        let shared = ctx.shared();
        let base_row = self.params.pass as usize * radix;
        for r in ranked {
            let dst = self.digit_base.load(base_row + r.digit)
                + shared.get(exclusive_at + r.digit)
                + shared.get(r.subgroup * radix + r.digit)
                + r.rank;
            self.dst_keys.store(dst as usize, r.key);
            self.dst_payloads.store(dst as usize, r.payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ScratchArena;
    use crate::compat::KernelVariant;
    use crate::digit::{digit_for_pass, DigitWidth};
    use crate::histogram::build_digit_bases;
    use crate::layout::SortLayout;
    use forge_compute::{DeviceProfile, DispatchOrder, PipelineCache};

    fn run_pass(profile: DeviceProfile, variant: KernelVariant, keys: &[u32], policy: SpinPolicy) -> (Vec<(u32, u32)>, (u32, u32)) {
        let device = Device::new(profile).unwrap();
        let layout = SortLayout::new(DigitWidth::Eight, 8);
        let kernels = KernelSet::build(&device, &mut PipelineCache::new(), variant, layout).unwrap();
        let payloads: Vec<u32> = (0..keys.len() as u32).collect();
        let mut arena = ScratchArena::new(&layout, keys.len());
        let scratch = arena.begin_sort(&layout, keys, &payloads);
        let params = SortParams::new(keys.len(), 0, scratch.partitions(), 0);
        build_digit_bases(&device, &kernels, &scratch, params);
        onesweep_pass(&device, &kernels, &scratch, params, policy);
        assert!(scratch.status().faults().is_empty());
        let out = scratch
            .dst_keys()
            .read(keys.len())
            .into_iter()
            .zip(scratch.dst_payloads().read(keys.len()))
            .collect();
        (out, scratch.lookback_stats())
    }

    fn expected(keys: &[u32]) -> Vec<(u32, u32)> {
        let mut pairs: Vec<(u32, u32)> = keys.iter().copied().zip(0..).collect();
        pairs.sort_by_key(|&(k, _)| digit_for_pass(k, DigitWidth::Eight, 0));
        pairs
    }

    #[test]
    fn test_pass_is_stable_by_low_digit() {
        let keys: Vec<u32> = (0..7000u32).map(|i| i.wrapping_mul(2_246_822_519) >> 3).collect();
        for width in [8u32, 16, 32, 64] {
            let profile = DeviceProfile::amd_wave64().with_subgroup_width(width);
            let variant = KernelVariant::select(width).unwrap();
            let (out, _) = run_pass(profile, variant, &keys, SpinPolicy::default());
            assert_eq!(out, expected(&keys), "width {width}");
        }
    }

    #[test]
    fn test_single_worker_descending_dispatch() {
        let keys: Vec<u32> = (0..9000u32).map(|i| (i * 31) % 500).collect();
        let profile = DeviceProfile::nvidia_like()
            .with_dispatch_order(DispatchOrder::Descending)
            .with_worker_threads(1);
        let policy = SpinPolicy {
            spin_limit: 0,
            yield_every: 0,
            publish_fallback: true,
        };
        let (out, _) = run_pass(profile, KernelVariant::W32, &keys, policy);
        assert_eq!(out, expected(&keys));
    }

    #[test]
    fn test_repeated_digits_in_one_row() {
        let keys = vec![5u32; 3000];
        let (out, _) = run_pass(DeviceProfile::intel_like(), KernelVariant::W16, &keys, SpinPolicy::default());
        assert_eq!(out, expected(&keys));
    }
}
