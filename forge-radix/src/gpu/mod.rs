//! wgpu backend: the sort kernels as WGSL on a real adapter.
//!
//! Same kernel chains, buffer roles and error register as the simulated
//! backend. Per-dispatch parameters are bound as uniforms at binding 1, the
//! error register at binding 0 of every kernel. After every step the host
//! reads the register back: a raised fault aborts the sort, and the width
//! table behind the fault slots says which subgroup width each stage ran
//! with.
//!
//! | Binding | Contents                                              |
//! |---------|-------------------------------------------------------|
//! | 0       | error register + width table                          |
//! | 1       | `SortParams` / `ScanParams` / `ResetParams` uniform   |
//! | 2..=5   | stage inputs and outputs                              |
//! | 6       | lookback cells (offsets for the scatter)              |
//! | 7       | control words: partition ticket, lookback statistics  |
//! | 8       | per-pass digit bases (OneSweep)                       |

use std::sync::Arc;

use forge_compute::{DispatchInfo, GpuBuffer, GpuDevice, GpuPipeline};
use tracing::{debug, info, warn};

use crate::arena::cell_capacity;
use crate::compat::{stage_desc, KernelVariant};
use crate::config::Design;
use crate::engine::{fault_error, StageReport};
use crate::error::{SortError, Stage};
use crate::layout::SortLayout;
use crate::params::{ResetParams, ScanParams, SortParams};
use crate::scan::two_level::block_size_for;
use crate::scan::{lookback_blocks, ScanKind, SpinPolicy, MAX_SPINE_BLOCKS, SCAN_BLOCK};
use crate::status::{decode_faults, STATUS_WORDS};

pub mod source;

/// Control word holding the next partition ticket.
pub const TICKET: usize = 0;
/// Control word counting lookback fallbacks.
pub const FALLBACKS: usize = 1;
/// Control word counting lookback stalls.
pub const STALLS: usize = 2;
pub const CONTROL_WORDS: usize = 3;

/// Error register followed by one width entry per stage code.
pub const STATUS_BUFFER_WORDS: usize = STATUS_WORDS + Stage::ALL.len() + 1;

/// Workgroup words the kernels declare besides the shared array.
const GROUP_VAR_WORDS: usize = 4;

/// Every pipeline of one variant and layout, compiled for the adapter.
#[derive(Debug)]
pub struct GpuKernels {
    variant: KernelVariant,
    layout: SortLayout,
    pipelines: Vec<GpuPipeline>,
}

impl GpuKernels {
    pub fn build(
        gpu: &GpuDevice,
        variant: KernelVariant,
        layout: SortLayout,
        spin: SpinPolicy,
    ) -> Result<Self, SortError> {
        let max_words = gpu.max_shared_words().saturating_sub(GROUP_VAR_WORDS);
        let pipelines = Stage::ALL
            .into_iter()
            .map(|stage| {
                let mut desc = stage_desc(stage, &layout, variant, max_words);
                if source::uses_lookback(stage) {
                    desc = desc
                        .with_constant("spin_limit", spin.spin_limit)
                        .with_constant("publish_fallback", spin.publish_fallback as u32);
                }
                gpu.create_pipeline(desc, &source::kernel_source(stage))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            variant,
            layout,
            pipelines,
        })
    }

    pub fn variant(&self) -> KernelVariant {
        self.variant
    }

    pub fn layout(&self) -> &SortLayout {
        &self.layout
    }

    pub fn pipeline(&self, stage: Stage) -> &GpuPipeline {
        &self.pipelines[stage.index()]
    }

    /// Shared words allocated to `stage`'s pipeline.
    pub fn bound(&self, stage: Stage) -> usize {
        self.pipeline(stage).shared_words()
    }
}

/// Device buffers of one GPU engine, sized once for `max_keys`.
#[derive(Debug)]
pub struct GpuArena {
    max_keys: usize,
    keys: [GpuBuffer; 2],
    payloads: [GpuBuffer; 2],
    counts: GpuBuffer,
    offsets: GpuBuffer,
    reduced: GpuBuffer,
    cells: GpuBuffer,
    digit_base: GpuBuffer,
    control: GpuBuffer,
    status: GpuBuffer,
}

impl GpuArena {
    pub fn new(gpu: &GpuDevice, layout: &SortLayout, max_keys: usize) -> Self {
        let max_keys = max_keys.max(1);
        let table = layout.table_len(max_keys);
        Self {
            max_keys,
            keys: [
                gpu.storage_buffer("keys_ping", max_keys),
                gpu.storage_buffer("keys_pong", max_keys),
            ],
            payloads: [
                gpu.storage_buffer("payloads_ping", max_keys),
                gpu.storage_buffer("payloads_pong", max_keys),
            ],
            counts: gpu.storage_buffer("digit_counts", table),
            offsets: gpu.storage_buffer("digit_offsets", table),
            reduced: gpu.storage_buffer("scan_reduced", MAX_SPINE_BLOCKS),
            cells: gpu.storage_buffer("lookback_cells", cell_capacity(layout, max_keys)),
            digit_base: gpu.storage_buffer(
                "digit_base",
                (layout.passes() * layout.radix()) as usize,
            ),
            control: gpu.storage_buffer("control", CONTROL_WORDS),
            status: gpu.storage_buffer("error_register", STATUS_BUFFER_WORDS),
        }
    }

    pub fn max_keys(&self) -> usize {
        self.max_keys
    }

    pub fn byte_len(&self) -> usize {
        self.keys
            .iter()
            .chain(&self.payloads)
            .chain([
                &self.counts,
                &self.offsets,
                &self.reduced,
                &self.cells,
                &self.digit_base,
                &self.control,
                &self.status,
            ])
            .map(GpuBuffer::byte_len)
            .sum()
    }

    /// Zero every scratch buffer and upload the input into the ping buffers.
    fn begin_sort(&self, gpu: &GpuDevice, keys: &[u32], payloads: &[u32]) {
        gpu.clear(&[
            &self.counts,
            &self.offsets,
            &self.reduced,
            &self.cells,
            &self.digit_base,
            &self.control,
            &self.status,
        ]);
        gpu.upload(&self.keys[0], keys);
        gpu.upload(&self.payloads[0], payloads);
    }
}

/// What one GPU sort produced.
#[derive(Clone, Debug)]
pub struct GpuRun {
    pub keys: Vec<u32>,
    pub payloads: Vec<u32>,
    pub stages: Vec<StageReport>,
    pub lookback_fallbacks: u32,
    pub lookback_stalls: u32,
}

/// Runs a design's kernel chain on a [`GpuDevice`].
#[derive(Debug)]
pub struct GpuSorter {
    gpu: Arc<GpuDevice>,
    design: Design,
    scan: ScanKind,
    kernels: GpuKernels,
    arena: GpuArena,
}

impl GpuSorter {
    pub fn new(
        gpu: Arc<GpuDevice>,
        design: Design,
        scan: ScanKind,
        variant: KernelVariant,
        max_keys: usize,
        spin: SpinPolicy,
    ) -> Result<Self, SortError> {
        let layout = design.layout();
        // one group per partition, all in the first dispatch dimension
        let limit = gpu.info().max_groups as usize * layout.partition_size() as usize;
        if max_keys > limit {
            return Err(SortError::TooManyKeys {
                count: max_keys,
                max: limit,
            });
        }
        let kernels = GpuKernels::build(&gpu, variant, layout, spin)?;
        let arena = GpuArena::new(&gpu, &layout, max_keys);
        info!(
            device = gpu.name(),
            design = %design,
            scan = %scan,
            variant = variant.name(),
            scratch_bytes = arena.byte_len(),
            "GPU sorter ready"
        );
        Ok(Self {
            gpu,
            design,
            scan,
            kernels,
            arena,
        })
    }

    pub fn gpu(&self) -> &Arc<GpuDevice> {
        &self.gpu
    }

    pub fn kernels(&self) -> &GpuKernels {
        &self.kernels
    }

    pub fn max_keys(&self) -> usize {
        self.arena.max_keys()
    }

    pub fn scratch_bytes(&self) -> usize {
        self.arena.byte_len()
    }

    /// Sort `keys` with `payloads`. Both must have equal length of at least
    /// 2 and at most `max_keys`.
    pub fn sort(&self, keys: &[u32], payloads: &[u32]) -> Result<GpuRun, SortError> {
        let n = keys.len();
        let layout = self.kernels.layout;
        let partitions = layout.partitions(n);
        self.arena.begin_sort(&self.gpu, keys, payloads);

        let mut stages = Vec::new();
        let mut current = 0;
        match self.design {
            Design::MultiPass4 | Design::MultiPass8 => {
                for pass in 0..layout.passes() {
                    let params = SortParams::new(n, layout.digit.shift(pass), partitions, pass);
                    let uniform = self.gpu.uniform("sort_params", &params);
                    let histogram = self.dispatch(
                        Stage::Histogram,
                        partitions,
                        &[
                            (1, &uniform),
                            (2, self.arena.keys[current].raw()),
                            (3, self.arena.counts.raw()),
                        ],
                    )?;
                    self.record(&mut stages, Some(pass), vec![histogram])?;
                    let scan = match self.scan {
                        ScanKind::TwoLevel => self.two_level_scan(layout.table_len(n))?,
                        ScanKind::Lookback => self.lookback_scan(layout.table_len(n))?,
                    };
                    self.record(&mut stages, Some(pass), scan)?;
                    let scatter = self.dispatch(
                        Stage::Scatter,
                        partitions,
                        &[
                            (1, &uniform),
                            (2, self.arena.keys[current].raw()),
                            (3, self.arena.payloads[current].raw()),
                            (4, self.arena.keys[1 - current].raw()),
                            (5, self.arena.payloads[1 - current].raw()),
                            (6, self.arena.offsets.raw()),
                        ],
                    )?;
                    self.record(&mut stages, Some(pass), vec![scatter])?;
                    current = 1 - current;
                }
            }
            Design::OneSweep => {
                let prelude = self.gpu.uniform("sort_params", &SortParams::new(n, 0, partitions, 0));
                let histogram = self.dispatch(
                    Stage::GlobalHistogram,
                    partitions,
                    &[
                        (1, &prelude),
                        (2, self.arena.keys[0].raw()),
                        (3, self.arena.digit_base.raw()),
                    ],
                )?;
                let bases =
                    self.dispatch(Stage::DigitBase, 1, &[(1, self.arena.digit_base.raw())])?;
                self.record(&mut stages, None, vec![histogram, bases])?;
                for pass in 0..layout.passes() {
                    let params = SortParams::new(n, layout.digit.shift(pass), partitions, pass);
                    let uniform = self.gpu.uniform("sort_params", &params);
                    let reset = self.reset(partitions as usize + 1, layout.radix() as usize)?;
                    let sweep = self.dispatch(
                        Stage::OneSweep,
                        partitions,
                        &[
                            (1, &uniform),
                            (2, self.arena.keys[current].raw()),
                            (3, self.arena.payloads[current].raw()),
                            (4, self.arena.keys[1 - current].raw()),
                            (5, self.arena.payloads[1 - current].raw()),
                            (6, self.arena.cells.raw()),
                            (7, self.arena.control.raw()),
                            (8, self.arena.digit_base.raw()),
                        ],
                    )?;
                    self.record(&mut stages, Some(pass), vec![reset, sweep])?;
                    current = 1 - current;
                }
            }
        }

        let control = self.gpu.read(&self.arena.control, CONTROL_WORDS)?;
        let (fallbacks, stalls) = (control[FALLBACKS], control[STALLS]);
        if fallbacks > 0 {
            warn!(fallbacks, "GPU lookback fell back to recomputing predecessors");
        }
        Ok(GpuRun {
            keys: self.gpu.read(&self.arena.keys[current], n)?,
            payloads: self.gpu.read(&self.arena.payloads[current], n)?,
            stages,
            lookback_fallbacks: fallbacks,
            lookback_stalls: stalls,
        })
    }

    /// Reduce, spine, add-back over the first `len` table entries.
    fn two_level_scan(&self, len: usize) -> Result<Vec<(Stage, DispatchInfo)>, SortError> {
        let params = ScanParams::new(len, block_size_for(len));
        debug!(
            entries = params.element_count,
            block_size = params.block_size,
            blocks = params.block_count,
            "GPU two-level scan"
        );
        let uniform = self.gpu.uniform("scan_params", &params);
        let counts = self.arena.counts.raw();
        let reduced = self.arena.reduced.raw();
        Ok(vec![
            self.dispatch(
                Stage::ScanReduce,
                params.block_count,
                &[(1, &uniform), (2, counts), (3, reduced)],
            )?,
            self.dispatch(Stage::ScanSpine, 1, &[(1, &uniform), (2, reduced)])?,
            self.dispatch(
                Stage::ScanAddBack,
                params.block_count,
                &[
                    (1, &uniform),
                    (2, counts),
                    (3, reduced),
                    (4, self.arena.offsets.raw()),
                ],
            )?,
        ])
    }

    /// Reset plus the single-dispatch lookback scan.
    fn lookback_scan(&self, len: usize) -> Result<Vec<(Stage, DispatchInfo)>, SortError> {
        let params = ScanParams::new(len, SCAN_BLOCK);
        let blocks = lookback_blocks(len);
        debug!(entries = params.element_count, blocks, "GPU lookback scan");
        let reset = self.reset(blocks + 1, 1)?;
        let uniform = self.gpu.uniform("scan_params", &params);
        let scan = self.dispatch(
            Stage::LookbackScan,
            params.block_count,
            &[
                (1, &uniform),
                (2, self.arena.counts.raw()),
                (3, self.arena.offsets.raw()),
                (6, self.arena.cells.raw()),
                (7, self.arena.control.raw()),
            ],
        )?;
        Ok(vec![reset, scan])
    }

    /// Seed `rows x columns` lookback cells and rewind the ticket.
    fn reset(&self, rows: usize, columns: usize) -> Result<(Stage, DispatchInfo), SortError> {
        let params = ResetParams::new(rows, columns);
        let uniform = self.gpu.uniform("reset_params", &params);
        let groups = (rows * columns).div_ceil(self.kernels.layout.group_size as usize) as u32;
        self.dispatch(
            Stage::Reset,
            groups.max(1),
            &[
                (1, &uniform),
                (6, self.arena.cells.raw()),
                (7, self.arena.control.raw()),
            ],
        )
    }

    fn dispatch(
        &self,
        stage: Stage,
        groups: u32,
        bindings: &[(u32, &wgpu::Buffer)],
    ) -> Result<(Stage, DispatchInfo), SortError> {
        let mut all = Vec::with_capacity(bindings.len() + 1);
        all.push((0, self.arena.status.raw()));
        all.extend_from_slice(bindings);
        let info = self.gpu.dispatch(self.kernels.pipeline(stage), groups, &all)?;
        Ok((stage, info))
    }

    /// Read the register back after a step: the first fault becomes the
    /// error, otherwise the step's dispatches are recorded with the width
    /// each stage reported.
    fn record(
        &self,
        stages: &mut Vec<StageReport>,
        pass: Option<u32>,
        dispatched: Vec<(Stage, DispatchInfo)>,
    ) -> Result<(), SortError> {
        let words = self.gpu.read(&self.arena.status, STATUS_BUFFER_WORDS)?;
        if let Some(fault) = decode_faults(&words).into_iter().next() {
            let error = fault_error(fault, self.kernels.variant, self.kernels.bound(fault.stage));
            warn!(%error, recovery = ?error.recovery(), "GPU sort aborted by kernel fault");
            return Err(error);
        }
        stages.extend(dispatched.into_iter().map(|(stage, info)| {
            let width = words
                .get(STATUS_WORDS + stage.code() as usize)
                .copied()
                .unwrap_or(info.subgroup_width);
            StageReport::new(
                pass,
                stage,
                DispatchInfo {
                    subgroup_width: width,
                    ..info
                },
            )
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digit::DigitWidth;

    #[test]
    fn test_status_buffer_has_a_width_per_stage_code() {
        let highest = Stage::ALL.iter().map(|s| s.code()).max().unwrap_or(0) as usize;
        assert!(STATUS_WORDS + highest < STATUS_BUFFER_WORDS);
    }

    #[test]
    fn test_control_words_are_distinct() {
        let mut words = [TICKET, FALLBACKS, STALLS];
        words.sort_unstable();
        assert_eq!(words, [0, 1, 2]);
        assert_eq!(CONTROL_WORDS, words.len());
    }

    #[test]
    fn test_pipeline_bounds_leave_room_for_group_vars() {
        let layout = SortLayout::new(DigitWidth::Eight, 8);
        let max_words = 8192 - GROUP_VAR_WORDS;
        let desc = stage_desc(Stage::OneSweep, &layout, KernelVariant::W8, max_words);
        assert_eq!(desc.shared_words, max_words);
        assert!((desc.shared_words + GROUP_VAR_WORDS) * 4 <= 32 * 1024);
    }
}
