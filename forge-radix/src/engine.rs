//! Pass orchestrator.
//!
//! A [`RadixEngine`] is built once per device and design: it probes the
//! subgroup width, picks (or is told) a kernel variant, builds every
//! pipeline and allocates a scratch arena sized for `max_keys`. Each sort
//! then uploads into the ping buffers, runs the design's kernel chain pass
//! by pass with the ping-pong roles swapped after every scatter, and checks
//! the error register after every stage. A raised fault aborts the sort;
//! no partial result is ever returned.
//!
//! [`RadixEngine::on_gpu`] runs the chain as WGSL on a wgpu adapter; that is
//! the production path. [`RadixEngine::new`] runs it on the software
//! [`Device`], whose profiles reproduce subgroup widths and scheduling
//! orders no single adapter offers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use forge_compute::{probe_subgroup_width, Device, DispatchInfo, GpuDevice, PipelineCache};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::arena::{ScratchArena, SortScratch};
use crate::compat::{KernelSet, KernelVariant};
use crate::config::{Design, EngineConfig, MAX_KEYS};
use crate::error::{SortError, Stage};
use crate::gpu::GpuSorter;
use crate::histogram::{build_digit_bases, build_histograms};
use crate::onesweep::onesweep_pass;
use crate::params::SortParams;
use crate::scan::{strategy_for, ScanKind, ScanStrategy};
use crate::scatter::scatter_partitions;
use crate::status::{FaultClass, KernelFault};

/// A key with its payload.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Record {
    pub key: u32,
    pub payload: u32,
}

impl Record {
    pub fn new(key: u32, payload: u32) -> Self {
        Self { key, payload }
    }
}

/// One completed dispatch of a sort.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StageReport {
    /// Radix pass, `None` for the OneSweep prelude.
    pub pass: Option<u32>,
    pub stage: Stage,
    pub label: &'static str,
    pub groups: u32,
    /// Width the stage's groups actually executed with.
    pub subgroup_width: u32,
    pub elapsed_us: u64,
}

impl StageReport {
    pub(crate) fn new(pass: Option<u32>, stage: Stage, info: DispatchInfo) -> Self {
        Self {
            pass,
            stage,
            label: info.label,
            groups: info.groups,
            subgroup_width: info.subgroup_width,
            elapsed_us: info.elapsed.as_micros() as u64,
        }
    }
}

/// Where an engine's kernels execute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// WGSL kernels on a wgpu adapter.
    Gpu,
    /// The software device.
    Simulated,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Gpu => "gpu",
            BackendKind::Simulated => "simulated",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What a sort did, for benchmarking and debugging.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub backend: BackendKind,
    pub design: Design,
    pub scan: ScanKind,
    pub variant: &'static str,
    /// Width reported by the probe at engine construction.
    pub probed_width: u32,
    pub partition_size: u32,
    pub partitions: u32,
    pub passes: u32,
    pub stages: Vec<StageReport>,
    pub lookback_fallbacks: u32,
    pub lookback_stalls: u32,
}

impl Diagnostics {
    /// Width the first dispatch of `stage` executed with.
    pub fn observed_width(&self, stage: Stage) -> Option<u32> {
        self.stages
            .iter()
            .find(|s| s.stage == stage)
            .map(|s| s.subgroup_width)
    }

    /// Total time spent inside dispatches.
    pub fn dispatch_time(&self) -> Duration {
        Duration::from_micros(self.stages.iter().map(|s| s.elapsed_us).sum())
    }
}

/// Result of a successful sort.
#[derive(Clone, Debug)]
pub struct SortOutput {
    pub pairs: Vec<Record>,
    /// Wall time from upload to readback.
    pub elapsed: Duration,
    pub diagnostics: Diagnostics,
}

impl SortOutput {
    pub fn keys(&self) -> Vec<u32> {
        self.pairs.iter().map(|r| r.key).collect()
    }

    pub fn payloads(&self) -> Vec<u32> {
        self.pairs.iter().map(|r| r.payload).collect()
    }
}

enum Backend {
    Simulated {
        device: Arc<Device>,
        kernels: KernelSet,
        cache: PipelineCache,
        scan: Box<dyn ScanStrategy>,
        arena: ScratchArena,
    },
    Gpu(GpuSorter),
}

/// A radix sort engine for one device and design.
pub struct RadixEngine {
    config: EngineConfig,
    backend: Backend,
    variant: KernelVariant,
    scan: ScanKind,
    probed_width: u32,
}

impl RadixEngine {
    /// An engine on the software device.
    pub fn new(device: Arc<Device>, config: EngineConfig) -> Result<Self, SortError> {
        check_capacity(&config)?;
        let probed_width = probe_subgroup_width(&device)?;
        let variant = choose_variant(&config, probed_width)?;

        let layout = config.design.layout();
        let mut cache = PipelineCache::new();
        let kernels = KernelSet::build(&device, &mut cache, variant, layout)?;
        let scan = strategy_for(config.effective_scan(), config.spin);
        let arena = ScratchArena::new(&layout, config.max_keys);

        info!(
            device = device.name(),
            design = %config.design,
            scan = %scan.kind(),
            variant = variant.name(),
            probed_width,
            pipelines = cache.len(),
            scratch_bytes = arena.byte_len(),
            "radix engine ready"
        );
        Ok(Self {
            scan: scan.kind(),
            config,
            backend: Backend::Simulated {
                device,
                kernels,
                cache,
                scan,
                arena,
            },
            variant,
            probed_width,
        })
    }

    /// An engine running WGSL kernels on `gpu`.
    pub fn on_gpu(gpu: Arc<GpuDevice>, config: EngineConfig) -> Result<Self, SortError> {
        check_capacity(&config)?;
        let probed_width = gpu.subgroup_width();
        let variant = choose_variant(&config, probed_width)?;
        let scan = config.effective_scan();
        let sorter = GpuSorter::new(
            gpu,
            config.design,
            scan,
            variant,
            config.max_keys,
            config.spin,
        )?;
        info!(
            device = sorter.gpu().name(),
            design = %config.design,
            scan = %scan,
            variant = variant.name(),
            probed_width,
            pipelines = Stage::ALL.len(),
            scratch_bytes = sorter.scratch_bytes(),
            "radix engine ready"
        );
        Ok(Self {
            config,
            backend: Backend::Gpu(sorter),
            variant,
            scan,
            probed_width,
        })
    }

    pub fn backend(&self) -> BackendKind {
        match self.backend {
            Backend::Simulated { .. } => BackendKind::Simulated,
            Backend::Gpu(_) => BackendKind::Gpu,
        }
    }

    /// Name of the device the kernels run on.
    pub fn device_name(&self) -> &str {
        match &self.backend {
            Backend::Simulated { device, .. } => device.name(),
            Backend::Gpu(sorter) => sorter.gpu().name(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn design(&self) -> Design {
        self.config.design
    }

    pub fn variant(&self) -> KernelVariant {
        self.variant
    }

    pub fn probed_width(&self) -> u32 {
        self.probed_width
    }

    pub fn max_keys(&self) -> usize {
        match &self.backend {
            Backend::Simulated { arena, .. } => arena.max_keys(),
            Backend::Gpu(sorter) => sorter.max_keys(),
        }
    }

    /// Distinct pipelines built for this engine.
    pub fn pipeline_count(&self) -> usize {
        match &self.backend {
            Backend::Simulated { cache, .. } => cache.len(),
            Backend::Gpu(_) => Stage::ALL.len(),
        }
    }

    /// Sort `keys` ascending, carrying `payloads` along. Equal keys keep
    /// their input order.
    pub fn sort(&mut self, keys: &[u32], payloads: &[u32]) -> Result<SortOutput, SortError> {
        if keys.len() != payloads.len() {
            return Err(SortError::LengthMismatch {
                keys: keys.len(),
                payloads: payloads.len(),
            });
        }
        let n = keys.len();
        if n > self.max_keys() {
            return Err(SortError::TooManyKeys {
                count: n,
                max: self.max_keys(),
            });
        }

        let start = Instant::now();
        let layout = self.config.design.layout();
        let mut diagnostics = Diagnostics {
            backend: self.backend(),
            design: self.config.design,
            scan: self.scan,
            variant: self.variant.name(),
            probed_width: self.probed_width,
            partition_size: layout.partition_size(),
            partitions: layout.partitions(n),
            passes: layout.passes(),
            stages: Vec::new(),
            lookback_fallbacks: 0,
            lookback_stalls: 0,
        };
        if n <= 1 {
            // A variant the device can't run is rejected whatever the size.
            let variant = self.variant;
            if !variant.supports(self.probed_width) {
                return Err(SortError::CapabilityMismatch {
                    stage: self.config.design.first_stage(),
                    observed_width: self.probed_width,
                    required_width: variant.min_width(),
                    variant: variant.name(),
                });
            }
            let pairs = keys
                .iter()
                .zip(payloads)
                .map(|(&key, &payload)| Record { key, payload })
                .collect();
            return Ok(SortOutput {
                pairs,
                elapsed: start.elapsed(),
                diagnostics,
            });
        }

        let (sorted_keys, sorted_payloads) = match &mut self.backend {
            Backend::Simulated {
                device,
                kernels,
                scan,
                arena,
                ..
            } => {
                let mut scratch = arena.begin_sort(&layout, keys, payloads);
                let partitions = scratch.partitions();
                let device = device.as_ref();
                let stages = &mut diagnostics.stages;

                match self.config.design {
                    Design::MultiPass4 | Design::MultiPass8 => {
                        for pass in 0..layout.passes() {
                            let params =
                                SortParams::new(n, layout.digit.shift(pass), partitions, pass);
                            let histogram = build_histograms(device, kernels, &scratch, params);
                            record(stages, Some(pass), vec![histogram], kernels, &scratch)?;
                            let offsets = scan.compute_global_offsets(device, kernels, &scratch);
                            record(stages, Some(pass), offsets, kernels, &scratch)?;
                            let scatter = scatter_partitions(device, kernels, &scratch, params);
                            record(stages, Some(pass), vec![scatter], kernels, &scratch)?;
                            scratch.swap();
                        }
                    }
                    Design::OneSweep => {
                        let prelude = SortParams::new(n, 0, partitions, 0);
                        let bases = build_digit_bases(device, kernels, &scratch, prelude);
                        record(stages, None, bases, kernels, &scratch)?;
                        for pass in 0..layout.passes() {
                            let params =
                                SortParams::new(n, layout.digit.shift(pass), partitions, pass);
                            let sweep =
                                onesweep_pass(device, kernels, &scratch, params, self.config.spin);
                            record(stages, Some(pass), sweep, kernels, &scratch)?;
                            scratch.swap();
                        }
                    }
                }

                let (fallbacks, stalls) = scratch.lookback_stats();
                diagnostics.lookback_fallbacks = fallbacks;
                diagnostics.lookback_stalls = stalls;
                scratch.read_current()
            }
            Backend::Gpu(sorter) => {
                let run = sorter.sort(keys, payloads)?;
                diagnostics.stages = run.stages;
                diagnostics.lookback_fallbacks = run.lookback_fallbacks;
                diagnostics.lookback_stalls = run.lookback_stalls;
                (run.keys, run.payloads)
            }
        };
        let pairs = sorted_keys
            .into_iter()
            .zip(sorted_payloads)
            .map(|(key, payload)| Record { key, payload })
            .collect();
        let elapsed = start.elapsed();
        debug!(
            keys = n,
            design = %self.config.design,
            elapsed_us = elapsed.as_micros() as u64,
            dispatches = diagnostics.stages.len(),
            fallbacks = diagnostics.lookback_fallbacks,
            "sort complete"
        );
        Ok(SortOutput {
            pairs,
            elapsed,
            diagnostics,
        })
    }

    /// Sort records by key.
    pub fn sort_records(&mut self, records: &[Record]) -> Result<SortOutput, SortError> {
        let (keys, payloads): (Vec<u32>, Vec<u32>) =
            records.iter().map(|r| (r.key, r.payload)).unzip();
        self.sort(&keys, &payloads)
    }
}

impl std::fmt::Debug for RadixEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadixEngine")
            .field("backend", &self.backend())
            .field("device", &self.device_name())
            .field("config", &self.config)
            .field("variant", &self.variant.name())
            .field("probed_width", &self.probed_width)
            .finish()
    }
}

/// Append the dispatches of one step, then check the error register so a
/// faulted stage never feeds the next one.
fn record(
    stages: &mut Vec<StageReport>,
    pass: Option<u32>,
    dispatched: Vec<(Stage, DispatchInfo)>,
    kernels: &KernelSet,
    scratch: &SortScratch<'_>,
) -> Result<(), SortError> {
    stages.extend(
        dispatched
            .into_iter()
            .map(|(stage, info)| StageReport::new(pass, stage, info)),
    );
    check_faults(kernels, scratch)
}

/// Turn the first fault in the error register into an error.
fn check_faults(kernels: &KernelSet, scratch: &SortScratch<'_>) -> Result<(), SortError> {
    let Some(fault) = scratch.status().first_fault() else {
        return Ok(());
    };
    let error = fault_error(fault, kernels.variant(), kernels.bound(fault.stage));
    warn!(%error, recovery = ?error.recovery(), "sort aborted by kernel fault");
    Err(error)
}

/// The error a kernel fault stands for; `available_words` is the shared
/// memory the faulting stage's pipeline was given.
pub(crate) fn fault_error(
    fault: KernelFault,
    variant: KernelVariant,
    available_words: usize,
) -> SortError {
    match fault.class {
        FaultClass::CapabilityMismatch => SortError::CapabilityMismatch {
            stage: fault.stage,
            observed_width: fault.observed_width,
            required_width: fault.required,
            variant: variant.name(),
        },
        FaultClass::CapacityOverflow => SortError::CapacityOverflow {
            stage: fault.stage,
            observed_width: fault.observed_width,
            required_words: fault.required,
            available_words: available_words as u32,
        },
    }
}

fn check_capacity(config: &EngineConfig) -> Result<(), SortError> {
    if config.max_keys > MAX_KEYS {
        return Err(SortError::TooManyKeys {
            count: config.max_keys,
            max: MAX_KEYS,
        });
    }
    Ok(())
}

/// The forced variant, or the widest one the probed width satisfies.
fn choose_variant(config: &EngineConfig, probed_width: u32) -> Result<KernelVariant, SortError> {
    let variant = match &config.variant {
        Some(name) => KernelVariant::by_name(name)?,
        None => KernelVariant::select(probed_width)?,
    };
    if !variant.supports(probed_width) {
        warn!(
            variant = variant.name(),
            probed_width, "forced variant needs a wider subgroup than the device reports"
        );
    }
    Ok(variant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_compute::DeviceProfile;

    fn engine(design: Design) -> RadixEngine {
        let device = Arc::new(Device::new(DeviceProfile::nvidia_like()).unwrap());
        RadixEngine::new(device, EngineConfig::new(design).with_max_keys(8192)).unwrap()
    }

    #[test]
    fn test_engine_selects_variant_from_probe() {
        let device = Arc::new(Device::new(DeviceProfile::intel_like()).unwrap());
        let engine = RadixEngine::new(device, EngineConfig::new(Design::MultiPass8)).unwrap();
        assert_eq!(engine.probed_width(), 16);
        assert_eq!(engine.variant().name(), "w16");
        assert_eq!(engine.pipeline_count(), Stage::ALL.len());
        assert_eq!(engine.backend(), BackendKind::Simulated);
        assert_eq!(engine.device_name(), "simd16");
    }

    #[test]
    fn test_fault_error_carries_variant_and_bound() {
        let mismatch = KernelFault {
            class: FaultClass::CapabilityMismatch,
            stage: Stage::Scatter,
            observed_width: 16,
            required: 32,
        };
        assert!(matches!(
            fault_error(mismatch, KernelVariant::W32, 4360),
            SortError::CapabilityMismatch {
                stage: Stage::Scatter,
                observed_width: 16,
                required_width: 32,
                variant: "w32"
            }
        ));
        let overflow = KernelFault {
            class: FaultClass::CapacityOverflow,
            stage: Stage::OneSweep,
            observed_width: 8,
            required: 8704,
        };
        assert!(matches!(
            fault_error(overflow, KernelVariant::W8, 8192),
            SortError::CapacityOverflow {
                required_words: 8704,
                available_words: 8192,
                ..
            }
        ));
    }

    #[test]
    fn test_four_record_example() {
        for design in Design::ALL {
            let mut engine = engine(design);
            let out = engine.sort(&[3, 1, 2, 1], &[30, 10, 20, 11]).unwrap();
            assert_eq!(
                out.pairs,
                vec![
                    Record::new(1, 10),
                    Record::new(1, 11),
                    Record::new(2, 20),
                    Record::new(3, 30)
                ],
                "{design}"
            );
        }
    }

    #[test]
    fn test_trivial_inputs_skip_dispatch() {
        let mut engine = engine(Design::OneSweep);
        let empty = engine.sort(&[], &[]).unwrap();
        assert!(empty.pairs.is_empty());
        assert!(empty.diagnostics.stages.is_empty());

        let one = engine.sort(&[7], &[70]).unwrap();
        assert_eq!(one.pairs, vec![Record::new(7, 70)]);
        assert!(one.diagnostics.stages.is_empty());
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let mut engine = engine(Design::MultiPass4);
        assert!(matches!(
            engine.sort(&[1, 2], &[1]),
            Err(SortError::LengthMismatch {
                keys: 2,
                payloads: 1
            })
        ));
        let big = vec![0u32; 8193];
        assert!(matches!(
            engine.sort(&big, &big),
            Err(SortError::TooManyKeys {
                count: 8193,
                max: 8192
            })
        ));
    }

    #[test]
    fn test_rejects_capacity_beyond_count_width() {
        let device = Arc::new(Device::new(DeviceProfile::nvidia_like()).unwrap());
        let err = RadixEngine::new(device, EngineConfig::default().with_max_keys(1 << 30)).unwrap_err();
        assert!(matches!(err, SortError::TooManyKeys { .. }));
    }

    #[test]
    fn test_diagnostics_record_passes() {
        let mut engine = engine(Design::MultiPass8);
        let keys: Vec<u32> = (0..5000u32).rev().collect();
        let out = engine.sort(&keys, &keys).unwrap();
        let d = &out.diagnostics;
        assert_eq!(d.backend, BackendKind::Simulated);
        assert_eq!(d.passes, 4);
        assert_eq!(d.partitions, 3);
        // histogram + reduce/spine/add-back + scatter per pass
        assert_eq!(d.stages.len(), 4 * 5);
        assert_eq!(d.observed_width(Stage::Scatter), Some(32));
        assert_eq!(d.stages.last().map(|s| s.pass), Some(Some(3)));
    }
}
