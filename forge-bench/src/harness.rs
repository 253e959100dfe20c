//! Measurement harness.
//!
//! For each size every contender sorts the same input once; the outputs are
//! cross-validated against the reference sort and against each other before
//! any timing starts. Then each contender runs its warmup and measured loops
//! and the samples are reduced to a [`DataPoint`].

use std::sync::Arc;

use forge_compute::{mkeys_per_sec, BenchTimer, Device, DeviceError, GpuDevice, HardwareInfo};
use forge_radix::validate::{cross_validate, is_stable};
use forge_radix::{
    BackendKind, Design, Diagnostics, EngineConfig, RadixEngine, Record, ScanKind, SortError,
};
use rayon::slice::ParallelSliceMut;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::format_size;
use crate::data_gen::{positions, DataGenerator, Distribution};
use crate::error::BenchError;
use crate::stats::Stats;

/// The device engine contenders are built on.
#[derive(Clone)]
pub enum Platform {
    Simulated(Arc<Device>),
    Gpu(Arc<GpuDevice>),
}

impl Platform {
    pub fn hardware(&self) -> Result<HardwareInfo, DeviceError> {
        match self {
            Platform::Simulated(device) => HardwareInfo::detect(device),
            Platform::Gpu(gpu) => Ok(HardwareInfo::from_gpu(gpu)),
        }
    }

    pub fn backend(&self) -> BackendKind {
        match self {
            Platform::Simulated(_) => BackendKind::Simulated,
            Platform::Gpu(_) => BackendKind::Gpu,
        }
    }

    fn engine(&self, config: EngineConfig) -> Result<RadixEngine, SortError> {
        match self {
            Platform::Simulated(device) => RadixEngine::new(Arc::clone(device), config),
            Platform::Gpu(gpu) => RadixEngine::on_gpu(Arc::clone(gpu), config),
        }
    }
}

/// Something that sorts key/payload pairs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Contender {
    Engine { design: Design, scan: ScanKind },
    /// `slice::sort_by_key`, single-threaded.
    StdSort,
    /// rayon `par_sort_by_key`.
    RayonSort,
}

impl Contender {
    pub const ALL: [Contender; 7] = [
        Contender::Engine {
            design: Design::OneSweep,
            scan: ScanKind::Lookback,
        },
        Contender::Engine {
            design: Design::MultiPass8,
            scan: ScanKind::TwoLevel,
        },
        Contender::Engine {
            design: Design::MultiPass8,
            scan: ScanKind::Lookback,
        },
        Contender::Engine {
            design: Design::MultiPass4,
            scan: ScanKind::TwoLevel,
        },
        Contender::Engine {
            design: Design::MultiPass4,
            scan: ScanKind::Lookback,
        },
        Contender::StdSort,
        Contender::RayonSort,
    ];

    pub fn name(self) -> String {
        match self {
            Contender::Engine {
                design: Design::OneSweep,
                ..
            } => "onesweep".to_string(),
            Contender::Engine {
                design,
                scan: ScanKind::TwoLevel,
            } => design.name().to_string(),
            Contender::Engine { design, scan } => format!("{}-{}", design.name(), scan.name()),
            Contender::StdSort => "std".to_string(),
            Contender::RayonSort => "rayon".to_string(),
        }
    }

    pub fn from_name(name: &str) -> Result<Contender, BenchError> {
        Contender::ALL
            .into_iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| BenchError::UnknownContender {
                name: name.to_string(),
                available: Contender::ALL
                    .iter()
                    .map(|c| c.name())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}

/// Per-sort engine details worth reporting next to the timings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EngineSummary {
    pub backend: BackendKind,
    pub variant: &'static str,
    pub probed_width: u32,
    pub partitions: u32,
    pub passes: u32,
    pub dispatches: usize,
    /// Time spent inside dispatches, excluding upload and readback.
    pub dispatch_us: u64,
    pub lookback_fallbacks: u32,
    pub lookback_stalls: u32,
}

impl From<&Diagnostics> for EngineSummary {
    fn from(d: &Diagnostics) -> Self {
        Self {
            backend: d.backend,
            variant: d.variant,
            probed_width: d.probed_width,
            partitions: d.partitions,
            passes: d.passes,
            dispatches: d.stages.len(),
            dispatch_us: d.dispatch_time().as_micros() as u64,
            lookback_fallbacks: d.lookback_fallbacks,
            lookback_stalls: d.lookback_stalls,
        }
    }
}

/// One contender at one size.
#[derive(Debug, Clone, Serialize)]
pub struct DataPoint {
    pub contender: String,
    pub distribution: Distribution,
    pub size: usize,
    /// Wall time per sort in milliseconds; `None` when the contender failed.
    pub stats: Option<Stats>,
    pub mkeys_per_sec: f64,
    /// `std` mean over this contender's mean.
    pub speedup_vs_std: Option<f64>,
    pub validated: bool,
    pub stable: bool,
    pub engine: Option<EngineSummary>,
    pub error: Option<String>,
}

impl DataPoint {
    fn failed(contender: &str, distribution: Distribution, size: usize, error: String) -> Self {
        Self {
            contender: contender.to_string(),
            distribution,
            size,
            stats: None,
            mkeys_per_sec: 0.0,
            speedup_vs_std: None,
            validated: false,
            stable: false,
            engine: None,
            error: Some(error),
        }
    }
}

/// Runs, warmups and input shape shared by every size.
#[derive(Clone, Debug, Serialize)]
pub struct BenchConfig {
    pub profile: Option<&'static str>,
    pub sizes: Vec<usize>,
    pub runs: u32,
    pub warmup: u32,
    pub distribution: Distribution,
    pub seed: u64,
}

enum Runner {
    Engine(Box<RadixEngine>),
    Std,
    Rayon,
}

impl Runner {
    fn sort(
        &mut self,
        keys: &[u32],
        payloads: &[u32],
    ) -> Result<(Vec<Record>, Option<EngineSummary>), BenchError> {
        match self {
            Runner::Engine(engine) => {
                let out = engine.sort(keys, payloads)?;
                let summary = EngineSummary::from(&out.diagnostics);
                Ok((out.pairs, Some(summary)))
            }
            Runner::Std => {
                let mut pairs = zip_records(keys, payloads);
                pairs.sort_by_key(|r| r.key);
                Ok((pairs, None))
            }
            Runner::Rayon => {
                let mut pairs = zip_records(keys, payloads);
                pairs.par_sort_by_key(|r| r.key);
                Ok((pairs, None))
            }
        }
    }
}

fn zip_records(keys: &[u32], payloads: &[u32]) -> Vec<Record> {
    keys.iter()
        .zip(payloads)
        .map(|(&key, &payload)| Record::new(key, payload))
        .collect()
}

/// A contender with its runner, or the reason it could not be built.
pub struct Contestant {
    pub contender: Contender,
    runner: Result<Runner, String>,
}

impl Contestant {
    /// Build the contender on `platform`. Engine construction failures are
    /// kept and reported per size instead of aborting the run.
    pub fn new(
        contender: Contender,
        platform: &Platform,
        variant: Option<&str>,
        max_keys: usize,
    ) -> Self {
        let runner = match contender {
            Contender::Engine { design, scan } => {
                let mut config = EngineConfig::new(design)
                    .with_scan(scan)
                    .with_max_keys(max_keys);
                if let Some(name) = variant {
                    config = config.with_variant(name);
                }
                platform
                    .engine(config)
                    .map(|engine| Runner::Engine(Box::new(engine)))
                    .map_err(|e| {
                        warn!(contender = %contender.name(), error = %e, "engine unavailable");
                        e.to_string()
                    })
            }
            Contender::StdSort => Ok(Runner::Std),
            Contender::RayonSort => Ok(Runner::Rayon),
        };
        Self { contender, runner }
    }

    pub fn is_available(&self) -> bool {
        self.runner.is_ok()
    }
}

/// Run every contestant at one size.
pub fn run_size(
    contestants: &mut [Contestant],
    size: usize,
    config: &BenchConfig,
    gen: &mut DataGenerator,
    progress: Option<&dyn Fn(&str)>,
) -> Vec<DataPoint> {
    let label = format_size(size);
    let report = |msg: String| {
        if let Some(cb) = progress {
            cb(&msg);
        }
    };
    let keys = gen.keys(config.distribution, size);
    let payloads = positions(size);

    // First sort of every contender doubles as validation input.
    report(format!("{label}: validating"));
    let first: Vec<Result<(Vec<Record>, Option<EngineSummary>), String>> = contestants
        .iter_mut()
        .map(|c| match &mut c.runner {
            Ok(runner) => runner.sort(&keys, &payloads).map_err(|e| e.to_string()),
            Err(reason) => Err(reason.clone()),
        })
        .collect();
    let outputs: Vec<&[Record]> = first
        .iter()
        .filter_map(|r| r.as_ref().ok().map(|(pairs, _)| pairs.as_slice()))
        .collect();
    let validation = cross_validate(&keys, &outputs);
    if !validation.all_match {
        warn!(size, "contenders disagree on sorted output");
    }

    let mut results = Vec::with_capacity(contestants.len());
    let mut valid_index = 0;
    for (contestant, first) in contestants.iter_mut().zip(first) {
        let name = contestant.contender.name();
        let (pairs, engine) = match first {
            Ok(done) => done,
            Err(error) => {
                results.push(DataPoint::failed(&name, config.distribution, size, error));
                continue;
            }
        };
        let validated = validation.against_reference[valid_index].matches
            && validation.against_first[valid_index].matches;
        valid_index += 1;
        let stable = is_stable(&pairs);

        let Ok(runner) = &mut contestant.runner else {
            continue;
        };
        report(format!(
            "{name} @ {label}: {} warmup + {} measured runs",
            config.warmup, config.runs
        ));
        let samples = match timed_runs(config.warmup, config.runs, || {
            runner.sort(&keys, &payloads).map(|_| ())
        }) {
            Ok(samples) => samples,
            Err(error) => {
                results.push(DataPoint::failed(&name, config.distribution, size, error));
                continue;
            }
        };

        let stats = Stats::from_samples(&samples);
        debug!(contender = %name, size, mean_ms = stats.mean, validated, "measured");
        results.push(DataPoint {
            contender: name,
            distribution: config.distribution,
            size,
            mkeys_per_sec: mkeys_per_sec(size, stats.mean),
            stats: Some(stats),
            speedup_vs_std: None,
            validated,
            stable,
            engine,
            error: None,
        });
    }

    let std_mean = results
        .iter()
        .find(|dp| dp.contender == Contender::StdSort.name())
        .and_then(|dp| dp.stats.as_ref())
        .map(|s| s.mean);
    if let Some(base) = std_mean {
        for dp in &mut results {
            if let Some(stats) = dp.stats.as_ref().filter(|s| s.mean > 0.0) {
                dp.speedup_vs_std = Some(base / stats.mean);
            }
        }
    }
    results
}

/// Run `sort` `warmup` times untimed, then `runs` times timed.
///
/// The first failure, warmup or measured, ends the loop and is returned.
fn timed_runs<E: std::fmt::Display>(
    warmup: u32,
    runs: u32,
    mut sort: impl FnMut() -> Result<(), E>,
) -> Result<Vec<f64>, String> {
    for _ in 0..warmup {
        sort().map_err(|e| format!("warmup: {e}"))?;
    }
    let mut samples = Vec::with_capacity(runs as usize);
    for _ in 0..runs {
        let timer = BenchTimer::start();
        sort().map_err(|e| e.to_string())?;
        samples.push(timer.stop());
    }
    Ok(samples)
}

/// Number of results that are failed, unvalidated, or unstable.
pub fn count_failures(data: &[DataPoint]) -> usize {
    data.iter()
        .filter(|dp| dp.error.is_some() || !dp.validated || !dp.stable)
        .count()
}
