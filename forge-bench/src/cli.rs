use clap::{Parser, ValueEnum};
use forge_compute::{DeviceProfile, DispatchOrder};

use crate::data_gen::Distribution;
use crate::error::BenchError;

/// Which device the engine contenders sort on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum BackendChoice {
    /// The GPU when an adapter opens, else the software device.
    #[default]
    Auto,
    Gpu,
    /// The software device described by --device.
    Sim,
}

/// Cross-validate and time the radix sort engines on a GPU or a software compute device
#[derive(Parser, Debug)]
#[command(name = "forge-bench", version, about)]
pub struct BenchArgs {
    /// Contenders to run (e.g. onesweep multipass8-lookback std).
    /// Omit to run all of them.
    #[arg(value_name = "CONTENDERS")]
    pub contenders: Vec<String>,

    /// Key counts to benchmark (e.g. 64K, 1M, 100000)
    #[arg(long, value_delimiter = ',')]
    pub sizes: Option<Vec<String>>,

    /// Number of measured runs per size
    #[arg(long, default_value_t = 5)]
    pub runs: u32,

    /// Number of warmup runs before measurement
    #[arg(long, default_value_t = 1)]
    pub warmup: u32,

    /// Benchmark profile: quick, standard, thorough
    #[arg(long)]
    pub profile: Option<String>,

    /// Where the engines run
    #[arg(long, value_enum, default_value_t = BackendChoice::Auto)]
    pub backend: BackendChoice,

    /// Device preset: warp32, wave64, simd32, simd16
    #[arg(long, default_value = "warp32")]
    pub device: String,

    /// Override the device's native subgroup width
    #[arg(long)]
    pub subgroup_width: Option<u32>,

    /// Dedicated worker threads for group execution
    #[arg(long)]
    pub workers: Option<usize>,

    /// Hand groups to workers in a seeded shuffled order
    #[arg(long)]
    pub shuffle_seed: Option<u64>,

    /// Force a kernel variant (w32, w16, w8) instead of probing
    #[arg(long)]
    pub variant: Option<String>,

    /// Key distribution
    #[arg(long, value_enum, default_value_t = Distribution::Uniform)]
    pub distribution: Distribution,

    /// Seed for key generation
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Write JSON results to file
    #[arg(long)]
    pub json_file: Option<String>,

    /// Disable the progress spinner
    #[arg(long)]
    pub quiet: bool,
}

impl BenchArgs {
    /// Device profile from the preset plus any overrides.
    pub fn device_profile(&self) -> Result<DeviceProfile, BenchError> {
        let mut profile = DeviceProfile::preset(&self.device)
            .ok_or_else(|| BenchError::UnknownDevice(self.device.clone()))?;
        if let Some(width) = self.subgroup_width {
            profile = profile.with_subgroup_width(width);
        }
        if let Some(threads) = self.workers {
            profile = profile.with_worker_threads(threads);
        }
        if let Some(seed) = self.shuffle_seed {
            profile = profile.with_dispatch_order(DispatchOrder::Shuffled { seed });
        }
        Ok(profile)
    }
}
