mod cli;
mod config;
mod data_gen;
mod error;
mod harness;
mod output;
mod stats;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use forge_compute::{Device, GpuDevice};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use cli::{BackendChoice, BenchArgs};
use config::{format_size, get_profile, parse_sizes};
use data_gen::DataGenerator;
use error::BenchError;
use harness::{count_failures, run_size, BenchConfig, Contender, Contestant, DataPoint, Platform};
use output::progress::BenchProgress;
use output::table::render_table;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(BenchArgs::parse()) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn resolve_config(args: &BenchArgs) -> Result<BenchConfig, BenchError> {
    let profile = args.profile.as_deref().map(get_profile).transpose()?;

    // --sizes beats --profile beats the default.
    let sizes = match (&args.sizes, &profile) {
        (Some(raw), _) => parse_sizes(raw)?,
        (None, Some(p)) => p.sizes.clone(),
        (None, None) => vec![1_000_000],
    };
    // Explicit --runs/--warmup beat the profile.
    let (runs, warmup) = match &profile {
        Some(p) => (
            if args.runs != 5 { args.runs } else { p.runs },
            if args.warmup != 1 { args.warmup } else { p.warmup },
        ),
        None => (args.runs, args.warmup),
    };
    Ok(BenchConfig {
        profile: profile.map(|p| p.name),
        sizes,
        runs,
        warmup,
        distribution: args.distribution,
        seed: args.seed,
    })
}

fn open_platform(args: &BenchArgs) -> Result<Platform, BenchError> {
    let simulated = || -> Result<Platform, BenchError> {
        Ok(Platform::Simulated(Arc::new(Device::new(args.device_profile()?)?)))
    };
    match args.backend {
        BackendChoice::Sim => simulated(),
        BackendChoice::Gpu => Ok(Platform::Gpu(Arc::new(GpuDevice::new()?))),
        BackendChoice::Auto => match GpuDevice::new() {
            Ok(gpu) => Ok(Platform::Gpu(Arc::new(gpu))),
            Err(e) => {
                warn!(error = %e, "no usable GPU adapter, using the software device");
                simulated()
            }
        },
    }
}

fn run(args: BenchArgs) -> Result<(), BenchError> {
    let config = resolve_config(&args)?;
    let contenders = if args.contenders.is_empty() {
        Contender::ALL.to_vec()
    } else {
        args.contenders
            .iter()
            .map(|name| Contender::from_name(name))
            .collect::<Result<Vec<_>, _>>()?
    };

    let platform = open_platform(&args)?;
    let hardware = platform.hardware()?;

    println!("forge-bench: radix sort engines on the {} backend", platform.backend());
    println!("  Hardware: {}", hardware.summary());
    println!(
        "  Contenders: {}",
        contenders.iter().map(|c| c.name()).collect::<Vec<_>>().join(", ")
    );
    println!(
        "  Sizes: {}",
        config.sizes.iter().map(|&s| format_size(s)).collect::<Vec<_>>().join(", ")
    );
    println!(
        "  Distribution: {}, Runs: {}, Warmup: {}",
        config.distribution.name(),
        config.runs,
        config.warmup
    );
    if let Some(path) = &args.json_file {
        println!("  JSON output: {path}");
    }

    let max_keys = config.sizes.iter().copied().max().unwrap_or(1).max(1);
    let mut contestants: Vec<Contestant> = contenders
        .into_iter()
        .map(|c| Contestant::new(c, &platform, args.variant.as_deref(), max_keys))
        .collect();
    for c in contestants.iter().filter(|c| !c.is_available()) {
        println!("  Unavailable: {}", c.contender.name());
    }
    println!();

    let progress = if args.quiet {
        BenchProgress::hidden()
    } else {
        BenchProgress::new()
    };
    let mut gen = DataGenerator::new(config.seed);
    let mut results: Vec<DataPoint> = Vec::new();
    for &size in &config.sizes {
        let cb = progress.callback();
        results.extend(run_size(&mut contestants, size, &config, &mut gen, Some(&cb)));
    }
    progress.finish();

    render_table(
        &format!("{} keys on {}", config.distribution.name(), hardware.device_name),
        &results,
    );

    if let Some(path) = &args.json_file {
        output::json::write_json(Path::new(path), &results, &hardware, &config)?;
        println!("JSON results written to: {path}");
    }

    match count_failures(&results) {
        0 => Ok(()),
        n => Err(BenchError::ValidationFailed(n)),
    }
}
