#![allow(dead_code)]

use std::sync::Arc;

use forge_compute::{Device, DeviceProfile, GpuDevice};
use forge_radix::validate::{is_sorted_by_key, is_stable, pairs_preserved, reference_sort};
use forge_radix::{Design, EngineConfig, RadixEngine, Record, ScanKind};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

pub fn random_keys(n: usize, seed: u64) -> Vec<u32> {
    let mut rng = seeded_rng(seed);
    (0..n).map(|_| rng.gen()).collect()
}

/// Keys drawn from `0..distinct`, so equal keys are common.
pub fn few_unique_keys(n: usize, distinct: u32, seed: u64) -> Vec<u32> {
    let mut rng = seeded_rng(seed);
    (0..n).map(|_| rng.gen_range(0..distinct)).collect()
}

/// Payload `i` for key `i`, so stability is checkable.
pub fn positions(n: usize) -> Vec<u32> {
    (0..n as u32).collect()
}

pub fn device(profile: DeviceProfile) -> Arc<Device> {
    Arc::new(Device::new(profile).unwrap())
}

/// The adapter, or `None` (with a note on stderr) where there is none, so
/// GPU tests pass vacuously on machines without one.
pub fn gpu() -> Option<Arc<GpuDevice>> {
    match GpuDevice::new() {
        Ok(gpu) => Some(Arc::new(gpu)),
        Err(e) => {
            eprintln!("skipping GPU test: {e}");
            None
        }
    }
}

pub fn engine(profile: DeviceProfile, design: Design, scan: ScanKind, max_keys: usize) -> RadixEngine {
    let config = EngineConfig::new(design).with_scan(scan).with_max_keys(max_keys);
    RadixEngine::new(device(profile), config).unwrap()
}

/// Every design with every scan strategy it can run.
pub fn configurations() -> Vec<(Design, ScanKind)> {
    vec![
        (Design::MultiPass4, ScanKind::TwoLevel),
        (Design::MultiPass4, ScanKind::Lookback),
        (Design::MultiPass8, ScanKind::TwoLevel),
        (Design::MultiPass8, ScanKind::Lookback),
        (Design::OneSweep, ScanKind::Lookback),
    ]
}

/// Sorted, a permutation of the input pairs, and stable for position payloads.
pub fn assert_valid_sort(keys: &[u32], payloads: &[u32], output: &[Record], context: &str) {
    assert_eq!(output.len(), keys.len(), "{context}: length");
    assert!(is_sorted_by_key(output), "{context}: not sorted");
    assert!(pairs_preserved(keys, payloads, output), "{context}: pairs not preserved");
    let sorted: Vec<u32> = output.iter().map(|r| r.key).collect();
    assert_eq!(sorted, reference_sort(keys), "{context}: differs from reference");
}

pub fn assert_stable(output: &[Record], context: &str) {
    assert!(is_stable(output), "{context}: equal keys reordered");
}
