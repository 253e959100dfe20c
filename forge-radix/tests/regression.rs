mod common;

use common::{assert_stable, assert_valid_sort, configurations, device, engine, positions, random_keys};
use forge_compute::{DeviceProfile, DispatchOrder};
use forge_radix::validate::reference_sort_pairs;
use forge_radix::{Design, EngineConfig, RadixEngine, Record, ScanKind, SpinPolicy};

#[test]
fn test_scratch_reuse_across_sizes() {
    let sizes = [30_000, 17, 4097, 1, 30_000, 2048, 0, 12_000];
    for (design, scan) in configurations() {
        let mut engine = engine(DeviceProfile::nvidia_like(), design, scan, 30_000);
        for (i, &n) in sizes.iter().enumerate() {
            let keys = random_keys(n, 1000 + i as u64);
            let payloads = positions(n);
            let out = engine.sort(&keys, &payloads).unwrap();
            assert_valid_sort(&keys, &payloads, &out.pairs, &format!("{design}/{scan} run {i} n={n}"));
        }
    }
}

#[test]
fn test_small_sort_after_large_sees_no_stale_keys() {
    let mut engine = engine(DeviceProfile::amd_wave64(), Design::OneSweep, ScanKind::Lookback, 50_000);
    let large: Vec<u32> = vec![0; 50_000];
    engine.sort(&large, &positions(50_000)).unwrap();
    let small = [9u32, 8, 7];
    let out = engine.sort(&small, &[0, 1, 2]).unwrap();
    assert_eq!(
        out.pairs,
        vec![Record::new(7, 2), Record::new(8, 1), Record::new(9, 0)]
    );
}

#[test]
fn test_two_workers_many_partitions() {
    let n = 120_000;
    let keys = random_keys(n, 55);
    let payloads = positions(n);
    let profile = DeviceProfile::intel_like().with_worker_threads(2);
    for (design, scan) in configurations() {
        let mut engine = engine(profile.clone(), design, scan, n);
        let out = engine.sort(&keys, &payloads).unwrap();
        let context = format!("{design}/{scan} on 2 workers");
        assert_valid_sort(&keys, &payloads, &out.pairs, &context);
        assert_stable(&out.pairs, &context);
    }
}

#[test]
fn test_impatient_lookback_still_sorts() {
    let n = 60_000;
    let keys = random_keys(n, 8);
    let payloads = positions(n);
    let expected = reference_sort_pairs(&keys, &payloads);
    for publish_fallback in [true, false] {
        let spin = SpinPolicy {
            spin_limit: 0,
            yield_every: 0,
            publish_fallback,
        };
        for design in [Design::MultiPass8, Design::OneSweep] {
            let profile = DeviceProfile::nvidia_like()
                .with_dispatch_order(DispatchOrder::Shuffled { seed: 17 })
                .with_worker_threads(4);
            let config = EngineConfig::new(design)
                .with_scan(ScanKind::Lookback)
                .with_spin_policy(spin)
                .with_max_keys(n);
            let mut engine = RadixEngine::new(device(profile), config).unwrap();
            let out = engine.sort(&keys, &payloads).unwrap();
            assert_eq!(out.pairs, expected, "{design} publish_fallback={publish_fallback}");
            assert!(out.diagnostics.lookback_fallbacks <= out.diagnostics.lookback_stalls);
        }
    }
}

#[test]
fn test_single_worker_never_stalls() {
    let n = 40_000;
    let keys = random_keys(n, 66);
    let profile = DeviceProfile::nvidia_like()
        .with_dispatch_order(DispatchOrder::Descending)
        .with_worker_threads(1);
    let mut engine = engine(profile, Design::OneSweep, ScanKind::Lookback, n);
    let out = engine.sort(&keys, &positions(n)).unwrap();
    assert_valid_sort(&keys, &positions(n), &out.pairs, "single worker");
    assert_eq!(out.diagnostics.lookback_stalls, 0);
    assert_eq!(out.diagnostics.lookback_fallbacks, 0);
}

#[test]
fn test_high_bits_only_keys() {
    let n = 8000;
    let keys: Vec<u32> = random_keys(n, 70).into_iter().map(|k| k & 0xFF00_0000).collect();
    let payloads = positions(n);
    for (design, scan) in configurations() {
        let mut engine = engine(DeviceProfile::apple_like(), design, scan, n);
        let out = engine.sort(&keys, &payloads).unwrap();
        let context = format!("{design}/{scan}");
        assert_valid_sort(&keys, &payloads, &out.pairs, &context);
        assert_stable(&out.pairs, &context);
    }
}

#[test]
fn test_record_layout() {
    assert_eq!(std::mem::size_of::<Record>(), 8);
    assert_eq!(std::mem::align_of::<Record>(), 4);
}
