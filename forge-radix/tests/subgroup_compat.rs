mod common;

use common::{assert_valid_sort, configurations, device, engine, positions, random_keys};
use forge_compute::DeviceProfile;
use forge_radix::{Design, EngineConfig, RadixEngine, RecoveryAction, ScanKind, SortError, Stage};

#[test]
fn test_every_width_sorts_with_auto_variant() {
    let n = 9_000;
    let keys = random_keys(n, 21);
    let payloads = positions(n);
    for width in [8u32, 16, 32, 64] {
        let profile = DeviceProfile::amd_wave64().with_subgroup_width(width);
        for (design, scan) in configurations() {
            let mut engine = engine(profile.clone(), design, scan, n);
            let out = engine.sort(&keys, &payloads).unwrap();
            assert_valid_sort(&keys, &payloads, &out.pairs, &format!("width {width} {design}/{scan}"));
            assert!(out
                .diagnostics
                .stages
                .iter()
                .all(|s| s.subgroup_width == width));
        }
    }
}

#[test]
fn test_forced_wide_variant_on_narrow_device_is_rejected() {
    let keys = random_keys(5000, 2);
    let payloads = positions(5000);
    for design in Design::ALL {
        let config = EngineConfig::new(design).with_variant("w32").with_max_keys(5000);
        let mut engine = RadixEngine::new(device(DeviceProfile::intel_like()), config).unwrap();
        let err = engine.sort(&keys, &payloads).unwrap_err();
        match &err {
            SortError::CapabilityMismatch {
                observed_width,
                required_width,
                variant,
                ..
            } => {
                assert_eq!(*observed_width, 16);
                assert_eq!(*required_width, 32);
                assert_eq!(*variant, "w32");
            }
            other => panic!("{design}: expected capability mismatch, got {other:?}"),
        }
        assert_eq!(
            err.recovery(),
            RecoveryAction::UseNarrowerVariant { variant: "w16" }
        );
    }
}

#[test]
fn test_forced_variant_is_rejected_at_every_size() {
    for design in Design::ALL {
        let config = EngineConfig::new(design).with_variant("w32").with_max_keys(16);
        let mut engine = RadixEngine::new(device(DeviceProfile::intel_like()), config).unwrap();
        for n in [0usize, 1, 2] {
            let keys = random_keys(n, n as u64);
            let err = engine.sort(&keys, &positions(n)).unwrap_err();
            match err {
                SortError::CapabilityMismatch {
                    stage,
                    observed_width: 16,
                    required_width: 32,
                    variant: "w32",
                } => assert_eq!(stage, design.first_stage(), "{design} n={n}"),
                other => panic!("{design} n={n}: expected capability mismatch, got {other:?}"),
            }
        }
    }
}

#[test]
fn test_pipeline_width_divergence_is_detected_then_recovered() {
    let n = 6000;
    let keys = random_keys(n, 4);
    let payloads = positions(n);
    let profile = DeviceProfile::nvidia_like().with_pipeline_width("split_scatter", 16);

    let mut engine = engine(profile.clone(), Design::MultiPass4, ScanKind::TwoLevel, n);
    assert_eq!(engine.probed_width(), 32);
    assert_eq!(engine.variant().name(), "w32");
    let err = engine.sort(&keys, &payloads).unwrap_err();
    assert!(matches!(
        err,
        SortError::CapabilityMismatch {
            stage: Stage::Scatter,
            observed_width: 16,
            required_width: 32,
            ..
        }
    ));

    let RecoveryAction::UseNarrowerVariant { variant } = err.recovery() else {
        panic!("expected a narrower variant, got {:?}", err.recovery());
    };
    let config = EngineConfig::new(Design::MultiPass4)
        .with_variant(variant)
        .with_max_keys(n);
    let mut recovered = RadixEngine::new(device(profile), config).unwrap();
    let out = recovered.sort(&keys, &payloads).unwrap();
    assert_valid_sort(&keys, &payloads, &out.pairs, "recovered");
    assert_eq!(out.diagnostics.probed_width, 32);
    assert_eq!(out.diagnostics.observed_width(Stage::Scatter), Some(16));
    assert_eq!(out.diagnostics.observed_width(Stage::Histogram), Some(32));
}

#[test]
fn test_fused_kernel_divergence_aborts_onesweep() {
    let profile = DeviceProfile::nvidia_like().with_pipeline_width("onesweep", 8);
    let mut engine = engine(profile, Design::OneSweep, ScanKind::Lookback, 8192);
    let keys = random_keys(8192, 8);
    let err = engine.sort(&keys, &positions(8192)).unwrap_err();
    assert!(matches!(
        err,
        SortError::CapabilityMismatch {
            stage: Stage::OneSweep,
            observed_width: 8,
            ..
        }
    ));
    assert_eq!(err.recovery(), RecoveryAction::UseNarrowerVariant { variant: "w8" });
}

#[test]
fn test_narrow_width_overflows_small_shared_memory() {
    let profile = DeviceProfile::apple_like().with_subgroup_width(8);
    let keys = random_keys(10_000, 6);
    let payloads = positions(10_000);

    let mut onesweep = engine(profile.clone(), Design::OneSweep, ScanKind::Lookback, 10_000);
    assert_eq!(onesweep.variant().name(), "w8");
    let err = onesweep.sort(&keys, &payloads).unwrap_err();
    match err {
        SortError::CapacityOverflow {
            stage,
            observed_width,
            required_words,
            available_words,
        } => {
            assert_eq!(stage, Stage::OneSweep);
            assert_eq!(observed_width, 8);
            assert_eq!(required_words, 32 * 256 + 2 * 256);
            assert_eq!(available_words, 8192);
        }
        ref other => panic!("expected capacity overflow, got {other:?}"),
    }
    assert_eq!(err.recovery(), RecoveryAction::RejectHardware);

    // the multi-pass kernels fit the same device
    let mut multipass = engine(profile, Design::MultiPass8, ScanKind::TwoLevel, 10_000);
    let out = multipass.sort(&keys, &payloads).unwrap();
    assert_valid_sort(&keys, &payloads, &out.pairs, "multipass8 at width 8");
}

#[test]
fn test_scatter_overflows_when_shared_memory_shrinks() {
    let profile = DeviceProfile::nvidia_like().with_max_shared_bytes(16 * 1024);
    let mut engine = engine(profile, Design::MultiPass8, ScanKind::TwoLevel, 5000);
    let keys = random_keys(5000, 12);
    let err = engine.sort(&keys, &positions(5000)).unwrap_err();
    assert!(matches!(
        err,
        SortError::CapacityOverflow {
            stage: Stage::Scatter,
            observed_width: 32,
            available_words: 4096,
            ..
        }
    ));
    assert!(err.is_kernel_fault());
}

#[test]
fn test_width_four_has_no_variant() {
    let profile = DeviceProfile::nvidia_like().with_subgroup_width(4);
    let err = RadixEngine::new(device(profile), EngineConfig::default()).unwrap_err();
    assert!(matches!(err, SortError::NoCompatibleVariant { width: 4 }));
    assert_eq!(err.recovery(), RecoveryAction::RejectHardware);
}

#[test]
fn test_unknown_variant_name() {
    let config = EngineConfig::default().with_variant("w64");
    let err = RadixEngine::new(device(DeviceProfile::amd_wave64()), config).unwrap_err();
    assert!(matches!(err, SortError::UnknownVariant(ref name) if name == "w64"));
    assert_eq!(err.recovery(), RecoveryAction::None);
}

#[test]
fn test_fault_does_not_poison_next_sort() {
    let profile = DeviceProfile::nvidia_like().with_pipeline_width("split_scatter", 16);
    let config = EngineConfig::new(Design::MultiPass8)
        .with_variant("w16")
        .with_max_keys(4096);
    let mut engine = RadixEngine::new(device(profile), config).unwrap();
    let keys = random_keys(4096, 30);
    let payloads = positions(4096);
    for _ in 0..3 {
        let out = engine.sort(&keys, &payloads).unwrap();
        assert_valid_sort(&keys, &payloads, &out.pairs, "w16 engine");
    }
}
