//! WGSL source of each sort kernel.
//!
//! A kernel's source is a generated prelude (status register layout,
//! lookback cell encoding, control words), `common.wgsl`, `lookback.wgsl`
//! for the two kernels that run a lookback, and the kernel's own file.
//! [`GpuDevice::create_pipeline`](forge_compute::GpuDevice::create_pipeline)
//! puts the pipeline header in front of all of it.

use crate::error::Stage;
use crate::scan::lookback::{CellFlag, FLAG_SHIFT, VALUE_MASK};
use crate::status::{FaultClass, CAPABILITY_MISMATCH, CAPACITY_OVERFLOW, SLOT_WORDS, STATUS_WORDS};

use super::{FALLBACKS, STALLS, TICKET};

const COMMON: &str = include_str!("../../shaders/common.wgsl");
const LOOKBACK: &str = include_str!("../../shaders/lookback.wgsl");

fn kernel_file(stage: Stage) -> &'static str {
    match stage {
        Stage::GlobalHistogram => include_str!("../../shaders/global_histogram.wgsl"),
        Stage::DigitBase => include_str!("../../shaders/digit_base.wgsl"),
        Stage::Histogram => include_str!("../../shaders/digit_histogram.wgsl"),
        Stage::ScanReduce => include_str!("../../shaders/scan_reduce.wgsl"),
        Stage::ScanSpine => include_str!("../../shaders/scan_spine.wgsl"),
        Stage::ScanAddBack => include_str!("../../shaders/scan_add_back.wgsl"),
        Stage::LookbackScan => include_str!("../../shaders/lookback_scan.wgsl"),
        Stage::Scatter => include_str!("../../shaders/split_scatter.wgsl"),
        Stage::OneSweep => include_str!("../../shaders/onesweep.wgsl"),
        Stage::Reset => include_str!("../../shaders/reset_lookback.wgsl"),
    }
}

/// Whether `stage` walks lookback cells and so takes the spin policy.
pub fn uses_lookback(stage: Stage) -> bool {
    matches!(stage, Stage::LookbackScan | Stage::OneSweep)
}

/// Constants shared by the host and every kernel.
pub fn prelude() -> String {
    let constants = [
        ("CAPABILITY_MISMATCH", CAPABILITY_MISMATCH),
        ("CAPACITY_OVERFLOW", CAPACITY_OVERFLOW),
        ("MISMATCH_SLOT", FaultClass::CapabilityMismatch.slot() as u32),
        ("OVERFLOW_SLOT", FaultClass::CapacityOverflow.slot() as u32),
        ("SLOT_WORDS", SLOT_WORDS as u32),
        ("WIDTH_TABLE", STATUS_WORDS as u32),
        ("FLAG_SHIFT", FLAG_SHIFT),
        ("VALUE_MASK", VALUE_MASK),
        ("NOT_READY", CellFlag::NotReady as u32),
        ("AGGREGATE", CellFlag::Aggregate as u32),
        ("INCLUSIVE", CellFlag::Inclusive as u32),
        ("TICKET", TICKET as u32),
        ("FALLBACKS", FALLBACKS as u32),
        ("STALLS", STALLS as u32),
    ];
    let mut prelude = String::new();
    for (name, value) in constants {
        prelude.push_str(&format!("const {name}: u32 = {value}u;\n"));
    }
    prelude
}

/// Full source of `stage`'s kernel, minus the pipeline header.
pub fn kernel_source(stage: Stage) -> String {
    let mut source = prelude();
    source.push_str(COMMON);
    if uses_lookback(stage) {
        source.push_str(LOOKBACK);
    }
    source.push_str(kernel_file(stage));
    source
}
