//! Sort errors and their recovery actions.
//!
//! | Error                 | Recovery                                        |
//! |-----------------------|-------------------------------------------------|
//! | LengthMismatch        | Caller bug, nothing to retry                    |
//! | TooManyKeys           | Split the input or raise `max_keys`             |
//! | CapabilityMismatch    | Rebuild with a variant for a narrower width     |
//! | CapacityOverflow      | Reject the hardware                             |
//! | NoCompatibleVariant   | Reject the hardware                             |
//! | UnknownVariant        | Caller bug, nothing to retry                    |
//! | Device                | Reject the hardware                             |
//!
//! Kernel faults are deterministic for a device/variant pairing, so no
//! recovery retries the same configuration.

use std::fmt;

use forge_compute::DeviceError;
use serde::{Deserialize, Serialize};

use crate::compat::KernelVariant;

/// Kernel stages of the sort pipelines. The discriminant is what kernels
/// write into the error register.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    GlobalHistogram = 1,
    DigitBase = 2,
    Histogram = 3,
    ScanReduce = 4,
    ScanSpine = 5,
    ScanAddBack = 6,
    LookbackScan = 7,
    Scatter = 8,
    OneSweep = 9,
    Reset = 10,
}

impl Stage {
    pub const ALL: [Stage; 10] = [
        Stage::GlobalHistogram,
        Stage::DigitBase,
        Stage::Histogram,
        Stage::ScanReduce,
        Stage::ScanSpine,
        Stage::ScanAddBack,
        Stage::LookbackScan,
        Stage::Scatter,
        Stage::OneSweep,
        Stage::Reset,
    ];

    /// Kernel entry point name; also the pipeline label.
    pub const fn label(self) -> &'static str {
        match self {
            Stage::GlobalHistogram => "global_histogram",
            Stage::DigitBase => "digit_base",
            Stage::Histogram => "digit_histogram",
            Stage::ScanReduce => "scan_reduce",
            Stage::ScanSpine => "scan_spine",
            Stage::ScanAddBack => "scan_add_back",
            Stage::LookbackScan => "lookback_scan",
            Stage::Scatter => "split_scatter",
            Stage::OneSweep => "onesweep",
            Stage::Reset => "reset_lookback",
        }
    }

    pub const fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Stage> {
        Stage::ALL.into_iter().find(|s| s.code() == code)
    }

    /// Position in [`Stage::ALL`].
    pub(crate) const fn index(self) -> usize {
        self as usize - 1
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SortError {
    #[error("length mismatch: keys={keys}, payloads={payloads}")]
    LengthMismatch { keys: usize, payloads: usize },
    #[error("too many keys: {count} exceeds the engine maximum of {max}")]
    TooManyKeys { count: usize, max: usize },
    #[error(
        "capability mismatch in {stage}: subgroup width {observed_width} is below the \
         minimum {required_width} of variant {variant}"
    )]
    CapabilityMismatch {
        stage: Stage,
        observed_width: u32,
        required_width: u32,
        variant: &'static str,
    },
    #[error(
        "capacity overflow in {stage}: subgroup width {observed_width} needs {required_words} \
         shared words but only {available_words} are allocated"
    )]
    CapacityOverflow {
        stage: Stage,
        observed_width: u32,
        required_words: u32,
        available_words: u32,
    },
    #[error("no compiled variant supports subgroup width {width}")]
    NoCompatibleVariant { width: u32 },
    #[error("unknown kernel variant: {0}")]
    UnknownVariant(String),
    #[error("compute device error: {0}")]
    Device(#[from] DeviceError),
}

/// How a caller should react to a [`SortError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Nothing to recover; the request itself was invalid.
    None,
    /// Rebuild the engine with this variant and run again.
    UseNarrowerVariant { variant: &'static str },
    /// The device cannot run these kernels.
    RejectHardware,
}

impl SortError {
    pub fn recovery(&self) -> RecoveryAction {
        match self {
            SortError::LengthMismatch { .. }
            | SortError::TooManyKeys { .. }
            | SortError::UnknownVariant(_) => RecoveryAction::None,
            SortError::CapabilityMismatch {
                observed_width,
                variant,
                ..
            } => match KernelVariant::select(*observed_width) {
                Ok(narrower) if narrower.name() != *variant => RecoveryAction::UseNarrowerVariant {
                    variant: narrower.name(),
                },
                _ => RecoveryAction::RejectHardware,
            },
            SortError::CapacityOverflow { .. }
            | SortError::NoCompatibleVariant { .. }
            | SortError::Device(_) => RecoveryAction::RejectHardware,
        }
    }

    /// Whether this error was raised by a kernel through the error register.
    pub fn is_kernel_fault(&self) -> bool {
        matches!(
            self,
            SortError::CapabilityMismatch { .. } | SortError::CapacityOverflow { .. }
        )
    }
}
