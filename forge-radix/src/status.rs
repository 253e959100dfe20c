//! Error/status register written by kernels that detect a violated precondition.
//!
//! One slot per failure class, each slot `[sentinel, stage, observed_width, required]`.
//! The first group to claim a slot (compare-and-swap on the sentinel word)
//! fills in the details; later reporters of the same class are dropped.
//! The host reads the register after every dispatch. The GPU backend keeps
//! the same slots in a device buffer and decodes its words with
//! [`decode_faults`].

use forge_compute::DeviceBuffer;

use crate::error::Stage;

/// Words per slot.
pub const SLOT_WORDS: usize = 4;
/// Words of the whole register.
pub const STATUS_WORDS: usize = FaultClass::ALL.len() * SLOT_WORDS;

/// Sentinel marking a capability mismatch (width below the variant minimum).
pub const CAPABILITY_MISMATCH: u32 = 0xE5C0_0001;
/// Sentinel marking a capacity overflow (shared memory too small at the runtime width).
pub const CAPACITY_OVERFLOW: u32 = 0xE5C0_0002;

/// Failure classes, in slot order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultClass {
    CapabilityMismatch,
    CapacityOverflow,
}

impl FaultClass {
    pub const ALL: [FaultClass; 2] = [FaultClass::CapabilityMismatch, FaultClass::CapacityOverflow];

    pub const fn sentinel(self) -> u32 {
        match self {
            FaultClass::CapabilityMismatch => CAPABILITY_MISMATCH,
            FaultClass::CapacityOverflow => CAPACITY_OVERFLOW,
        }
    }

    pub const fn slot(self) -> usize {
        match self {
            FaultClass::CapabilityMismatch => 0,
            FaultClass::CapacityOverflow => 1,
        }
    }
}

/// A fault reported by a kernel instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelFault {
    pub class: FaultClass,
    pub stage: Stage,
    pub observed_width: u32,
    /// Minimum width for a capability mismatch, needed words for a capacity overflow.
    pub required: u32,
}

/// The device-side register plus host accessors.
#[derive(Debug)]
pub struct StatusRegister {
    buffer: DeviceBuffer,
}

impl Default for StatusRegister {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusRegister {
    pub fn new() -> Self {
        Self {
            buffer: DeviceBuffer::new("error_register", STATUS_WORDS),
        }
    }

    /// Clear every slot. Must run before each sort.
    pub fn reset(&self) {
        self.buffer.fill(0);
    }

    /// Kernel side: record `fault` unless its slot is already claimed.
    pub fn raise(&self, fault: KernelFault) {
        let base = fault.class.slot() * SLOT_WORDS;
        if self
            .buffer
            .compare_exchange(base, 0, fault.class.sentinel())
            .is_ok()
        {
            self.buffer.store(base + 1, fault.stage.code());
            self.buffer.store(base + 2, fault.observed_width);
            self.buffer.store(base + 3, fault.required);
        }
    }

    /// Host side: all recorded faults, in slot order.
    pub fn faults(&self) -> Vec<KernelFault> {
        decode_faults(&self.buffer.to_vec())
    }

    /// Host side: the first recorded fault, if any.
    pub fn first_fault(&self) -> Option<KernelFault> {
        self.faults().into_iter().next()
    }

    /// Raw register words.
    pub fn words(&self) -> Vec<u32> {
        self.buffer.to_vec()
    }
}

/// Faults recorded in raw register `words`, in slot order. Slots with an
/// unknown sentinel or stage code are skipped.
pub fn decode_faults(words: &[u32]) -> Vec<KernelFault> {
    FaultClass::ALL
        .into_iter()
        .filter_map(|class| {
            let slot = words.get(class.slot() * SLOT_WORDS..(class.slot() + 1) * SLOT_WORDS)?;
            if slot[0] != class.sentinel() {
                return None;
            }
            Some(KernelFault {
                class,
                stage: Stage::from_code(slot[1])?,
                observed_width: slot[2],
                required: slot[3],
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mismatch(stage: Stage, width: u32) -> KernelFault {
        KernelFault {
            class: FaultClass::CapabilityMismatch,
            stage,
            observed_width: width,
            required: 32,
        }
    }

    #[test]
    fn test_empty_register_has_no_faults() {
        let reg = StatusRegister::new();
        assert!(reg.faults().is_empty());
        assert_eq!(reg.words(), vec![0; 8]);
    }

    #[test]
    fn test_first_writer_wins() {
        let reg = StatusRegister::new();
        reg.raise(mismatch(Stage::Histogram, 16));
        reg.raise(mismatch(Stage::Scatter, 8));
        let faults = reg.faults();
        assert_eq!(faults, vec![mismatch(Stage::Histogram, 16)]);
        assert_eq!(reg.words()[0], CAPABILITY_MISMATCH);
    }

    #[test]
    fn test_classes_use_separate_slots() {
        let reg = StatusRegister::new();
        reg.raise(KernelFault {
            class: FaultClass::CapacityOverflow,
            stage: Stage::OneSweep,
            observed_width: 8,
            required: 8704,
        });
        reg.raise(mismatch(Stage::Histogram, 16));
        let faults = reg.faults();
        assert_eq!(faults.len(), 2);
        assert_eq!(faults[0].class, FaultClass::CapabilityMismatch);
        assert_eq!(faults[1].required, 8704);
        assert_eq!(reg.first_fault().map(|f| f.stage), Some(Stage::Histogram));
    }

    #[test]
    fn test_reset_clears() {
        let reg = StatusRegister::new();
        reg.raise(mismatch(Stage::Histogram, 16));
        reg.reset();
        assert!(reg.first_fault().is_none());
    }

    #[test]
    fn test_decode_raw_words() {
        let mut words = vec![0u32; STATUS_WORDS];
        words[4..8].copy_from_slice(&[CAPACITY_OVERFLOW, Stage::Scatter.code(), 8, 4360]);
        assert_eq!(
            decode_faults(&words),
            vec![KernelFault {
                class: FaultClass::CapacityOverflow,
                stage: Stage::Scatter,
                observed_width: 8,
                required: 4360,
            }]
        );
        words[0..4].copy_from_slice(&[CAPABILITY_MISMATCH, 99, 8, 16]);
        assert_eq!(decode_faults(&words).len(), 1, "unknown stage code is skipped");
        assert!(decode_faults(&words[..3]).is_empty());
    }
}
