//! Subgroup compatibility layer.
//!
//! Kernels are "compiled" in width-specialized variants, each sized for a
//! minimum subgroup width. The host picks a variant from the probed width
//! once per engine, sizes every pipeline's shared memory against that
//! variant's minimum (the worst case), and clamps it to what the device
//! offers. Because the executing width can still differ per pipeline, every
//! kernel group re-checks its own width through a [`Gate`] before touching
//! any sort buffer, and addresses shared memory with the runtime width.

use forge_compute::{
    subgroup_count, ComputePipeline, Device, DeviceError, DispatchInfo, GroupContext,
    PipelineCache, PipelineDesc,
};
use serde::Serialize;

use crate::error::{SortError, Stage};
use crate::layout::SortLayout;
use crate::status::{FaultClass, KernelFault, StatusRegister};

/// A width-specialized build of the sort kernels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct KernelVariant {
    name: &'static str,
    min_width: u32,
}

impl KernelVariant {
    pub const W32: KernelVariant = KernelVariant {
        name: "w32",
        min_width: 32,
    };
    pub const W16: KernelVariant = KernelVariant {
        name: "w16",
        min_width: 16,
    };
    pub const W8: KernelVariant = KernelVariant {
        name: "w8",
        min_width: 8,
    };

    /// Compiled variants, widest minimum first.
    pub const ALL: [KernelVariant; 3] = [Self::W32, Self::W16, Self::W8];

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn min_width(&self) -> u32 {
        self.min_width
    }

    pub fn by_name(name: &str) -> Result<Self, SortError> {
        Self::ALL
            .into_iter()
            .find(|v| v.name == name)
            .ok_or_else(|| SortError::UnknownVariant(name.to_string()))
    }

    /// The variant with the largest minimum that `width` still satisfies.
    pub fn select(width: u32) -> Result<Self, SortError> {
        Self::ALL
            .into_iter()
            .find(|v| v.min_width <= width)
            .ok_or(SortError::NoCompatibleVariant { width })
    }

    pub fn supports(&self, width: u32) -> bool {
        width >= self.min_width
    }
}

/// Runtime geometry of an admitted group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub width: u32,
    pub subgroups: u32,
}

/// Admission check run at the top of every kernel.
#[derive(Clone, Copy)]
pub struct Gate<'a> {
    pub stage: Stage,
    pub min_width: u32,
    pub layout: &'a SortLayout,
    pub status: &'a StatusRegister,
}

impl Gate<'_> {
    /// Returns the group's geometry, or raises a fault and returns `None`.
    ///
    /// A group that gets `None` must return without writing sort buffers.
    pub fn admit(&self, ctx: &GroupContext) -> Option<Geometry> {
        let width = ctx.subgroup_width();
        if width < self.min_width {
            self.status.raise(KernelFault {
                class: FaultClass::CapabilityMismatch,
                stage: self.stage,
                observed_width: width,
                required: self.min_width,
            });
            return None;
        }
        let required = self.layout.required_words(self.stage, width);
        if required > ctx.shared().len() {
            self.status.raise(KernelFault {
                class: FaultClass::CapacityOverflow,
                stage: self.stage,
                observed_width: width,
                required: required as u32,
            });
            return None;
        }
        Some(Geometry {
            width,
            subgroups: subgroup_count(ctx.group_size(), width),
        })
    }
}

/// Pipeline descriptor for `stage`: shared memory sized for the variant's
/// minimum width and clamped to `max_words`, with the layout and variant
/// baked in as constants.
pub fn stage_desc(
    stage: Stage,
    layout: &SortLayout,
    variant: KernelVariant,
    max_words: usize,
) -> PipelineDesc {
    let bound = layout.required_words(stage, variant.min_width).min(max_words);
    PipelineDesc::new(stage.label(), layout.group_size)
        .with_shared_words(bound)
        .with_constant("stage", stage.code())
        .with_constant("digit_bits", layout.digit.bits())
        .with_constant("rows", layout.rows_per_lane)
        .with_constant("min_width", variant.min_width)
}

/// Every pipeline of one variant and layout.
#[derive(Debug)]
pub struct KernelSet {
    variant: KernelVariant,
    layout: SortLayout,
    pipelines: Vec<ComputePipeline>,
}

impl KernelSet {
    pub fn build(
        device: &Device,
        cache: &mut PipelineCache,
        variant: KernelVariant,
        layout: SortLayout,
    ) -> Result<Self, DeviceError> {
        let max_words = device.profile().max_shared_words();
        let pipelines = Stage::ALL
            .into_iter()
            .map(|stage| cache.get_or_create(device, stage_desc(stage, &layout, variant, max_words)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            variant,
            layout,
            pipelines,
        })
    }

    pub fn variant(&self) -> KernelVariant {
        self.variant
    }

    pub fn layout(&self) -> &SortLayout {
        &self.layout
    }

    pub fn pipeline(&self, stage: Stage) -> &ComputePipeline {
        &self.pipelines[stage.index()]
    }

    /// Shared words allocated to `stage`'s pipeline.
    pub fn bound(&self, stage: Stage) -> usize {
        self.pipeline(stage).shared_words()
    }

    pub fn gate<'a>(&'a self, stage: Stage, status: &'a StatusRegister) -> Gate<'a> {
        Gate {
            stage,
            min_width: self.variant.min_width,
            layout: &self.layout,
            status,
        }
    }

    /// Dispatch `stage`'s pipeline over `groups` groups.
    pub fn dispatch<F>(&self, device: &Device, stage: Stage, groups: u32, kernel: F) -> DispatchInfo
    where
        F: Fn(&mut GroupContext) + Sync,
    {
        device.dispatch(self.pipeline(stage), groups, kernel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digit::DigitWidth;
    use forge_compute::DeviceProfile;

    #[test]
    fn test_select_variant() {
        assert_eq!(KernelVariant::select(64).unwrap(), KernelVariant::W32);
        assert_eq!(KernelVariant::select(32).unwrap(), KernelVariant::W32);
        assert_eq!(KernelVariant::select(16).unwrap(), KernelVariant::W16);
        assert_eq!(KernelVariant::select(8).unwrap(), KernelVariant::W8);
        assert!(matches!(
            KernelVariant::select(4),
            Err(SortError::NoCompatibleVariant { width: 4 })
        ));
    }

    #[test]
    fn test_variant_by_name() {
        assert_eq!(KernelVariant::by_name("w16").unwrap().min_width(), 16);
        assert!(matches!(
            KernelVariant::by_name("w128"),
            Err(SortError::UnknownVariant(_))
        ));
    }

    #[test]
    fn test_bounds_clamped_to_device() {
        let device = Device::new(DeviceProfile::apple_like()).unwrap();
        let mut cache = PipelineCache::new();
        let layout = SortLayout::new(DigitWidth::Eight, 8);
        let kernels = KernelSet::build(&device, &mut cache, KernelVariant::W8, layout).unwrap();
        assert_eq!(kernels.bound(Stage::Histogram), 32 * 256);
        assert_eq!(kernels.bound(Stage::OneSweep), 8192);
        assert_eq!(kernels.bound(Stage::Reset), 0);
        assert_eq!(kernels.pipeline(Stage::Scatter).label(), "split_scatter");
        assert_eq!(kernels.pipeline(Stage::Scatter).constant("min_width"), Some(8));
    }

    #[test]
    fn test_gate_admits_and_rejects() {
        let status = StatusRegister::new();
        let layout = SortLayout::new(DigitWidth::Eight, 8);

        let run = |profile: DeviceProfile, variant: KernelVariant, stage: Stage| {
            let device = Device::new(profile).unwrap();
            let mut cache = PipelineCache::new();
            let kernels = KernelSet::build(&device, &mut cache, variant, layout).unwrap();
            let gate = kernels.gate(stage, &status);
            let admitted = forge_compute::DeviceBuffer::new("admitted", 1);
            kernels.dispatch(&device, stage, 4, |ctx| {
                if let Some(geo) = gate.admit(ctx) {
                    assert_eq!(geo.width, ctx.subgroup_width());
                    admitted.fetch_add(0, 1);
                }
            });
            admitted.load(0)
        };

        status.reset();
        assert_eq!(run(DeviceProfile::amd_wave64(), KernelVariant::W32, Stage::Histogram), 4);
        assert!(status.faults().is_empty());

        status.reset();
        let profile = DeviceProfile::nvidia_like().with_pipeline_width("digit_histogram", 16);
        assert_eq!(run(profile, KernelVariant::W32, Stage::Histogram), 0);
        let fault = status.first_fault().unwrap();
        assert_eq!(fault.class, FaultClass::CapabilityMismatch);
        assert_eq!(fault.observed_width, 16);
        assert_eq!(fault.required, 32);

        status.reset();
        let profile = DeviceProfile::apple_like().with_subgroup_width(8);
        assert_eq!(run(profile, KernelVariant::W8, Stage::OneSweep), 0);
        let fault = status.first_fault().unwrap();
        assert_eq!(fault.class, FaultClass::CapacityOverflow);
        assert_eq!(fault.required, 8704);
    }
}
