//! Subgroup width probe.
//!
//! Dispatches a single group whose first lane reports the width it is
//! executing with. This is what the host sees at startup; individual
//! pipelines may still end up running at a different width, so kernels
//! re-read the width themselves at dispatch time.

use crate::buffer::DeviceBuffer;
use crate::device::Device;
use crate::error::DeviceError;
use crate::pipeline::PipelineDesc;

/// Label of the probe pipeline.
pub const PROBE_LABEL: &str = "subgroup_probe";

/// Probe the device's default subgroup width.
pub fn probe_subgroup_width(device: &Device) -> Result<u32, DeviceError> {
    probe_pipeline_width(device, PROBE_LABEL)
}

/// Probe the width a pipeline with `label` would execute with.
pub fn probe_pipeline_width(device: &Device, label: &'static str) -> Result<u32, DeviceError> {
    let group_size = 64.min(device.profile().max_group_size);
    let pipeline = device.create_pipeline(PipelineDesc::new(label, group_size))?;
    let out = DeviceBuffer::new("probe_out", 1);
    device.dispatch(&pipeline, 1, |ctx| {
        for lane in ctx.lanes() {
            if lane == 0 {
                out.store(0, ctx.subgroup_width());
            }
        }
    });
    Ok(out.load(0))
}
