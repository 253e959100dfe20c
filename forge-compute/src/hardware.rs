//! Hardware description of the compute device the engines run on.

use serde::Serialize;

use crate::device::Device;
use crate::error::DeviceError;
use crate::gpu::GpuDevice;
use crate::probe::probe_subgroup_width;

/// Hardware information for the current device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HardwareInfo {
    /// Device profile or adapter name (e.g. "wave64").
    pub device_name: String,
    /// "software" for the simulated device, else the adapter's graphics API.
    pub backend: String,
    /// Subgroup width reported by the startup probe.
    pub subgroup_width: u32,
    pub max_group_size: u32,
    pub max_shared_bytes: usize,
    /// Workers executing groups concurrently; 0 on a GPU.
    pub worker_threads: usize,
}

impl HardwareInfo {
    /// Detect hardware by probing the device.
    pub fn detect(device: &Device) -> Result<Self, DeviceError> {
        let profile = device.profile();
        Ok(Self {
            device_name: profile.name.clone(),
            backend: "software".to_string(),
            subgroup_width: probe_subgroup_width(device)?,
            max_group_size: profile.max_group_size,
            max_shared_bytes: profile.max_shared_bytes,
            worker_threads: device.worker_threads(),
        })
    }

    /// Describe an opened GPU adapter.
    pub fn from_gpu(gpu: &GpuDevice) -> Self {
        let info = gpu.info();
        Self {
            device_name: info.name.clone(),
            backend: info.backend.clone(),
            subgroup_width: gpu.subgroup_width(),
            max_group_size: info.max_group_size,
            max_shared_bytes: info.max_shared_bytes,
            worker_threads: 0,
        }
    }

    /// One-line summary for report headers.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} [{}] (subgroup {}, {} KiB shared",
            self.device_name,
            self.backend,
            self.subgroup_width,
            self.max_shared_bytes / 1024
        );
        if self.worker_threads > 0 {
            line.push_str(&format!(", {} workers", self.worker_threads));
        }
        line.push(')');
        line
    }
}
