//! Software compute device for GPU-style kernels.
//!
//! Kernels are closures over a [`GroupContext`], dispatched over a 1-D grid
//! of independent work groups. The device models the parts of the GPU
//! execution model that kernels must be written against: group-local shared
//! memory with a hard bound, subgroups whose width is only known at run time,
//! device atomics, and no barrier between groups of one dispatch.
//!
//! [`GpuDevice`] exposes the same pipeline/dispatch seam on a wgpu adapter,
//! for kernels written in WGSL against the same model.

pub mod buffer;
pub mod device;
pub mod error;
pub mod gpu;
pub mod group;
pub mod hardware;
pub mod pipeline;
pub mod probe;
pub mod subgroup;
pub mod timing;

pub use buffer::DeviceBuffer;
pub use device::{Device, DeviceProfile, DispatchInfo, DispatchOrder};
pub use error::DeviceError;
pub use gpu::{wgsl_header, GpuBuffer, GpuDevice, GpuInfo, GpuPipeline};
pub use group::{GroupContext, SharedMemory};
pub use hardware::HardwareInfo;
pub use pipeline::{ComputePipeline, PipelineCache, PipelineDesc};
pub use probe::{probe_pipeline_width, probe_subgroup_width};
pub use subgroup::{is_valid_width, subgroup_count, LaneMask, Subgroup, MAX_SUBGROUP_WIDTH, MIN_SUBGROUP_WIDTH};
pub use timing::{mkeys_per_sec, BenchTimer};
