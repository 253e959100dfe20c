//! wgpu device: the pipeline/dispatch seam of [`Device`](crate::Device) on a
//! real adapter.
//!
//! Kernels are WGSL sources. A pipeline is built from a [`PipelineDesc`] by
//! prepending its group size, shared-memory bound and specialization
//! constants as `const` declarations (see [`wgsl_header`]), so one source
//! serves every variant and layout. Kernels read their subgroup width from
//! `@builtin(subgroup_size)`, which needs [`wgpu::Features::SUBGROUP`].
//!
//! Every dispatch is submitted on its own and waited for, which is the sync
//! point between dependent kernels and what the host times.

use std::sync::mpsc;
use std::time::Instant;

use bytemuck::Pod;
use serde::Serialize;
use tracing::{debug, info};
use wgpu::util::DeviceExt;

use crate::device::DispatchInfo;
use crate::error::DeviceError;
use crate::pipeline::PipelineDesc;

const WIDTH_LABEL: &str = "subgroup_width";
const WIDTH_SOURCE: &str = include_str!("../shaders/subgroup_width.wgsl");

/// `const` declarations for `desc`: `GROUP_SIZE`, `SHARED_WORDS` and every
/// constant with its name upper-cased.
///
/// Workgroup arrays can't be empty, so `SHARED_WORDS` is at least 1.
pub fn wgsl_header(desc: &PipelineDesc) -> String {
    let mut header = format!(
        "const GROUP_SIZE: u32 = {}u;\nconst SHARED_WORDS: u32 = {}u;\n",
        desc.group_size,
        desc.shared_words.max(1)
    );
    for (name, value) in &desc.constants {
        header.push_str(&format!(
            "const {}: u32 = {}u;\n",
            name.to_ascii_uppercase(),
            value
        ));
    }
    header
}

/// What the adapter reports about itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GpuInfo {
    pub name: String,
    /// Graphics API behind the adapter (Vulkan, Metal, Dx12, Gl).
    pub backend: String,
    pub device_type: String,
    pub min_subgroup_size: u32,
    pub max_subgroup_size: u32,
    pub max_group_size: u32,
    /// Largest group count of one dispatch dimension.
    pub max_groups: u32,
    pub max_shared_bytes: usize,
}

/// A storage buffer of 32-bit words in device memory.
#[derive(Debug)]
pub struct GpuBuffer {
    label: &'static str,
    buffer: wgpu::Buffer,
    len: usize,
}

impl GpuBuffer {
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn byte_len(&self) -> usize {
        self.len * std::mem::size_of::<u32>()
    }

    pub fn raw(&self) -> &wgpu::Buffer {
        &self.buffer
    }
}

/// A compiled compute pipeline with its bind group layout.
#[derive(Debug)]
pub struct GpuPipeline {
    desc: PipelineDesc,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

impl GpuPipeline {
    pub fn label(&self) -> &'static str {
        self.desc.label
    }

    pub fn shared_words(&self) -> usize {
        self.desc.shared_words
    }

    pub fn constant(&self, name: &str) -> Option<u32> {
        self.desc
            .constants
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
    }

    pub fn desc(&self) -> &PipelineDesc {
        &self.desc
    }
}

/// A wgpu device and queue with subgroup support.
pub struct GpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    info: GpuInfo,
    subgroup_width: u32,
}

impl GpuDevice {
    /// Open the highest-performance adapter that supports subgroups.
    pub fn new() -> Result<Self, DeviceError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface: None,
        }))
        .ok_or(DeviceError::NoAdapter)?;
        if !adapter.features().contains(wgpu::Features::SUBGROUP) {
            return Err(DeviceError::MissingFeature("SUBGROUP"));
        }

        let adapter_info = adapter.get_info();
        let limits = adapter.limits();
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("forge-gpu"),
                required_features: wgpu::Features::SUBGROUP,
                // the sort kernels want the full workgroup storage the adapter offers
                required_limits: limits.clone(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| DeviceError::RequestDevice(e.to_string()))?;

        let info = GpuInfo {
            name: adapter_info.name.clone(),
            backend: format!("{:?}", adapter_info.backend),
            device_type: format!("{:?}", adapter_info.device_type),
            min_subgroup_size: limits.min_subgroup_size,
            max_subgroup_size: limits.max_subgroup_size,
            max_group_size: limits.max_compute_invocations_per_workgroup,
            max_groups: limits.max_compute_workgroups_per_dimension,
            max_shared_bytes: limits.max_compute_workgroup_storage_size as usize,
        };
        let mut gpu = Self {
            device,
            queue,
            info,
            subgroup_width: 0,
        };
        gpu.subgroup_width = gpu.query_subgroup_width()?;
        info!(
            name = %gpu.info.name,
            backend = %gpu.info.backend,
            subgroup_width = gpu.subgroup_width,
            max_shared_bytes = gpu.info.max_shared_bytes,
            "opened GPU device"
        );
        Ok(gpu)
    }

    pub fn info(&self) -> &GpuInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Width the startup width query reported.
    pub fn subgroup_width(&self) -> u32 {
        self.subgroup_width
    }

    pub fn max_shared_words(&self) -> usize {
        self.info.max_shared_bytes / std::mem::size_of::<u32>()
    }

    /// Dispatch one group of the width kernel and read back the width its
    /// first lane saw.
    pub fn query_subgroup_width(&self) -> Result<u32, DeviceError> {
        let group_size = 64.min(self.info.max_group_size);
        let pipeline = self.create_pipeline(PipelineDesc::new(WIDTH_LABEL, group_size), WIDTH_SOURCE)?;
        let out = self.storage_buffer("width_out", 1);
        self.dispatch(&pipeline, 1, &[(0, out.raw())])?;
        Ok(self.read(&out, 1)?[0])
    }

    /// Validate `desc` against the adapter limits and compile `source`
    /// behind its header. The entry point is `desc.label`.
    pub fn create_pipeline(&self, desc: PipelineDesc, source: &str) -> Result<GpuPipeline, DeviceError> {
        if desc.group_size == 0 || desc.group_size > self.info.max_group_size {
            return Err(DeviceError::GroupSizeTooLarge {
                requested: desc.group_size,
                max: self.info.max_group_size,
            });
        }
        let shared_bytes = desc.shared_words * std::mem::size_of::<u32>();
        if shared_bytes > self.info.max_shared_bytes {
            return Err(DeviceError::SharedMemoryExceeded {
                requested: shared_bytes,
                max: self.info.max_shared_bytes,
            });
        }

        let code = format!("{}{}", wgsl_header(&desc), source);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(desc.label),
            source: wgpu::ShaderSource::Wgsl(code.into()),
        });
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(desc.label),
            layout: None,
            module: &module,
            entry_point: Some(desc.label),
            compilation_options: Default::default(),
            cache: None,
        });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(DeviceError::Shader {
                label: desc.label,
                message: error.to_string(),
            });
        }
        let layout = pipeline.get_bind_group_layout(0);
        debug!(key = %desc.cache_key(), "built GPU pipeline");
        Ok(GpuPipeline {
            desc,
            pipeline,
            layout,
        })
    }

    /// Allocate a zero-filled storage buffer of `len` words.
    pub fn storage_buffer(&self, label: &'static str, len: usize) -> GpuBuffer {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            // zero-sized bindings are invalid
            size: (len.max(1) * std::mem::size_of::<u32>()) as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        GpuBuffer { label, buffer, len }
    }

    /// A uniform buffer holding `value`.
    pub fn uniform<T: Pod>(&self, label: &'static str, value: &T) -> wgpu::Buffer {
        self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::bytes_of(value),
            usage: wgpu::BufferUsages::UNIFORM,
        })
    }

    /// Write `data` to the start of `buffer`.
    pub fn upload(&self, buffer: &GpuBuffer, data: &[u32]) {
        debug_assert!(data.len() <= buffer.len, "{}: upload past the end", buffer.label);
        if !data.is_empty() {
            self.queue.write_buffer(&buffer.buffer, 0, bytemuck::cast_slice(data));
        }
    }

    /// Zero every word of `buffers`.
    pub fn clear(&self, buffers: &[&GpuBuffer]) {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("clear") });
        for buffer in buffers {
            encoder.clear_buffer(&buffer.buffer, 0, None);
        }
        self.queue.submit(Some(encoder.finish()));
    }

    /// Read back the first `len` words of `buffer`.
    pub fn read(&self, buffer: &GpuBuffer, len: usize) -> Result<Vec<u32>, DeviceError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let size = (len.min(buffer.len) * std::mem::size_of::<u32>()) as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
        encoder.copy_buffer_to_buffer(&buffer.buffer, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| DeviceError::BufferMap(e.to_string()))?
            .map_err(|e| DeviceError::BufferMap(e.to_string()))?;

        let mapped = slice.get_mapped_range();
        let words = bytemuck::cast_slice::<u8, u32>(&mapped).to_vec();
        drop(mapped);
        staging.unmap();
        Ok(words)
    }

    /// Bind `bindings` (binding index, buffer) to group 0 of `pipeline`, run
    /// `groups` groups and wait for them.
    ///
    /// The reported width is the startup query's; kernels that need the width each
    /// stage actually ran with record it themselves.
    pub fn dispatch(
        &self,
        pipeline: &GpuPipeline,
        groups: u32,
        bindings: &[(u32, &wgpu::Buffer)],
    ) -> Result<DispatchInfo, DeviceError> {
        let label = pipeline.label();
        let entries: Vec<wgpu::BindGroupEntry<'_>> = bindings
            .iter()
            .map(|&(binding, buffer)| wgpu::BindGroupEntry {
                binding,
                resource: buffer.as_entire_binding(),
            })
            .collect();

        let start = Instant::now();
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &pipeline.layout,
            entries: &entries,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups, 1, 1);
        }
        self.queue.submit(Some(encoder.finish()));
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(DeviceError::Dispatch {
                label,
                message: error.to_string(),
            });
        }
        self.device.poll(wgpu::Maintain::Wait);
        let elapsed = start.elapsed();

        debug!(
            label,
            groups,
            elapsed_us = elapsed.as_micros() as u64,
            "GPU dispatch complete"
        );
        Ok(DispatchInfo {
            label,
            groups,
            subgroup_width: self.subgroup_width,
            elapsed,
        })
    }
}

impl std::fmt::Debug for GpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuDevice")
            .field("info", &self.info)
            .field("subgroup_width", &self.subgroup_width)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu() -> Option<GpuDevice> {
        match GpuDevice::new() {
            Ok(gpu) => Some(gpu),
            Err(e) => {
                eprintln!("skipping GPU test: {e}");
                None
            }
        }
    }

    #[test]
    fn test_header_declares_desc() {
        let desc = PipelineDesc::new("split_scatter", 256)
            .with_shared_words(4360)
            .with_constant("digit_bits", 8)
            .with_constant("min_width", 16);
        assert_eq!(
            wgsl_header(&desc),
            "const GROUP_SIZE: u32 = 256u;\n\
             const SHARED_WORDS: u32 = 4360u;\n\
             const DIGIT_BITS: u32 = 8u;\n\
             const MIN_WIDTH: u32 = 16u;\n"
        );
        let empty = wgsl_header(&PipelineDesc::new("reset_lookback", 256));
        assert!(empty.contains("const SHARED_WORDS: u32 = 1u;"));
    }

    #[test]
    fn test_subgroup_width_within_adapter_range() {
        let Some(gpu) = gpu() else { return };
        let width = gpu.subgroup_width();
        assert!(width.is_power_of_two(), "width {width}");
        if gpu.info().max_subgroup_size > 0 {
            assert!(width >= gpu.info().min_subgroup_size);
            assert!(width <= gpu.info().max_subgroup_size);
        }
    }

    #[test]
    fn test_upload_read_and_clear() {
        let Some(gpu) = gpu() else { return };
        let buffer = gpu.storage_buffer("words", 1000);
        let data: Vec<u32> = (0..1000).map(|i| i * 3).collect();
        gpu.upload(&buffer, &data);
        assert_eq!(gpu.read(&buffer, 1000).unwrap(), data);
        assert_eq!(gpu.read(&buffer, 4).unwrap(), vec![0, 3, 6, 9]);
        gpu.clear(&[&buffer]);
        assert!(gpu.read(&buffer, 1000).unwrap().iter().all(|&v| v == 0));
    }

    #[test]
    fn test_bad_shader_is_an_error() {
        let Some(gpu) = gpu() else { return };
        let err = gpu
            .create_pipeline(PipelineDesc::new("broken", 64), "fn broken( {")
            .unwrap_err();
        assert!(matches!(err, DeviceError::Shader { label: "broken", .. }));
    }

    #[test]
    fn test_shared_memory_limit_checked_before_compiling() {
        let Some(gpu) = gpu() else { return };
        let desc = PipelineDesc::new(WIDTH_LABEL, 64).with_shared_words(gpu.max_shared_words() + 1);
        assert!(matches!(
            gpu.create_pipeline(desc, WIDTH_SOURCE),
            Err(DeviceError::SharedMemoryExceeded { .. })
        ));
    }
}
