//! The compute device: profiles, pipeline creation and work-group dispatch.
//!
//! Groups of one dispatch are independent: they are handed to rayon workers in
//! the order chosen by the profile's [`DispatchOrder`] and may run in any
//! interleaving. There is no cross-group barrier; the only device-wide sync
//! point is the return of [`Device::dispatch`].
//!
//! A group that is running is never descheduled by the device in favour of
//! another group of the same dispatch, so a group that was started earlier
//! always makes progress. Kernels that spin on state published by other
//! groups must still only wait on groups that have provably started.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DeviceError;
use crate::group::GroupContext;
use crate::pipeline::{ComputePipeline, PipelineDesc};
use crate::subgroup::{is_valid_width, MAX_SUBGROUP_WIDTH, MIN_SUBGROUP_WIDTH};

/// Order in which the groups of a dispatch are handed to workers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchOrder {
    #[default]
    Ascending,
    Descending,
    Shuffled { seed: u64 },
}

/// Capabilities and scheduling behaviour of a device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub name: String,
    /// Native subgroup width for pipelines without an override.
    pub subgroup_width: u32,
    /// Per-pipeline width overrides, keyed by pipeline label.
    pub pipeline_widths: BTreeMap<String, u32>,
    pub max_group_size: u32,
    pub max_shared_bytes: usize,
    pub dispatch_order: DispatchOrder,
    /// Dedicated worker count; `None` uses the global rayon pool.
    pub worker_threads: Option<usize>,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self::nvidia_like()
    }
}

impl DeviceProfile {
    pub fn new(name: impl Into<String>, subgroup_width: u32) -> Self {
        Self {
            name: name.into(),
            subgroup_width,
            pipeline_widths: BTreeMap::new(),
            max_group_size: 1024,
            max_shared_bytes: 48 * 1024,
            dispatch_order: DispatchOrder::Ascending,
            worker_threads: None,
        }
    }

    /// 32-wide warps, 48 KiB of shared memory per group.
    pub fn nvidia_like() -> Self {
        Self::new("warp32", 32)
    }

    /// 64-wide wavefronts, 64 KiB of shared memory per group.
    pub fn amd_wave64() -> Self {
        Self::new("wave64", 64).with_max_shared_bytes(64 * 1024)
    }

    /// 32-wide SIMD-groups, 32 KiB of threadgroup memory.
    pub fn apple_like() -> Self {
        Self::new("simd32", 32).with_max_shared_bytes(32 * 1024)
    }

    /// 16-wide subgroups, 64 KiB of shared local memory.
    pub fn intel_like() -> Self {
        Self::new("simd16", 16).with_max_shared_bytes(64 * 1024)
    }

    /// Look up a preset by name.
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "warp32" | "nvidia" => Some(Self::nvidia_like()),
            "wave64" | "amd" => Some(Self::amd_wave64()),
            "simd32" | "apple" => Some(Self::apple_like()),
            "simd16" | "intel" => Some(Self::intel_like()),
            _ => None,
        }
    }

    pub fn with_subgroup_width(mut self, width: u32) -> Self {
        self.subgroup_width = width;
        self
    }

    /// Make the pipeline named `label` run at `width` regardless of the default.
    pub fn with_pipeline_width(mut self, label: impl Into<String>, width: u32) -> Self {
        self.pipeline_widths.insert(label.into(), width);
        self
    }

    pub fn with_max_shared_bytes(mut self, bytes: usize) -> Self {
        self.max_shared_bytes = bytes;
        self
    }

    pub fn with_max_group_size(mut self, size: u32) -> Self {
        self.max_group_size = size;
        self
    }

    pub fn with_dispatch_order(mut self, order: DispatchOrder) -> Self {
        self.dispatch_order = order;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads);
        self
    }

    /// Width the pipeline named `label` executes with.
    pub fn subgroup_width_for(&self, label: &str) -> u32 {
        self.pipeline_widths
            .get(label)
            .copied()
            .unwrap_or(self.subgroup_width)
    }

    /// Shared-memory limit in 32-bit words.
    pub fn max_shared_words(&self) -> usize {
        self.max_shared_bytes / std::mem::size_of::<u32>()
    }

    fn validate(&self) -> Result<(), DeviceError> {
        let widths = std::iter::once(self.subgroup_width).chain(self.pipeline_widths.values().copied());
        for width in widths {
            if !is_valid_width(width) {
                return Err(DeviceError::UnsupportedSubgroupWidth {
                    width,
                    min: MIN_SUBGROUP_WIDTH,
                    max: MAX_SUBGROUP_WIDTH,
                });
            }
        }
        Ok(())
    }
}

/// What a completed dispatch reports back.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DispatchInfo {
    pub label: &'static str,
    pub groups: u32,
    pub subgroup_width: u32,
    pub elapsed: Duration,
}

/// A compute device executing kernels as independent work groups.
pub struct Device {
    profile: DeviceProfile,
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl Device {
    pub fn new(profile: DeviceProfile) -> Result<Self, DeviceError> {
        profile.validate()?;
        let pool = match profile.worker_threads {
            Some(threads) => Some(Arc::new(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("forge-group-{i}"))
                    .build()
                    .map_err(|e| DeviceError::ThreadPool(e.to_string()))?,
            )),
            None => None,
        };
        debug!(
            name = %profile.name,
            subgroup_width = profile.subgroup_width,
            max_shared_bytes = profile.max_shared_bytes,
            "created compute device"
        );
        Ok(Self { profile, pool })
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn name(&self) -> &str {
        &self.profile.name
    }

    /// Number of workers that execute groups concurrently.
    pub fn worker_threads(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }

    /// Validate `desc` against the device limits and build a pipeline.
    pub fn create_pipeline(&self, desc: PipelineDesc) -> Result<ComputePipeline, DeviceError> {
        if desc.group_size == 0 || desc.group_size > self.profile.max_group_size {
            return Err(DeviceError::GroupSizeTooLarge {
                requested: desc.group_size,
                max: self.profile.max_group_size,
            });
        }
        let shared_bytes = desc.shared_words * std::mem::size_of::<u32>();
        if shared_bytes > self.profile.max_shared_bytes {
            return Err(DeviceError::SharedMemoryExceeded {
                requested: shared_bytes,
                max: self.profile.max_shared_bytes,
            });
        }
        Ok(ComputePipeline::new(desc))
    }

    /// Run `kernel` once for each of `groups` work groups and wait for all of them.
    pub fn dispatch<F>(&self, pipeline: &ComputePipeline, groups: u32, kernel: F) -> DispatchInfo
    where
        F: Fn(&mut GroupContext) + Sync,
    {
        let width = self.profile.subgroup_width_for(pipeline.label());
        let group_size = pipeline.group_size();
        let shared_words = pipeline.shared_words();
        let order = self.group_order(groups);

        let start = Instant::now();
        let run = || {
            order.par_iter().for_each(|&group_id| {
                let mut ctx = GroupContext::new(group_id, groups, group_size, width, shared_words);
                kernel(&mut ctx);
            })
        };
        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
        let elapsed = start.elapsed();

        debug!(
            label = pipeline.label(),
            groups,
            subgroup_width = width,
            elapsed_us = elapsed.as_micros() as u64,
            "dispatch complete"
        );
        DispatchInfo {
            label: pipeline.label(),
            groups,
            subgroup_width: width,
            elapsed,
        }
    }

    fn group_order(&self, groups: u32) -> Vec<u32> {
        let mut order: Vec<u32> = (0..groups).collect();
        match self.profile.dispatch_order {
            DispatchOrder::Ascending => {}
            DispatchOrder::Descending => order.reverse(),
            DispatchOrder::Shuffled { seed } => {
                let mut rng = StdRng::seed_from_u64(seed);
                order.shuffle(&mut rng);
            }
        }
        order
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("profile", &self.profile)
            .field("dedicated_pool", &self.pool.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::DeviceBuffer;

    #[test]
    fn test_profile_presets() {
        assert_eq!(DeviceProfile::nvidia_like().subgroup_width, 32);
        assert_eq!(DeviceProfile::amd_wave64().subgroup_width, 64);
        assert_eq!(DeviceProfile::apple_like().max_shared_bytes, 32 * 1024);
        assert_eq!(DeviceProfile::intel_like().subgroup_width, 16);
        assert!(DeviceProfile::preset("wave64").is_some());
        assert!(DeviceProfile::preset("unknown").is_none());
    }

    #[test]
    fn test_pipeline_width_override() {
        let profile = DeviceProfile::nvidia_like().with_pipeline_width("scatter", 16);
        assert_eq!(profile.subgroup_width_for("scatter"), 16);
        assert_eq!(profile.subgroup_width_for("histogram"), 32);
    }

    #[test]
    fn test_invalid_width_rejected() {
        let err = Device::new(DeviceProfile::new("odd", 24)).unwrap_err();
        assert!(matches!(err, DeviceError::UnsupportedSubgroupWidth { width: 24, .. }));

        let err = Device::new(DeviceProfile::nvidia_like().with_pipeline_width("k", 128)).unwrap_err();
        assert!(matches!(err, DeviceError::UnsupportedSubgroupWidth { width: 128, .. }));
    }

    #[test]
    fn test_create_pipeline_limits() {
        let device = Device::new(DeviceProfile::apple_like()).unwrap();
        assert!(device
            .create_pipeline(PipelineDesc::new("ok", 256).with_shared_words(8192))
            .is_ok());
        let err = device
            .create_pipeline(PipelineDesc::new("big", 256).with_shared_words(8193))
            .unwrap_err();
        assert!(matches!(err, DeviceError::SharedMemoryExceeded { .. }));
        let err = device
            .create_pipeline(PipelineDesc::new("wide", 2048))
            .unwrap_err();
        assert!(matches!(err, DeviceError::GroupSizeTooLarge { .. }));
    }

    #[test]
    fn test_dispatch_runs_every_group_once() {
        for order in [
            DispatchOrder::Ascending,
            DispatchOrder::Descending,
            DispatchOrder::Shuffled { seed: 7 },
        ] {
            let device = Device::new(
                DeviceProfile::nvidia_like()
                    .with_dispatch_order(order)
                    .with_worker_threads(3),
            )
            .unwrap();
            let pipeline = device
                .create_pipeline(PipelineDesc::new("count", 64).with_shared_words(4))
                .unwrap();
            let hits = DeviceBuffer::new("hits", 100);
            let info = device.dispatch(&pipeline, 100, |ctx| {
                assert_eq!(ctx.shared().len(), 4);
                assert_eq!(ctx.subgroup_width(), 32);
                hits.fetch_add(ctx.group_id() as usize, 1);
            });
            assert_eq!(info.groups, 100);
            assert_eq!(info.subgroup_width, 32);
            assert!(hits.to_vec().iter().all(|&h| h == 1), "{order:?}");
        }
    }
}
