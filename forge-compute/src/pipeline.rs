//! Compute pipelines and the pipeline cache.

use std::collections::HashMap;

use crate::device::Device;
use crate::error::DeviceError;

/// Everything needed to build a compute pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineDesc {
    /// Kernel entry point name, also used to resolve per-pipeline subgroup widths.
    pub label: &'static str,
    /// Lanes per group.
    pub group_size: u32,
    /// Group-local memory bound in 32-bit words.
    pub shared_words: usize,
    /// Specialization constants baked into this pipeline (e.g. digit bits, variant width).
    pub constants: Vec<(&'static str, u32)>,
}

impl PipelineDesc {
    pub fn new(label: &'static str, group_size: u32) -> Self {
        Self {
            label,
            group_size,
            shared_words: 0,
            constants: Vec::new(),
        }
    }

    pub fn with_shared_words(mut self, words: usize) -> Self {
        self.shared_words = words;
        self
    }

    pub fn with_constant(mut self, name: &'static str, value: u32) -> Self {
        self.constants.push((name, value));
        self
    }

    /// Cache key: `"label:g=256:s=4096:name=val:name=val"`.
    pub fn cache_key(&self) -> String {
        let mut key = format!("{}:g={}:s={}", self.label, self.group_size, self.shared_words);
        for (name, value) in &self.constants {
            key.push_str(&format!(":{}={}", name, value));
        }
        key
    }
}

/// A validated pipeline, ready to dispatch.
#[derive(Clone, Debug)]
pub struct ComputePipeline {
    desc: PipelineDesc,
}

impl ComputePipeline {
    pub(crate) fn new(desc: PipelineDesc) -> Self {
        Self { desc }
    }

    pub fn label(&self) -> &'static str {
        self.desc.label
    }

    pub fn group_size(&self) -> u32 {
        self.desc.group_size
    }

    pub fn shared_words(&self) -> usize {
        self.desc.shared_words
    }

    /// Value of a specialization constant, if set.
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

/// Cache of built pipelines keyed by [`PipelineDesc::cache_key`].
#[derive(Default)]
pub struct PipelineCache {
    cache: HashMap<String, ComputePipeline>,
}

impl PipelineCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or build the pipeline for `desc`.
    ///
    /// Identical descriptors reuse the same pipeline.
    pub fn get_or_create(
        &mut self,
        device: &Device,
        desc: PipelineDesc,
    ) -> Result<ComputePipeline, DeviceError> {
        let key = desc.cache_key();
        if let Some(pipeline) = self.cache.get(&key) {
            return Ok(pipeline.clone());
        }
        let pipeline = device.create_pipeline(desc)?;
        self.cache.insert(key, pipeline.clone());
        Ok(pipeline)
    }

    /// Number of distinct pipelines built.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceProfile;

    #[test]
    fn test_cache_key() {
        let desc = PipelineDesc::new("scatter", 256)
            .with_shared_words(1024)
            .with_constant("bits", 8)
            .with_constant("min_width", 16);
        assert_eq!(desc.cache_key(), "scatter:g=256:s=1024:bits=8:min_width=16");
    }

    #[test]
    fn test_cache_reuses_pipelines() {
        let device = Device::new(DeviceProfile::default()).unwrap();
        let mut cache = PipelineCache::new();
        let a = cache
            .get_or_create(&device, PipelineDesc::new("k", 64).with_constant("bits", 4))
            .unwrap();
        let _ = cache
            .get_or_create(&device, PipelineDesc::new("k", 64).with_constant("bits", 4))
            .unwrap();
        assert_eq!(cache.len(), 1);
        let _ = cache
            .get_or_create(&device, PipelineDesc::new("k", 64).with_constant("bits", 8))
            .unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(a.constant("bits"), Some(4));
        assert_eq!(a.constant("missing"), None);
    }
}
