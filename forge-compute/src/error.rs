/// Errors raised by a compute device when creating pipelines, pools or
/// GPU resources.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("unsupported subgroup width {width}: must be a power of two in {min}..={max}")]
    UnsupportedSubgroupWidth { width: u32, min: u32, max: u32 },
    #[error("group size {requested} exceeds device maximum {max}")]
    GroupSizeTooLarge { requested: u32, max: u32 },
    #[error("shared memory request of {requested} bytes exceeds device limit {max}")]
    SharedMemoryExceeded { requested: usize, max: usize },
    #[error("failed to build worker pool: {0}")]
    ThreadPool(String),
    #[error("no GPU adapter available")]
    NoAdapter,
    #[error("GPU adapter lacks required feature {0}")]
    MissingFeature(&'static str),
    #[error("GPU device request failed: {0}")]
    RequestDevice(String),
    #[error("shader {label} rejected: {message}")]
    Shader { label: &'static str, message: String },
    #[error("dispatch of {label} rejected: {message}")]
    Dispatch { label: &'static str, message: String },
    #[error("buffer readback failed: {0}")]
    BufferMap(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_display() {
        let e = DeviceError::UnsupportedSubgroupWidth {
            width: 3,
            min: 4,
            max: 64,
        };
        assert_eq!(
            e.to_string(),
            "unsupported subgroup width 3: must be a power of two in 4..=64"
        );

        let e = DeviceError::GroupSizeTooLarge {
            requested: 2048,
            max: 1024,
        };
        assert_eq!(e.to_string(), "group size 2048 exceeds device maximum 1024");

        let e = DeviceError::SharedMemoryExceeded {
            requested: 65536,
            max: 32768,
        };
        assert_eq!(
            e.to_string(),
            "shared memory request of 65536 bytes exceeds device limit 32768"
        );

        assert_eq!(
            DeviceError::MissingFeature("SUBGROUP").to_string(),
            "GPU adapter lacks required feature SUBGROUP"
        );
        let e = DeviceError::Shader {
            label: "onesweep",
            message: "unknown identifier".to_string(),
        };
        assert_eq!(e.to_string(), "shader onesweep rejected: unknown identifier");
    }
}
