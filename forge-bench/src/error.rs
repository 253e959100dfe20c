use forge_compute::DeviceError;
use forge_radix::SortError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("invalid size '{input}': {reason}")]
    InvalidSize { input: String, reason: String },
    #[error("unknown profile '{0}'. Valid: quick, standard, thorough")]
    UnknownProfile(String),
    #[error("unknown device preset '{0}'. Valid: warp32, wave64, simd32, simd16")]
    UnknownDevice(String),
    #[error("unknown contender '{name}'. Available: {available}")]
    UnknownContender { name: String, available: String },
    #[error("{0} result(s) failed validation")]
    ValidationFailed(usize),
    #[error(transparent)]
    Sort(#[from] SortError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}
