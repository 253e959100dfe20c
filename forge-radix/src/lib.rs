//! GPU-style LSD radix sort engines on `forge-compute`.
//!
//! Three designs share the same building blocks:
//!
//! - `MultiPass4` / `MultiPass8`: per pass, a digit histogram per
//!   partition, a global exclusive scan of the digit-major table (two-level
//!   block scan or single-dispatch decoupled lookback), and a stable split
//!   scatter.
//! - `OneSweep`: one global histogram for all passes, then per pass a single
//!   fused kernel that ranks keys, resolves its partition's digit prefixes
//!   with decoupled lookback, and scatters.
//!
//! Every kernel re-checks its runtime subgroup width against the compiled
//! variant and reports violations through an error register instead of
//! producing wrong output.
//!
//! The kernels exist twice: as WGSL under `shaders/`, run on a wgpu adapter
//! by [`RadixEngine::on_gpu`], and as Rust group functions on the software
//! device behind [`RadixEngine::new`], which tests use to pin subgroup
//! widths and scheduling orders.
//!
//! ```no_run
//! use std::sync::Arc;
//! use forge_compute::GpuDevice;
//! use forge_radix::{Design, EngineConfig, RadixEngine};
//!
//! let gpu = Arc::new(GpuDevice::new()?);
//! let mut engine = RadixEngine::on_gpu(gpu, EngineConfig::new(Design::OneSweep))?;
//! let out = engine.sort(&[3, 1, 2], &[30, 10, 20])?;
//! assert_eq!(out.keys(), vec![1, 2, 3]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod arena;
pub mod compat;
pub mod config;
pub mod digit;
pub mod engine;
pub mod error;
pub mod gpu;
pub mod histogram;
pub mod layout;
pub mod onesweep;
pub mod params;
pub mod scan;
pub mod scatter;
pub mod status;
pub mod validate;

pub use arena::{cell_capacity, ScratchArena, SortScratch};
pub use compat::{stage_desc, Gate, Geometry, KernelSet, KernelVariant};
pub use config::{Design, EngineConfig, DEFAULT_MAX_KEYS, MAX_KEYS};
pub use digit::{digit_for_pass, extract_digit, DigitWidth};
pub use engine::{BackendKind, Diagnostics, RadixEngine, Record, SortOutput, StageReport};
pub use error::{RecoveryAction, SortError, Stage};
pub use gpu::{GpuArena, GpuKernels, GpuRun, GpuSorter};
pub use layout::{SortLayout, GROUP_SIZE};
pub use params::{ResetParams, ScanParams, SortParams};
pub use scan::model::{LookbackModel, ModelReport, ModelViolation};
pub use scan::{ScanKind, ScanStrategy, SpinPolicy};
pub use status::{decode_faults, FaultClass, KernelFault, StatusRegister};
pub use validate::{compare, cross_validate, reference_sort, Comparison};
