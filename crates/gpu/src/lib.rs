// Copyright 2025-2026 Aurora Radar Group

//! Device side of the decimation pipeline: capability probe, per-sequence
//! buffer sets, the two decimation kernels with their warp-aware reduction,
//! and the per-sequence stream/event runtime.
//!
//! The default build runs the host backend, a faithful image of the kernel
//! launch geometry (grid, block, shared tile, warp shuffle) used by every
//! test. The `cuda` feature adds the real device backend; kernel source
//! lives in `kernels/decimate.cu` and is compiled with NVRTC at init.

use thiserror::Error;

pub mod buffers;
pub mod kernels;
pub mod probe;
pub mod reduce;
pub mod stream;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use buffers::SequenceBuffers;
pub use kernels::{launch_decimate, DecimateArgs, InputLayout};
pub use probe::{DeviceInfo, KernelVariant};
pub use stream::{Event, Stream};

#[derive(Error, Debug)]
pub enum GpuError {
    #[error("device allocation of {bytes} bytes failed")]
    AllocFailure { bytes: usize },

    #[error("kernel launch needs {threads} threads per block, device limit is {max}")]
    BadLaunchConfig { threads: usize, max: usize },

    #[error("filter tile needs {needed} bytes of shared memory, device has {available}")]
    SharedMemExceeded { needed: usize, available: usize },

    #[error("async copy failed: {0}")]
    CopyError(String),

    #[error("device error: {0}")]
    Device(String),
}
