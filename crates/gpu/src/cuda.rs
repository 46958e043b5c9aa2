// Copyright 2025-2026 Aurora Radar Group

//! Real device backend. Kernel source is compiled with NVRTC at context
//! creation; each pipeline instance forks its own device stream so the
//! copies and launches of concurrent sequences overlap on the GPU, and
//! stages transfers through page-locked host memory so the stream copies
//! are genuinely asynchronous. The launch wrappers mirror the host
//! backend's buffer API so the orchestrator can route a sequence through
//! either.

use std::ffi::c_void;
use std::sync::Arc;

use cudarc::driver::sys::{self, CUdevice_attribute};
use cudarc::driver::{
    result, CudaDevice, CudaSlice, CudaStream, DevicePtr, LaunchAsync, LaunchConfig,
};
use num_complex::Complex32;

use ar_dsp::DecimationPlan;

use crate::probe::{check_shared_mem, DeviceInfo, KernelVariant};
use crate::GpuError;

const KERNEL_SRC: &str = include_str!("../kernels/decimate.cu");
const MODULE: &str = "decimate";

fn dev_err<E: std::fmt::Debug>(what: &str) -> impl FnOnce(E) -> GpuError + '_ {
    move |e| GpuError::Device(format!("{}: {:?}", what, e))
}

/// Read the capability set of every CUDA device.
pub fn probe_devices() -> Result<Vec<DeviceInfo>, GpuError> {
    let count = CudaDevice::count().map_err(dev_err("device count"))? as usize;
    let mut out = Vec::with_capacity(count);
    for ordinal in 0..count {
        let device = CudaDevice::new(ordinal).map_err(dev_err("device open"))?;
        let attr = |a: CUdevice_attribute| -> Result<i32, GpuError> {
            device.attribute(a).map_err(dev_err("device attribute"))
        };
        out.push(DeviceInfo {
            name: device.name().map_err(dev_err("device name"))?,
            max_threads_per_block: attr(
                CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK,
            )? as usize,
            shared_mem_per_block: attr(
                CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK,
            )? as usize,
            warp_size: attr(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_WARP_SIZE)? as usize,
            memory_clock_khz: attr(
                CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MEMORY_CLOCK_RATE,
            )? as u32,
            memory_bus_width_bits: attr(
                CUdevice_attribute::CU_DEVICE_ATTRIBUTE_GLOBAL_MEMORY_BUS_WIDTH,
            )? as u32,
        });
    }
    Ok(out)
}

/// A compiled kernel module on one device, shared by every sequence.
pub struct CudaContext {
    device: Arc<CudaDevice>,
    pub info: DeviceInfo,
}

impl CudaContext {
    pub fn new(ordinal: usize) -> Result<Self, GpuError> {
        let device = CudaDevice::new(ordinal).map_err(dev_err("device open"))?;
        let ptx = cudarc::nvrtc::compile_ptx(KERNEL_SRC)
            .map_err(|e| GpuError::Device(format!("kernel compile: {:?}", e)))?;
        device
            .load_ptx(ptx, MODULE, &["decimate_small", "decimate_large"])
            .map_err(dev_err("module load"))?;

        let info = probe_devices()?
            .into_iter()
            .nth(ordinal)
            .ok_or_else(|| GpuError::Device(format!("no device at ordinal {}", ordinal)))?;
        log::info!(
            "using {} ({} threads/block, {} KiB shared)",
            info.name,
            info.max_threads_per_block,
            info.shared_mem_per_block / 1024
        );
        Ok(CudaContext { device, info })
    }
}

/// Page-locked host staging buffer of floats. Required for the stream
/// copies to run as true DMA transfers instead of falling back to a
/// driver-side synchronous path.
struct PinnedBuffer {
    ptr: *mut f32,
    len: usize,
}

impl PinnedBuffer {
    fn new(len: usize) -> Result<Self, GpuError> {
        let bytes = len * std::mem::size_of::<f32>();
        let ptr = unsafe { result::malloc_host(bytes, 0) }
            .map_err(|_| GpuError::AllocFailure { bytes })?;
        Ok(PinnedBuffer {
            ptr: ptr as *mut f32,
            len,
        })
    }

    fn as_slice(&self) -> &[f32] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [f32] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// Interleave complex samples into the front of the buffer, returning
    /// the number of floats staged.
    fn stage(&mut self, samples: &[Complex32]) -> usize {
        let dst = self.as_mut_slice();
        for (i, s) in samples.iter().enumerate() {
            dst[2 * i] = s.re;
            dst[2 * i + 1] = s.im;
        }
        samples.len() * 2
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            let _ = unsafe { result::free_host(self.ptr as *mut c_void) };
        }
    }
}

// The buffer moves between the stream worker and the finalisation worker,
// never shared concurrently.
unsafe impl Send for PinnedBuffer {}

/// Device-resident buffer set for one sequence, mirroring the host
/// backend's `SequenceBuffers` surface. Owns the instance's forked device
/// stream; every copy and launch for the sequence is issued on it, so
/// concurrent sequences pipeline against each other on the GPU.
pub struct CudaPipeline {
    ctx: Arc<CudaContext>,
    stream: Option<CudaStream>,
    rf_samples: Option<CudaSlice<f32>>,
    stage_filters: Vec<CudaSlice<f32>>,
    stage_outputs: Vec<CudaSlice<f32>>,
    upload: Option<PinnedBuffer>,
    download: Option<PinnedBuffer>,
    host_output: Vec<Complex32>,
    freed: bool,
}

impl CudaPipeline {
    pub fn allocate(ctx: Arc<CudaContext>, plan: &DecimationPlan) -> Result<Self, GpuError> {
        for stage in &plan.stages {
            check_shared_mem(stage.bank.num_taps, stage.bank.num_freqs, &ctx.info)?;
        }

        let stream = ctx
            .device
            .fork_default_stream()
            .map_err(dev_err("stream create"))?;

        let alloc = |len: usize| -> Result<CudaSlice<f32>, GpuError> {
            ctx.device
                .alloc_zeros::<f32>(len * 2)
                .map_err(|_| GpuError::AllocFailure { bytes: len * 8 })
        };

        let rf_samples = Some(alloc(plan.num_antennas * plan.samples_per_antenna)?);
        let mut stage_filters = Vec::with_capacity(plan.stages.len());
        let mut stage_outputs = Vec::with_capacity(plan.stages.len());
        for (s, stage) in plan.stages.iter().enumerate() {
            stage_filters.push(alloc(stage.bank.taps().len())?);
            stage_outputs.push(alloc(plan.stage_output_len(s))?);
        }

        // One staging buffer serves the raw samples and, later, each tap
        // bank in turn; the drain gets its own.
        let mut staging = plan.num_antennas * plan.samples_per_antenna;
        for stage in &plan.stages {
            staging = staging.max(stage.bank.taps().len());
        }
        let upload = Some(PinnedBuffer::new(staging * 2)?);
        let download = Some(PinnedBuffer::new(plan.output_len() * 2)?);

        Ok(CudaPipeline {
            ctx,
            stream: Some(stream),
            rf_samples,
            stage_filters,
            stage_outputs,
            upload,
            download,
            host_output: Vec::new(),
            freed: false,
        })
    }

    fn check_live(&self) -> Result<(), GpuError> {
        if self.freed {
            return Err(GpuError::Device("sequence buffers already freed".into()));
        }
        Ok(())
    }

    fn raw_stream(&self) -> Result<sys::CUstream, GpuError> {
        self.stream
            .as_ref()
            .map(|s| s.stream)
            .ok_or_else(|| GpuError::Device("stream already destroyed".into()))
    }

    /// Block until everything issued on the instance stream has finished.
    fn sync(&self) -> Result<(), GpuError> {
        let raw = self.raw_stream()?;
        unsafe { result::stream::synchronize(raw) }
            .map_err(|e| GpuError::Device(format!("stream sync: {:?}", e)))
    }

    /// Stage complex samples into pinned memory and copy them into a
    /// device buffer on the instance stream, then wait for the copy: the
    /// op boundary above this call is the copy-complete callback.
    fn upload_to(
        upload: &mut PinnedBuffer,
        raw: sys::CUstream,
        samples: &[Complex32],
        dst: &CudaSlice<f32>,
    ) -> Result<(), GpuError> {
        let floats = upload.stage(samples);
        unsafe {
            result::memcpy_htod_async(*dst.device_ptr(), &upload.as_slice()[..floats], raw)
        }
        .map_err(|e| GpuError::CopyError(format!("{:?}", e)))
    }

    pub fn load_rf(&mut self, src: &[Complex32]) -> Result<(), GpuError> {
        self.check_live()?;
        let raw = self.raw_stream()?;
        let dst = self
            .rf_samples
            .as_ref()
            .ok_or_else(|| GpuError::Device("rf buffer missing".into()))?;
        let upload = self
            .upload
            .as_mut()
            .ok_or_else(|| GpuError::Device("staging buffer missing".into()))?;
        Self::upload_to(upload, raw, src, dst)?;
        self.sync()
    }

    pub fn load_filters(&mut self, plan: &DecimationPlan) -> Result<(), GpuError> {
        self.check_live()?;
        let raw = self.raw_stream()?;
        for (buf, stage) in self.stage_filters.iter().zip(plan.stages.iter()) {
            let upload = self
                .upload
                .as_mut()
                .ok_or_else(|| GpuError::Device("staging buffer missing".into()))?;
            Self::upload_to(upload, raw, stage.bank.taps(), buf)?;
            // The staging buffer is reused for the next bank; wait for the
            // in-flight copy before overwriting it.
            unsafe { result::stream::synchronize(raw) }
                .map_err(|e| GpuError::Device(format!("stream sync: {:?}", e)))?;
        }
        Ok(())
    }

    pub fn run_stage(&mut self, plan: &DecimationPlan, stage: usize) -> Result<(), GpuError> {
        self.check_live()?;
        let sp = &plan.stages[stage];
        let num_taps = sp.bank.num_taps;
        let num_freqs = sp.bank.num_freqs;
        let variant = KernelVariant::select(num_taps, num_freqs, &self.ctx.info)?;

        let (name, block_x) = match variant {
            KernelVariant::Small => ("decimate_small", num_taps),
            KernelVariant::Large => ("decimate_large", num_taps / 2),
        };
        let func = self
            .ctx
            .device
            .get_func(MODULE, name)
            .ok_or_else(|| GpuError::Device(format!("kernel {} not loaded", name)))?;

        let out_samples = sp.output_samples;
        let cfg = LaunchConfig {
            grid_dim: (out_samples as u32, plan.num_antennas as u32, 1),
            block_dim: (block_x as u32, num_freqs as u32, 1),
            shared_mem_bytes: (num_freqs * block_x * 8) as u32,
        };

        let freq_major_input: u32 = if stage == 0 { 0 } else { 1 };
        let (done, rest) = self.stage_outputs.split_at_mut(stage);
        let input: &CudaSlice<f32> = if stage == 0 {
            self.rf_samples
                .as_ref()
                .ok_or_else(|| GpuError::Device("rf buffer missing".into()))?
        } else {
            &done[stage - 1]
        };

        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| GpuError::Device("stream already destroyed".into()))?;

        // Asynchronous: stages queue behind each other on the instance
        // stream, and the drain's copy queues behind the last stage.
        unsafe {
            func.launch_on_stream(
                stream,
                cfg,
                (
                    input,
                    &self.stage_filters[stage],
                    &mut rest[0],
                    sp.dm_rate as u32,
                    sp.input_samples as u32,
                    plan.num_antennas as u32,
                    freq_major_input,
                ),
            )
        }
        .map_err(|e| GpuError::Device(format!("kernel launch: {:?}", e)))
    }

    pub fn drain(&mut self) -> Result<(), GpuError> {
        self.check_live()?;
        let raw = self.raw_stream()?;
        let last = self
            .stage_outputs
            .last()
            .ok_or_else(|| GpuError::Device("no stages".into()))?;
        let download = self
            .download
            .as_mut()
            .ok_or_else(|| GpuError::Device("staging buffer missing".into()))?;

        let n = download.len;
        unsafe {
            result::memcpy_dtoh_async(&mut download.as_mut_slice()[..n], *last.device_ptr(), raw)
        }
        .map_err(|e| GpuError::CopyError(format!("{:?}", e)))?;
        self.sync()?;

        let download = self
            .download
            .as_ref()
            .ok_or_else(|| GpuError::Device("staging buffer missing".into()))?;
        self.host_output = download
            .as_slice()
            .chunks_exact(2)
            .map(|c| Complex32::new(c[0], c[1]))
            .collect();
        Ok(())
    }

    pub fn output(&self) -> &[Complex32] {
        &self.host_output
    }

    pub fn take_output(&mut self) -> Vec<Complex32> {
        std::mem::take(&mut self.host_output)
    }

    pub fn free(&mut self) {
        if self.freed {
            return;
        }
        // Let in-flight work retire before its buffers go away.
        let _ = self.sync();
        self.rf_samples = None;
        self.stage_filters.clear();
        self.stage_outputs.clear();
        self.upload = None;
        self.download = None;
        self.host_output = Vec::new();
        self.stream = None;
        self.freed = true;
    }
}

impl Drop for CudaPipeline {
    fn drop(&mut self) {
        self.free();
    }
}
