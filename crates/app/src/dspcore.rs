// Copyright 2025-2026 Aurora Radar Group

//! Per-sequence pipeline orchestrator.
//!
//! Each admitted sequence gets one `DspCore`: a private work stream, three
//! timing events, its buffer set and its ring-buffer slot lease. The whole
//! flow is enqueued up front; the copy-complete callback acks the slot
//! back to the controller before any kernel runs, and the finalisation
//! callback hands teardown to a short-lived worker so the stream thread
//! never blocks on itself.
//!
//! A sequence either completes all steps or fails and tears down cleanly;
//! either way the timing channel hears about it exactly once.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use crossbeam::channel::Sender;
use num_complex::Complex32;
use thiserror::Error;

use ar_comms::{SequenceRequest, SequenceSink, SequenceStatus, TimingMsg};
use ar_config::SiteConfig;
use ar_dsp::{DecimationPlan, PlanError};
use ar_gpu::probe::KernelVariant;
use ar_gpu::{DeviceInfo, Event, GpuError, SequenceBuffers, Stream};
use ar_shm::{ShmError, ShmSlot};

#[cfg(feature = "cuda")]
use ar_gpu::cuda::{CudaContext, CudaPipeline};

/// Sentinel kernel time reported for failed sequences.
const FAILED_KERNEL_TIME_MS: f32 = -1.0;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Shm(#[from] ShmError),

    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl PipelineError {
    /// Status discriminant for the sentinel timing report.
    pub fn status(&self) -> SequenceStatus {
        match self {
            PipelineError::Plan(_) => SequenceStatus::BadRequest,
            PipelineError::BadRequest(_) => SequenceStatus::BadRequest,
            PipelineError::Shm(ShmError::SlotMissing(_)) => SequenceStatus::SlotMissing,
            PipelineError::Shm(ShmError::SizeMismatch { .. }) => SequenceStatus::BadRequest,
            PipelineError::Shm(_) => SequenceStatus::SlotMissing,
            PipelineError::Gpu(GpuError::AllocFailure { .. }) => SequenceStatus::AllocFailure,
            PipelineError::Gpu(GpuError::BadLaunchConfig { .. }) => {
                SequenceStatus::BadLaunchConfig
            }
            PipelineError::Gpu(GpuError::SharedMemExceeded { .. }) => {
                SequenceStatus::BadLaunchConfig
            }
            PipelineError::Gpu(_) => SequenceStatus::CopyError,
        }
    }
}

/// The final decimated block, frequency-major, handed to the beamforming
/// stage.
pub struct SequenceOutput {
    pub sequence_num: u32,
    pub num_freqs: usize,
    pub num_antennas: usize,
    pub samples_per_stream: usize,
    pub samples: Vec<Complex32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoreState {
    Init = 0,
    Copying = 1,
    CopyAcked = 2,
    Stage1 = 3,
    Stage2 = 4,
    Stage3 = 5,
    Draining = 6,
    Done = 7,
    Failed = 8,
}

impl CoreState {
    fn from_u8(v: u8) -> CoreState {
        match v {
            0 => CoreState::Init,
            1 => CoreState::Copying,
            2 => CoreState::CopyAcked,
            3 => CoreState::Stage1,
            4 => CoreState::Stage2,
            5 => CoreState::Stage3,
            6 => CoreState::Draining,
            7 => CoreState::Done,
            _ => CoreState::Failed,
        }
    }
}

/// Buffer backend for one sequence: the host image, or the real device
/// when built with `cuda` and a context is supplied.
enum Backend {
    Host(SequenceBuffers),
    #[cfg(feature = "cuda")]
    Cuda(CudaPipeline),
}

impl Backend {
    fn load_rf(&mut self, src: &[Complex32]) -> Result<(), GpuError> {
        match self {
            Backend::Host(b) => b.load_rf(src),
            #[cfg(feature = "cuda")]
            Backend::Cuda(b) => b.load_rf(src),
        }
    }

    fn load_filters(&mut self, plan: &DecimationPlan) -> Result<(), GpuError> {
        match self {
            Backend::Host(b) => b.load_filters(plan),
            #[cfg(feature = "cuda")]
            Backend::Cuda(b) => b.load_filters(plan),
        }
    }

    fn run_stage(
        &mut self,
        plan: &DecimationPlan,
        stage: usize,
        dev: &DeviceInfo,
    ) -> Result<(), GpuError> {
        match self {
            Backend::Host(b) => b.run_stage(plan, stage, dev),
            #[cfg(feature = "cuda")]
            Backend::Cuda(b) => b.run_stage(plan, stage),
        }
    }

    fn drain(&mut self) -> Result<(), GpuError> {
        match self {
            Backend::Host(b) => b.drain(),
            #[cfg(feature = "cuda")]
            Backend::Cuda(b) => b.drain(),
        }
    }

    fn take_output(&mut self) -> Vec<Complex32> {
        match self {
            Backend::Host(b) => b.take_output(),
            #[cfg(feature = "cuda")]
            Backend::Cuda(b) => b.take_output(),
        }
    }

    fn free(&mut self) {
        match self {
            Backend::Host(b) => b.free(),
            #[cfg(feature = "cuda")]
            Backend::Cuda(b) => b.free(),
        }
    }
}

struct CoreInner {
    sequence_num: u32,
    plan: DecimationPlan,
    dev: DeviceInfo,

    state: AtomicU8,
    destroyed: AtomicBool,
    error: Mutex<Option<PipelineError>>,

    backend: Mutex<Option<Backend>>,
    slot: Mutex<Option<ShmSlot>>,
    stream: Mutex<Option<Stream>>,

    initial_start: Event,
    kernel_start: Event,
    stop: Event,
    finished: Event,

    sink: Arc<dyn SequenceSink>,
    output_tx: Option<Sender<SequenceOutput>>,
}

impl CoreInner {
    fn set_state(&self, s: CoreState) {
        self.state.store(s as u8, Ordering::SeqCst);
    }

    fn fail(&self, err: PipelineError) {
        log::warn!("sequence {} failed: {}", self.sequence_num, err);
        let mut slot = match self.error.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn has_failed(&self) -> bool {
        match self.error.lock() {
            Ok(g) => g.is_some(),
            Err(p) => p.into_inner().is_some(),
        }
    }

    fn with_backend<F>(&self, f: F) -> Result<(), GpuError>
    where
        F: FnOnce(&mut Backend) -> Result<(), GpuError>,
    {
        let mut guard = match self.backend.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        match guard.as_mut() {
            Some(b) => f(b),
            None => Err(GpuError::Device("backend already torn down".into())),
        }
    }

    /// Runs on the short-lived finalisation worker.
    fn finalize(&self) {
        self.stop.synchronize();

        let error = {
            let mut guard = match self.error.lock() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            guard.take()
        };

        match error {
            None => {
                let kernel_ms = self
                    .kernel_start
                    .elapsed_ms_until(&self.stop)
                    .unwrap_or(FAILED_KERNEL_TIME_MS);
                let total_ms = self
                    .initial_start
                    .elapsed_ms_until(&self.stop)
                    .unwrap_or(FAILED_KERNEL_TIME_MS);
                log::debug!(
                    "sequence {}: kernels {:.3} ms, total {:.3} ms",
                    self.sequence_num,
                    kernel_ms,
                    total_ms
                );
                self.sink.send_timing(&TimingMsg {
                    sequence_num: self.sequence_num,
                    kernel_time_ms: kernel_ms,
                    status: SequenceStatus::Ok,
                });

                if let Some(tx) = &self.output_tx {
                    let samples = {
                        let mut guard = match self.backend.lock() {
                            Ok(g) => g,
                            Err(p) => p.into_inner(),
                        };
                        guard.as_mut().map(|b| b.take_output()).unwrap_or_default()
                    };
                    let out = SequenceOutput {
                        sequence_num: self.sequence_num,
                        num_freqs: self.plan.num_freqs,
                        num_antennas: self.plan.num_antennas,
                        samples_per_stream: self.plan.output_samples_per_stream(),
                        samples,
                    };
                    if tx.send(out).is_err() {
                        log::warn!(
                            "sequence {}: downstream consumer gone",
                            self.sequence_num
                        );
                    }
                }
                self.set_state(CoreState::Done);
            }
            Some(err) => {
                self.sink.send_timing(&TimingMsg {
                    sequence_num: self.sequence_num,
                    kernel_time_ms: FAILED_KERNEL_TIME_MS,
                    status: err.status(),
                });
                self.set_state(CoreState::Failed);
            }
        }

        self.teardown();
        self.finished.record();
    }

    /// Free buffers, release the slot lease, destroy the stream. Safe to
    /// call any number of times from any thread except the stream itself.
    fn teardown(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut guard = match self.backend.lock() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            if let Some(mut b) = guard.take() {
                b.free();
            }
        }
        {
            // Dropping the mapping releases the lease; the controller was
            // already told via the ack that the data is off the slot.
            let mut guard = match self.slot.lock() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            guard.take();
        }
        {
            let mut guard = match self.stream.lock() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            if let Some(s) = guard.take() {
                s.destroy();
            }
        }
    }
}

/// Which backend a sequence should run on.
#[derive(Clone)]
pub enum BackendSel {
    Host,
    #[cfg(feature = "cuda")]
    Cuda(Arc<CudaContext>),
}

/// Handle to one sequence's pipeline instance.
pub struct DspCore {
    inner: Arc<CoreInner>,
}

impl std::fmt::Debug for DspCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DspCore").finish_non_exhaustive()
    }
}

impl DspCore {
    /// Admit a sequence: validate, design filters, lease the slot,
    /// allocate, and enqueue the whole flow on a fresh stream.
    ///
    /// Errors before admission send the sentinel timing report themselves;
    /// the pipeline keeps accepting further sequences either way.
    pub fn submit(
        request: &SequenceRequest,
        config: &SiteConfig,
        dev: &DeviceInfo,
        sink: Arc<dyn SequenceSink>,
        output_tx: Option<Sender<SequenceOutput>>,
        sel: BackendSel,
    ) -> Result<DspCore, PipelineError> {
        match Self::admit(request, config, dev, sink.clone(), output_tx, sel) {
            Ok(core) => Ok(core),
            Err(err) => {
                sink.send_timing(&TimingMsg {
                    sequence_num: request.sequence_num,
                    kernel_time_ms: FAILED_KERNEL_TIME_MS,
                    status: err.status(),
                });
                Err(err)
            }
        }
    }

    fn admit(
        request: &SequenceRequest,
        config: &SiteConfig,
        dev: &DeviceInfo,
        sink: Arc<dyn SequenceSink>,
        output_tx: Option<Sender<SequenceOutput>>,
        sel: BackendSel,
    ) -> Result<DspCore, PipelineError> {
        if request.num_antennas != config.total_antennas() {
            return Err(PipelineError::BadRequest(format!(
                "request names {} antennas, site has {}",
                request.num_antennas,
                config.total_antennas()
            )));
        }
        if request.rx_rate_hz > config.max_rx_sample_rate {
            return Err(PipelineError::BadRequest(format!(
                "rx rate {} Hz over site cap {} Hz",
                request.rx_rate_hz, config.max_rx_sample_rate
            )));
        }

        let plan = DecimationPlan::design(
            &request.rx_freqs_hz,
            request.rx_rate_hz,
            &request.dm_rates,
            request.num_antennas as usize,
            request.samples_per_antenna as usize,
        )?;

        let output_rate = request.rx_rate_hz / plan.total_decimation() as f64;
        if output_rate > config.max_output_sample_rate {
            return Err(PipelineError::BadRequest(format!(
                "output rate {} Hz over site cap {} Hz",
                output_rate, config.max_output_sample_rate
            )));
        }

        // Kernel geometry must be decidable before we touch the slot.
        for stage in &plan.stages {
            KernelVariant::select(stage.bank.num_taps, stage.bank.num_freqs, dev)?;
            if stage.bank.num_taps > config.max_filter_taps_per_stage as usize {
                return Err(PipelineError::BadRequest(format!(
                    "stage {} needs {} taps, site cap is {}",
                    stage.stage, stage.bank.num_taps, config.max_filter_taps_per_stage
                )));
            }
        }

        let slot = ShmSlot::open(
            &request.slot_name,
            plan.num_antennas * plan.samples_per_antenna,
        )?;

        let backend = match sel {
            BackendSel::Host => Backend::Host(SequenceBuffers::allocate(&plan, dev)?),
            #[cfg(feature = "cuda")]
            BackendSel::Cuda(ctx) => Backend::Cuda(CudaPipeline::allocate(ctx, &plan)?),
        };

        let stream = Stream::new(&format!("seq-{}", request.sequence_num))?;

        let inner = Arc::new(CoreInner {
            sequence_num: request.sequence_num,
            plan,
            dev: dev.clone(),
            state: AtomicU8::new(CoreState::Init as u8),
            destroyed: AtomicBool::new(false),
            error: Mutex::new(None),
            backend: Mutex::new(Some(backend)),
            slot: Mutex::new(Some(slot)),
            stream: Mutex::new(Some(stream)),
            initial_start: Event::new(),
            kernel_start: Event::new(),
            stop: Event::new(),
            finished: Event::new(),
            sink,
            output_tx,
        });

        Self::enqueue(&inner);
        log::info!(
            "sequence {} admitted: {} freqs, {} antennas, {} samples/antenna",
            inner.sequence_num,
            inner.plan.num_freqs,
            inner.plan.num_antennas,
            inner.plan.samples_per_antenna
        );
        Ok(DspCore { inner })
    }

    /// Enqueue the eight-step flow on the instance's stream.
    fn enqueue(inner: &Arc<CoreInner>) {
        let stream_guard = match inner.stream.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        let stream = match stream_guard.as_ref() {
            Some(s) => s,
            None => return,
        };

        // 1. Timing starts when the stream first turns over.
        stream.record(&inner.initial_start);

        // 2. H->D copy of the slot samples.
        let core = inner.clone();
        stream.exec(move || {
            if core.has_failed() {
                return;
            }
            core.set_state(CoreState::Copying);
            let slot_guard = match core.slot.lock() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            let result = match slot_guard.as_ref() {
                Some(slot) => {
                    let samples = slot.as_slice();
                    core.with_backend(|b| b.load_rf(samples))
                }
                None => Err(GpuError::Device("slot lease lost".into())),
            };
            drop(slot_guard);
            if let Err(e) = result {
                core.fail(PipelineError::Gpu(e));
            }
        });

        // 3. Copy-complete callback: ack frees the controller to start the
        // next sequence, then kernel timing is armed. No blocking device
        // work may happen here.
        let core = inner.clone();
        stream.exec(move || {
            if core.has_failed() {
                return;
            }
            core.sink.send_ack(core.sequence_num);
            core.set_state(CoreState::CopyAcked);
            core.kernel_start.record();
        });

        // 4. Stage filter banks up to the device.
        let core = inner.clone();
        stream.exec(move || {
            if core.has_failed() {
                return;
            }
            if let Err(e) = core.with_backend(|b| b.load_filters(&core.plan)) {
                core.fail(PipelineError::Gpu(e));
            }
        });

        // 5. The three decimation stages, in order.
        for stage in 0..3 {
            let core = inner.clone();
            stream.exec(move || {
                if core.has_failed() {
                    return;
                }
                core.set_state(match stage {
                    0 => CoreState::Stage1,
                    1 => CoreState::Stage2,
                    _ => CoreState::Stage3,
                });
                let started = Instant::now();
                let result = core.with_backend(|b| b.run_stage(&core.plan, stage, &core.dev));
                log::debug!(
                    "sequence {} stage {}: {:?}",
                    core.sequence_num,
                    stage + 1,
                    started.elapsed()
                );
                if let Err(e) = result {
                    core.fail(PipelineError::Gpu(e));
                }
            });
        }

        // 6. D->H drain into the pinned host buffer.
        let core = inner.clone();
        stream.exec(move || {
            if core.has_failed() {
                return;
            }
            core.set_state(CoreState::Draining);
            if let Err(e) = core.with_backend(|b| b.drain()) {
                core.fail(PipelineError::Gpu(e));
            }
        });

        // 7. Stop marker.
        stream.record(&inner.stop);

        // 8. Finalisation callback: hand everything else to a short-lived
        // worker; the stream thread must stay free of blocking calls and
        // cannot join itself.
        let core = inner.clone();
        stream.exec(move || {
            let worker = core.clone();
            let spawned = thread::Builder::new()
                .name(format!("finalize-{}", worker.sequence_num))
                .spawn(move || worker.finalize());
            if let Err(e) = spawned {
                log::error!(
                    "sequence {}: failed to spawn finalisation worker: {}",
                    core.sequence_num,
                    e
                );
                core.finalize();
            }
        });
    }

    pub fn sequence_num(&self) -> u32 {
        self.inner.sequence_num
    }

    pub fn state(&self) -> CoreState {
        CoreState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// Block until the sequence has completed or failed and torn down.
    pub fn wait(&self) {
        self.inner.finished.synchronize();
    }

    /// Explicit teardown; a no-op if the instance already destroyed itself.
    pub fn destroy(&self) {
        self.inner.teardown();
    }

    /// Stamp of the kernel-start event, once the copy callback has fired.
    pub fn kernel_start_time(&self) -> Option<Instant> {
        self.inner.kernel_start.query()
    }
}
