// Copyright 2025-2026 Aurora Radar Group

//! Per-sequence buffer sets.
//!
//! Every live sequence owns its raw-sample buffer, a tap bank and an output
//! buffer per stage, and the pinned host buffer the final stage drains
//! into. Allocation failure is fatal for that sequence only; the instance
//! reports it and the pipeline moves on. Freeing is idempotent so teardown
//! can race a destructor without consequence.

use num_complex::Complex32;

use ar_dsp::DecimationPlan;

use crate::kernels::{launch_decimate, DecimateArgs, InputLayout};
use crate::probe::{check_shared_mem, DeviceInfo, KernelVariant};
use crate::GpuError;

/// A device-resident sample buffer. The host backend keeps the image in
/// ordinary memory; the layout and lifetime contract match the device.
#[derive(Debug)]
pub struct DeviceBuffer {
    data: Vec<Complex32>,
}

/// Page-locked host buffer for the final asynchronous drain.
#[derive(Debug)]
pub struct PinnedBuffer {
    data: Vec<Complex32>,
}

fn try_alloc(len: usize) -> Result<Vec<Complex32>, GpuError> {
    let mut v: Vec<Complex32> = Vec::new();
    v.try_reserve_exact(len).map_err(|_| GpuError::AllocFailure {
        bytes: len * std::mem::size_of::<Complex32>(),
    })?;
    v.resize(len, Complex32::new(0.0, 0.0));
    Ok(v)
}

/// All allocations for one sequence.
pub struct SequenceBuffers {
    rf_samples: DeviceBuffer,
    stage_filters: Vec<DeviceBuffer>,
    stage_outputs: Vec<DeviceBuffer>,
    host_output: PinnedBuffer,
    freed: bool,
}

impl SequenceBuffers {
    /// Allocate everything the plan needs, checking the filter tiles
    /// against the device's shared-memory capacity first.
    pub fn allocate(plan: &DecimationPlan, dev: &DeviceInfo) -> Result<Self, GpuError> {
        for stage in &plan.stages {
            check_shared_mem(stage.bank.num_taps, stage.bank.num_freqs, dev)?;
        }

        let rf_samples = DeviceBuffer {
            data: try_alloc(plan.num_antennas * plan.samples_per_antenna)?,
        };

        let mut stage_filters = Vec::with_capacity(plan.stages.len());
        let mut stage_outputs = Vec::with_capacity(plan.stages.len());
        for (s, stage) in plan.stages.iter().enumerate() {
            stage_filters.push(DeviceBuffer {
                data: try_alloc(stage.bank.taps().len())?,
            });
            stage_outputs.push(DeviceBuffer {
                data: try_alloc(plan.stage_output_len(s))?,
            });
        }

        let host_output = PinnedBuffer {
            data: try_alloc(plan.output_len())?,
        };

        Ok(SequenceBuffers {
            rf_samples,
            stage_filters,
            stage_outputs,
            host_output,
            freed: false,
        })
    }

    fn check_live(&self) -> Result<(), GpuError> {
        if self.freed {
            return Err(GpuError::Device("sequence buffers already freed".into()));
        }
        Ok(())
    }

    /// H->D image: copy the ring-buffer slot into the sample buffer.
    pub fn load_rf(&mut self, src: &[Complex32]) -> Result<(), GpuError> {
        self.check_live()?;
        if src.len() != self.rf_samples.data.len() {
            return Err(GpuError::CopyError(format!(
                "slot holds {} samples, sequence expects {}",
                src.len(),
                self.rf_samples.data.len()
            )));
        }
        self.rf_samples.data.copy_from_slice(src);
        Ok(())
    }

    /// Copy all three stages' tap banks up.
    pub fn load_filters(&mut self, plan: &DecimationPlan) -> Result<(), GpuError> {
        self.check_live()?;
        for (buf, stage) in self.stage_filters.iter_mut().zip(plan.stages.iter()) {
            buf.data.copy_from_slice(stage.bank.taps());
        }
        Ok(())
    }

    /// Run one stage's kernel, reading the previous stage's output (or the
    /// raw samples for stage 0).
    pub fn run_stage(
        &mut self,
        plan: &DecimationPlan,
        stage: usize,
        dev: &DeviceInfo,
    ) -> Result<(), GpuError> {
        self.check_live()?;
        let sp = &plan.stages[stage];
        let variant = KernelVariant::select(sp.bank.num_taps, sp.bank.num_freqs, dev)?;

        let (done, rest) = self.stage_outputs.split_at_mut(stage);
        let (input, layout) = if stage == 0 {
            (&self.rf_samples.data[..], InputLayout::AntennaMajor)
        } else {
            (&done[stage - 1].data[..], InputLayout::FrequencyMajor)
        };

        launch_decimate(
            DecimateArgs {
                variant,
                layout,
                input,
                taps: &self.stage_filters[stage].data,
                output: &mut rest[0].data,
                dm_rate: sp.dm_rate,
                samples_per_stream: sp.input_samples,
                num_antennas: plan.num_antennas,
                num_freqs: plan.num_freqs,
                num_taps: sp.bank.num_taps,
            },
            dev,
        )
    }

    /// D->H image: drain the final stage into the pinned host buffer.
    pub fn drain(&mut self) -> Result<(), GpuError> {
        self.check_live()?;
        let last = self
            .stage_outputs
            .last()
            .ok_or_else(|| GpuError::Device("no stages".into()))?;
        self.host_output.data.copy_from_slice(&last.data);
        Ok(())
    }

    /// The drained decimated block.
    pub fn output(&self) -> &[Complex32] {
        &self.host_output.data
    }

    /// Take the drained block, leaving the pinned buffer empty.
    pub fn take_output(&mut self) -> Vec<Complex32> {
        std::mem::take(&mut self.host_output.data)
    }

    /// Release every allocation. Safe to call more than once.
    pub fn free(&mut self) {
        if self.freed {
            return;
        }
        self.rf_samples.data = Vec::new();
        self.stage_filters.clear();
        self.stage_outputs.clear();
        self.host_output.data = Vec::new();
        self.freed = true;
    }

    pub fn is_freed(&self) -> bool {
        self.freed
    }
}

impl Drop for SequenceBuffers {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ar_dsp::DecimationPlan;

    fn small_plan() -> DecimationPlan {
        DecimationPlan::design(&[0.0], 1.0e6, &[2, 2, 2], 2, 256).unwrap()
    }

    #[test]
    fn test_allocate_sizes_match_plan() {
        let plan = small_plan();
        let bufs = SequenceBuffers::allocate(&plan, &DeviceInfo::emulated()).unwrap();
        assert_eq!(bufs.rf_samples.data.len(), 2 * 256);
        assert_eq!(bufs.stage_outputs[0].data.len(), plan.stage_output_len(0));
        assert_eq!(bufs.stage_outputs[2].data.len(), plan.output_len());
        assert_eq!(bufs.host_output.data.len(), plan.output_len());
    }

    #[test]
    fn test_full_chain_runs() {
        let plan = small_plan();
        let dev = DeviceInfo::emulated();
        let mut bufs = SequenceBuffers::allocate(&plan, &dev).unwrap();

        let rf = vec![Complex32::new(1.0, 0.0); 2 * 256];
        bufs.load_rf(&rf).unwrap();
        bufs.load_filters(&plan).unwrap();
        for s in 0..3 {
            bufs.run_stage(&plan, s, &dev).unwrap();
        }
        bufs.drain().unwrap();
        assert_eq!(bufs.output().len(), plan.output_len());
    }

    #[test]
    fn test_load_rf_rejects_short_slot() {
        let plan = small_plan();
        let mut bufs = SequenceBuffers::allocate(&plan, &DeviceInfo::emulated()).unwrap();
        let short = vec![Complex32::new(0.0, 0.0); 100];
        assert!(matches!(
            bufs.load_rf(&short),
            Err(GpuError::CopyError(_))
        ));
    }

    #[test]
    fn test_free_is_idempotent() {
        let plan = small_plan();
        let mut bufs = SequenceBuffers::allocate(&plan, &DeviceInfo::emulated()).unwrap();
        bufs.free();
        assert!(bufs.is_freed());
        bufs.free();
        assert!(bufs.is_freed());
        assert!(bufs.load_filters(&plan).is_err());
    }

    #[test]
    fn test_absurd_allocation_fails_cleanly() {
        assert!(matches!(
            try_alloc(usize::MAX / 64),
            Err(GpuError::AllocFailure { .. })
        ));
    }

    #[test]
    fn test_shared_mem_cap_rejected_at_allocate() {
        // A tile bigger than shared memory must be refused before any
        // allocation happens.
        let plan = DecimationPlan::design(
            &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            5.0e6,
            &[10, 10, 5],
            2,
            1000,
        )
        .unwrap();
        let mut dev = DeviceInfo::emulated();
        dev.shared_mem_per_block = 4096;
        assert!(matches!(
            SequenceBuffers::allocate(&plan, &dev),
            Err(GpuError::SharedMemExceeded { .. })
        ));
    }
}
