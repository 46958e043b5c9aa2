// Copyright 2025-2026 Aurora Radar Group

//! Per-sequence decimation plan: the three stage filter banks plus the rate
//! and sample-count bookkeeping the kernels and buffer manager need.

use thiserror::Error;

use crate::filters::{build_stage_filters, FilterBank, FilterError};

#[derive(Error, Debug)]
pub enum PlanError {
    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error("decimation rate for stage {0} is zero")]
    ZeroDmRate(usize),

    #[error("{samples} samples per antenna not divisible by total decimation {total}")]
    NotDivisible { samples: usize, total: usize },

    #[error("no antennas in sequence")]
    NoAntennas,

    #[error("no samples in sequence")]
    NoSamples,
}

/// One filter+downsample pass.
#[derive(Debug, Clone)]
pub struct StagePlan {
    pub stage: usize,
    pub dm_rate: usize,
    pub input_rate: f64,
    pub output_rate: f64,
    /// Samples per (frequency, antenna) stream entering this stage.
    pub input_samples: usize,
    /// Samples per stream leaving this stage.
    pub output_samples: usize,
    pub bank: FilterBank,
}

/// The full three-stage plan for one sequence.
#[derive(Debug, Clone)]
pub struct DecimationPlan {
    pub num_freqs: usize,
    pub num_antennas: usize,
    pub samples_per_antenna: usize,
    pub stages: Vec<StagePlan>,
}

impl DecimationPlan {
    pub fn design(
        rx_freqs: &[f64],
        rx_rate: f64,
        dm_rates: &[u32; 3],
        num_antennas: usize,
        samples_per_antenna: usize,
    ) -> Result<Self, PlanError> {
        if num_antennas == 0 {
            return Err(PlanError::NoAntennas);
        }
        if samples_per_antenna == 0 {
            return Err(PlanError::NoSamples);
        }

        let mut total = 1usize;
        for (s, &d) in dm_rates.iter().enumerate() {
            if d == 0 {
                return Err(PlanError::ZeroDmRate(s));
            }
            total *= d as usize;
        }
        if samples_per_antenna % total != 0 {
            return Err(PlanError::NotDivisible {
                samples: samples_per_antenna,
                total,
            });
        }

        let mut stages = Vec::with_capacity(3);
        let mut input_rate = rx_rate;
        let mut input_samples = samples_per_antenna;
        for (s, &d) in dm_rates.iter().enumerate() {
            let dm_rate = d as usize;
            let output_rate = input_rate / dm_rate as f64;
            let bank = build_stage_filters(s, rx_freqs, input_rate, output_rate)?;
            let output_samples = input_samples / dm_rate;
            stages.push(StagePlan {
                stage: s,
                dm_rate,
                input_rate,
                output_rate,
                input_samples,
                output_samples,
                bank,
            });
            input_rate = output_rate;
            input_samples = output_samples;
        }

        Ok(DecimationPlan {
            num_freqs: rx_freqs.len(),
            num_antennas,
            samples_per_antenna,
            stages,
        })
    }

    pub fn total_decimation(&self) -> usize {
        self.stages.iter().map(|s| s.dm_rate).product()
    }

    /// Samples per (frequency, antenna) stream in the final output.
    pub fn output_samples_per_stream(&self) -> usize {
        self.stages.last().map(|s| s.output_samples).unwrap_or(0)
    }

    /// Total length of the final decimated block.
    pub fn output_len(&self) -> usize {
        self.num_freqs * self.num_antennas * self.output_samples_per_stream()
    }

    /// Total length of one stage's output buffer.
    pub fn stage_output_len(&self, stage: usize) -> usize {
        self.num_freqs * self.num_antennas * self.stages[stage].output_samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_rate_chain() {
        let plan =
            DecimationPlan::design(&[1.0e6], 5.0e6, &[10, 10, 5], 20, 1_000_000).unwrap();
        assert_eq!(plan.total_decimation(), 500);
        assert_eq!(plan.output_samples_per_stream(), 2000);
        assert_eq!(plan.output_len(), 20 * 2000);

        assert_eq!(plan.stages[0].input_samples, 1_000_000);
        assert_eq!(plan.stages[0].output_samples, 100_000);
        assert_eq!(plan.stages[1].output_samples, 10_000);
        assert_eq!(plan.stages[2].output_samples, 2000);
        assert!((plan.stages[2].output_rate - 10_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_plan_rejects_indivisible_samples() {
        let err = DecimationPlan::design(&[0.0], 5.0e6, &[10, 10, 5], 20, 1_000_001)
            .unwrap_err();
        assert!(matches!(err, PlanError::NotDivisible { total: 500, .. }));
    }

    #[test]
    fn test_plan_rejects_zero_rate() {
        let err = DecimationPlan::design(&[0.0], 5.0e6, &[10, 0, 5], 20, 1_000_000)
            .unwrap_err();
        assert!(matches!(err, PlanError::ZeroDmRate(1)));
    }

    #[test]
    fn test_stage_output_lengths() {
        let plan = DecimationPlan::design(&[0.1e6, -0.1e6], 1.0e6, &[5, 2, 2], 4, 2000)
            .unwrap();
        assert_eq!(plan.stage_output_len(0), 2 * 4 * 400);
        assert_eq!(plan.stage_output_len(1), 2 * 4 * 200);
        assert_eq!(plan.stage_output_len(2), 2 * 4 * 100);
    }
}
