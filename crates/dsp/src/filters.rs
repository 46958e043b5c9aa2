// Copyright 2025-2026 Aurora Radar Group

//! Per-stage FIR design.
//!
//! Stage 1 runs a complex bandpass per receive frequency: one Kaiser
//! windowed-sinc lowpass mixed up to each frequency's offset from the local
//! oscillator. Stages 2 and 3 run the same real lowpass for every frequency.
//! Every filter is padded to a power-of-two length so the kernel reduction
//! can halve it cleanly, and normalised to unit gain at its band centre.

use std::f64::consts::PI;

use num_complex::Complex32;
use thiserror::Error;

/// Shortest filter the reduction accepts.
pub const MIN_FILTER_TAPS: usize = 4;
/// Per-stage tap ceiling after padding.
pub const MAX_FILTER_TAPS: usize = 2048;

/// Stopband attenuation target for every stage, dB.
const STOPBAND_ATTEN_DB: f64 = 60.0;
/// Passband edge as a fraction of the post-stage Nyquist rate.
const PASSBAND_FRACTION: f64 = 0.8;
/// Transition band as a fraction of the post-stage Nyquist rate.
const TRANSITION_FRACTION: f64 = 0.4;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("no receive frequencies given")]
    NoFrequencies,

    #[error("stage {stage} rates invalid: {input_rate} Hz -> {output_rate} Hz")]
    BadRate {
        stage: usize,
        input_rate: f64,
        output_rate: f64,
    },

    #[error("stage {stage} needs {taps} taps, cap is {cap}")]
    TooManyTaps {
        stage: usize,
        taps: usize,
        cap: usize,
    },
}

/// A frequency-major bank of complex taps: `num_freqs` rows of `num_taps`.
#[derive(Debug, Clone)]
pub struct FilterBank {
    pub num_freqs: usize,
    pub num_taps: usize,
    taps: Vec<Complex32>,
}

impl FilterBank {
    pub fn taps(&self) -> &[Complex32] {
        &self.taps
    }

    /// Taps for one frequency row.
    pub fn row(&self, freq_idx: usize) -> &[Complex32] {
        let start = freq_idx * self.num_taps;
        &self.taps[start..start + self.num_taps]
    }
}

/// Kaiser window shape for the 60 dB stopband target: beta = 0.1102(A - 8.7)
/// evaluated at A = 60.
const KAISER_SHAPE: f64 = 5.65326;

/// Zeroth-order modified Bessel function of the first kind, evaluated by
/// its power series I0(x) = sum_k ((x/2)^k / k!)^2.
fn bessel_i0(x: f64) -> f64 {
    let half = 0.5 * x;
    let mut total = 1.0;
    let mut term = 1.0;
    let mut k = 1.0f64;
    loop {
        let factor = half / k;
        term *= factor * factor;
        total += term;
        if term <= total * 1e-16 {
            return total;
        }
        k += 1.0;
    }
}

/// Kaiser window of length `len` at the fixed 60 dB shape.
fn kaiser_window(len: usize) -> Vec<f64> {
    let centre = (len as f64 - 1.0) / 2.0;
    let peak = bessel_i0(KAISER_SHAPE);
    (0..len)
        .map(|i| {
            let r = (i as f64 - centre) / centre;
            bessel_i0(KAISER_SHAPE * (1.0 - r * r).max(0.0).sqrt()) / peak
        })
        .collect()
}

/// Kaiser estimate of the FIR order for a given transition band.
fn ideal_length(atten_db: f64, transition_hz: f64, sample_rate: f64) -> usize {
    let delta_omega = 2.0 * PI * transition_hz / sample_rate;
    let n = (atten_db - 7.95) / (2.285 * delta_omega);
    (n.ceil() as usize).max(MIN_FILTER_TAPS)
}

/// Kaiser-windowed sinc lowpass, normalised to unit DC gain.
fn lowpass(num_taps: usize, cutoff_hz: f64, sample_rate: f64) -> Vec<f64> {
    let wc = 2.0 * cutoff_hz / sample_rate; // cutoff as a fraction of Nyquist
    let centre = (num_taps as f64 - 1.0) / 2.0;
    let window = kaiser_window(num_taps);

    let mut taps: Vec<f64> = window
        .iter()
        .enumerate()
        .map(|(i, &w)| {
            let m = i as f64 - centre;
            let ideal = if m.abs() < 1e-9 {
                wc
            } else {
                (PI * wc * m).sin() / (PI * m)
            };
            ideal * w
        })
        .collect();

    let gain: f64 = taps.iter().sum();
    for tap in &mut taps {
        *tap /= gain;
    }
    taps
}

/// Build the tap bank for one stage.
///
/// `pass_freqs` are the receive offsets from the local oscillator; for
/// stages past the first they only determine the row count, since the
/// per-channel signal has already been isolated.
///
/// Returns `num_freqs × L` taps where `L` is the next power of two above
/// the Kaiser length estimate for this stage's transition band.
pub fn build_stage_filters(
    stage_idx: usize,
    pass_freqs: &[f64],
    input_rate: f64,
    output_rate: f64,
) -> Result<FilterBank, FilterError> {
    if pass_freqs.is_empty() {
        return Err(FilterError::NoFrequencies);
    }
    if !(input_rate > 0.0) || !(output_rate > 0.0) || output_rate > input_rate {
        return Err(FilterError::BadRate {
            stage: stage_idx,
            input_rate,
            output_rate,
        });
    }

    let nyquist_out = output_rate / 2.0;
    let cutoff = nyquist_out * PASSBAND_FRACTION;
    let transition = nyquist_out * TRANSITION_FRACTION;

    let ideal = ideal_length(STOPBAND_ATTEN_DB, transition, input_rate);
    let num_taps = ideal.next_power_of_two();
    if num_taps > MAX_FILTER_TAPS {
        return Err(FilterError::TooManyTaps {
            stage: stage_idx,
            taps: num_taps,
            cap: MAX_FILTER_TAPS,
        });
    }

    let proto = lowpass(ideal, cutoff, input_rate);
    let num_freqs = pass_freqs.len();
    let mut taps = vec![Complex32::new(0.0, 0.0); num_freqs * num_taps];

    if stage_idx == 0 {
        // Bandpass: mix the lowpass prototype up to each receive offset.
        // Gain at the offset itself stays exactly the lowpass DC gain of 1.
        for (f, &freq) in pass_freqs.iter().enumerate() {
            let row = &mut taps[f * num_taps..(f + 1) * num_taps];
            for (t, &h) in proto.iter().enumerate() {
                let phase = 2.0 * PI * freq * t as f64 / input_rate;
                row[t] = Complex32::new(
                    (h * phase.cos()) as f32,
                    (h * phase.sin()) as f32,
                );
            }
            // Trailing entries stay zero: power-of-two padding.
        }
    } else {
        // Lowpass, identical for every frequency, zero imaginary part.
        for f in 0..num_freqs {
            let row = &mut taps[f * num_taps..(f + 1) * num_taps];
            for (t, &h) in proto.iter().enumerate() {
                row[t] = Complex32::new(h as f32, 0.0);
            }
        }
    }

    Ok(FilterBank {
        num_freqs,
        num_taps,
        taps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustfft::FftPlanner;

    /// Magnitude response of a tap row on a dense grid via FFT.
    fn response(row: &[Complex32], fft_len: usize) -> Vec<f32> {
        let mut buf: Vec<Complex32> = row.to_vec();
        buf.resize(fft_len, Complex32::new(0.0, 0.0));
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_len);
        fft.process(&mut buf);
        buf.iter().map(|c| c.norm()).collect()
    }

    #[test]
    fn test_kaiser_window_symmetric() {
        let w = kaiser_window(64);
        for i in 0..32 {
            assert!((w[i] - w[63 - i]).abs() < 1e-10);
        }
        assert!(w[0] < 0.1);
        assert!(w[31] > 0.99 && w[32] > 0.99);
    }

    #[test]
    fn test_bessel_i0_reference_values() {
        // I0(0) = 1; I0(1) and I0(5) against tabulated values.
        assert!((bessel_i0(0.0) - 1.0).abs() < 1e-12);
        assert!((bessel_i0(1.0) - 1.2660658).abs() < 1e-6);
        assert!((bessel_i0(5.0) - 27.239872).abs() < 1e-4);
    }

    #[test]
    fn test_lowpass_unit_dc_gain() {
        let h = lowpass(101, 20_000.0, 500_000.0);
        let sum: f64 = h.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_stage_filters_power_of_two() {
        let bank = build_stage_filters(0, &[1.0e6], 5.0e6, 500.0e3).unwrap();
        assert!(bank.num_taps.is_power_of_two());
        assert!(bank.num_taps >= MIN_FILTER_TAPS);
        assert_eq!(bank.taps().len(), bank.num_taps);
    }

    #[test]
    fn test_bandpass_unit_gain_at_centre() {
        let freq = 1.0e6;
        let rate = 5.0e6;
        let bank = build_stage_filters(0, &[freq], rate, 500.0e3).unwrap();

        // Evaluate H(f0) = sum tap[t] * e^{-j 2 pi f0 t / fs}; the mixing
        // cancels and the sum of the prototype is 1.
        let mut acc = num_complex::Complex64::new(0.0, 0.0);
        for (t, tap) in bank.row(0).iter().enumerate() {
            let phase = -2.0 * PI * freq * t as f64 / rate;
            let e = num_complex::Complex64::new(phase.cos(), phase.sin());
            acc += num_complex::Complex64::new(tap.re as f64, tap.im as f64) * e;
        }
        assert!((acc.norm() - 1.0).abs() < 1e-4, "centre gain {}", acc.norm());
    }

    #[test]
    fn test_bandpass_rejects_far_tone() {
        // Two-channel geometry: 1 MHz separation at 5 MHz must be deep in
        // the stopband for a 500 kHz output rate.
        let rate = 5.0e6;
        let bank = build_stage_filters(0, &[0.5e6, -0.5e6], rate, 500.0e3).unwrap();

        let eval = |row: &[Complex32], f: f64| {
            let mut acc = num_complex::Complex64::new(0.0, 0.0);
            for (t, tap) in row.iter().enumerate() {
                let phase = -2.0 * PI * f * t as f64 / rate;
                acc += num_complex::Complex64::new(tap.re as f64, tap.im as f64)
                    * num_complex::Complex64::new(phase.cos(), phase.sin());
            }
            acc.norm()
        };

        // Channel 0 centred at +0.5 MHz: passes own tone, rejects the other.
        assert!(eval(bank.row(0), 0.5e6) > 0.99);
        assert!(eval(bank.row(0), -0.5e6) < 0.01);
        assert!(eval(bank.row(1), -0.5e6) > 0.99);
        assert!(eval(bank.row(1), 0.5e6) < 0.01);
    }

    #[test]
    fn test_lowpass_stage_stopband() {
        let bank = build_stage_filters(1, &[0.0], 500.0e3, 50.0e3).unwrap();
        let resp = response(bank.row(0), 8192);

        // Stopband starts past cutoff + transition; check everything from
        // 1.5x the output Nyquist out to input Nyquist.
        let bin_hz = 500.0e3 / 8192.0;
        let start = (1.5 * 25.0e3 / bin_hz) as usize;
        let max_stop = resp[start..4096].iter().cloned().fold(0.0f32, f32::max);
        assert!(
            max_stop < 0.01,
            "stopband leakage {} at 60 dB design",
            max_stop
        );
        // DC bin passes at unit gain.
        assert!((resp[0] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_later_stage_rows_identical_and_real() {
        let bank = build_stage_filters(2, &[1.0e6, -1.0e6, 0.3e6], 50.0e3, 10.0e3).unwrap();
        assert_eq!(bank.num_freqs, 3);
        for f in 1..3 {
            assert_eq!(bank.row(0), bank.row(f));
        }
        assert!(bank.row(0).iter().all(|c| c.im == 0.0));
    }

    #[test]
    fn test_rejects_upsampling() {
        assert!(matches!(
            build_stage_filters(0, &[0.0], 1.0e6, 2.0e6),
            Err(FilterError::BadRate { .. })
        ));
    }

    #[test]
    fn test_rejects_empty_frequency_list() {
        assert!(matches!(
            build_stage_filters(0, &[], 5.0e6, 500.0e3),
            Err(FilterError::NoFrequencies)
        ));
    }
}
