// Copyright 2025-2026 Aurora Radar Group

//! Site configuration for the receive-side DSP server.
//!
//! All tuning comes from one immutable `SiteConfig` loaded at start-up;
//! nothing in the hot path reads mutable global state.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of filter/decimate passes in the receive chain.
pub const NUM_STAGES: usize = 3;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Immutable site configuration.
///
/// Loaded once from JSON at start-up and shared read-only with every
/// sequence. Field names match the on-disk schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Elements in the main receive array.
    pub main_antenna_count: u32,
    /// Elements in the interferometer array.
    pub intf_antenna_count: u32,

    /// Highest RF sample rate the driver will hand us, Hz.
    pub max_rx_sample_rate: f64,
    /// Highest post-decimation rate the downstream stage accepts, Hz.
    pub max_output_sample_rate: f64,

    /// Filter/decimate passes; the receive chain is built for exactly 3.
    pub max_filtering_stages: u32,
    /// Per-stage tap ceiling after power-of-two padding.
    pub max_filter_taps_per_stage: u32,

    /// Name of the shared-memory ring buffer the driver writes into.
    pub ringbuffer_name: String,
    /// Total ring buffer size in bytes.
    pub ringbuffer_size_bytes: u64,

    /// Outbound channel for copy acknowledgements (transport-neutral URI).
    pub ack_endpoint: String,
    /// Outbound channel for timing reports.
    pub timing_endpoint: String,
    /// Inbound channel for start-of-sequence requests from radar control.
    pub request_endpoint: String,

    /// Delay before the driver samples the AGC status lines, seconds.
    /// Carried for the driver options surface; the DSP chain does not
    /// consume it (see DESIGN.md).
    #[serde(default)]
    pub agc_signal_read_delay: f64,
}

impl SiteConfig {
    /// Load and validate a site config from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().display().to_string();
        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path_str.clone(),
            source,
        })?;
        let config: SiteConfig =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path_str,
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Main plus interferometer elements; the decimation grid spans both.
    pub fn total_antennas(&self) -> u32 {
        self.main_antenna_count + self.intf_antenna_count
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.main_antenna_count == 0 {
            return Err(ConfigError::Invalid(
                "main_antenna_count must be non-zero".into(),
            ));
        }
        if self.max_filtering_stages as usize != NUM_STAGES {
            return Err(ConfigError::Invalid(format!(
                "max_filtering_stages is {}, receive chain is built for {}",
                self.max_filtering_stages, NUM_STAGES
            )));
        }
        if self.max_filter_taps_per_stage == 0 || !self.max_filter_taps_per_stage.is_power_of_two()
        {
            return Err(ConfigError::Invalid(format!(
                "max_filter_taps_per_stage must be a power of two, got {}",
                self.max_filter_taps_per_stage
            )));
        }
        if self.ringbuffer_name.is_empty() {
            return Err(ConfigError::Invalid("ringbuffer_name is empty".into()));
        }
        if self.ringbuffer_size_bytes == 0 {
            return Err(ConfigError::Invalid("ringbuffer_size_bytes is zero".into()));
        }
        if self.max_rx_sample_rate <= 0.0 || self.max_output_sample_rate <= 0.0 {
            return Err(ConfigError::Invalid("sample rate caps must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SiteConfig {
        SiteConfig {
            main_antenna_count: 16,
            intf_antenna_count: 4,
            max_rx_sample_rate: 5_000_000.0,
            max_output_sample_rate: 100_000.0,
            max_filtering_stages: 3,
            max_filter_taps_per_stage: 2048,
            ringbuffer_name: "/aurora_rx_ringbuffer".into(),
            ringbuffer_size_bytes: 512 * 1024 * 1024,
            ack_endpoint: "tcp://127.0.0.1:7700".into(),
            timing_endpoint: "tcp://127.0.0.1:7701".into(),
            request_endpoint: "tcp://127.0.0.1:7702".into(),
            agc_signal_read_delay: 0.0,
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(test_config().validate().is_ok());
        assert_eq!(test_config().total_antennas(), 20);
    }

    #[test]
    fn test_rejects_wrong_stage_count() {
        let mut c = test_config();
        c.max_filtering_stages = 2;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_rejects_non_pow2_tap_cap() {
        let mut c = test_config();
        c.max_filter_taps_per_stage = 1500;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_antennas() {
        let mut c = test_config();
        c.main_antenna_count = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let c = test_config();
        let text = serde_json::to_string(&c).unwrap();
        let back: SiteConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.main_antenna_count, c.main_antenna_count);
        assert_eq!(back.ringbuffer_name, c.ringbuffer_name);
        assert!((back.max_rx_sample_rate - c.max_rx_sample_rate).abs() < 1e-9);
    }

    #[test]
    fn test_agc_delay_defaults_to_zero() {
        // Older site files omit the AGC field entirely.
        let mut v = serde_json::to_value(test_config()).unwrap();
        v.as_object_mut().unwrap().remove("agc_signal_read_delay");
        let back: SiteConfig = serde_json::from_value(v).unwrap();
        assert_eq!(back.agc_signal_read_delay, 0.0);
    }
}
