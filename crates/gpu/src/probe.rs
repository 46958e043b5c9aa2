// Copyright 2025-2026 Aurora Radar Group

//! Device enumeration and kernel-variant selection.

use num_complex::Complex32;

use crate::GpuError;

/// Capabilities of one compute device, read once at start-up.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub max_threads_per_block: usize,
    pub shared_mem_per_block: usize,
    pub warp_size: usize,
    pub memory_clock_khz: u32,
    pub memory_bus_width_bits: u32,
}

impl DeviceInfo {
    /// The host backend's emulated device. Thread and shared-memory caps
    /// match the hardware generation the kernels are tuned for, so variant
    /// selection behaves identically on and off the GPU.
    pub fn emulated() -> Self {
        DeviceInfo {
            name: "host-emulated".into(),
            max_threads_per_block: 1024,
            shared_mem_per_block: 48 * 1024,
            warp_size: 32,
            memory_clock_khz: 0,
            memory_bus_width_bits: 0,
        }
    }

    /// Peak memory bandwidth in GB/s, if the probe reported clocks.
    pub fn memory_bandwidth_gbps(&self) -> Option<f64> {
        if self.memory_clock_khz == 0 || self.memory_bus_width_bits == 0 {
            return None;
        }
        // DDR: two transfers per clock.
        let bytes_per_sec = self.memory_clock_khz as f64 * 1000.0 * 2.0
            * (self.memory_bus_width_bits as f64 / 8.0);
        Some(bytes_per_sec / 1.0e9)
    }
}

/// Enumerate compute devices.
///
/// Without the `cuda` feature this is the emulated host device; with it,
/// the real device list (falling back to the emulated device if none are
/// present, so a GPU-less host can still run).
pub fn probe() -> Vec<DeviceInfo> {
    #[cfg(feature = "cuda")]
    {
        match crate::cuda::probe_devices() {
            Ok(devices) if !devices.is_empty() => return devices,
            Ok(_) => log::warn!("no CUDA devices found, using host backend"),
            Err(e) => log::warn!("CUDA probe failed ({}), using host backend", e),
        }
    }
    vec![DeviceInfo::emulated()]
}

/// Which decimation kernel to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelVariant {
    /// One sample and tap per thread: `taps x freqs` threads per block.
    Small,
    /// Two samples and taps per thread: `taps/2 x freqs` threads per block.
    Large,
}

impl KernelVariant {
    /// Pick the variant for a `taps x freqs` filter tile.
    ///
    /// Over twice the device thread cap cannot be launched at all and is a
    /// configuration error for the sequence.
    pub fn select(
        num_taps: usize,
        num_freqs: usize,
        dev: &DeviceInfo,
    ) -> Result<KernelVariant, GpuError> {
        let threads = num_taps * num_freqs;
        if threads > 2 * dev.max_threads_per_block {
            return Err(GpuError::BadLaunchConfig {
                threads,
                max: dev.max_threads_per_block,
            });
        }
        if threads > dev.max_threads_per_block {
            Ok(KernelVariant::Large)
        } else {
            Ok(KernelVariant::Small)
        }
    }
}

/// Reject filter tiles that cannot fit in a block's shared memory.
pub fn check_shared_mem(
    num_taps: usize,
    num_freqs: usize,
    dev: &DeviceInfo,
) -> Result<(), GpuError> {
    let needed = num_freqs * num_taps * std::mem::size_of::<Complex32>();
    if needed > dev.shared_mem_per_block {
        return Err(GpuError::SharedMemExceeded {
            needed,
            available: dev.shared_mem_per_block,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_variant_within_cap() {
        let dev = DeviceInfo::emulated();
        assert_eq!(
            KernelVariant::select(128, 4, &dev).unwrap(),
            KernelVariant::Small
        );
        assert_eq!(
            KernelVariant::select(1024, 1, &dev).unwrap(),
            KernelVariant::Small
        );
    }

    #[test]
    fn test_large_variant_above_cap() {
        let dev = DeviceInfo::emulated();
        assert_eq!(
            KernelVariant::select(1024, 2, &dev).unwrap(),
            KernelVariant::Large
        );
        assert_eq!(
            KernelVariant::select(512, 4, &dev).unwrap(),
            KernelVariant::Large
        );
    }

    #[test]
    fn test_over_double_cap_is_config_error() {
        let dev = DeviceInfo::emulated();
        assert!(matches!(
            KernelVariant::select(1024, 3, &dev),
            Err(GpuError::BadLaunchConfig { .. })
        ));
    }

    #[test]
    fn test_shared_mem_check() {
        let dev = DeviceInfo::emulated();
        // 48 KiB / 8 bytes = 6144 complex entries.
        assert!(check_shared_mem(1024, 6, &dev).is_ok());
        assert!(matches!(
            check_shared_mem(1024, 7, &dev),
            Err(GpuError::SharedMemExceeded { .. })
        ));
    }

    #[test]
    fn test_probe_reports_a_device() {
        let devices = probe();
        assert!(!devices.is_empty());
        assert!(devices[0].max_threads_per_block >= 1024);
        assert_eq!(devices[0].warp_size, 32);
    }

    #[test]
    fn test_bandwidth_none_without_clocks() {
        assert!(DeviceInfo::emulated().memory_bandwidth_gbps().is_none());
    }
}
