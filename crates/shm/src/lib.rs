// Copyright 2025-2026 Aurora Radar Group

//! Shared-memory ring-buffer slots.
//!
//! The driver writes each sequence's antenna sample block into a named
//! POSIX shared-memory object and names the slot in the start-of-sequence
//! request. The orchestrator holds the mapping as a lease for the duration
//! of the sequence; the driver must not reuse the slot until the copy
//! acknowledgement arrives.

use std::ffi::CString;

use num_complex::Complex32;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShmError {
    #[error("shared-memory slot {0} does not exist")]
    SlotMissing(String),

    #[error("failed to open shared-memory slot {name}: errno {errno}")]
    Open { name: String, errno: i32 },

    #[error("failed to create shared-memory slot {name}: errno {errno}")]
    Create { name: String, errno: i32 },

    #[error("slot {name} holds {actual} bytes, expected at least {expected}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("failed to map slot {name}: errno {errno}")]
    Map { name: String, errno: i32 },

    #[error("slot name {0:?} contains an interior nul")]
    BadName(String),
}

/// A mapped ring-buffer slot of interleaved complex float samples,
/// antenna-major. Unmapped on drop; slots created with [`ShmSlot::create`]
/// are also unlinked on drop.
#[derive(Debug)]
pub struct ShmSlot {
    name: String,
    ptr: *mut Complex32,
    num_samples: usize,
    mapped_bytes: usize,
    owner: bool,
}

// The mapping is private to this process and only ever handed to one
// sequence worker at a time.
unsafe impl Send for ShmSlot {}

fn shm_name_cstr(name: &str) -> Result<CString, ShmError> {
    // POSIX wants a leading slash and no others; normalise what the driver
    // sends us.
    let normalised = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    };
    CString::new(normalised).map_err(|_| ShmError::BadName(name.to_string()))
}

impl ShmSlot {
    /// Map an existing slot, expecting `num_samples` complex samples.
    pub fn open(name: &str, num_samples: usize) -> Result<Self, ShmError> {
        let cname = shm_name_cstr(name)?;
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(0);
            if errno == libc::ENOENT {
                return Err(ShmError::SlotMissing(name.to_string()));
            }
            return Err(ShmError::Open {
                name: name.to_string(),
                errno,
            });
        }

        let expected = num_samples * std::mem::size_of::<Complex32>();
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(0);
            unsafe { libc::close(fd) };
            return Err(ShmError::Open {
                name: name.to_string(),
                errno,
            });
        }
        if (stat.st_size as usize) < expected {
            unsafe { libc::close(fd) };
            return Err(ShmError::SizeMismatch {
                name: name.to_string(),
                expected,
                actual: stat.st_size as usize,
            });
        }

        let slot = Self::map(name, fd, num_samples, false)?;
        Ok(slot)
    }

    /// Create and map a fresh slot of `num_samples` complex samples.
    ///
    /// This is the driver side of the contract; the DSP tests use it to
    /// stand in for the driver.
    pub fn create(name: &str, num_samples: usize) -> Result<Self, ShmError> {
        let cname = shm_name_cstr(name)?;
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };
        if fd < 0 {
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(0);
            return Err(ShmError::Create {
                name: name.to_string(),
                errno,
            });
        }

        let bytes = num_samples * std::mem::size_of::<Complex32>();
        if unsafe { libc::ftruncate(fd, bytes as libc::off_t) } != 0 {
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(0);
            unsafe {
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
            }
            return Err(ShmError::Create {
                name: name.to_string(),
                errno,
            });
        }

        Self::map(name, fd, num_samples, true)
    }

    fn map(name: &str, fd: i32, num_samples: usize, owner: bool) -> Result<Self, ShmError> {
        let bytes = num_samples * std::mem::size_of::<Complex32>();
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        // fd is only needed to establish the mapping.
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(0);
            if owner {
                if let Ok(cname) = shm_name_cstr(name) {
                    unsafe { libc::shm_unlink(cname.as_ptr()) };
                }
            }
            return Err(ShmError::Map {
                name: name.to_string(),
                errno,
            });
        }

        Ok(ShmSlot {
            name: name.to_string(),
            ptr: ptr as *mut Complex32,
            num_samples,
            mapped_bytes: bytes,
            owner,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// The slot's samples, antenna-major.
    pub fn as_slice(&self) -> &[Complex32] {
        // mmap returns page-aligned memory, which satisfies Complex32.
        unsafe { std::slice::from_raw_parts(self.ptr, self.num_samples) }
    }

    /// Mutable view, for the creating (driver) side.
    pub fn as_mut_slice(&mut self) -> &mut [Complex32] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.num_samples) }
    }
}

impl Drop for ShmSlot {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.mapped_bytes);
        }
        if self.owner {
            if let Ok(cname) = shm_name_cstr(&self.name) {
                unsafe { libc::shm_unlink(cname.as_ptr()) };
            }
        }
    }
}
