// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cmp::max;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::RawFd;
use std::path::Path;

use libc::O_CLOEXEC;

use crate::ioctl::ControlChannel;
use crate::ioctl::RawHandle;
use crate::ioctl::Scope;
use crate::Error;
use crate::Result;

pub const DEFAULT_DEVICE_PATH: &str = "/dev/aehd";

/// Returns the host page size in bytes.
pub fn pagesize() -> usize {
    // Trivially safe.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn error_from_errno(errno: i32) -> Error {
    match errno {
        libc::E2BIG => Error::TooSmallBuffer,
        libc::EAGAIN => Error::WouldBlock,
        libc::EINTR => Error::Interrupted,
        _ => Error::Fault,
    }
}

/// The hypervisor character device. VM and vCPU handles are file descriptors owned by the driver
/// connection.
pub struct DeviceChannel {
    device: File,
}

impl DeviceChannel {
    pub fn open(path: &Path) -> Result<DeviceChannel> {
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(O_CLOEXEC)
            .open(path)
            .map_err(|source| Error::DeviceUnavailable {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(DeviceChannel { device })
    }
}

impl ControlChannel for DeviceChannel {
    fn call(&self, scope: Scope, request: u32, input: &[u8], output: &mut [u8]) -> Result<()> {
        let fd = match scope {
            Scope::Device => self.device.as_raw_fd(),
            Scope::Vm(handle) | Scope::Vcpu(handle) => handle.0 as RawFd,
        };
        // Buffered requests share one buffer for both directions.
        let mut buf = vec![0u8; max(input.len(), output.len())];
        buf[..input.len()].copy_from_slice(input);
        // Safe because `buf` is owned by this frame and is at least as large as both the request
        // and the reply, so the driver cannot write outside of it.
        let ret = unsafe { libc::ioctl(fd, request as _, buf.as_mut_ptr()) };
        if ret < 0 {
            let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(error_from_errno(errno));
        }
        let len = output.len();
        output.copy_from_slice(&buf[..len]);
        Ok(())
    }

    fn close(&self, handle: RawHandle) {
        // Safe because the handle was handed out by the driver and the caller gives up ownership.
        unsafe {
            libc::close(handle.0 as RawFd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_is_unavailable() {
        let err = DeviceChannel::open(Path::new("/nonexistent/aehd"))
            .err()
            .expect("open should fail");
        assert!(matches!(err, Error::DeviceUnavailable { .. }));
    }

    #[test]
    fn errno_mapping() {
        assert!(matches!(error_from_errno(libc::E2BIG), Error::TooSmallBuffer));
        assert!(matches!(error_from_errno(libc::EAGAIN), Error::WouldBlock));
        assert!(matches!(error_from_errno(libc::EINTR), Error::Interrupted));
        assert!(matches!(error_from_errno(libc::EINVAL), Error::Fault));
    }

    #[test]
    fn page_size_is_power_of_two() {
        assert!(pagesize().is_power_of_two());
    }
}
