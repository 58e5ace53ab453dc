// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::ffi::OsStr;
use std::io;
use std::iter::once;
use std::mem::MaybeUninit;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use std::ptr::null_mut;

use winapi::ctypes::c_void;
use winapi::shared::minwindef::DWORD;
use winapi::shared::winerror::ERROR_MORE_DATA;
use winapi::shared::winerror::ERROR_RETRY;
use winapi::um::errhandlingapi::GetLastError;
use winapi::um::fileapi::CreateFileW;
use winapi::um::fileapi::CREATE_ALWAYS;
use winapi::um::handleapi::CloseHandle;
use winapi::um::handleapi::INVALID_HANDLE_VALUE;
use winapi::um::ioapiset::DeviceIoControl;
use winapi::um::sysinfoapi::GetSystemInfo;
use winapi::um::winnt::FILE_ATTRIBUTE_NORMAL;
use winapi::um::winnt::GENERIC_READ;
use winapi::um::winnt::GENERIC_WRITE;
use winapi::um::winnt::HANDLE;

use crate::ioctl::ControlChannel;
use crate::ioctl::RawHandle;
use crate::ioctl::Scope;
use crate::Error;
use crate::Result;

pub const DEFAULT_DEVICE_PATH: &str = r"\\.\aehd";

/// Returns the host page size in bytes.
pub fn pagesize() -> usize {
    let mut info = MaybeUninit::uninit();
    // Safe because GetSystemInfo always fills in the whole structure.
    let info = unsafe {
        GetSystemInfo(info.as_mut_ptr());
        info.assume_init()
    };
    info.dwPageSize as usize
}

fn win32_wide_string(value: &OsStr) -> Vec<u16> {
    value.encode_wide().chain(once(0)).collect()
}

fn error_from_last_error(code: DWORD) -> Error {
    match code {
        ERROR_MORE_DATA => Error::TooSmallBuffer,
        ERROR_RETRY => Error::WouldBlock,
        _ => Error::Fault,
    }
}

/// The hypervisor device object. VM and vCPU handles are driver-created file handles.
pub struct DeviceChannel {
    device: HANDLE,
}

// Safe because the device handle is only used for DeviceIoControl, which the driver serializes.
unsafe impl Send for DeviceChannel {}
unsafe impl Sync for DeviceChannel {}

impl DeviceChannel {
    pub fn open(path: &Path) -> Result<DeviceChannel> {
        let name = win32_wide_string(path.as_os_str());
        // Safe because we give a nul-terminated string and verify the result.
        let device = unsafe {
            CreateFileW(
                name.as_ptr(),
                GENERIC_READ | GENERIC_WRITE,
                0,
                null_mut(),
                CREATE_ALWAYS,
                FILE_ATTRIBUTE_NORMAL,
                null_mut(),
            )
        };
        if device == INVALID_HANDLE_VALUE {
            return Err(Error::DeviceUnavailable {
                path: path.to_path_buf(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(DeviceChannel { device })
    }
}

impl ControlChannel for DeviceChannel {
    fn call(&self, scope: Scope, request: u32, input: &[u8], output: &mut [u8]) -> Result<()> {
        let handle = match scope {
            Scope::Device => self.device,
            Scope::Vm(handle) | Scope::Vcpu(handle) => handle.0 as HANDLE,
        };
        let in_ptr = if input.is_empty() {
            null_mut()
        } else {
            input.as_ptr() as *mut c_void
        };
        let out_ptr = if output.is_empty() {
            null_mut()
        } else {
            output.as_mut_ptr() as *mut c_void
        };
        let mut returned: DWORD = 0;
        // Safe because both buffers outlive the synchronous call and their lengths are passed
        // alongside them.
        let ret = unsafe {
            DeviceIoControl(
                handle,
                request,
                in_ptr,
                input.len() as DWORD,
                out_ptr,
                output.len() as DWORD,
                &mut returned,
                null_mut(),
            )
        };
        if ret == 0 {
            // Trivially safe.
            return Err(error_from_last_error(unsafe { GetLastError() }));
        }
        Ok(())
    }

    fn close(&self, handle: RawHandle) {
        // Safe because the handle was handed out by the driver and the caller gives up ownership.
        unsafe {
            CloseHandle(handle.0 as HANDLE);
        }
    }
}

impl Drop for DeviceChannel {
    fn drop(&mut self) {
        // Safe because we own the device handle.
        unsafe {
            CloseHandle(self.device);
        }
    }
}
