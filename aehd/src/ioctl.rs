// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Synchronous control calls against the hypervisor driver.

use std::fmt;
use std::sync::Arc;

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

use crate::Result;

/// A driver handle for a VM or a vCPU, as returned by the driver.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RawHandle(pub u64);

/// The object a control call is issued against.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Scope {
    Device,
    Vm(RawHandle),
    Vcpu(RawHandle),
}

/// A connection to the hypervisor driver.
///
/// Implementations copy `input` to the driver and copy at most `output.len()` bytes back, the way
/// a buffered device control call does. Driver failures are reported as `Error::TooSmallBuffer`,
/// `Error::WouldBlock`, `Error::Interrupted` or `Error::Fault`; implementations never retry.
pub trait ControlChannel: Send + Sync {
    fn call(&self, scope: Scope, request: u32, input: &[u8], output: &mut [u8]) -> Result<()>;

    /// Releases a VM or vCPU handle. The handle must not be used afterwards.
    fn close(&self, handle: RawHandle);
}

/// A `ControlChannel` bound to one scope.
#[derive(Clone)]
pub struct ControlHandle {
    channel: Arc<dyn ControlChannel>,
    scope: Scope,
}

impl ControlHandle {
    pub fn new(channel: Arc<dyn ControlChannel>, scope: Scope) -> ControlHandle {
        ControlHandle { channel, scope }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Returns a handle on the same channel for a different scope.
    pub fn with_scope(&self, scope: Scope) -> ControlHandle {
        ControlHandle {
            channel: self.channel.clone(),
            scope,
        }
    }

    /// Issues `request` with raw input and output buffers.
    pub fn call(&self, request: u32, input: &[u8], output: &mut [u8]) -> Result<()> {
        self.channel.call(self.scope, request, input, output)
    }

    /// Issues `request` with no payload in either direction.
    pub fn ioctl(&self, request: u32) -> Result<()> {
        self.call(request, &[], &mut [])
    }

    /// Issues `request` with `arg` as input and no output.
    pub fn ioctl_with_ref<T: IntoBytes + Immutable>(&self, request: u32, arg: &T) -> Result<()> {
        self.call(request, arg.as_bytes(), &mut [])
    }

    /// Issues `request` with `arg` as input and reads the driver's reply back into `arg`.
    pub fn ioctl_with_mut_ref<T: FromBytes + IntoBytes + Immutable>(
        &self,
        request: u32,
        arg: &mut T,
    ) -> Result<()> {
        let input = arg.as_bytes().to_vec();
        self.call(request, &input, arg.as_mut_bytes())
    }

    /// Issues `request` with `arg` as input and returns a value of type `O` filled by the driver.
    pub fn ioctl_with_ref_ret<T, O>(&self, request: u32, arg: &T) -> Result<O>
    where
        T: IntoBytes + Immutable,
        O: FromBytes + IntoBytes,
    {
        let mut out = O::new_zeroed();
        self.call(request, arg.as_bytes(), out.as_mut_bytes())?;
        Ok(out)
    }

    /// Issues `request` with no input and returns a value of type `O` filled by the driver.
    pub fn ioctl_ret<O: FromBytes + IntoBytes>(&self, request: u32) -> Result<O> {
        let mut out = O::new_zeroed();
        self.call(request, &[], out.as_mut_bytes())?;
        Ok(out)
    }

    /// Closes the handle this scope refers to. A no-op for the device scope.
    pub fn close(&self) {
        match self.scope {
            Scope::Device => {}
            Scope::Vm(handle) | Scope::Vcpu(handle) => self.channel.close(handle),
        }
    }
}

impl fmt::Debug for ControlHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ControlHandle")
            .field("scope", &self.scope)
            .finish()
    }
}
