// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io;
use std::path::PathBuf;

use remain::sorted;
use thiserror::Error as ThisError;

/// Coarse classification of every failure the acceleration layer reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    DeviceUnavailable,
    Fault,
    NoSpace,
    NotFound,
    TooSmallBuffer,
    WouldBlock,
}

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("failed to open hypervisor device {path:?}: {source}")]
    DeviceUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("hypervisor control call failed")]
    Fault,
    #[error("gsi {0} already has a route")]
    GsiInUse(u32),
    #[error("hypervisor internal error, suberror {0}")]
    InternalError(u32),
    #[error("hypervisor control call was interrupted")]
    Interrupted,
    #[error("gsi {0} is outside the routing table")]
    InvalidGsi(u32),
    #[error("irqchip pin {0} is outside the routing table")]
    InvalidIrqPin(u32),
    #[error("page size {0:#x} is not a power of two")]
    InvalidPageSize(u64),
    #[error("vcpu id {0} is not supported by the hypervisor")]
    InvalidVcpuId(u64),
    #[error("no free entries left")]
    NoSpace,
    #[error("no such entry")]
    NotFound,
    #[error("region {start:#x}+{size:#x} overlaps a registered slot")]
    RegionOverlap { start: u64, size: u64 },
    #[error("{requested} vcpus requested, the hypervisor supports at most {limit}")]
    TooManyVcpus { requested: usize, limit: usize },
    #[error("output buffer too small")]
    TooSmallBuffer,
    #[error("unknown exit, hardware exit reason {0:#x}")]
    UnknownExit(u64),
    #[error("vcpu requests must be made from another thread")]
    VcpuThread,
    #[error("control call would block")]
    WouldBlock,
}

impl Error {
    /// Returns the taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        use Error::*;

        match self {
            DeviceUnavailable { .. } => ErrorKind::DeviceUnavailable,
            NoSpace => ErrorKind::NoSpace,
            NotFound => ErrorKind::NotFound,
            TooSmallBuffer => ErrorKind::TooSmallBuffer,
            Interrupted | WouldBlock => ErrorKind::WouldBlock,
            Fault
            | GsiInUse(_)
            | InternalError(_)
            | InvalidGsi(_)
            | InvalidIrqPin(_)
            | InvalidPageSize(_)
            | InvalidVcpuId(_)
            | RegionOverlap { .. }
            | TooManyVcpus { .. }
            | UnknownExit(_)
            | VcpuThread => ErrorKind::Fault,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
