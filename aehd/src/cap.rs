// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use aehd_sys::*;

/// A capability the driver can be queried for with `check_extension`.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Cap {
    Irqchip = AEHD_CAP_IRQCHIP,
    UserMemory = AEHD_CAP_USER_MEMORY,
    /// Recommended number of vCPUs.
    NrVcpus = AEHD_CAP_NR_VCPUS,
    /// Size of the memory slot table.
    NrMemslots = AEHD_CAP_NR_MEMSLOTS,
    /// One more than the number of routable GSIs.
    IrqRouting = AEHD_CAP_IRQ_ROUTING,
    MaxVcpus = AEHD_CAP_MAX_VCPUS,
    MaxVcpuId = AEHD_CAP_MAX_VCPU_ID,
}
