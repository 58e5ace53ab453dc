// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bindings for the Android Emulator hypervisor driver (AEHD) control interface.
//!
//! Every request is a buffered device control call: the input structure is copied to the driver
//! and the output structure is copied back. Handles returned by the driver (VM, vCPU) are plain
//! 64-bit values.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const AEHD_DEVICE_TYPE: u32 = 0xE3E3;
pub const METHOD_BUFFERED: u32 = 0;
pub const FILE_ANY_ACCESS: u32 = 0;

/// Builds a control code the same way the Windows `CTL_CODE` macro does.
pub const fn aehd_ctl_code(function: u32) -> u32 {
    (AEHD_DEVICE_TYPE << 16) | (FILE_ANY_ACCESS << 14) | (function << 2) | METHOD_BUFFERED
}

// Device scope.
pub const AEHD_GET_API_VERSION: u32 = aehd_ctl_code(0x00);
pub const AEHD_CREATE_VM: u32 = aehd_ctl_code(0x01);
pub const AEHD_CHECK_EXTENSION: u32 = aehd_ctl_code(0x03);
pub const AEHD_GET_VCPU_MMAP_SIZE: u32 = aehd_ctl_code(0x04);

// VM scope.
pub const AEHD_CREATE_VCPU: u32 = aehd_ctl_code(0x41);
pub const AEHD_GET_DIRTY_LOG: u32 = aehd_ctl_code(0x42);
pub const AEHD_SET_USER_MEMORY_REGION: u32 = aehd_ctl_code(0x46);
pub const AEHD_KICK_VCPU: u32 = aehd_ctl_code(0x49);
pub const AEHD_CREATE_IRQCHIP: u32 = aehd_ctl_code(0x60);
pub const AEHD_IRQ_LINE_STATUS: u32 = aehd_ctl_code(0x67);
pub const AEHD_SET_GSI_ROUTING: u32 = aehd_ctl_code(0x6a);

// vCPU scope.
pub const AEHD_RUN: u32 = aehd_ctl_code(0x80);
pub const AEHD_GET_REGS: u32 = aehd_ctl_code(0x81);
pub const AEHD_SET_REGS: u32 = aehd_ctl_code(0x82);
pub const AEHD_VCPU_MMAP: u32 = aehd_ctl_code(0x87);
pub const AEHD_VCPU_MUNMAP: u32 = aehd_ctl_code(0x88);

// Capabilities understood by AEHD_CHECK_EXTENSION.
pub const AEHD_CAP_IRQCHIP: u32 = 0;
pub const AEHD_CAP_USER_MEMORY: u32 = 3;
pub const AEHD_CAP_NR_VCPUS: u32 = 9;
pub const AEHD_CAP_NR_MEMSLOTS: u32 = 10;
pub const AEHD_CAP_IRQ_ROUTING: u32 = 25;
pub const AEHD_CAP_MAX_VCPUS: u32 = 66;
pub const AEHD_CAP_MAX_VCPU_ID: u32 = 128;

// Flags for aehd_userspace_memory_region::flags.
pub const AEHD_MEM_LOG_DIRTY_PAGES: u32 = 1 << 0;
pub const AEHD_MEM_READONLY: u32 = 1 << 1;

// Routing entry kinds.
pub const AEHD_IRQ_ROUTING_IRQCHIP: u32 = 1;
pub const AEHD_IRQ_ROUTING_MSI: u32 = 2;

// Exit reasons reported in aehd_run::exit_reason.
pub const AEHD_EXIT_UNKNOWN: u32 = 0;
pub const AEHD_EXIT_EXCEPTION: u32 = 1;
pub const AEHD_EXIT_IO: u32 = 2;
pub const AEHD_EXIT_HYPERCALL: u32 = 3;
pub const AEHD_EXIT_DEBUG: u32 = 4;
pub const AEHD_EXIT_HLT: u32 = 5;
pub const AEHD_EXIT_MMIO: u32 = 6;
pub const AEHD_EXIT_IRQ_WINDOW_OPEN: u32 = 7;
pub const AEHD_EXIT_SHUTDOWN: u32 = 8;
pub const AEHD_EXIT_FAIL_ENTRY: u32 = 9;
pub const AEHD_EXIT_INTR: u32 = 10;
pub const AEHD_EXIT_SET_TPR: u32 = 11;
pub const AEHD_EXIT_TPR_ACCESS: u32 = 12;
pub const AEHD_EXIT_NMI: u32 = 16;
pub const AEHD_EXIT_INTERNAL_ERROR: u32 = 17;
pub const AEHD_EXIT_SYSTEM_EVENT: u32 = 24;

pub const AEHD_EXIT_IO_IN: u8 = 0;
pub const AEHD_EXIT_IO_OUT: u8 = 1;

pub const AEHD_INTERNAL_ERROR_EMULATION: u32 = 1;
pub const AEHD_INTERNAL_ERROR_SIMUL_EX: u32 = 2;
pub const AEHD_INTERNAL_ERROR_DELIVERY_EV: u32 = 3;

pub const AEHD_SYSTEM_EVENT_SHUTDOWN: u32 = 1;
pub const AEHD_SYSTEM_EVENT_RESET: u32 = 2;
pub const AEHD_SYSTEM_EVENT_CRASH: u32 = 3;

/// Maximum number of diagnostic words carried by an internal error exit.
pub const AEHD_INTERNAL_ERROR_MAX_DATA: usize = 16;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct aehd_userspace_memory_region {
    pub slot: u32,
    pub flags: u32,
    pub guest_phys_addr: u64,
    pub memory_size: u64,
    pub userspace_addr: u64,
}

/// Request for AEHD_GET_DIRTY_LOG. The driver writes the bitmap through `dirty_bitmap`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct aehd_dirty_log {
    pub slot: u32,
    pub padding1: u32,
    pub dirty_bitmap: u64,
}

/// Request for AEHD_IRQ_LINE_STATUS. On return `irq` holds the delivery status.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct aehd_irq_level {
    pub irq: u32,
    pub level: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct aehd_irq_routing_irqchip {
    pub irqchip: u32,
    pub pin: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct aehd_irq_routing_msi {
    pub address_lo: u32,
    pub address_hi: u32,
    pub data: u32,
    pub pad: u32,
}

/// One routing entry. `u` holds either an `aehd_irq_routing_irqchip` or an
/// `aehd_irq_routing_msi`, selected by `type_`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct aehd_irq_routing_entry {
    pub gsi: u32,
    pub type_: u32,
    pub flags: u32,
    pub pad: u32,
    pub u: [u32; 8],
}

/// Header of AEHD_SET_GSI_ROUTING, immediately followed by `nr` entries.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct aehd_irq_routing {
    pub nr: u32,
    pub flags: u32,
}

/// The shared per-vCPU run area mapped by AEHD_VCPU_MMAP.
///
/// `exit` is a union whose active member is selected by `exit_reason`; see the `aehd_run_*`
/// structures below.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct aehd_run {
    pub request_interrupt_window: u8,
    pub user_event_pending: u8,
    pub padding1: [u8; 6],
    pub exit_reason: u32,
    pub ready_for_interrupt_injection: u8,
    pub if_flag: u8,
    pub padding2: [u8; 2],
    pub cr8: u64,
    pub apic_base: u64,
    pub exit: [u64; 32],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct aehd_run_hw {
    pub hardware_exit_reason: u64,
}

/// Port I/O exit. The data lives `data_offset` bytes from the start of the run area.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct aehd_run_io {
    pub direction: u8,
    pub size: u8,
    pub port: u16,
    pub count: u32,
    pub data_offset: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct aehd_run_mmio {
    pub phys_addr: u64,
    pub data: [u8; 8],
    pub len: u32,
    pub is_write: u8,
    pub padding: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct aehd_run_internal {
    pub suberror: u32,
    pub ndata: u32,
    pub data: [u64; AEHD_INTERNAL_ERROR_MAX_DATA],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct aehd_run_system_event {
    pub type_: u32,
    pub padding: u32,
    pub flags: u64,
}
