// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interfaces the acceleration layer consumes from the rest of the emulator.

use aehd_sys::aehd_run;

use crate::ioctl::ControlHandle;
use crate::irq::IrqRoute;
use crate::ExitResult;
use crate::Resources;
use crate::Result;

/// The address space an exit access targets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddressSpace {
    Io,
    Memory,
}

/// Transaction attributes produced by `ArchVcpu::post_run` for the following bus access.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MemTxAttrs {
    pub secure: bool,
    pub user: bool,
    pub requester_id: u16,
}

/// The emulator's memory and I/O bus.
///
/// Called with the coarse lock held; `resources` is the locked state so device models can route
/// or signal interrupts while handling the access.
pub trait IoBus {
    fn read_write(
        &mut self,
        resources: &mut Resources,
        space: AddressSpace,
        addr: u64,
        attrs: MemTxAttrs,
        data: &mut [u8],
        is_write: bool,
    );
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShutdownCause {
    GuestShutdown,
    GuestReset,
}

/// Architecture specific details of a guest crash.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct GuestPanicInfo {
    pub params: Vec<u64>,
}

/// Process level requests raised by vCPU exits.
pub trait MachineControl {
    fn request_shutdown(&self, cause: ShutdownCause);
    fn request_reset(&self, cause: ShutdownCause);
    fn notify_panic(&self, info: Option<GuestPanicInfo>);
    /// Stops every vCPU after a fatal exit.
    fn stop_vm(&self);
}

/// How much register state `ArchVcpu::put_registers` must push.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum PutLevel {
    /// State that can change while the guest runs.
    Runtime,
    /// Runtime state plus what a reset clobbers.
    Reset,
    /// Everything, used after initialization and migration.
    Full,
}

/// Per-vCPU architecture hooks.
///
/// The implementation owns the emulator's copy of the vCPU registers. Every method runs on the
/// vCPU's own thread and receives the vCPU scoped control handle.
pub trait ArchVcpu: Send {
    fn init_vcpu(&mut self, _vcpu: &ControlHandle) -> Result<()> {
        Ok(())
    }

    /// Pulls register state from the hypervisor into the emulator's copy.
    fn get_registers(&mut self, vcpu: &ControlHandle) -> Result<()>;

    /// Pushes the emulator's register copy to the hypervisor.
    fn put_registers(&mut self, vcpu: &ControlHandle, level: PutLevel) -> Result<()>;

    /// Handles events that must be processed before entering the guest. Returns true if the vCPU
    /// should not run this quantum.
    fn process_async_events(&mut self, _vcpu: &ControlHandle) -> bool {
        false
    }

    fn pre_run(&mut self, _vcpu: &ControlHandle, _run: &mut aehd_run) {}

    fn post_run(&mut self, _vcpu: &ControlHandle, _run: &aehd_run) -> MemTxAttrs {
        MemTxAttrs::default()
    }

    /// Handles an exit the generic loop does not understand. `Ok(None)` resumes the guest.
    fn handle_exit(&mut self, vcpu: &ControlHandle, run: &mut aehd_run)
        -> Result<Option<ExitResult>>;

    /// Whether an emulation failure reported by the hypervisor must stop the VM.
    fn stop_on_emulation_error(&mut self) -> bool {
        true
    }

    fn crash_info(&mut self) -> Option<GuestPanicInfo> {
        None
    }

    /// Human readable register dump used in fatal diagnostics.
    fn dump_state(&self) -> String {
        String::new()
    }
}

/// VM wide architecture hooks run once during `AehdState::init`.
pub trait ArchVm {
    fn init(&mut self, _vm: &ControlHandle) -> Result<()> {
        Ok(())
    }

    /// Creates an architecture specific interrupt controller. Returns false to let the generic
    /// irqchip be created instead.
    fn create_irqchip(&mut self, _vm: &ControlHandle) -> Result<bool> {
        Ok(false)
    }
}

/// Notifications from the routing table to the platform interrupt code.
pub trait IrqRouteHooks: Send {
    fn add_msi_route_post(&mut self, _route: &IrqRoute, _vector: u32) {}

    fn release_virq_post(&mut self, _gsi: u32) {}
}

/// Route hooks that ignore every notification.
pub struct NoopRouteHooks;

impl IrqRouteHooks for NoopRouteHooks {}
