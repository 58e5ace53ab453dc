// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The per-vCPU execution loop.

use std::cmp::min;
use std::slice;
use std::sync::atomic::Ordering;

use aehd_sys::*;
use enumn::N;
use log::debug;
use log::error;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

use crate::arch::AddressSpace;
use crate::arch::IoBus;
use crate::arch::MachineControl;
use crate::arch::MemTxAttrs;
use crate::arch::PutLevel;
use crate::arch::ShutdownCause;
use crate::vcpu::AehdVcpu;
use crate::AehdState;
use crate::Error;
use crate::Result;

/// Why `AehdVcpu::exec` returned control to the scheduler.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitResult {
    /// The vCPU has nothing to run until an event arrives.
    Halt,
    /// The vCPU left the guest so the scheduler can look at pending work.
    Interrupt,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, N)]
#[repr(u32)]
enum ExitReason {
    Unknown = AEHD_EXIT_UNKNOWN,
    Io = AEHD_EXIT_IO,
    Mmio = AEHD_EXIT_MMIO,
    IrqWindowOpen = AEHD_EXIT_IRQ_WINDOW_OPEN,
    Shutdown = AEHD_EXIT_SHUTDOWN,
    Intr = AEHD_EXIT_INTR,
    InternalError = AEHD_EXIT_INTERNAL_ERROR,
    SystemEvent = AEHD_EXIT_SYSTEM_EVENT,
}

/// Reads the active member of the exit union.
fn exit_payload<T: FromBytes>(run: &aehd_run) -> T {
    // Every payload fits in the union, so the fallback is never taken.
    T::read_from_prefix(run.exit.as_bytes())
        .map(|(payload, _)| payload)
        .unwrap_or_else(|_| T::new_zeroed())
}

impl AehdVcpu {
    /// Runs the guest until the scheduler needs to look at this vCPU again.
    ///
    /// The coarse lock in `state` is only taken around I/O and MMIO dispatch. Cross-thread
    /// synchronization requests are serviced on entry. An error means the VM has been stopped
    /// through `machine` and must not be resumed.
    pub fn exec(
        &mut self,
        state: &AehdState,
        bus: &mut dyn IoBus,
        machine: &dyn MachineControl,
    ) -> Result<ExitResult> {
        self.process_requests();

        let vcpu = self.handle()?.clone();
        if self.arch.process_async_events(&vcpu) {
            self.exit_request.store(false, Ordering::Release);
            return Ok(ExitResult::Halt);
        }

        let ret = loop {
            match self.run_once(state, bus, machine) {
                Ok(None) => continue,
                Ok(Some(result)) => break Ok(result),
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = &ret {
            error!("vcpu {} stopped: {}", self.vcpu_id, e);
            self.dump_state();
            machine.stop_vm();
        }
        self.exit_request.store(false, Ordering::Release);
        ret
    }

    fn dump_state(&self) {
        let dump = self.arch.dump_state();
        if !dump.is_empty() {
            error!("vcpu {} state:\n{}", self.vcpu_id, dump);
        }
    }

    /// Enters the guest once and handles the resulting exit. `Ok(None)` keeps the loop going.
    fn run_once(
        &mut self,
        state: &AehdState,
        bus: &mut dyn IoBus,
        machine: &dyn MachineControl,
    ) -> Result<Option<ExitResult>> {
        let vcpu = self.handle()?.clone();

        if self.dirty {
            self.arch.put_registers(&vcpu, PutLevel::Runtime)?;
            self.dirty = false;
        }

        {
            // Safe because the run area stays mapped while we hold the vCPU handle and only this
            // thread references it outside of the run call.
            let run = unsafe { &mut *self.run.as_ptr() };
            self.arch.pre_run(&vcpu, run);
        }
        if self.exit_request.load(Ordering::Acquire) {
            // The driver must be re-entered after an I/O exit to finish the instruction; the
            // pending event makes it leave again right away.
            debug!("interrupt exit requested");
            self.raise_event();
        }

        let run_ret = vcpu.ioctl(AEHD_RUN);

        // Safe for the same reasons as above; the run call has returned.
        let run = unsafe { &mut *self.run.as_ptr() };
        let attrs = self.arch.post_run(&vcpu, run);

        match run_ret {
            Ok(()) => {}
            Err(Error::Interrupted) | Err(Error::WouldBlock) => {
                debug!("io window exit");
                return Ok(Some(ExitResult::Interrupt));
            }
            Err(e) => {
                error!("aehd run failed: {}", e);
                return Err(e);
            }
        }

        match ExitReason::n(run.exit_reason) {
            Some(ExitReason::Io) => {
                self.handle_io(state, bus, attrs, exit_payload(run))?;
                Ok(None)
            }
            Some(ExitReason::Mmio) => {
                let mut mmio: aehd_run_mmio = exit_payload(run);
                let len = min(mmio.len as usize, mmio.data.len());
                {
                    let mut resources = state.lock();
                    bus.read_write(
                        &mut resources,
                        AddressSpace::Memory,
                        mmio.phys_addr,
                        attrs,
                        &mut mmio.data[..len],
                        mmio.is_write != 0,
                    );
                }
                if mmio.is_write == 0 {
                    mmio.write_to_prefix(run.exit.as_mut_bytes())
                        .map_err(|_| Error::Fault)?;
                }
                Ok(None)
            }
            Some(ExitReason::IrqWindowOpen) => {
                debug!("irq window open");
                Ok(Some(ExitResult::Interrupt))
            }
            Some(ExitReason::Intr) => {
                debug!("raise event exit");
                Ok(Some(ExitResult::Interrupt))
            }
            Some(ExitReason::Shutdown) => {
                debug!("shutdown");
                machine.request_reset(ShutdownCause::GuestReset);
                Ok(Some(ExitResult::Interrupt))
            }
            Some(ExitReason::Unknown) => {
                let hw: aehd_run_hw = exit_payload(run);
                error!(
                    "AEHD: unknown exit, hardware reason {:#x}",
                    hw.hardware_exit_reason
                );
                Err(Error::UnknownExit(hw.hardware_exit_reason))
            }
            Some(ExitReason::InternalError) => self.handle_internal_error(exit_payload(run)),
            Some(ExitReason::SystemEvent) => {
                let event: aehd_run_system_event = exit_payload(run);
                match event.type_ {
                    AEHD_SYSTEM_EVENT_SHUTDOWN => {
                        machine.request_shutdown(ShutdownCause::GuestShutdown);
                        Ok(Some(ExitResult::Interrupt))
                    }
                    AEHD_SYSTEM_EVENT_RESET => {
                        machine.request_reset(ShutdownCause::GuestReset);
                        Ok(Some(ExitResult::Interrupt))
                    }
                    AEHD_SYSTEM_EVENT_CRASH => {
                        self.synchronize_state()?;
                        machine.notify_panic(self.arch.crash_info());
                        Ok(None)
                    }
                    _ => self.arch.handle_exit(&vcpu, run),
                }
            }
            None => self.arch.handle_exit(&vcpu, run),
        }
    }

    fn handle_io(
        &mut self,
        state: &AehdState,
        bus: &mut dyn IoBus,
        attrs: MemTxAttrs,
        io: aehd_run_io,
    ) -> Result<()> {
        let size = io.size as usize;
        if size == 0 || io.count == 0 {
            return Ok(());
        }
        let len = size * io.count as usize;
        let ptr = self.run.data_ptr(io.data_offset, len).ok_or(Error::Fault)?;
        // Safe because `data_ptr` checked the range lies inside the mapping and past the run
        // header, so it aliases nothing else we hold.
        let data = unsafe { slice::from_raw_parts_mut(ptr, len) };
        let is_write = io.direction == AEHD_EXIT_IO_OUT;
        let mut resources = state.lock();
        for item in data.chunks_mut(size) {
            bus.read_write(
                &mut resources,
                AddressSpace::Io,
                io.port.into(),
                attrs,
                item,
                is_write,
            );
        }
        Ok(())
    }

    fn handle_internal_error(&mut self, internal: aehd_run_internal) -> Result<Option<ExitResult>> {
        error!("AEHD internal error. Suberror: {}", internal.suberror);
        let ndata = min(internal.ndata as usize, internal.data.len());
        for (i, data) in internal.data[..ndata].iter().enumerate() {
            error!("extra data[{}]: {:#x}", i, data);
        }
        if internal.suberror == AEHD_INTERNAL_ERROR_EMULATION {
            error!("emulation failure");
            if !self.arch.stop_on_emulation_error() {
                self.dump_state();
                return Ok(Some(ExitResult::Halt));
            }
        }
        Err(Error::InternalError(internal.suberror))
    }
}
