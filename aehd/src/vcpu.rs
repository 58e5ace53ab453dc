// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! vCPU creation, parking and register synchronization.

use std::mem::align_of;
use std::mem::size_of;
use std::ptr::addr_of_mut;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc::channel;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::thread::ThreadId;
use std::time::Duration;

use aehd_sys::*;
use log::debug;
use log::warn;

use crate::arch::ArchVcpu;
use crate::arch::PutLevel;
use crate::ioctl::ControlHandle;
use crate::ioctl::RawHandle;
use crate::ioctl::Scope;
use crate::sync::Mutex;
use crate::Error;
use crate::Result;

/// A vCPU handle kept after its vCPU was destroyed so a later vCPU with the same id can reuse it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ParkedVcpu {
    pub vcpu_id: u64,
    pub handle: RawHandle,
}

/// The run area the driver shares with a vCPU.
pub(crate) struct RunMapping {
    addr: u64,
    size: usize,
    mapped: Mutex<bool>,
}

impl RunMapping {
    /// # Safety
    ///
    /// `addr` must point to `size` bytes that stay readable and writable until `unmap` is called
    /// and the driver is told to drop the mapping.
    pub(crate) unsafe fn new(addr: u64, size: usize) -> Result<RunMapping> {
        if addr == 0 || addr as usize % align_of::<aehd_run>() != 0 || size < size_of::<aehd_run>()
        {
            return Err(Error::Fault);
        }
        Ok(RunMapping {
            addr,
            size,
            mapped: Mutex::new(true),
        })
    }

    pub(crate) fn as_ptr(&self) -> *mut aehd_run {
        self.addr as *mut aehd_run
    }

    /// Returns the `len` bytes at `offset` past the start of the run area, if they lie entirely
    /// after the `aehd_run` header and inside the mapping.
    pub(crate) fn data_ptr(&self, offset: u64, len: usize) -> Option<*mut u8> {
        let offset = usize::try_from(offset).ok()?;
        let end = offset.checked_add(len)?;
        if offset < size_of::<aehd_run>() || end > self.size {
            return None;
        }
        Some((self.addr as usize + offset) as *mut u8)
    }

    fn set_user_event_pending(&self) -> bool {
        // Held across the write so `unmap` cannot complete in between.
        let mapped = self.mapped.lock();
        if !*mapped {
            return false;
        }
        // Safe because the area is still mapped and the field is a single byte the driver polls.
        unsafe { addr_of_mut!((*self.as_ptr()).user_event_pending).write_volatile(1) };
        true
    }

    /// Stops further writes from other threads. Returns once no such write is in progress.
    fn unmap(&self) {
        *self.mapped.lock() = false;
    }
}

// Safe because the mapping is shared memory owned by the driver; the owning vCPU thread is the
// only one that reads or writes it apart from the single byte written by `set_user_event_pending`.
unsafe impl Send for RunMapping {}
unsafe impl Sync for RunMapping {}

/// Register synchronization points that must run on the vCPU's own thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncRequest {
    State,
    PostReset,
    PostInit,
    PreLoadvm,
}

struct VcpuRequest {
    request: SyncRequest,
    done: Sender<Result<()>>,
}

/// A handle for poking a vCPU from other threads.
#[derive(Clone)]
pub struct VcpuRemote {
    vcpu_id: u64,
    vm: ControlHandle,
    run: Arc<RunMapping>,
    exit_request: Arc<AtomicBool>,
    requests: Sender<VcpuRequest>,
    owner: Arc<Mutex<Option<ThreadId>>>,
}

impl VcpuRemote {
    pub fn vcpu_id(&self) -> u64 {
        self.vcpu_id
    }

    /// Forces the vCPU out of the guest at the next opportunity.
    pub fn raise_event(&self) {
        kick(&self.vm, &self.run, self.vcpu_id);
    }

    /// Asks the vCPU to return to its scheduler.
    pub fn request_exit(&self) {
        self.exit_request.store(true, Ordering::Release);
        self.raise_event();
    }

    /// Runs `request` on the vCPU thread and waits for it to complete.
    ///
    /// Fails with `VcpuThread` when called from the thread that services the vCPU's requests,
    /// since nothing would be left to answer it.
    pub fn run_on_vcpu(&self, request: SyncRequest) -> Result<()> {
        if *self.owner.lock() == Some(thread::current().id()) {
            return Err(Error::VcpuThread);
        }
        let (done, result) = channel();
        self.requests
            .send(VcpuRequest { request, done })
            .map_err(|_| Error::NotFound)?;
        self.raise_event();
        result.recv().map_err(|_| Error::NotFound)?
    }

    pub fn synchronize_state(&self) -> Result<()> {
        self.run_on_vcpu(SyncRequest::State)
    }

    pub fn synchronize_post_reset(&self) -> Result<()> {
        self.run_on_vcpu(SyncRequest::PostReset)
    }

    pub fn synchronize_post_init(&self) -> Result<()> {
        self.run_on_vcpu(SyncRequest::PostInit)
    }

    pub fn synchronize_pre_loadvm(&self) -> Result<()> {
        self.run_on_vcpu(SyncRequest::PreLoadvm)
    }
}

fn kick(vm: &ControlHandle, run: &RunMapping, vcpu_id: u64) {
    if !run.set_user_event_pending() {
        return;
    }
    if let Err(e) = vm.ioctl_with_ref(AEHD_KICK_VCPU, &(vcpu_id as u32)) {
        debug!("failed to kick vcpu {}: {}", vcpu_id, e);
    }
}

/// A vCPU owned by the thread that runs it.
pub struct AehdVcpu {
    pub(crate) vcpu_id: u64,
    pub(crate) vcpu: Option<ControlHandle>,
    pub(crate) vm: ControlHandle,
    pub(crate) run: Arc<RunMapping>,
    pub(crate) dirty: bool,
    pub(crate) arch: Box<dyn ArchVcpu>,
    pub(crate) exit_request: Arc<AtomicBool>,
    requests: Receiver<VcpuRequest>,
    request_sender: Sender<VcpuRequest>,
    // The thread that last serviced requests.
    owner: Arc<Mutex<Option<ThreadId>>>,
}

impl AehdVcpu {
    pub(crate) fn new(
        vcpu_id: u64,
        vcpu: ControlHandle,
        vm: ControlHandle,
        run: RunMapping,
        arch: Box<dyn ArchVcpu>,
    ) -> AehdVcpu {
        let (request_sender, requests) = channel();
        AehdVcpu {
            vcpu_id,
            vcpu: Some(vcpu),
            vm,
            run: Arc::new(run),
            dirty: true,
            arch,
            exit_request: Arc::new(AtomicBool::new(false)),
            requests,
            request_sender,
            owner: Arc::new(Mutex::new(None)),
        }
    }

    pub fn vcpu_id(&self) -> u64 {
        self.vcpu_id
    }

    /// True while the emulator's register copy is authoritative.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn arch(&self) -> &dyn ArchVcpu {
        self.arch.as_ref()
    }

    pub fn arch_mut(&mut self) -> &mut dyn ArchVcpu {
        self.arch.as_mut()
    }

    pub fn remote(&self) -> VcpuRemote {
        VcpuRemote {
            vcpu_id: self.vcpu_id,
            vm: self.vm.clone(),
            run: self.run.clone(),
            exit_request: self.exit_request.clone(),
            requests: self.request_sender.clone(),
            owner: self.owner.clone(),
        }
    }

    pub(crate) fn handle(&self) -> Result<&ControlHandle> {
        self.vcpu.as_ref().ok_or(Error::NotFound)
    }

    pub fn raise_event(&self) {
        kick(&self.vm, &self.run, self.vcpu_id);
    }

    /// Pulls registers from the hypervisor unless the emulator copy is already authoritative.
    pub fn synchronize_state(&mut self) -> Result<()> {
        if !self.dirty {
            let vcpu = self.handle()?.clone();
            self.arch.get_registers(&vcpu)?;
            self.dirty = true;
        }
        Ok(())
    }

    pub fn synchronize_post_reset(&mut self) -> Result<()> {
        let vcpu = self.handle()?.clone();
        self.arch.put_registers(&vcpu, PutLevel::Reset)?;
        self.dirty = false;
        Ok(())
    }

    pub fn synchronize_post_init(&mut self) -> Result<()> {
        let vcpu = self.handle()?.clone();
        self.arch.put_registers(&vcpu, PutLevel::Full)?;
        self.dirty = false;
        Ok(())
    }

    /// Marks the emulator copy authoritative without pulling, since it is about to be
    /// overwritten.
    pub fn synchronize_pre_loadvm(&mut self) {
        self.dirty = true;
    }

    fn handle_request(&mut self, request: VcpuRequest) {
        let result = match request.request {
            SyncRequest::State => self.synchronize_state(),
            SyncRequest::PostReset => self.synchronize_post_reset(),
            SyncRequest::PostInit => self.synchronize_post_init(),
            SyncRequest::PreLoadvm => {
                self.synchronize_pre_loadvm();
                Ok(())
            }
        };
        // The requester may have given up waiting.
        let _ = request.done.send(result);
    }

    fn claim_thread(&self) {
        *self.owner.lock() = Some(thread::current().id());
    }

    /// Services every pending cross-thread request. Returns how many were handled.
    pub fn process_requests(&mut self) -> usize {
        self.claim_thread();
        let mut handled = 0;
        while let Ok(request) = self.requests.try_recv() {
            self.handle_request(request);
            handled += 1;
        }
        handled
    }

    /// Waits up to `timeout` for a cross-thread request, then services every pending one.
    pub fn wait_for_requests(&mut self, timeout: Duration) -> usize {
        self.claim_thread();
        match self.requests.recv_timeout(timeout) {
            Ok(request) => {
                self.handle_request(request);
                1 + self.process_requests()
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => 0,
        }
    }

    /// Unmaps the run area and gives up the handle so it can be parked.
    pub(crate) fn release(&mut self) -> Option<ParkedVcpu> {
        let vcpu = self.vcpu.take()?;
        self.run.unmap();
        if let Err(e) = vcpu.ioctl(AEHD_VCPU_MUNMAP) {
            warn!("failed to unmap run area of vcpu {}: {}", self.vcpu_id, e);
        }
        match vcpu.scope() {
            Scope::Vcpu(handle) => Some(ParkedVcpu {
                vcpu_id: self.vcpu_id,
                handle,
            }),
            _ => None,
        }
    }
}

impl Drop for AehdVcpu {
    fn drop(&mut self) {
        if let Some(vcpu) = self.vcpu.as_ref().cloned() {
            self.release();
            vcpu.close();
        }
    }
}
