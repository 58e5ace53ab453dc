// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Client side of the Android Emulator hypervisor driver (AEHD).
//!
//! `AehdState` owns the driver connection and the VM. Guest memory slots, the interrupt routing
//! table and parked vCPU handles live in `Resources` behind a single coarse lock. vCPUs are
//! created with `AehdState::init_vcpu` and driven by `AehdVcpu::exec` on their own thread.

pub mod arch;
mod cap;
pub mod config;
mod error;
pub mod ioctl;
pub mod irq;
pub mod memory;
mod run;
mod sync;
mod sys;
pub mod vcpu;

use std::sync::Arc;
use std::sync::MutexGuard;

use aehd_sys::*;
use log::debug;
use log::error;
use log::info;
use log::warn;

pub use crate::cap::Cap;
pub use crate::config::Config;
pub use crate::error::Error;
pub use crate::error::ErrorKind;
pub use crate::error::Result;
pub use crate::run::ExitResult;
pub use crate::sys::pagesize;
pub use crate::sys::DeviceChannel;
pub use crate::sys::DEFAULT_DEVICE_PATH;

use crate::arch::ArchVcpu;
use crate::arch::ArchVm;
use crate::ioctl::ControlChannel;
use crate::ioctl::ControlHandle;
use crate::ioctl::RawHandle;
use crate::ioctl::Scope;
use crate::irq::IrqRouting;
use crate::irq::MsiMessage;
use crate::memory::DirtyTracker;
use crate::memory::MemoryListener;
use crate::sync::Mutex;
use crate::vcpu::AehdVcpu;
use crate::vcpu::ParkedVcpu;
use crate::vcpu::RunMapping;

/// vCPU counts the driver supports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VcpuLimits {
    /// Soft limit; exceeding it only warns.
    pub recommended: usize,
    /// Hard limit.
    pub max: usize,
    /// vCPU ids must be below this value.
    pub max_vcpu_id: u64,
}

/// State shared by every vCPU and device model, guarded by the coarse lock.
pub struct Resources {
    pub memory: MemoryListener,
    pub irq: IrqRouting,
    parked: Vec<ParkedVcpu>,
}

impl Resources {
    pub fn parked_vcpus(&self) -> &[ParkedVcpu] {
        &self.parked
    }
}

/// Asks the driver behind `handle` about `cap`.
fn query_extension(handle: &ControlHandle, cap: Cap) -> Result<i32> {
    handle.ioctl_with_ref_ret(AEHD_CHECK_EXTENSION, &(cap as u32))
}

fn positive(value: i32) -> Option<usize> {
    if value > 0 {
        Some(value as usize)
    } else {
        None
    }
}

fn check_vcpu_count(kind: &str, requested: usize, limits: &VcpuLimits) -> Result<()> {
    if requested > limits.recommended {
        warn!(
            "Number of {} cpus requested ({}) exceeds the recommended cpus supported by AEHD ({})",
            kind, requested, limits.recommended
        );
    }
    if requested > limits.max {
        error!(
            "Number of {} cpus requested ({}) exceeds the maximum cpus supported by AEHD ({})",
            kind, requested, limits.max
        );
        return Err(Error::TooManyVcpus {
            requested,
            limit: limits.max,
        });
    }
    Ok(())
}

fn create_vm(device: &ControlHandle) -> Result<ControlHandle> {
    let vm_type: u32 = 0;
    loop {
        match device.ioctl_with_ref_ret::<_, u64>(AEHD_CREATE_VM, &vm_type) {
            Ok(handle) => return Ok(device.with_scope(Scope::Vm(RawHandle(handle)))),
            Err(Error::Interrupted) => debug!("AEHD_CREATE_VM interrupted, retrying"),
            Err(e) => {
                error!("AEHD_CREATE_VM failed: {}", e);
                return Err(e);
            }
        }
    }
}

/// The accelerator context: one driver connection and one VM.
pub struct AehdState {
    device: ControlHandle,
    vm: ControlHandle,
    limits: VcpuLimits,
    page_size: u64,
    resources: Mutex<Resources>,
}

impl AehdState {
    /// Opens the device named by `config` and initializes a VM on it.
    pub fn open(
        config: &Config,
        arch: &mut dyn ArchVm,
        tracker: Box<dyn DirtyTracker>,
    ) -> Result<AehdState> {
        let channel = DeviceChannel::open(&config.device_path)?;
        AehdState::init(config, Arc::new(channel), arch, tracker)
    }

    /// Initializes a VM over an already open driver connection.
    ///
    /// `tracker` receives dirty pages of address space 0.
    pub fn init(
        config: &Config,
        channel: Arc<dyn ControlChannel>,
        arch: &mut dyn ArchVm,
        tracker: Box<dyn DirtyTracker>,
    ) -> Result<AehdState> {
        let device = ControlHandle::new(channel, Scope::Device);

        let ext = |cap| query_extension(&device, cap).ok().and_then(positive);
        let nr_slots = ext(Cap::NrMemslots).unwrap_or(config.default_nr_slots);
        let recommended = ext(Cap::NrVcpus).unwrap_or(config.default_nr_vcpus);
        let max = ext(Cap::MaxVcpus).unwrap_or(recommended);
        let limits = VcpuLimits {
            recommended,
            max,
            max_vcpu_id: ext(Cap::MaxVcpuId).unwrap_or(max) as u64,
        };
        check_vcpu_count("SMP", config.smp_cpus, &limits)?;
        check_vcpu_count("hotpluggable", config.max_cpus, &limits)?;
        let page_size = config.page_size.unwrap_or(pagesize() as u64);
        if !page_size.is_power_of_two() {
            error!("invalid page size {:#x}", page_size);
            return Err(Error::InvalidPageSize(page_size));
        }

        let vm = create_vm(&device)?;
        let gsi_count = ext(Cap::IrqRouting).map_or(0, |n| n - 1) as u32;

        let setup = || -> Result<Resources> {
            arch.init(&vm)?;
            if !arch.create_irqchip(&vm)? {
                vm.ioctl(AEHD_CREATE_IRQCHIP).map_err(|e| {
                    error!("Create kernel irqchip failed: {}", e);
                    e
                })?;
            }
            Ok(Resources {
                memory: MemoryListener::new(vm.clone(), nr_slots, 0, page_size, tracker),
                irq: IrqRouting::new(vm.clone(), gsi_count),
                parked: Vec::new(),
            })
        };
        let resources = match setup() {
            Ok(resources) => resources,
            Err(e) => {
                vm.close();
                return Err(e);
            }
        };

        info!(
            "AEHD is operational: {} slots, {} gsis, up to {} vcpus",
            nr_slots, gsi_count, limits.max
        );
        Ok(AehdState {
            device,
            vm,
            limits,
            page_size,
            resources: Mutex::new(resources),
        })
    }

    /// Takes the coarse lock.
    pub fn lock(&self) -> MutexGuard<'_, Resources> {
        self.resources.lock()
    }

    pub fn vm(&self) -> &ControlHandle {
        &self.vm
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn vcpu_limits(&self) -> VcpuLimits {
        self.limits
    }

    /// Returns the driver's answer for `cap`, or 0 if it does not know it.
    pub fn check_extension(&self, cap: Cap) -> i32 {
        query_extension(&self.device, cap).unwrap_or(0)
    }

    /// Like `check_extension` but asks the VM first, which reflects VM specific limits.
    pub fn vm_check_extension(&self, cap: Cap) -> i32 {
        query_extension(&self.vm, cap).unwrap_or_else(|_| self.check_extension(cap))
    }

    pub fn vcpu_id_is_valid(&self, vcpu_id: u64) -> bool {
        vcpu_id < self.limits.max_vcpu_id
    }

    /// Returns a parked handle for `vcpu_id` or creates a new vCPU.
    fn acquire_vcpu(&self, vcpu_id: u64) -> Result<RawHandle> {
        {
            let mut resources = self.lock();
            if let Some(index) = resources.parked.iter().position(|p| p.vcpu_id == vcpu_id) {
                return Ok(resources.parked.remove(index).handle);
            }
        }
        let handle: u64 = self
            .vm
            .ioctl_with_ref_ret(AEHD_CREATE_VCPU, &(vcpu_id as u32))
            .map_err(|e| {
                error!("failed to create vcpu {}: {}", vcpu_id, e);
                Error::Fault
            })?;
        Ok(RawHandle(handle))
    }

    fn map_run(&self, vcpu: &ControlHandle) -> Result<RunMapping> {
        let mmap_size: u32 = self.device.ioctl_ret(AEHD_GET_VCPU_MMAP_SIZE)?;
        let addr: u64 = vcpu.ioctl_ret(AEHD_VCPU_MMAP)?;
        // Safe because the driver just mapped `mmap_size` bytes at `addr` for this vCPU and keeps
        // them mapped until AEHD_VCPU_MUNMAP.
        unsafe { RunMapping::new(addr, mmap_size as usize) }
    }

    /// Creates (or reuses) the vCPU `vcpu_id` and maps its run area.
    pub fn init_vcpu(&self, vcpu_id: u64, arch: Box<dyn ArchVcpu>) -> Result<AehdVcpu> {
        if !self.vcpu_id_is_valid(vcpu_id) {
            return Err(Error::InvalidVcpuId(vcpu_id));
        }
        let handle = self.acquire_vcpu(vcpu_id)?;
        let vcpu = self.vm.with_scope(Scope::Vcpu(handle));
        let run = match self.map_run(&vcpu) {
            Ok(run) => run,
            Err(e) => {
                vcpu.close();
                return Err(e);
            }
        };
        // From here on dropping `aehd_vcpu` unmaps and closes the handle.
        let mut aehd_vcpu = AehdVcpu::new(vcpu_id, vcpu.clone(), self.vm.clone(), run, arch);
        aehd_vcpu.arch.init_vcpu(&vcpu)?;
        Ok(aehd_vcpu)
    }

    /// Unmaps `vcpu` and parks its handle for a later `init_vcpu` with the same id.
    pub fn destroy_vcpu(&self, mut vcpu: AehdVcpu) {
        if let Some(parked) = vcpu.release() {
            self.lock().parked.push(parked);
        }
    }

    /// Sets the level of `gsi`. Returns the driver's delivery status.
    pub fn send_irq(&self, gsi: u32, level: bool) -> Result<i32> {
        self.lock().irq.set_irq(gsi, level)
    }

    pub fn send_msi(&self, msg: MsiMessage) -> Result<i32> {
        self.lock().irq.send_msi(msg)
    }

    /// Allocates and commits a GSI for MSI `vector` of a device.
    pub fn add_msi_route(&self, vector: u32, msg: MsiMessage) -> Result<u32> {
        self.lock().irq.add_msi_vector(vector, msg)
    }

    /// Retargets the MSI route of `gsi`. Takes effect on the next `commit_routes`.
    pub fn update_msi_route(&self, gsi: u32, msg: MsiMessage) -> Result<()> {
        self.lock().irq.update_msi_route(gsi, msg)
    }

    pub fn release_route(&self, gsi: u32) {
        self.lock().irq.release_route(gsi)
    }

    pub fn commit_routes(&self) -> Result<()> {
        self.lock().irq.commit()
    }
}

impl Drop for AehdState {
    fn drop(&mut self) {
        let resources = self.resources.get_mut();
        for parked in resources.parked.drain(..) {
            self.vm.with_scope(Scope::Vcpu(parked.handle)).close();
        }
        self.vm.close();
    }
}
