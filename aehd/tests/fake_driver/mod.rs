// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A scripted in-process stand-in for the AEHD driver.

#![allow(dead_code)]

use std::collections::HashMap;
use std::collections::VecDeque;
use std::mem::size_of;
use std::slice;
use std::sync::Arc;
use std::sync::Mutex;

use aehd::arch::AddressSpace;
use aehd::arch::ArchVcpu;
use aehd::arch::ArchVm;
use aehd::arch::GuestPanicInfo;
use aehd::arch::IoBus;
use aehd::arch::MachineControl;
use aehd::arch::MemTxAttrs;
use aehd::arch::PutLevel;
use aehd::arch::ShutdownCause;
use aehd::ioctl::ControlChannel;
use aehd::ioctl::ControlHandle;
use aehd::ioctl::RawHandle;
use aehd::ioctl::Scope;
use aehd::memory::DirtyTracker;
use aehd::AehdState;
use aehd::Cap;
use aehd::Config;
use aehd::Error;
use aehd::ExitResult;
use aehd::Resources;
use aehd::Result;
use aehd_sys::*;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

pub const PAGE_SIZE: u64 = 0x1000;
/// Size of every fake run area.
pub const RUN_AREA_SIZE: usize = 0x1000;
/// Where port I/O data is placed inside the run area.
pub const IO_DATA_OFFSET: u64 = 0x200;

/// Mutates a run area to describe the next exit, or fails the run call.
pub type Exit = Box<dyn FnOnce(&mut aehd_run, &mut [u8]) -> Result<()> + Send>;

struct RunArea {
    ptr: *mut u64,
    words: usize,
}

impl RunArea {
    fn new() -> RunArea {
        let words = RUN_AREA_SIZE / 8;
        let ptr = Box::into_raw(vec![0u64; words].into_boxed_slice()) as *mut u64;
        RunArea { ptr, words }
    }

    fn bytes(&mut self) -> &mut [u8] {
        // Safe because the allocation lives as long as `self` and is `words` u64s long.
        unsafe { slice::from_raw_parts_mut(self.ptr as *mut u8, self.words * 8) }
    }
}

impl Drop for RunArea {
    fn drop(&mut self) {
        // Safe because `ptr` came from `Box::into_raw` of a slice of `words` elements.
        unsafe {
            drop(Box::from_raw(slice::from_raw_parts_mut(self.ptr, self.words)));
        }
    }
}

// Safe because the area is only accessed under the driver lock or by the vCPU owning it.
unsafe impl Send for RunArea {}

struct Vcpu {
    vcpu_id: u32,
    run: Option<RunArea>,
    mapped: bool,
    exits: VecDeque<Exit>,
}

#[derive(Default)]
pub struct DriverState {
    pub caps: HashMap<u32, i32>,
    pub calls: Vec<(Scope, u32)>,
    pub closed: Vec<RawHandle>,
    /// Every SET_USER_MEMORY_REGION request in order.
    pub regions: Vec<aehd_userspace_memory_region>,
    /// Bitmap words reported by the next GET_DIRTY_LOG of a slot.
    pub dirty_bitmaps: HashMap<u32, Vec<u64>>,
    /// The table of the last SET_GSI_ROUTING.
    pub routes: Vec<aehd_irq_routing_entry>,
    pub irq_levels: Vec<aehd_irq_level>,
    pub irq_status: i32,
    pub kicks: Vec<u32>,
    failures: HashMap<u32, VecDeque<Error>>,
    next_handle: u64,
    vcpus: HashMap<u64, Vcpu>,
}

impl DriverState {
    fn new_handle(&mut self) -> u64 {
        self.next_handle += 1;
        0x100 + self.next_handle
    }

    fn vcpu_by_id(&mut self, vcpu_id: u32) -> &mut Vcpu {
        self.vcpus
            .values_mut()
            .find(|v| v.vcpu_id == vcpu_id)
            .expect("no such vcpu")
    }

    fn slot_size(&self, slot: u32) -> u64 {
        self.regions
            .iter()
            .rev()
            .find(|r| r.slot == slot)
            .map_or(0, |r| r.memory_size)
    }
}

pub struct FakeDriver {
    state: Mutex<DriverState>,
}

fn write_out<T: IntoBytes + zerocopy::Immutable>(output: &mut [u8], value: &T) -> Result<()> {
    value
        .write_to_prefix(output)
        .map_err(|_| Error::TooSmallBuffer)
}

fn read_in<T: FromBytes>(input: &[u8]) -> Result<T> {
    T::read_from_prefix(input)
        .map(|(v, _)| v)
        .map_err(|_| Error::Fault)
}

impl FakeDriver {
    /// A driver reporting 4 slots, 4 vCPUs and a routing table of 8 GSIs.
    pub fn new() -> Arc<FakeDriver> {
        let driver = FakeDriver {
            state: Mutex::new(DriverState::default()),
        };
        driver.set_cap(Cap::Irqchip, 1);
        driver.set_cap(Cap::UserMemory, 1);
        driver.set_cap(Cap::NrMemslots, 4);
        driver.set_cap(Cap::NrVcpus, 4);
        driver.set_cap(Cap::MaxVcpus, 8);
        driver.set_cap(Cap::MaxVcpuId, 8);
        driver.set_cap(Cap::IrqRouting, 9);
        Arc::new(driver)
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, DriverState> {
        self.state.lock().unwrap()
    }

    pub fn set_cap(&self, cap: Cap, value: i32) {
        self.state().caps.insert(cap as u32, value);
    }

    pub fn clear_cap(&self, cap: Cap) {
        self.state().caps.remove(&(cap as u32));
    }

    /// Makes the next call of `request` fail with `error`.
    pub fn fail_next(&self, request: u32, error: Error) {
        self.state()
            .failures
            .entry(request)
            .or_default()
            .push_back(error);
    }

    pub fn count(&self, request: u32) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|(_, r)| *r == request)
            .count()
    }

    pub fn regions(&self) -> Vec<aehd_userspace_memory_region> {
        self.state().regions.clone()
    }

    pub fn routes(&self) -> Vec<aehd_irq_routing_entry> {
        self.state().routes.clone()
    }

    pub fn set_dirty_bitmap(&self, slot: u32, words: Vec<u64>) {
        self.state().dirty_bitmaps.insert(slot, words);
    }

    /// Queues an exit for the next run call of vCPU `vcpu_id`.
    pub fn push_exit(&self, vcpu_id: u32, exit: Exit) {
        self.state().vcpu_by_id(vcpu_id).exits.push_back(exit);
    }

    /// Copies the run area of `vcpu_id`.
    pub fn run_area(&self, vcpu_id: u32) -> Vec<u8> {
        let mut state = self.state();
        let vcpu = state.vcpu_by_id(vcpu_id);
        vcpu.run.as_mut().map_or(Vec::new(), |r| r.bytes().to_vec())
    }

    pub fn is_mapped(&self, vcpu_id: u32) -> bool {
        self.state().vcpu_by_id(vcpu_id).mapped
    }

    fn run(&self, handle: u64) -> Result<()> {
        let mut state = self.state();
        let vcpu = state.vcpus.get_mut(&handle).ok_or(Error::Fault)?;
        let exit = vcpu.exits.pop_front();
        let area = vcpu.run.as_mut().ok_or(Error::Fault)?;
        let (header, data) = area.bytes().split_at_mut(size_of::<aehd_run>());
        let (run, _) = aehd_run::mut_from_prefix(header).map_err(|_| Error::Fault)?;
        if run.user_event_pending != 0 {
            run.user_event_pending = 0;
            if let Some(exit) = exit {
                vcpu.exits.push_front(exit);
            }
            run.exit_reason = AEHD_EXIT_INTR;
            return Ok(());
        }
        match exit {
            Some(exit) => exit(run, data),
            None => {
                run.exit_reason = AEHD_EXIT_INTR;
                Ok(())
            }
        }
    }
}

impl ControlChannel for FakeDriver {
    fn call(&self, scope: Scope, request: u32, input: &[u8], output: &mut [u8]) -> Result<()> {
        {
            let mut state = self.state();
            state.calls.push((scope, request));
            if let Some(error) = state.failures.get_mut(&request).and_then(|f| f.pop_front()) {
                return Err(error);
            }
        }

        match request {
            AEHD_CHECK_EXTENSION => {
                let cap: u32 = read_in(input)?;
                let value = self.state().caps.get(&cap).copied().unwrap_or(0);
                write_out(output, &value)
            }
            AEHD_CREATE_VM => {
                let handle = self.state().new_handle();
                write_out(output, &handle)
            }
            AEHD_GET_VCPU_MMAP_SIZE => write_out(output, &(RUN_AREA_SIZE as u32)),
            AEHD_CREATE_VCPU => {
                let vcpu_id: u32 = read_in(input)?;
                let mut state = self.state();
                let handle = state.new_handle();
                state.vcpus.insert(
                    handle,
                    Vcpu {
                        vcpu_id,
                        run: None,
                        mapped: false,
                        exits: VecDeque::new(),
                    },
                );
                write_out(output, &handle)
            }
            AEHD_SET_USER_MEMORY_REGION => {
                let region: aehd_userspace_memory_region = read_in(input)?;
                self.state().regions.push(region);
                Ok(())
            }
            AEHD_GET_DIRTY_LOG => {
                let log: aehd_dirty_log = read_in(input)?;
                let mut state = self.state();
                let words = (state.slot_size(log.slot) / PAGE_SIZE).div_ceil(64) as usize;
                let bitmap = state.dirty_bitmaps.remove(&log.slot).unwrap_or_default();
                for i in 0..words {
                    let word = bitmap.get(i).copied().unwrap_or(0);
                    // Safe because the caller sized the bitmap for the whole slot.
                    unsafe { (log.dirty_bitmap as *mut u64).add(i).write(word.to_le()) };
                }
                Ok(())
            }
            AEHD_SET_GSI_ROUTING => {
                let header: aehd_irq_routing = read_in(input)?;
                let entries = input[size_of::<aehd_irq_routing>()..]
                    .chunks_exact(size_of::<aehd_irq_routing_entry>())
                    .take(header.nr as usize)
                    .map(read_in)
                    .collect::<Result<Vec<aehd_irq_routing_entry>>>()?;
                self.state().routes = entries;
                Ok(())
            }
            AEHD_IRQ_LINE_STATUS => {
                let level: aehd_irq_level = read_in(input)?;
                let mut state = self.state();
                state.irq_levels.push(level);
                let status = aehd_irq_level {
                    irq: state.irq_status as u32,
                    level: level.level,
                };
                write_out(output, &status)
            }
            AEHD_KICK_VCPU => {
                let vcpu_id: u32 = read_in(input)?;
                self.state().kicks.push(vcpu_id);
                Ok(())
            }
            AEHD_VCPU_MMAP => {
                let Scope::Vcpu(RawHandle(handle)) = scope else {
                    return Err(Error::Fault);
                };
                let mut state = self.state();
                let vcpu = state.vcpus.get_mut(&handle).ok_or(Error::Fault)?;
                let area = vcpu.run.get_or_insert_with(RunArea::new);
                vcpu.mapped = true;
                write_out(output, &(area.ptr as u64))
            }
            AEHD_VCPU_MUNMAP => {
                if let Scope::Vcpu(RawHandle(handle)) = scope {
                    if let Some(vcpu) = self.state().vcpus.get_mut(&handle) {
                        vcpu.mapped = false;
                    }
                }
                Ok(())
            }
            AEHD_RUN => match scope {
                Scope::Vcpu(RawHandle(handle)) => self.run(handle),
                _ => Err(Error::Fault),
            },
            _ => Ok(()),
        }
    }

    fn close(&self, handle: RawHandle) {
        self.state().closed.push(handle);
    }
}

/// Opens a VM on `driver` with a 4 KiB page size.
pub fn open_state(driver: &Arc<FakeDriver>) -> AehdState {
    open_state_with(driver, Config::default(), Box::new(FakeTracker::default()))
}

pub fn open_state_with(
    driver: &Arc<FakeDriver>,
    config: Config,
    tracker: Box<dyn DirtyTracker>,
) -> AehdState {
    let config = Config {
        page_size: Some(PAGE_SIZE),
        ..config
    };
    AehdState::init(&config, driver.clone(), &mut NoArchVm, tracker).unwrap()
}

pub struct NoArchVm;

impl ArchVm for NoArchVm {}

/// Pages handed to a `DirtyTracker`.
#[derive(Clone, Default)]
pub struct FakeTracker {
    pub pages: Arc<Mutex<Vec<(u64, u64)>>>,
}

impl FakeTracker {
    pub fn pages(&self) -> Vec<(u64, u64)> {
        self.pages.lock().unwrap().clone()
    }
}

impl DirtyTracker for FakeTracker {
    fn mark_dirty(&mut self, ram_addr: u64, len: u64) {
        self.pages.lock().unwrap().push((ram_addr, len));
    }
}

/// What a `FakeArch` observed.
#[derive(Default)]
pub struct ArchLog {
    pub gets: usize,
    pub puts: Vec<PutLevel>,
    pub handled_exits: Vec<u32>,
    pub pre_runs: usize,
}

#[derive(Clone)]
pub struct FakeArch {
    pub log: Arc<Mutex<ArchLog>>,
    pub halt_on_async_events: bool,
    pub stop_on_emulation_error: bool,
    pub exit_result: Option<ExitResult>,
    pub crash_params: Option<Vec<u64>>,
}

impl Default for FakeArch {
    fn default() -> Self {
        FakeArch {
            log: Arc::new(Mutex::new(ArchLog::default())),
            halt_on_async_events: false,
            stop_on_emulation_error: true,
            exit_result: Some(ExitResult::Halt),
            crash_params: None,
        }
    }
}

impl FakeArch {
    pub fn gets(&self) -> usize {
        self.log.lock().unwrap().gets
    }

    pub fn puts(&self) -> Vec<PutLevel> {
        self.log.lock().unwrap().puts.clone()
    }

    pub fn handled_exits(&self) -> Vec<u32> {
        self.log.lock().unwrap().handled_exits.clone()
    }
}

impl ArchVcpu for FakeArch {
    fn get_registers(&mut self, vcpu: &ControlHandle) -> Result<()> {
        vcpu.ioctl(AEHD_GET_REGS)?;
        self.log.lock().unwrap().gets += 1;
        Ok(())
    }

    fn put_registers(&mut self, vcpu: &ControlHandle, level: PutLevel) -> Result<()> {
        vcpu.ioctl(AEHD_SET_REGS)?;
        self.log.lock().unwrap().puts.push(level);
        Ok(())
    }

    fn process_async_events(&mut self, _vcpu: &ControlHandle) -> bool {
        self.halt_on_async_events
    }

    fn pre_run(&mut self, _vcpu: &ControlHandle, _run: &mut aehd_run) {
        self.log.lock().unwrap().pre_runs += 1;
    }

    fn handle_exit(
        &mut self,
        _vcpu: &ControlHandle,
        run: &mut aehd_run,
    ) -> Result<Option<ExitResult>> {
        self.log.lock().unwrap().handled_exits.push(run.exit_reason);
        Ok(self.exit_result)
    }

    fn stop_on_emulation_error(&mut self) -> bool {
        self.stop_on_emulation_error
    }

    fn crash_info(&mut self) -> Option<GuestPanicInfo> {
        self.crash_params
            .clone()
            .map(|params| GuestPanicInfo { params })
    }

    fn dump_state(&self) -> String {
        "rip=0".to_string()
    }
}

/// One bus access seen by `FakeBus`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Access {
    pub space: AddressSpace,
    pub addr: u64,
    pub data: Vec<u8>,
    pub is_write: bool,
}

/// Records writes and answers reads with `read_value` repeated.
#[derive(Default)]
pub struct FakeBus {
    pub accesses: Vec<Access>,
    pub read_value: u8,
    pub locked_slots: Vec<usize>,
}

impl IoBus for FakeBus {
    fn read_write(
        &mut self,
        resources: &mut Resources,
        space: AddressSpace,
        addr: u64,
        _attrs: MemTxAttrs,
        data: &mut [u8],
        is_write: bool,
    ) {
        if !is_write {
            data.fill(self.read_value);
        }
        self.locked_slots.push(resources.memory.nr_slots());
        self.accesses.push(Access {
            space,
            addr,
            data: data.to_vec(),
            is_write,
        });
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MachineEvent {
    Shutdown(ShutdownCause),
    Reset(ShutdownCause),
    Panic(Option<GuestPanicInfo>),
    Stop,
}

#[derive(Default)]
pub struct FakeMachine {
    pub events: Mutex<Vec<MachineEvent>>,
}

impl FakeMachine {
    pub fn events(&self) -> Vec<MachineEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl MachineControl for FakeMachine {
    fn request_shutdown(&self, cause: ShutdownCause) {
        self.events.lock().unwrap().push(MachineEvent::Shutdown(cause));
    }

    fn request_reset(&self, cause: ShutdownCause) {
        self.events.lock().unwrap().push(MachineEvent::Reset(cause));
    }

    fn notify_panic(&self, info: Option<GuestPanicInfo>) {
        self.events.lock().unwrap().push(MachineEvent::Panic(info));
    }

    fn stop_vm(&self) {
        self.events.lock().unwrap().push(MachineEvent::Stop);
    }
}

/// Writes `payload` into the exit union of `run`.
pub fn set_payload<T: IntoBytes + zerocopy::Immutable>(run: &mut aehd_run, payload: &T) {
    payload.write_to_prefix(run.exit.as_mut_bytes()).unwrap();
}

pub fn simple_exit(reason: u32) -> Exit {
    Box::new(move |run, _| {
        run.exit_reason = reason;
        Ok(())
    })
}

pub fn failing_exit(error: Error) -> Exit {
    Box::new(move |_, _| Err(error))
}

pub fn io_exit(direction: u8, port: u16, size: u8, data: Vec<u8>) -> Exit {
    Box::new(move |run, area| {
        run.exit_reason = AEHD_EXIT_IO;
        let count = (data.len() / size as usize) as u32;
        set_payload(
            run,
            &aehd_run_io {
                direction,
                size,
                port,
                count,
                data_offset: IO_DATA_OFFSET,
            },
        );
        let start = IO_DATA_OFFSET as usize - size_of::<aehd_run>();
        area[start..start + data.len()].copy_from_slice(&data);
        Ok(())
    })
}

pub fn mmio_exit(phys_addr: u64, len: u32, is_write: bool, data: [u8; 8]) -> Exit {
    Box::new(move |run, _| {
        run.exit_reason = AEHD_EXIT_MMIO;
        set_payload(
            run,
            &aehd_run_mmio {
                phys_addr,
                data,
                len,
                is_write: is_write.into(),
                padding: [0; 3],
            },
        );
        Ok(())
    })
}

pub fn system_event_exit(type_: u32) -> Exit {
    Box::new(move |run, _| {
        run.exit_reason = AEHD_EXIT_SYSTEM_EVENT;
        set_payload(
            run,
            &aehd_run_system_event {
                type_,
                padding: 0,
                flags: 0,
            },
        );
        Ok(())
    })
}

pub fn internal_error_exit(suberror: u32, extra: &[u64]) -> Exit {
    let mut internal = aehd_run_internal {
        suberror,
        ndata: extra.len() as u32,
        ..Default::default()
    };
    internal.data[..extra.len()].copy_from_slice(extra);
    Box::new(move |run, _| {
        run.exit_reason = AEHD_EXIT_INTERNAL_ERROR;
        set_payload(run, &internal);
        Ok(())
    })
}

pub fn unknown_exit(hardware_exit_reason: u64) -> Exit {
    Box::new(move |run, _| {
        run.exit_reason = AEHD_EXIT_UNKNOWN;
        set_payload(
            run,
            &aehd_run_hw {
                hardware_exit_reason,
            },
        );
        Ok(())
    })
}

/// Reads the exit union of a copied run area.
pub fn payload<T: FromBytes>(area: &[u8]) -> T {
    let (run, _) = aehd_run::read_from_prefix(area).unwrap();
    T::read_from_prefix(run.exit.as_bytes()).unwrap().0
}
