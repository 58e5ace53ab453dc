// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Guest physical memory slots.
//!
//! The driver maps guest physical ranges onto host memory through a fixed size table of slots.
//! `MemoryListener` mirrors that table and keeps it in step with memory topology notifications.

use aehd_sys::*;
use bitflags::bitflags;
use log::debug;

use crate::ioctl::ControlHandle;
use crate::Error;
use crate::Result;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct MemFlags: u32 {
        const LOG_DIRTY_PAGES = AEHD_MEM_LOG_DIRTY_PAGES;
        const READONLY = AEHD_MEM_READONLY;
    }
}

/// What backs a memory section.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegionKind {
    Ram { read_only: bool },
    /// ROM whose reads are served from memory while `romd_mode` is set and trap otherwise.
    RomDevice { romd_mode: bool },
    /// Emulated device registers; every access traps.
    Io,
}

/// A contiguous piece of the guest physical address space as seen by the memory topology.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemorySection {
    pub guest_addr: u64,
    pub size: u64,
    /// Host address backing `guest_addr`.
    pub host_addr: u64,
    /// Offset of `guest_addr` in the dirty tracking space.
    pub ram_addr: u64,
    pub kind: RegionKind,
    pub dirty_log: bool,
}

impl MemorySection {
    /// A writable RAM section without dirty logging.
    pub fn ram(guest_addr: u64, size: u64, host_addr: u64, ram_addr: u64) -> MemorySection {
        MemorySection {
            guest_addr,
            size,
            host_addr,
            ram_addr,
            kind: RegionKind::Ram { read_only: false },
            dirty_log: false,
        }
    }

    pub fn with_kind(self, kind: RegionKind) -> MemorySection {
        MemorySection { kind, ..self }
    }

    pub fn with_dirty_log(self, dirty_log: bool) -> MemorySection {
        MemorySection { dirty_log, ..self }
    }

    /// Flags a slot backing this section is registered with.
    pub fn mem_flags(&self) -> MemFlags {
        let mut flags = MemFlags::empty();
        if self.dirty_log {
            flags |= MemFlags::LOG_DIRTY_PAGES;
        }
        match self.kind {
            RegionKind::Ram { read_only: true } | RegionKind::RomDevice { romd_mode: true } => {
                flags |= MemFlags::READONLY
            }
            _ => {}
        }
        flags
    }
}

/// One entry of the driver's slot table. A `memory_size` of zero marks a free slot.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Slot {
    pub slot: u32,
    pub start_addr: u64,
    pub memory_size: u64,
    pub host_addr: u64,
    pub flags: MemFlags,
}

impl Slot {
    fn overlaps(&self, start: u64, size: u64) -> bool {
        self.memory_size != 0
            && start < self.start_addr + self.memory_size
            && self.start_addr < start + size
    }
}

/// Receives pages reported dirty by the hypervisor.
pub trait DirtyTracker: Send {
    /// Marks `[ram_addr, ram_addr + len)` dirty.
    fn mark_dirty(&mut self, ram_addr: u64, len: u64);
}

/// A tracker that discards every report.
pub struct NullDirtyTracker;

impl DirtyTracker for NullDirtyTracker {
    fn mark_dirty(&mut self, _ram_addr: u64, _len: u64) {}
}

/// Rounds `start` up and the end of the range down to `page_size`.
///
/// Returns the aligned start and the aligned size, which is zero when no whole page is covered.
pub fn align_region(start: u64, size: u64, page_size: u64) -> (u64, u64) {
    let page_mask = !(page_size - 1);
    let aligned = start.wrapping_add(page_size - 1) & page_mask;
    let delta = aligned.wrapping_sub(start);
    if delta > size {
        return (aligned, 0);
    }
    (aligned, (size - delta) & page_mask)
}

/// Size in bytes of the dirty bitmap for a slot of `size` bytes. The driver fills whole 64 bit
/// words.
pub fn dirty_log_bitmap_size(size: u64, page_size: u64) -> usize {
    let pages = size / page_size;
    (pages.div_ceil(64) * 8) as usize
}

pub struct MemoryListener {
    vm: ControlHandle,
    slots: Vec<Slot>,
    as_id: u32,
    page_size: u64,
    tracker: Box<dyn DirtyTracker>,
}

impl MemoryListener {
    /// Creates a listener for address space `as_id` over a table of `nr_slots` slots.
    pub fn new(
        vm: ControlHandle,
        nr_slots: usize,
        as_id: u32,
        page_size: u64,
        tracker: Box<dyn DirtyTracker>,
    ) -> MemoryListener {
        let slots = (0..nr_slots as u32)
            .map(|slot| Slot {
                slot,
                ..Default::default()
            })
            .collect();
        MemoryListener {
            vm,
            slots,
            as_id,
            page_size,
            tracker,
        }
    }

    pub fn nr_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn has_free_slot(&self) -> bool {
        self.slots.iter().any(|s| s.memory_size == 0)
    }

    pub fn align_region(&self, section: &MemorySection) -> (u64, u64) {
        align_region(section.guest_addr, section.size, self.page_size)
    }

    fn find_free_slot(&self) -> Result<usize> {
        self.slots
            .iter()
            .position(|s| s.memory_size == 0)
            .ok_or(Error::NoSpace)
    }

    fn matching_index(&self, start: u64, size: u64) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.memory_size != 0 && s.start_addr == start && s.memory_size == size)
    }

    /// Returns the live slot registered for exactly `[start, start + size)`.
    pub fn find_matching_slot(&self, start: u64, size: u64) -> Option<&Slot> {
        self.matching_index(start, size).map(|i| &self.slots[i])
    }

    /// Pushes `slot` to the driver. `old_flags` are the flags the driver currently holds for it.
    fn register(&self, slot: &Slot, old_flags: MemFlags) -> Result<()> {
        let region = aehd_userspace_memory_region {
            slot: slot.slot | (self.as_id << 16),
            flags: slot.flags.bits(),
            guest_phys_addr: slot.start_addr,
            memory_size: slot.memory_size,
            userspace_addr: slot.host_addr,
        };
        if slot.memory_size != 0
            && old_flags.contains(MemFlags::READONLY)
            && !slot.flags.contains(MemFlags::READONLY)
        {
            // The driver only drops write protection from a slot that was emptied first.
            let empty = aehd_userspace_memory_region {
                memory_size: 0,
                ..region
            };
            self.vm
                .ioctl_with_ref(AEHD_SET_USER_MEMORY_REGION, &empty)?;
        }
        self.vm.ioctl_with_ref(AEHD_SET_USER_MEMORY_REGION, &region)
    }

    fn set_phys_mem(&mut self, section: &MemorySection, add: bool) -> Result<()> {
        let add = match section.kind {
            // Emulated registers never get a slot.
            RegionKind::Io => return Ok(()),
            // Drop the slot so reads of a ROM device outside ROMD mode trap.
            RegionKind::RomDevice { romd_mode: false } => false,
            _ => add,
        };

        let (start, size) = self.align_region(section);
        if size == 0 {
            return Ok(());
        }
        let delta = start - section.guest_addr;

        if !add {
            let index = match self.matching_index(start, size) {
                Some(index) => index,
                None => return Ok(()),
            };
            let slot = self.slots[index];
            if slot.flags.contains(MemFlags::LOG_DIRTY_PAGES) {
                self.sync_slot(&slot, section.ram_addr + delta)?;
            }
            let removed = Slot {
                memory_size: 0,
                ..slot
            };
            self.register(&removed, slot.flags)?;
            self.slots[index] = Slot {
                slot: slot.slot,
                ..Default::default()
            };
            debug!("removed slot {} at {:#x}+{:#x}", slot.slot, start, size);
            return Ok(());
        }

        if self.slots.iter().any(|s| s.overlaps(start, size)) {
            return Err(Error::RegionOverlap { start, size });
        }
        let index = self.find_free_slot()?;
        let slot = Slot {
            slot: self.slots[index].slot,
            start_addr: start,
            memory_size: size,
            host_addr: section.host_addr + delta,
            flags: section.mem_flags(),
        };
        self.register(&slot, MemFlags::empty())?;
        self.slots[index] = slot;
        debug!(
            "registered slot {} at {:#x}+{:#x} flags {:?}",
            slot.slot, start, size, slot.flags
        );
        Ok(())
    }

    /// Registers a slot for a newly visible section.
    pub fn region_add(&mut self, section: &MemorySection) -> Result<()> {
        self.set_phys_mem(section, true)
    }

    /// Unregisters the slot of a section that went away, syncing its dirty log first.
    pub fn region_del(&mut self, section: &MemorySection) -> Result<()> {
        self.set_phys_mem(section, false)
    }

    fn update_slot_flags(&mut self, index: usize, flags: MemFlags) -> Result<()> {
        let old = self.slots[index];
        if old.flags == flags {
            return Ok(());
        }
        let slot = Slot { flags, ..old };
        self.register(&slot, old.flags)?;
        self.slots[index] = slot;
        Ok(())
    }

    /// Re-registers the slot of `section` if its protection or logging changed.
    pub fn region_flags_changed(&mut self, section: &MemorySection) -> Result<()> {
        let (start, size) = self.align_region(section);
        match self.matching_index(start, size) {
            Some(index) => self.update_slot_flags(index, section.mem_flags()),
            None => Ok(()),
        }
    }

    fn dirty_pages_log_change(&mut self, section: &MemorySection, log_dirty: bool) -> Result<()> {
        let (start, size) = self.align_region(section);
        let index = self.matching_index(start, size).ok_or(Error::NotFound)?;
        let mut flags = self.slots[index].flags;
        flags.set(MemFlags::LOG_DIRTY_PAGES, log_dirty);
        self.update_slot_flags(index, flags)
    }

    /// Enables dirty logging for `section` when the first logging client appears.
    pub fn log_start(&mut self, section: &MemorySection, old_clients: u8) -> Result<()> {
        if old_clients != 0 {
            return Ok(());
        }
        self.dirty_pages_log_change(section, true)
    }

    /// Disables dirty logging for `section` when the last logging client goes away.
    pub fn log_stop(&mut self, section: &MemorySection, new_clients: u8) -> Result<()> {
        if new_clients != 0 {
            return Ok(());
        }
        self.dirty_pages_log_change(section, false)
    }

    /// Fetches the dirty log of the slot backing `section` and forwards it to the tracker.
    pub fn sync_dirty_bitmap(&mut self, section: &MemorySection) -> Result<()> {
        let (start, size) = self.align_region(section);
        let slot = match self.find_matching_slot(start, size) {
            Some(slot) => *slot,
            None => return Ok(()),
        };
        self.sync_slot(&slot, section.ram_addr + (start - section.guest_addr))
    }

    fn sync_slot(&mut self, slot: &Slot, ram_addr: u64) -> Result<()> {
        let pages = slot.memory_size / self.page_size;
        let mut bitmap = vec![0u64; dirty_log_bitmap_size(slot.memory_size, self.page_size) / 8];
        let log = aehd_dirty_log {
            slot: slot.slot | (self.as_id << 16),
            padding1: 0,
            // The driver writes one bit per page of the slot, which `bitmap` covers.
            dirty_bitmap: bitmap.as_mut_ptr() as u64,
        };
        self.vm.ioctl_with_ref(AEHD_GET_DIRTY_LOG, &log)?;

        for (word_index, word) in bitmap.iter().enumerate() {
            let mut bits = u64::from_le(*word);
            while bits != 0 {
                let page = word_index as u64 * 64 + bits.trailing_zeros() as u64;
                bits &= bits - 1;
                if page >= pages {
                    break;
                }
                self.tracker
                    .mark_dirty(ram_addr + page * self.page_size, self.page_size);
            }
        }
        Ok(())
    }
}
