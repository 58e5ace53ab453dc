// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! GSI allocation and the interrupt routing table.

use std::mem::size_of;

use aehd_sys::*;
use fnv::FnvHashMap;
use log::debug;
use zerocopy::IntoBytes;

use crate::arch::IrqRouteHooks;
use crate::arch::NoopRouteHooks;
use crate::ioctl::ControlHandle;
use crate::Error;
use crate::Result;

/// A message signaled interrupt as written by a device.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct MsiMessage {
    pub address: u64,
    pub data: u32,
}

/// Where a GSI is delivered.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IrqSource {
    Irqchip { chip: u32, pin: u32 },
    Msi(MsiMessage),
}

/// A single GSI routing entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IrqRoute {
    pub gsi: u32,
    pub source: IrqSource,
}

impl IrqRoute {
    fn to_entry(self) -> aehd_irq_routing_entry {
        let mut entry = aehd_irq_routing_entry {
            gsi: self.gsi,
            ..Default::default()
        };
        match self.source {
            IrqSource::Irqchip { chip, pin } => {
                entry.type_ = AEHD_IRQ_ROUTING_IRQCHIP;
                let irqchip = aehd_irq_routing_irqchip { irqchip: chip, pin };
                entry.u.as_mut_bytes()[..size_of::<aehd_irq_routing_irqchip>()]
                    .copy_from_slice(irqchip.as_bytes());
            }
            IrqSource::Msi(msg) => {
                entry.type_ = AEHD_IRQ_ROUTING_MSI;
                let msi = aehd_irq_routing_msi {
                    address_lo: msg.address as u32,
                    address_hi: (msg.address >> 32) as u32,
                    data: msg.data,
                    pad: 0,
                };
                entry.u.as_mut_bytes()[..size_of::<aehd_irq_routing_msi>()]
                    .copy_from_slice(msi.as_bytes());
            }
        }
        entry
    }
}

const INITIAL_ROUTES: usize = 64;

/// The VM's GSI routing table.
///
/// Changes made with `add_*`, `update_route` and `release_route` reach the driver on the next
/// `commit`.
pub struct IrqRouting {
    vm: ControlHandle,
    gsi_count: u32,
    used_gsi: Vec<u64>,
    routes: Vec<IrqRoute>,
    // Routes created on demand by `send_msi`.
    msi_routes: FnvHashMap<MsiMessage, u32>,
    irq_to_gsi: FnvHashMap<u32, u32>,
    hooks: Box<dyn IrqRouteHooks>,
}

impl IrqRouting {
    /// Creates an empty table able to route `gsi_count` GSIs.
    pub fn new(vm: ControlHandle, gsi_count: u32) -> IrqRouting {
        IrqRouting {
            vm,
            gsi_count,
            used_gsi: vec![0; (gsi_count as usize).div_ceil(64)],
            routes: Vec::with_capacity(INITIAL_ROUTES),
            msi_routes: FnvHashMap::default(),
            irq_to_gsi: FnvHashMap::default(),
            hooks: Box::new(NoopRouteHooks),
        }
    }

    pub fn set_hooks(&mut self, hooks: Box<dyn IrqRouteHooks>) {
        self.hooks = hooks;
    }

    pub fn gsi_count(&self) -> u32 {
        self.gsi_count
    }

    pub fn routes(&self) -> &[IrqRoute] {
        &self.routes
    }

    pub fn is_gsi_used(&self, gsi: u32) -> bool {
        gsi < self.gsi_count && self.used_gsi[gsi as usize / 64] & (1 << (gsi % 64)) != 0
    }

    fn set_gsi(&mut self, gsi: u32) {
        self.used_gsi[gsi as usize / 64] |= 1 << (gsi % 64);
    }

    fn clear_gsi(&mut self, gsi: u32) {
        self.used_gsi[gsi as usize / 64] &= !(1 << (gsi % 64));
    }

    /// Drops every route created by `send_msi` to make room in the table.
    pub fn flush_dynamic_msi_routes(&mut self) {
        let gsis: Vec<u32> = self.msi_routes.drain().map(|(_, gsi)| gsi).collect();
        for gsi in gsis {
            self.release_route(gsi);
        }
    }

    /// Returns the lowest free GSI, reclaiming dynamic MSI routes if the table is full.
    pub fn allocate_gsi(&mut self) -> Result<u32> {
        if self.routes.len() == self.gsi_count as usize {
            debug!("routing table full, flushing dynamic msi routes");
            self.flush_dynamic_msi_routes();
        }
        (0..self.gsi_count)
            .find(|gsi| !self.is_gsi_used(*gsi))
            .ok_or(Error::NoSpace)
    }

    fn add_route(&mut self, route: IrqRoute) -> Result<()> {
        if route.gsi >= self.gsi_count {
            return Err(Error::InvalidGsi(route.gsi));
        }
        if self.is_gsi_used(route.gsi) {
            return Err(Error::GsiInUse(route.gsi));
        }
        self.routes.push(route);
        self.set_gsi(route.gsi);
        Ok(())
    }

    /// Routes `gsi` to `pin` of interrupt controller `chip`.
    pub fn add_irqchip_route(&mut self, gsi: u32, chip: u32, pin: u32) -> Result<()> {
        if pin >= self.gsi_count {
            return Err(Error::InvalidIrqPin(pin));
        }
        self.add_route(IrqRoute {
            gsi,
            source: IrqSource::Irqchip { chip, pin },
        })
    }

    /// Routes `gsi` to the message `msg`.
    pub fn add_msi_route(&mut self, gsi: u32, msg: MsiMessage) -> Result<()> {
        self.add_route(IrqRoute {
            gsi,
            source: IrqSource::Msi(msg),
        })
    }

    /// Allocates a GSI for a device MSI vector, routes it to `msg` and commits the table.
    pub fn add_msi_vector(&mut self, vector: u32, msg: MsiMessage) -> Result<u32> {
        let gsi = self.allocate_gsi()?;
        let route = IrqRoute {
            gsi,
            source: IrqSource::Msi(msg),
        };
        self.add_route(route)?;
        self.hooks.add_msi_route_post(&route, vector);
        if let Err(e) = self.commit() {
            self.release_route(gsi);
            return Err(e);
        }
        Ok(gsi)
    }

    /// Replaces the destination of an existing route.
    pub fn update_route(&mut self, gsi: u32, source: IrqSource) -> Result<()> {
        let route = self
            .routes
            .iter_mut()
            .find(|r| r.gsi == gsi)
            .ok_or(Error::NotFound)?;
        route.source = source;
        Ok(())
    }

    pub fn update_msi_route(&mut self, gsi: u32, msg: MsiMessage) -> Result<()> {
        self.update_route(gsi, IrqSource::Msi(msg))
    }

    /// Removes every route for `gsi` and frees it.
    pub fn release_route(&mut self, gsi: u32) {
        self.unroute(gsi);
        self.hooks.release_virq_post(gsi);
    }

    fn unroute(&mut self, gsi: u32) {
        while let Some(index) = self.routes.iter().position(|r| r.gsi == gsi) {
            self.routes.swap_remove(index);
        }
        if gsi < self.gsi_count {
            self.clear_gsi(gsi);
        }
        self.msi_routes.retain(|_, cached| *cached != gsi);
    }

    /// Sends the whole table to the driver.
    pub fn commit(&self) -> Result<()> {
        let header = aehd_irq_routing {
            nr: self.routes.len() as u32,
            flags: 0,
        };
        let mut request = Vec::with_capacity(
            size_of::<aehd_irq_routing>() + self.routes.len() * size_of::<aehd_irq_routing_entry>(),
        );
        request.extend_from_slice(header.as_bytes());
        for route in &self.routes {
            request.extend_from_slice(route.to_entry().as_bytes());
        }
        self.vm.call(AEHD_SET_GSI_ROUTING, &request, &mut [])
    }

    /// Sets the level of `gsi` and returns the delivery status reported by the driver.
    pub fn set_irq(&self, gsi: u32, level: bool) -> Result<i32> {
        let mut irq_level = aehd_irq_level {
            irq: gsi,
            level: level.into(),
        };
        self.vm
            .ioctl_with_mut_ref(AEHD_IRQ_LINE_STATUS, &mut irq_level)?;
        Ok(irq_level.irq as i32)
    }

    /// Delivers `msg`, creating and caching a route for it on first use.
    pub fn send_msi(&mut self, msg: MsiMessage) -> Result<i32> {
        let gsi = match self.msi_routes.get(&msg) {
            Some(gsi) => *gsi,
            None => {
                let gsi = self.allocate_gsi()?;
                self.add_msi_route(gsi, msg)?;
                if let Err(e) = self.commit() {
                    // Drop the uncommitted route so the gsi is not leaked.
                    self.unroute(gsi);
                    return Err(e);
                }
                self.msi_routes.insert(msg, gsi);
                gsi
            }
        };
        self.set_irq(gsi, true)
    }

    /// Records that emulator interrupt line `irq` is delivered through `gsi`.
    pub fn set_irq_gsi(&mut self, irq: u32, gsi: u32) {
        self.irq_to_gsi.insert(irq, gsi);
    }

    pub fn irq_gsi(&self, irq: u32) -> Option<u32> {
        self.irq_to_gsi.get(&irq).copied()
    }
}
