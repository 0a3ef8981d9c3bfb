// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Catalog of host devices exported for passthrough.
//!
//! The host enumerates passthrough-eligible devices on a virtual bus;
//! each carries an ordered resource list whose entries are identified by
//! a 4-character tag (a 3-letter kind prefix plus one decimal digit).
//! Device memory is reachable through a single bus-wide io dataspace;
//! interrupts are reachable through the bus interrupt controller.

use std::collections::BTreeSet;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::bus::Bus;
use crate::bus::Dataspace;
use crate::bus::DsHandler;
use crate::bus::Result as BusResult;
use crate::irqchip::HostIcu;

/// Typed value of one exported bus resource.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VbusResourceKind {
    /// Device memory; `start` and `end` are inclusive offsets into the
    /// bus io dataspace (host addresses).
    Mmio { start: u64, end: u64 },
    /// A host interrupt line.
    Irq { irq: u32 },
}

/// One resource exported by a bus device.
#[derive(Clone, Debug)]
pub struct VbusResource {
    name: [u8; 4],
    kind: VbusResourceKind,
}

impl VbusResource {
    pub fn new(name: [u8; 4], kind: VbusResourceKind) -> VbusResource {
        VbusResource { name, kind }
    }

    pub fn kind(&self) -> VbusResourceKind {
        self.kind
    }

    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    /// Decodes the positional index from the resource name tag.
    ///
    /// Memory resources must be named `reg<digit>`, interrupt resources
    /// `irq<digit>`; anything else has no recognisable position.
    pub fn index(&self) -> Option<usize> {
        let prefix = match self.kind {
            VbusResourceKind::Mmio { .. } => b"reg",
            VbusResourceKind::Irq { .. } => b"irq",
        };
        if &self.name[..3] != prefix || !self.name[3].is_ascii_digit() {
            return None;
        }
        Some((self.name[3] - b'0') as usize)
    }
}

/// One host device exported on the bus, identified by its hardware id.
pub struct VbusDevice {
    hid: String,
    name: String,
    resources: Vec<VbusResource>,
    assigned: bool,
}

impl VbusDevice {
    pub fn hid(&self) -> &str {
        &self.hid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resources(&self) -> &[VbusResource] {
        &self.resources
    }

    pub fn is_assigned(&self) -> bool {
        self.assigned
    }
}

/// Index of a device within the catalog, handed out by lookup.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VbusDeviceId(usize);

/// The virtual bus resource catalog.
pub struct Vbus {
    devices: Vec<VbusDevice>,
    io_ds: Arc<dyn Dataspace>,
    icu: Arc<dyn HostIcu>,
    present_irqs: BTreeSet<u32>,
    bound_irqs: BTreeSet<u32>,
}

impl Vbus {
    pub fn new(io_ds: Arc<dyn Dataspace>, icu: Arc<dyn HostIcu>) -> Vbus {
        Vbus {
            devices: Vec::new(),
            io_ds,
            icu,
            present_irqs: BTreeSet::new(),
            bound_irqs: BTreeSet::new(),
        }
    }

    /// Adds an enumerated host device to the catalog.
    pub fn add_device(&mut self, hid: &str, name: &str, resources: Vec<VbusResource>) {
        self.devices.push(VbusDevice {
            hid: hid.to_owned(),
            name: name.to_owned(),
            resources,
            assigned: false,
        });
    }

    /// The bus-wide dataspace backing all exported device memory.
    pub fn io_ds(&self) -> Arc<dyn Dataspace> {
        self.io_ds.clone()
    }

    /// The bus interrupt controller.
    pub fn icu(&self) -> Arc<dyn HostIcu> {
        self.icu.clone()
    }

    /// Looks up a device by hardware id. Devices already claimed by a
    /// passthrough device are not returned.
    pub fn find_unassigned_device_by_hid(&self, hid: &str) -> Option<VbusDeviceId> {
        self.devices
            .iter()
            .position(|dev| !dev.assigned && dev.hid == hid)
            .map(VbusDeviceId)
    }

    pub fn device(&self, id: VbusDeviceId) -> &VbusDevice {
        &self.devices[id.0]
    }

    /// Claims the device for a passthrough device. Claimed devices stop
    /// being visible to `find_unassigned_device_by_hid`.
    pub fn mark_assigned(&mut self, id: VbusDeviceId) {
        self.devices[id.0].assigned = true;
    }

    /// One-time preparation for address-based matching: registers every
    /// exported memory resource into the guest registry at its host
    /// address and records which host interrupt lines exist.
    pub fn collect_resources(&mut self, mmio_bus: &Bus) -> BusResult<()> {
        for dev in &self.devices {
            for res in &dev.resources {
                match res.kind {
                    VbusResourceKind::Mmio { start, end } => {
                        let size = end - start + 1;
                        let label = format!("{}.{}", dev.name, res.name_str());
                        debug!(
                            "collecting MMIO resource {} : [{:#x} - {:#x}]",
                            label, start, end
                        );
                        let handler =
                            DsHandler::new(self.io_ds.clone(), start, size, &label);
                        mmio_bus.insert(Arc::new(Mutex::new(handler)), start, size)?;
                    }
                    VbusResourceKind::Irq { irq } => {
                        self.present_irqs.insert(irq);
                    }
                }
            }
        }
        Ok(())
    }

    /// Whether the host exports `irq` on this bus.
    pub fn irq_present(&self, irq: u32) -> bool {
        self.present_irqs.contains(&irq)
    }

    pub fn mark_irq_bound(&mut self, irq: u32) {
        self.bound_irqs.insert(irq);
    }

    pub fn irq_bound(&self, irq: u32) -> bool {
        self.bound_irqs.contains(&irq)
    }
}
