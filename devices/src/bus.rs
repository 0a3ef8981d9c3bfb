// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Handles routing to devices in the guest-physical address space.

use std::cmp::Ord;
use std::cmp::Ordering;
use std::cmp::PartialEq;
use std::cmp::PartialOrd;
use std::collections::BTreeMap;
use std::fmt;
use std::result;
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;
use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Information about how a device was accessed.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct BusAccessInfo {
    /// Offset from base address that the device was accessed at.
    pub offset: u64,
    /// Absolute address of the device's access in its address space.
    pub address: u64,
    /// ID of the entity requesting a device access, usually the VCPU id.
    pub id: usize,
}

impl std::fmt::Display for BusAccessInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Trait for devices that respond to reads or writes in an arbitrary address space.
///
/// The device does not care where it exists in address space as each method is only given an offset
/// into its allocated portion of address space.
#[allow(unused_variables)]
pub trait BusDevice: Send {
    /// Returns a label suitable for debug output.
    fn debug_label(&self) -> String;
    /// Reads at `offset` from this device
    fn read(&mut self, offset: BusAccessInfo, data: &mut [u8]) {}
    /// Writes at `offset` into this device
    fn write(&mut self, offset: BusAccessInfo, data: &[u8]) {}
}

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    /// The insertion failed because the new device overlapped with an old device.
    #[error("new device {base},{len} overlaps with an old device {other_base},{other_len}")]
    Overlap {
        base: u64,
        len: u64,
        other_base: u64,
        other_len: u64,
    },
}

pub type Result<T> = result::Result<T, Error>;

/// Holds a base and length representing the address space occupied by a `BusDevice`.
///
/// * base - The address at which the range start.
/// * len - The length of the range in bytes.
#[derive(Copy, Clone, Serialize, Deserialize)]
pub struct BusRange {
    pub base: u64,
    pub len: u64,
}

impl BusRange {
    /// Returns true if `addr` is within the range.
    pub fn contains(&self, addr: u64) -> bool {
        self.base <= addr && addr < self.base.saturating_add(self.len)
    }

    /// Returns true if there is overlap with the given range.
    pub fn overlaps(&self, base: u64, len: u64) -> bool {
        self.base < base.saturating_add(len) && base < self.base.saturating_add(self.len)
    }
}

impl Eq for BusRange {}

impl PartialEq for BusRange {
    fn eq(&self, other: &BusRange) -> bool {
        self.base == other.base
    }
}

impl Ord for BusRange {
    fn cmp(&self, other: &BusRange) -> Ordering {
        self.base.cmp(&other.base)
    }
}

impl PartialOrd for BusRange {
    fn partial_cmp(&self, other: &BusRange) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Debug for BusRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}..+{:#x}", self.base, self.len)
    }
}

/// A device container for routing reads and writes over the guest MMIO address space.
///
/// The only restriction is that no two devices can overlap in this address space.
#[derive(Clone)]
pub struct Bus {
    devices: Arc<Mutex<BTreeMap<BusRange, Arc<Mutex<dyn BusDevice>>>>>,
    access_id: usize,
}

impl Bus {
    /// Constructs a bus with an empty address space.
    pub fn new() -> Bus {
        Bus {
            devices: Arc::new(Mutex::new(BTreeMap::new())),
            access_id: 0,
        }
    }

    /// Sets the id that will be used for BusAccessInfo.
    pub fn set_access_id(&mut self, id: usize) {
        self.access_id = id;
    }

    fn first_before(&self, addr: u64) -> Option<(BusRange, Arc<Mutex<dyn BusDevice>>)> {
        let devices = self.devices.lock();
        let (range, dev) = devices
            .range(..=BusRange { base: addr, len: 1 })
            .next_back()?;
        Some((*range, dev.clone()))
    }

    fn get_device(&self, addr: u64) -> Option<(u64, u64, Arc<Mutex<dyn BusDevice>>)> {
        if let Some((range, dev)) = self.first_before(addr) {
            let offset = addr - range.base;
            if offset < range.len {
                return Some((offset, addr, dev));
            }
        }
        None
    }

    /// Returns true if the whole `[base, base + len)` range lies inside a single registered
    /// region.
    pub fn claims(&self, base: u64, len: u64) -> bool {
        if len == 0 {
            return false;
        }
        match self.first_before(base) {
            Some((range, _dev)) => {
                let offset = base - range.base;
                len <= range.len && offset <= range.len - len
            }
            None => false,
        }
    }

    /// Puts the given device at the given address space.
    pub fn insert(&self, device: Arc<Mutex<dyn BusDevice>>, base: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Err(Error::Overlap {
                base,
                len,
                other_base: 0,
                other_len: 0,
            });
        }

        // Reject all cases where the new device's range overlaps with an existing device.
        let mut devices = self.devices.lock();
        devices.iter().try_for_each(|(range, _dev)| {
            if range.overlaps(base, len) {
                Err(Error::Overlap {
                    base,
                    len,
                    other_base: range.base,
                    other_len: range.len,
                })
            } else {
                Ok(())
            }
        })?;

        if devices.insert(BusRange { base, len }, device).is_some() {
            return Err(Error::Overlap {
                base,
                len,
                other_base: base,
                other_len: len,
            });
        }

        Ok(())
    }

    /// Number of registered regions.
    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }

    /// Reads data from the device that owns the range containing `addr` and puts it into `data`.
    ///
    /// Returns true on success, otherwise `data` is untouched.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> bool {
        if let Some((offset, address, dev)) = self.get_device(addr) {
            dev.lock().read(
                BusAccessInfo {
                    address,
                    offset,
                    id: self.access_id,
                },
                data,
            );
            true
        } else {
            false
        }
    }

    /// Writes `data` to the device that owns the range containing `addr`.
    ///
    /// Returns true on success, otherwise `data` is untouched.
    pub fn write(&self, addr: u64, data: &[u8]) -> bool {
        if let Some((offset, address, dev)) = self.get_device(addr) {
            dev.lock().write(
                BusAccessInfo {
                    address,
                    offset,
                    id: self.access_id,
                },
                data,
            );
            true
        } else {
            false
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// Host memory object that guest MMIO ranges can be backed by.
///
/// This stands in for whatever the host exposes device memory through; accesses are always
/// relative to the start of the object.
pub trait Dataspace: Send + Sync {
    /// Size of the object in bytes.
    fn len(&self) -> u64;
    /// Reads `data.len()` bytes at `offset` into `data`.
    fn read(&self, offset: u64, data: &mut [u8]);
    /// Writes `data` at `offset`.
    fn write(&self, offset: u64, data: &[u8]);
}

/// Forwards accesses to a guest range into a `Dataspace` at a fixed offset.
pub struct DsHandler {
    ds: Arc<dyn Dataspace>,
    offset: u64,
    size: u64,
    label: String,
}

impl DsHandler {
    /// Creates a handler covering `size` bytes of `ds` starting at `offset`.
    pub fn new(ds: Arc<dyn Dataspace>, offset: u64, size: u64, label: &str) -> DsHandler {
        DsHandler {
            ds,
            offset,
            size,
            label: label.to_owned(),
        }
    }

    fn check_access(&self, offset: u64, len: usize) -> bool {
        let len = len as u64;
        if len == 0 || len > self.size || offset > self.size - len {
            warn!(
                "{}: access outside mapped range, offset: {:#x}, size: {:#x}",
                self.label, offset, len
            );
            return false;
        }
        // The mapped window may extend past the end of the backing
        // dataspace; such accesses cannot be served.
        let end = self
            .offset
            .checked_add(offset)
            .and_then(|start| start.checked_add(len));
        match end {
            Some(end) if end <= self.ds.len() => true,
            _ => {
                warn!(
                    "{}: access beyond backing dataspace, offset: {:#x}, size: {:#x}",
                    self.label, offset, len
                );
                false
            }
        }
    }
}

impl BusDevice for DsHandler {
    fn debug_label(&self) -> String {
        self.label.clone()
    }

    fn read(&mut self, info: BusAccessInfo, data: &mut [u8]) {
        if self.check_access(info.offset, data.len()) {
            self.ds.read(self.offset + info.offset, data);
        }
    }

    fn write(&mut self, info: BusAccessInfo, data: &[u8]) {
        if self.check_access(info.offset, data.len()) {
            self.ds.write(self.offset + info.offset, data);
        }
    }
}
