// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! OP-TEE secure monitor proxy.
//!
//! Probes the monitor behind a secure-monitor-call transport during VM
//! construction and, on success, exposes its static shared-memory region
//! to the guest and forwards guest secure monitor calls to it. A failed
//! probe yields a disabled device so that a guest compiled with OP-TEE
//! support can still boot without it.

use std::fmt;
use std::result;
use std::sync::Arc;

use guest_dt::DtNode;
use guest_dt::MmioRange;
use log::info;
use log::warn;
use parking_lot::Mutex;
use remain::sorted;
use thiserror::Error as ThisError;

use crate::bus;
use crate::bus::Bus;
use crate::bus::Dataspace;
use crate::bus::DsHandler;
use crate::caps::Capability;
use crate::caps::CapRegistry;
use crate::irqchip::bind_irq;
use crate::irqchip::IcLookup;
use crate::irqchip::IcRef;
use crate::irqchip::IrqBindError;
use crate::irqchip::HOST_IRQ_NONE;

/// Node property naming the monitor capability to proxy.
pub const CAP_PROP: &str = "vmm,cap";
/// Node property naming an explicit shared-memory dataspace.
pub const DSCAP_PROP: &str = "vmm,dscap";

const SMC_CALL_TRUSTED_OS_UID: u64 = 0xbf00_ff01;
const SMC_CALL_TRUSTED_OS_REVISION: u64 = 0xbf00_ff03;
const OPTEE_CALL_GET_SHM_CONFIG: u64 = 0xb200_0007;
const OPTEE_CALL_EXCHANGE_CAPS: u64 = 0xb200_0009;

// OP-TEE's trusted OS UID, in the register order the UID call returns.
const OPTEE_UUID: [u32; 4] = [0x384f_b3e0, 0xe7f8_11e3, 0xaf63_0002, 0xa5d5_c51b];

const OPTEE_API_MAJOR: u64 = 2;
const OPTEE_API_MINOR: u64 = 0;

const OPTEE_SMC_RETURN_OK: u64 = 0;
const OPTEE_SEC_CAP_HAVE_RESERVED_SHM: u64 = 1 << 0;

/// Guest register file of one secure monitor call: the function id and
/// its six arguments.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SmcccRegs {
    pub r: [u64; 7],
}

/// Transport for fast secure monitor calls.
///
/// An `Err` is a transport failure; monitor-level status travels in the
/// returned registers.
pub trait SmcccCall: Send + Sync {
    fn call(&self, regs: &SmcccRegs) -> anyhow::Result<[u64; 4]>;
}

#[sorted]
#[derive(ThisError, Debug)]
pub enum ProbeError {
    #[error("monitor call failed: {0}")]
    Call(#[from] anyhow::Error),
    #[error("monitor does not provide static shared memory")]
    NoSharedMemory,
    #[error("monitor does not identify as OP-TEE")]
    NotPresent,
    #[error("monitor refused the shared memory configuration request")]
    ShmConfig,
    #[error("cannot register shared memory: {0}")]
    ShmRegister(#[from] bus::Error),
    #[error("unsupported OP-TEE API revision {major}.{minor}")]
    UnsupportedApi { major: u64, minor: u64 },
}

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    #[error(transparent)]
    IrqBind(#[from] IrqBindError),
    #[error("{0}: notification interrupt targets a non-virtual controller")]
    NonVirtualIc(String),
    #[error("{0}: unknown interrupt parent")]
    UnknownIrqParent(String),
}

pub type Result<T> = result::Result<T, Error>;

fn fast_call(call: &Arc<dyn SmcccCall>, func: u64) -> anyhow::Result<[u64; 4]> {
    let mut regs = SmcccRegs::default();
    regs.r[0] = func;
    call.call(&regs)
}

/// The OP-TEE proxy device.
///
/// Holds the monitor transport when the probe succeeded; a disabled
/// instance swallows guest calls without forwarding them.
pub struct OpteeDevice {
    monitor: Option<Arc<dyn SmcccCall>>,
}

impl OpteeDevice {
    pub fn new(call: Arc<dyn SmcccCall>) -> OpteeDevice {
        OpteeDevice {
            monitor: Some(call),
        }
    }

    /// A device that accepts guest calls but never forwards them.
    pub fn disabled() -> OpteeDevice {
        OpteeDevice { monitor: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.monitor.is_some()
    }

    /// Runs the OP-TEE presence handshake and exposes the monitor's
    /// static shared memory region to the guest.
    ///
    /// `shm_ds` backs the region; the monitor reports the region's
    /// physical placement, which doubles as its guest-physical address
    /// and its offset into `shm_ds`.
    pub fn probe_shm(
        &self,
        mmio_bus: &Bus,
        shm_ds: Arc<dyn Dataspace>,
    ) -> result::Result<MmioRange, ProbeError> {
        let call = self.monitor.as_ref().ok_or(ProbeError::NotPresent)?;

        let uid = fast_call(call, SMC_CALL_TRUSTED_OS_UID)?;
        for (reg, expected) in uid.iter().zip(OPTEE_UUID.iter()) {
            if *reg != u64::from(*expected) {
                return Err(ProbeError::NotPresent);
            }
        }

        let rev = fast_call(call, SMC_CALL_TRUSTED_OS_REVISION)?;
        if rev[0] != OPTEE_API_MAJOR || rev[1] != OPTEE_API_MINOR {
            return Err(ProbeError::UnsupportedApi {
                major: rev[0],
                minor: rev[1],
            });
        }

        let caps = fast_call(call, OPTEE_CALL_EXCHANGE_CAPS)?;
        if caps[0] != OPTEE_SMC_RETURN_OK || caps[1] & OPTEE_SEC_CAP_HAVE_RESERVED_SHM == 0 {
            return Err(ProbeError::NoSharedMemory);
        }

        let shm = fast_call(call, OPTEE_CALL_GET_SHM_CONFIG)?;
        if shm[0] != OPTEE_SMC_RETURN_OK {
            return Err(ProbeError::ShmConfig);
        }
        let (base, size) = (shm[1], shm[2]);
        // The monitor's answer is untrusted input; the range must be
        // non-empty and addressable before anything consumes it.
        if size == 0 || base.checked_add(size - 1).is_none() {
            return Err(ProbeError::ShmConfig);
        }
        let range = MmioRange { base, size };

        info!(
            "OP-TEE revision {}.{}, shared memory [{:#x} - {:#x}]",
            rev[0],
            rev[1],
            range.base,
            range.last()
        );

        let handler = DsHandler::new(shm_ds, range.base, range.size, "optee.shm");
        mmio_bus.insert(Arc::new(Mutex::new(handler)), range.base, range.size)?;

        Ok(range)
    }
}

impl fmt::Debug for OpteeDevice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("OpteeDevice")
            .field("enabled", &self.monitor.is_some())
            .finish()
    }
}

/// Handler for guest secure monitor calls.
pub trait SmcHandler: Send + Sync {
    /// Handles one call: all seven registers go in, the first four carry
    /// the result back.
    fn smc(&self, regs: &mut SmcccRegs);
}

impl SmcHandler for OpteeDevice {
    fn smc(&self, regs: &mut SmcccRegs) {
        let call = match &self.monitor {
            Some(call) => call,
            // Disabled device; the guest sees its own registers back.
            None => return,
        };
        match call.call(regs) {
            Ok(out) => regs.r[..4].copy_from_slice(&out),
            Err(e) => warn!("smc call {:#x} failed: {}", regs.r[0], e),
        }
    }
}

/// Builds the OP-TEE proxy for `node`.
///
/// A missing or unusable capability and a failed probe all degrade to a
/// disabled device; only a broken notification interrupt description is
/// fatal.
pub fn create(
    node: &DtNode,
    caps: &CapRegistry,
    mmio_bus: &Bus,
    ics: &IcLookup,
) -> Result<Option<OpteeDevice>> {
    let cap_name = match node.prop_str(CAP_PROP) {
        Some(name) => name,
        None => {
            warn!("{}: missing '{}' property", node.name(), CAP_PROP);
            return Ok(None);
        }
    };
    let monitor = match caps.get(cap_name) {
        Some(Capability::Monitor(mc)) => mc.clone(),
        Some(Capability::Dataspace(_)) => {
            warn!("{}: '{}' is not a monitor capability", node.name(), cap_name);
            return Ok(None);
        }
        None => {
            warn!("{}: no capability named '{}'", node.name(), cap_name);
            return Ok(None);
        }
    };

    let shm_ds = match node.prop_str(DSCAP_PROP) {
        Some(name) => match caps.get(name) {
            Some(Capability::Dataspace(ds)) => ds.clone(),
            _ => {
                warn!("{}: no dataspace named '{}'", node.name(), name);
                return Ok(None);
            }
        },
        None => monitor.dataspace.clone(),
    };

    let device = OpteeDevice::new(monitor.call.clone());
    if let Err(e) = device.probe_shm(mmio_bus, shm_ds) {
        warn!("{}: OP-TEE not available: {}", node.name(), e);
        return Ok(None);
    }

    if let Some(desc) = node.interrupt(0) {
        match &monitor.notify_icu {
            Some(icu) => match ics.resolve(desc.parent) {
                Some(IcRef::Virtual(ic)) => {
                    bind_irq(ic, icu, desc.irq, HOST_IRQ_NONE, node.name())?;
                }
                Some(IcRef::Foreign) => {
                    return Err(Error::NonVirtualIc(node.name().to_owned()));
                }
                None => {
                    return Err(Error::UnknownIrqParent(node.name().to_owned()));
                }
            },
            None => {
                warn!(
                    "{}: monitor does not support notification interrupts",
                    node.name()
                );
            }
        }
    }

    Ok(Some(device))
}
