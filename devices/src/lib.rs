// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Emulates devices and binds host hardware into the guest.

mod bus;
mod caps;
mod irqchip;
mod optee;
pub mod platform;
mod vbus;

pub use self::bus::Bus;
pub use self::bus::BusAccessInfo;
pub use self::bus::BusDevice;
pub use self::bus::BusRange;
pub use self::bus::Dataspace;
pub use self::bus::DsHandler;
pub use self::bus::Error as BusError;
pub use self::bus::Result as BusResult;
pub use self::caps::Capability;
pub use self::caps::CapRegistry;
pub use self::caps::MonitorCap;
pub use self::irqchip::bind_irq;
pub use self::irqchip::HostIcu;
pub use self::irqchip::IcLookup;
pub use self::irqchip::IcRef;
pub use self::irqchip::IrqBindError;
pub use self::irqchip::IrqInjector;
pub use self::irqchip::IrqSource;
pub use self::irqchip::SourceEntry;
pub use self::irqchip::VirtIc;
pub use self::irqchip::HOST_IRQ_NONE;
pub use self::optee::create as create_optee;
pub use self::optee::Error as OpteeError;
pub use self::optee::OpteeDevice;
pub use self::optee::ProbeError;
pub use self::optee::SmcccCall;
pub use self::optee::SmcccRegs;
pub use self::optee::SmcHandler;
pub use self::optee::CAP_PROP;
pub use self::optee::DSCAP_PROP;
pub use self::platform::PassthroughDevice;
pub use self::platform::PassthroughMatcher;
pub use self::vbus::Vbus;
pub use self::vbus::VbusDevice;
pub use self::vbus::VbusDeviceId;
pub use self::vbus::VbusResource;
pub use self::vbus::VbusResourceKind;
