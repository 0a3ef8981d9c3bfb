// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reconciles a devicetree node's declared resources against a bus
//! device's exported resources.
//!
//! Two paths exist. A node naming a hardware id through `vmm,vbus-device`
//! is matched positionally against that device's resource tags. A node
//! without one is matched by address against the regions collected from
//! the whole bus; that path requires the one-time prepare step to have
//! run.
//!
//! All side effects of a named-binding match are staged during the scan
//! and committed only once every declared reg and interrupt entry has
//! been accounted for, so a failed match leaves no registrations behind.

use std::fmt;
use std::result;
use std::sync::Arc;

use guest_dt::DtNode;
use guest_dt::Error as DtError;
use guest_dt::MmioRange;
use log::debug;
use log::error;
use log::warn;
use parking_lot::Mutex;
use remain::sorted;
use thiserror::Error;

use crate::bus;
use crate::bus::Bus;
use crate::bus::Dataspace;
use crate::bus::DsHandler;
use crate::irqchip::bind_irq;
use crate::irqchip::IcLookup;
use crate::irqchip::IcRef;
use crate::irqchip::IrqBindError;
use crate::irqchip::VirtIc;
use crate::vbus::Vbus;
use crate::vbus::VbusResourceKind;

/// Node property naming the hardware id of the bus device to bind to.
pub const VBUS_DEVICE_PROP: &str = "vmm,vbus-device";

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot register mmio range: {0}")]
    Bus(#[from] bus::Error),
    #[error(transparent)]
    IrqBind(#[from] IrqBindError),
    #[error("{node}: vbus interrupt resource {index} has no matching device tree entry")]
    IrqResourceIndex { node: String, index: usize },
    #[error("{node}: not enough interrupt resources found in vbus device")]
    IrqsUnmatched { node: String },
    #[error("address-based matching invoked before bus resources were collected")]
    NotPrepared,
    #[error("{node}: bad reg entry {index}: {source}")]
    RegEntry {
        node: String,
        index: usize,
        #[source]
        source: DtError,
    },
    #[error("{node}: reg entry {index} is not claimed by the mmio registry")]
    RegNotClaimed { node: String, index: usize },
    #[error("{node}: not enough memory resources found in vbus device")]
    RegsUnmatched { node: String },
    #[error("{node}: vbus resource size {resource:#x} does not match reg entry {index} size {reg:#x}")]
    SizeMismatch {
        node: String,
        index: usize,
        reg: u64,
        resource: u64,
    },
    #[error("{node}: more vbus interrupt resources than device tree interrupt entries")]
    SurplusIrqResources { node: String },
    #[error("{node}: more vbus memory resources than device tree reg entries")]
    SurplusRegResources { node: String },
    #[error("{node}: unknown interrupt parent phandle {phandle}")]
    UnknownIrqParent { node: String, phandle: u32 },
}

pub type Result<T> = result::Result<T, Error>;

/// A host bus device matched into the guest.
///
/// Created only after the device's entire resource set was successfully
/// matched and bound; immutable thereafter. Guest accesses reach the
/// device through the MMIO handlers registered during the match, backed
/// by the io interface held here.
pub struct PassthroughDevice {
    name: String,
    io: Arc<dyn Dataspace>,
}

impl PassthroughDevice {
    fn new(name: &str, io: Arc<dyn Dataspace>) -> PassthroughDevice {
        PassthroughDevice {
            name: name.to_owned(),
            io,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn io(&self) -> Arc<dyn Dataspace> {
        self.io.clone()
    }
}

impl fmt::Debug for PassthroughDevice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PassthroughDevice")
            .field("name", &self.name)
            .finish()
    }
}

// Counts reg entries while validating that each one parses; matching
// against unparsable nodes must fail before any side effect.
fn count_reg_entries(node: &DtNode) -> Result<usize> {
    for index in 0.. {
        match node.reg_entry(index) {
            Ok(_) => {}
            Err(DtError::BadIndex(_)) => return Ok(index),
            Err(e) => {
                return Err(Error::RegEntry {
                    node: node.name().to_owned(),
                    index,
                    source: e,
                })
            }
        }
    }
    unreachable!();
}

// Counts interrupt entries while validating that every parent resolves.
fn count_interrupts(node: &DtNode, ics: &IcLookup) -> Result<usize> {
    for desc in node.interrupts() {
        if ics.resolve(desc.parent).is_none() {
            return Err(Error::UnknownIrqParent {
                node: node.name().to_owned(),
                phandle: desc.parent,
            });
        }
    }
    Ok(node.interrupt_count())
}

/// Matches devicetree nodes against bus devices and produces passthrough
/// devices.
#[derive(Default)]
pub struct PassthroughMatcher {
    prepared: bool,
}

impl PassthroughMatcher {
    pub fn new() -> PassthroughMatcher {
        PassthroughMatcher { prepared: false }
    }

    /// Whether the one-time resource collection has run.
    pub fn prepared(&self) -> bool {
        self.prepared
    }

    /// Collects all bus resources into the guest registry. Must run once
    /// before any address-based match.
    pub fn prepare(&mut self, vbus: &mut Vbus, mmio_bus: &Bus) -> Result<()> {
        vbus.collect_resources(mmio_bus)?;
        self.prepared = true;
        Ok(())
    }

    /// Creates a passthrough device for `node`.
    ///
    /// `Ok(None)` means the device was not created for an expected reason
    /// (absent bus device, absent interrupt line); construction of other
    /// devices proceeds. Errors are configuration violations that abort
    /// the whole device-model construction.
    pub fn create(
        &self,
        vbus: &mut Vbus,
        mmio_bus: &Bus,
        ics: &IcLookup,
        node: &DtNode,
    ) -> Result<Option<PassthroughDevice>> {
        if let Some(hid) = node.prop_str(VBUS_DEVICE_PROP) {
            let hid = hid.to_owned();
            return self.create_from_vbus_dev(vbus, mmio_bus, ics, node, &hid);
        }

        if !self.prepared {
            error!(
                "{}: address-based match attempted before bus resources were collected",
                node.name()
            );
            return Err(Error::NotPrepared);
        }

        self.create_from_address(vbus, mmio_bus, ics, node)
    }

    fn create_from_vbus_dev(
        &self,
        vbus: &mut Vbus,
        mmio_bus: &Bus,
        ics: &IcLookup,
        node: &DtNode,
        hid: &str,
    ) -> Result<Option<PassthroughDevice>> {
        let id = match vbus.find_unassigned_device_by_hid(hid) {
            Some(id) => id,
            None => {
                warn!(
                    "{}: requested vbus device '{}' not available",
                    node.name(),
                    hid
                );
                return Ok(None);
            }
        };

        // Count the expected resources up front as a cheap means of
        // validation; this also checks that the node parses cleanly.
        let mut todo_regs = count_reg_entries(node)?;
        let mut todo_irqs = count_interrupts(node, ics)?;

        let mut staged_mmio: Vec<(MmioRange, u64, String)> = Vec::new();
        let mut staged_irqs: Vec<(Arc<VirtIc>, u32, u32)> = Vec::new();

        let dev = vbus.device(id);
        let dev_name = dev.name().to_owned();
        for res in dev.resources() {
            match res.kind() {
                VbusResourceKind::Mmio { start, end } => {
                    let index = match res.index() {
                        Some(index) => index,
                        None => {
                            warn!(
                                "{}: vbus memory resource '{}' has no recognisable name",
                                node.name(),
                                res.name_str()
                            );
                            continue;
                        }
                    };
                    let range = node.reg_entry(index).map_err(|e| Error::RegEntry {
                        node: node.name().to_owned(),
                        index,
                        source: e,
                    })?;
                    let res_size = end - start + 1;
                    if res_size != range.size {
                        return Err(Error::SizeMismatch {
                            node: node.name().to_owned(),
                            index,
                            reg: range.size,
                            resource: res_size,
                        });
                    }

                    debug!(
                        "staging MMIO resource {}.{} : [{:#x} - {:#x}] -> [{:#x} - {:#x}]",
                        dev_name,
                        res.name_str(),
                        start,
                        end,
                        range.base,
                        range.last()
                    );
                    staged_mmio.push((range, start, format!("{}.{}", dev_name, res.name_str())));
                    todo_regs = match todo_regs.checked_sub(1) {
                        Some(v) => v,
                        None => {
                            return Err(Error::SurplusRegResources {
                                node: node.name().to_owned(),
                            })
                        }
                    };
                }
                VbusResourceKind::Irq { irq: host_irq } => {
                    let index = match res.index() {
                        Some(index) => index,
                        None => {
                            warn!(
                                "{}: vbus interrupt resource '{}' has no recognisable name",
                                node.name(),
                                res.name_str()
                            );
                            continue;
                        }
                    };
                    let desc = match node.interrupt(index) {
                        Some(desc) => desc,
                        None => {
                            return Err(Error::IrqResourceIndex {
                                node: node.name().to_owned(),
                                index,
                            })
                        }
                    };
                    // count_interrupts() above checked that every parent
                    // resolves.
                    if let Some(IcRef::Virtual(ic)) = ics.resolve(desc.parent) {
                        staged_irqs.push((ic.clone(), desc.irq, host_irq));
                    }
                    debug!(
                        "staging IRQ resource {}.{} : {:#x}",
                        dev_name,
                        res.name_str(),
                        host_irq
                    );
                    todo_irqs = match todo_irqs.checked_sub(1) {
                        Some(v) => v,
                        None => {
                            return Err(Error::SurplusIrqResources {
                                node: node.name().to_owned(),
                            })
                        }
                    };
                }
            }
        }

        if todo_regs > 0 {
            error!(
                "{}: not enough memory resources found in vbus device '{}'",
                node.name(),
                hid
            );
            return Err(Error::RegsUnmatched {
                node: node.name().to_owned(),
            });
        }
        if todo_irqs > 0 {
            error!(
                "{}: not enough interrupt resources found in vbus device '{}'",
                node.name(),
                hid
            );
            return Err(Error::IrqsUnmatched {
                node: node.name().to_owned(),
            });
        }

        // Full match; commit the staged registrations and bindings.
        for (range, ds_offset, label) in staged_mmio {
            let handler = DsHandler::new(vbus.io_ds(), ds_offset, range.size, &label);
            mmio_bus.insert(Arc::new(Mutex::new(handler)), range.base, range.size)?;
        }
        for (ic, guest_line, host_irq) in staged_irqs {
            bind_irq(&ic, &vbus.icu(), guest_line, host_irq, node.name())?;
        }

        vbus.mark_assigned(id);
        Ok(Some(PassthroughDevice::new(&dev_name, vbus.io_ds())))
    }

    fn create_from_address(
        &self,
        vbus: &mut Vbus,
        mmio_bus: &Bus,
        ics: &IcLookup,
        node: &DtNode,
    ) -> Result<Option<PassthroughDevice>> {
        // The MMIO areas were established by the prepare step; every
        // translated reg entry must land inside one of them.
        for index in 0.. {
            match node.reg_entry(index) {
                Ok(range) => {
                    if !mmio_bus.claims(range.base, range.size) {
                        return Err(Error::RegNotClaimed {
                            node: node.name().to_owned(),
                            index,
                        });
                    }
                }
                // Reached the end of the reg entries.
                Err(DtError::BadIndex(_)) => break,
                // Region not managed by us.
                Err(DtError::NotTranslatable(_)) => continue,
                Err(e) => {
                    return Err(Error::RegEntry {
                        node: node.name().to_owned(),
                        index,
                        source: e,
                    })
                }
            }
        }

        // Check that every interrupt targeting the virtual controller is
        // available on the bus before binding any of them.
        let mut to_bind: Vec<(Arc<VirtIc>, u32)> = Vec::new();
        for desc in node.interrupts() {
            match ics.resolve(desc.parent) {
                None => {
                    return Err(Error::UnknownIrqParent {
                        node: node.name().to_owned(),
                        phandle: desc.parent,
                    })
                }
                Some(IcRef::Virtual(ic)) => {
                    if !vbus.irq_present(desc.irq) {
                        warn!(
                            "{}: interrupt {:#x} not present on the vbus",
                            node.name(),
                            desc.irq
                        );
                        return Ok(None);
                    }
                    to_bind.push((ic.clone(), desc.irq));
                }
                Some(IcRef::Foreign) => {}
            }
        }

        for (ic, line) in to_bind {
            // 1:1 identity mapping between guest line and host irq.
            bind_irq(&ic, &vbus.icu(), line, line, node.name())?;
            vbus.mark_irq_bound(line);
        }

        Ok(Some(PassthroughDevice::new(node.name(), vbus.io_ds())))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use guest_dt::DtNode;
    use parking_lot::Mutex;

    use super::*;
    use crate::irqchip::HostIcu;
    use crate::irqchip::IrqInjector;
    use crate::irqchip::IrqSource;
    use crate::irqchip::SourceEntry;
    use crate::vbus::VbusResource;

    struct TestDataspace;

    impl Dataspace for TestDataspace {
        fn len(&self) -> u64 {
            0x10_0000
        }
        fn read(&self, _offset: u64, _data: &mut [u8]) {}
        fn write(&self, _offset: u64, _data: &[u8]) {}
    }

    #[derive(Default)]
    struct StubIcu {
        bound: Mutex<Vec<u32>>,
        acks: Mutex<Vec<u32>>,
    }

    impl HostIcu for StubIcu {
        fn bind(&self, host_irq: u32, _source: Arc<IrqSource>) -> anyhow::Result<()> {
            self.bound.lock().push(host_irq);
            Ok(())
        }

        fn ack(&self, host_irq: u32) {
            self.acks.lock().push(host_irq);
        }
    }

    struct NullInjector;

    impl IrqInjector for NullInjector {
        fn inject(&self, _line: u32) {}
    }

    struct TestEnv {
        vbus: Vbus,
        mmio_bus: Bus,
        ics: IcLookup,
        ic: Arc<VirtIc>,
        icu: Arc<StubIcu>,
    }

    const GIC_PHANDLE: u32 = 1;
    const FOREIGN_PHANDLE: u32 = 2;

    fn test_env() -> TestEnv {
        let icu = Arc::new(StubIcu::default());
        let vbus = Vbus::new(Arc::new(TestDataspace), icu.clone());
        let ic = Arc::new(VirtIc::new(256, Arc::new(NullInjector)));
        let mut ics = IcLookup::new();
        ics.register(GIC_PHANDLE, IcRef::Virtual(ic.clone()));
        ics.register(FOREIGN_PHANDLE, IcRef::Foreign);
        TestEnv {
            vbus,
            mmio_bus: Bus::new(),
            ics,
            ic,
            icu,
        }
    }

    fn uart_resources() -> Vec<VbusResource> {
        vec![
            VbusResource::new(
                *b"reg0",
                VbusResourceKind::Mmio {
                    start: 0x4000,
                    end: 0x4fff,
                },
            ),
            VbusResource::new(*b"irq0", VbusResourceKind::Irq { irq: 0x21 }),
        ]
    }

    fn uart_node() -> DtNode {
        let mut node = DtNode::new("uart@9000000");
        node.set_prop(VBUS_DEVICE_PROP, "uart8250");
        node.push_reg(0x0900_0000, 0x1000);
        node.push_interrupt(GIC_PHANDLE, 39, 4);
        node
    }

    #[test]
    fn named_match_registers_all_resources() {
        let mut env = test_env();
        env.vbus.add_device("uart8250", "uart", uart_resources());

        let matcher = PassthroughMatcher::new();
        let dev = matcher
            .create(&mut env.vbus, &env.mmio_bus, &env.ics, &uart_node())
            .unwrap()
            .unwrap();
        assert_eq!(dev.name(), "uart");

        // Exactly one MMIO handler over the declared guest range, backed
        // by the host offset.
        assert_eq!(env.mmio_bus.len(), 1);
        assert!(env.mmio_bus.claims(0x0900_0000, 0x1000));
        assert!(!env.mmio_bus.claims(0x4000, 0x1000));

        // Exactly one IRQ route, guest line 39 <- host irq 0x21.
        match env.ic.source(39) {
            Some(SourceEntry::Passthrough(source)) => assert_eq!(source.host_irq(), 0x21),
            _ => panic!("guest line 39 not bound"),
        }
        assert_eq!(*env.icu.bound.lock(), vec![0x21]);

        // The handle is claimed.
        assert!(env.vbus.find_unassigned_device_by_hid("uart8250").is_none());
    }

    #[test]
    fn named_match_multiple_resources() {
        let mut env = test_env();
        env.vbus.add_device(
            "gpu",
            "gpu0",
            vec![
                VbusResource::new(
                    *b"irq1",
                    VbusResourceKind::Irq { irq: 0x41 },
                ),
                VbusResource::new(
                    *b"reg1",
                    VbusResourceKind::Mmio {
                        start: 0x2_0000,
                        end: 0x2_0fff,
                    },
                ),
                VbusResource::new(
                    *b"reg0",
                    VbusResourceKind::Mmio {
                        start: 0x1_0000,
                        end: 0x1_7fff,
                    },
                ),
                VbusResource::new(*b"irq0", VbusResourceKind::Irq { irq: 0x40 }),
            ],
        );

        let mut node = DtNode::new("gpu@a0000000");
        node.set_prop(VBUS_DEVICE_PROP, "gpu");
        node.push_reg(0xa000_0000, 0x8000);
        node.push_reg(0xa100_0000, 0x1000);
        node.push_interrupt(GIC_PHANDLE, 70, 4);
        node.push_interrupt(GIC_PHANDLE, 71, 4);

        let matcher = PassthroughMatcher::new();
        let dev = matcher
            .create(&mut env.vbus, &env.mmio_bus, &env.ics, &node)
            .unwrap();
        assert!(dev.is_some());

        assert_eq!(env.mmio_bus.len(), 2);
        assert!(env.mmio_bus.claims(0xa000_0000, 0x8000));
        assert!(env.mmio_bus.claims(0xa100_0000, 0x1000));
        match env.ic.source(70) {
            Some(SourceEntry::Passthrough(source)) => assert_eq!(source.host_irq(), 0x40),
            _ => panic!("guest line 70 not bound"),
        }
        match env.ic.source(71) {
            Some(SourceEntry::Passthrough(source)) => assert_eq!(source.host_irq(), 0x41),
            _ => panic!("guest line 71 not bound"),
        }
    }

    #[test]
    fn absent_bus_device_is_not_fatal() {
        let mut env = test_env();
        let matcher = PassthroughMatcher::new();
        let dev = matcher
            .create(&mut env.vbus, &env.mmio_bus, &env.ics, &uart_node())
            .unwrap();
        assert!(dev.is_none());
    }

    #[test]
    fn size_mismatch_fails_and_stages_nothing() {
        let mut env = test_env();
        // Host exports 0x2000 bytes, the node declares 0x1000.
        env.vbus.add_device(
            "uart8250",
            "uart",
            vec![
                VbusResource::new(
                    *b"reg0",
                    VbusResourceKind::Mmio {
                        start: 0x4000,
                        end: 0x5fff,
                    },
                ),
                VbusResource::new(*b"irq0", VbusResourceKind::Irq { irq: 0x21 }),
            ],
        );

        let matcher = PassthroughMatcher::new();
        let err = matcher
            .create(&mut env.vbus, &env.mmio_bus, &env.ics, &uart_node())
            .unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { .. }));

        // No registration, no binding, no claimed handle.
        assert!(env.mmio_bus.is_empty());
        assert!(env.ic.source(39).is_none());
        assert!(env.icu.bound.lock().is_empty());
        assert!(env.vbus.find_unassigned_device_by_hid("uart8250").is_some());
    }

    #[test]
    fn missing_vbus_resources_fail_the_match() {
        let mut env = test_env();
        // No irq resource for the node's interrupt entry.
        env.vbus.add_device(
            "uart8250",
            "uart",
            vec![VbusResource::new(
                *b"reg0",
                VbusResourceKind::Mmio {
                    start: 0x4000,
                    end: 0x4fff,
                },
            )],
        );

        let matcher = PassthroughMatcher::new();
        let err = matcher
            .create(&mut env.vbus, &env.mmio_bus, &env.ics, &uart_node())
            .unwrap_err();
        assert!(matches!(err, Error::IrqsUnmatched { .. }));
        assert!(env.mmio_bus.is_empty());
    }

    #[test]
    fn surplus_vbus_resources_fail_the_match() {
        let mut env = test_env();
        // Two memory resources both claiming position 0.
        let mut resources = uart_resources();
        resources.push(VbusResource::new(
            *b"reg0",
            VbusResourceKind::Mmio {
                start: 0x6000,
                end: 0x6fff,
            },
        ));
        env.vbus.add_device("uart8250", "uart", resources);

        let matcher = PassthroughMatcher::new();
        let err = matcher
            .create(&mut env.vbus, &env.mmio_bus, &env.ics, &uart_node())
            .unwrap_err();
        assert!(matches!(err, Error::SurplusRegResources { .. }));
        assert!(env.mmio_bus.is_empty());

        // Same for a duplicated interrupt position.
        let mut resources = uart_resources();
        resources.push(VbusResource::new(
            *b"irq0",
            VbusResourceKind::Irq { irq: 0x22 },
        ));
        env.vbus.add_device("rtc", "rtc0", resources);

        let mut node = uart_node();
        node.set_prop(VBUS_DEVICE_PROP, "rtc");
        let err = matcher
            .create(&mut env.vbus, &env.mmio_bus, &env.ics, &node)
            .unwrap_err();
        assert!(matches!(err, Error::SurplusIrqResources { .. }));
        assert!(env.ic.source(39).is_none());
    }

    #[test]
    fn unrecognised_resource_names_are_skipped() {
        let mut env = test_env();
        let mut resources = uart_resources();
        resources.push(VbusResource::new(
            *b"misc",
            VbusResourceKind::Mmio {
                start: 0x8000,
                end: 0x8fff,
            },
        ));
        env.vbus.add_device("uart8250", "uart", resources);

        let matcher = PassthroughMatcher::new();
        let dev = matcher
            .create(&mut env.vbus, &env.mmio_bus, &env.ics, &uart_node())
            .unwrap();
        assert!(dev.is_some());
        // The unnamed resource is not registered and not counted.
        assert_eq!(env.mmio_bus.len(), 1);
    }

    #[test]
    fn foreign_controller_interrupts_are_counted_but_not_bound() {
        let mut env = test_env();
        env.vbus.add_device("uart8250", "uart", uart_resources());

        let mut node = DtNode::new("uart@9000000");
        node.set_prop(VBUS_DEVICE_PROP, "uart8250");
        node.push_reg(0x0900_0000, 0x1000);
        node.push_interrupt(FOREIGN_PHANDLE, 39, 4);

        let matcher = PassthroughMatcher::new();
        let dev = matcher
            .create(&mut env.vbus, &env.mmio_bus, &env.ics, &node)
            .unwrap();
        assert!(dev.is_some());
        assert!(env.ic.source(39).is_none());
        assert!(env.icu.bound.lock().is_empty());
    }

    #[test]
    fn address_match_before_prepare_is_a_usage_error() {
        let mut env = test_env();
        let matcher = PassthroughMatcher::new();

        // Regardless of node content, even an empty one.
        let node = DtNode::new("mmio@0");
        let err = matcher
            .create(&mut env.vbus, &env.mmio_bus, &env.ics, &node)
            .unwrap_err();
        assert!(matches!(err, Error::NotPrepared));

        let mut full = DtNode::new("mmio@10000");
        full.push_reg(0x1_0000, 0x1000);
        full.push_interrupt(GIC_PHANDLE, 0x21, 4);
        let err = matcher
            .create(&mut env.vbus, &env.mmio_bus, &env.ics, &full)
            .unwrap_err();
        assert!(matches!(err, Error::NotPrepared));
    }

    #[test]
    fn address_match_binds_identity_irqs() {
        let mut env = test_env();
        env.vbus.add_device("uart8250", "uart", uart_resources());

        let mut matcher = PassthroughMatcher::new();
        matcher.prepare(&mut env.vbus, &env.mmio_bus).unwrap();
        assert!(matcher.prepared());

        let mut node = DtNode::new("uart@4000");
        node.push_reg(0x4000, 0x1000);
        node.push_interrupt(GIC_PHANDLE, 0x21, 4);

        let dev = matcher
            .create(&mut env.vbus, &env.mmio_bus, &env.ics, &node)
            .unwrap();
        assert!(dev.is_some());

        match env.ic.source(0x21) {
            Some(SourceEntry::Passthrough(source)) => assert_eq!(source.host_irq(), 0x21),
            _ => panic!("guest line 0x21 not bound"),
        }
        assert!(env.vbus.irq_bound(0x21));
    }

    #[test]
    fn address_match_skips_foreign_regs() {
        let mut env = test_env();
        env.vbus.add_device("uart8250", "uart", uart_resources());

        let mut matcher = PassthroughMatcher::new();
        matcher.prepare(&mut env.vbus, &env.mmio_bus).unwrap();

        let mut node = DtNode::new("uart@4000");
        node.push_foreign_reg();
        node.push_reg(0x4000, 0x1000);

        let dev = matcher
            .create(&mut env.vbus, &env.mmio_bus, &env.ics, &node)
            .unwrap();
        assert!(dev.is_some());
    }

    #[test]
    fn address_match_rejects_unclaimed_regs() {
        let mut env = test_env();
        env.vbus.add_device("uart8250", "uart", uart_resources());

        let mut matcher = PassthroughMatcher::new();
        matcher.prepare(&mut env.vbus, &env.mmio_bus).unwrap();

        let mut node = DtNode::new("uart@80000");
        node.push_reg(0x8_0000, 0x1000);

        let err = matcher
            .create(&mut env.vbus, &env.mmio_bus, &env.ics, &node)
            .unwrap_err();
        assert!(matches!(err, Error::RegNotClaimed { index: 0, .. }));
    }

    #[test]
    fn address_match_absent_irq_is_not_fatal() {
        let mut env = test_env();
        env.vbus.add_device("uart8250", "uart", uart_resources());

        let mut matcher = PassthroughMatcher::new();
        matcher.prepare(&mut env.vbus, &env.mmio_bus).unwrap();

        let mut node = DtNode::new("uart@4000");
        node.push_reg(0x4000, 0x1000);
        node.push_interrupt(GIC_PHANDLE, 0x7f, 4);

        let dev = matcher
            .create(&mut env.vbus, &env.mmio_bus, &env.ics, &node)
            .unwrap();
        assert!(dev.is_none());
        assert!(env.ic.source(0x7f).is_none());
    }

    #[test]
    fn conflicting_binds_from_two_devices_are_fatal() {
        let mut env = test_env();
        env.vbus.add_device("uart8250", "uart", uart_resources());
        env.vbus.add_device(
            "rtc",
            "rtc0",
            vec![VbusResource::new(
                *b"irq0",
                VbusResourceKind::Irq { irq: 0x30 },
            )],
        );

        let matcher = PassthroughMatcher::new();
        matcher
            .create(&mut env.vbus, &env.mmio_bus, &env.ics, &uart_node())
            .unwrap()
            .unwrap();

        // Second device wants the same guest line with a different host
        // irq.
        let mut node = DtNode::new("rtc@0");
        node.set_prop(VBUS_DEVICE_PROP, "rtc");
        node.push_interrupt(GIC_PHANDLE, 39, 4);

        let err = matcher
            .create(&mut env.vbus, &env.mmio_bus, &env.ics, &node)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::IrqBind(IrqBindError::Conflict {
                line: 39,
                bound: 0x21,
                requested: 0x30,
            })
        ));

        // The first binding survives.
        match env.ic.source(39) {
            Some(SourceEntry::Passthrough(source)) => assert_eq!(source.host_irq(), 0x21),
            _ => panic!("guest line 39 lost its binding"),
        }
    }
}
