// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-IRQ-to-guest-line binding for the virtual interrupt controller.
//!
//! `bind_irq` is the only writer of the controller's per-line binding
//! table. All bindings are established during device construction and
//! persist for the lifetime of the VM; only delivery and end-of-interrupt
//! events flow through afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Weak;

use guest_dt::Phandle;
use log::info;
use log::warn;
use parking_lot::Mutex;
use remain::sorted;
use thiserror::Error;

/// Sentinel host IRQ for sources without a distinct host interrupt line,
/// such as a secure monitor raising its own notification. The host-side
/// controller facet that accepts the bind decides what it maps to.
pub const HOST_IRQ_NONE: u32 = u32::MAX;

#[sorted]
#[derive(Error, Debug)]
pub enum IrqBindError {
    #[error(
        "guest line {line:#x} is already bound to host irq {bound:#x}, requested {requested:#x}"
    )]
    Conflict {
        line: u32,
        bound: u32,
        requested: u32,
    },
    #[error("guest line {line:#x} is bound to a non-passthrough source")]
    ForeignSource { line: u32 },
    #[error("cannot bind host irq {host_irq:#x}")]
    HostBind {
        host_irq: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error("guest line {0:#x} is out of range")]
    LineOutOfRange(u32),
}

pub type Result<T> = std::result::Result<T, IrqBindError>;

/// Host-side interrupt controller capability.
///
/// The seam through which host interrupts are attached to their delivery
/// sinks and re-enabled after the guest acknowledges them.
pub trait HostIcu: Send + Sync {
    /// Attaches `source` as the receiver of host interrupt `host_irq`.
    fn bind(&self, host_irq: u32, source: Arc<IrqSource>) -> anyhow::Result<()>;

    /// Re-enables delivery of `host_irq` after the guest acknowledged it.
    fn ack(&self, host_irq: u32);
}

/// Injection seam into the vcpu side of the virtual interrupt controller.
pub trait IrqInjector: Send + Sync {
    fn inject(&self, line: u32);
}

/// One bound host interrupt.
///
/// Delivery sink for "interrupt arrived" events from the host and EOI
/// target for "interrupt acknowledged" events from the guest controller.
/// The recorded host IRQ never changes after construction.
pub struct IrqSource {
    host_irq: u32,
    icu: Arc<dyn HostIcu>,
    sink: Mutex<Option<(Weak<VirtIc>, u32)>>,
}

impl IrqSource {
    fn new(host_irq: u32, icu: Arc<dyn HostIcu>) -> Arc<IrqSource> {
        Arc::new(IrqSource {
            host_irq,
            icu,
            sink: Mutex::new(None),
        })
    }

    pub fn host_irq(&self) -> u32 {
        self.host_irq
    }

    fn set_sink(&self, ic: &Arc<VirtIc>, line: u32) {
        *self.sink.lock() = Some((Arc::downgrade(ic), line));
    }

    /// Forwards a host "interrupt arrived" event to the guest line.
    pub fn interrupt(&self) {
        if let Some((ic, line)) = &*self.sink.lock() {
            if let Some(ic) = ic.upgrade() {
                ic.inject(*line);
            }
        }
    }

    /// Signals the host side that the guest finished handling the interrupt.
    pub fn eoi(&self) {
        self.icu.ack(self.host_irq);
    }
}

impl fmt::Debug for IrqSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("IrqSource")
            .field("host_irq", &self.host_irq)
            .finish()
    }
}

/// A guest line's binding table entry.
#[derive(Clone)]
pub enum SourceEntry {
    /// Line driven by a bound host interrupt.
    Passthrough(Arc<IrqSource>),
    /// Line driven by something else, typically an emulated device.
    Emulated,
}

/// Virtual interrupt controller: per-line binding table plus the
/// injection path towards the vcpus.
///
/// The table is mutated during device construction only; afterwards it is
/// read to route guest end-of-interrupt events back to their sources.
pub struct VirtIc {
    lines: u32,
    sources: Mutex<BTreeMap<u32, SourceEntry>>,
    injector: Arc<dyn IrqInjector>,
}

impl VirtIc {
    pub fn new(lines: u32, injector: Arc<dyn IrqInjector>) -> VirtIc {
        VirtIc {
            lines,
            sources: Mutex::new(BTreeMap::new()),
            injector,
        }
    }

    pub fn contains_line(&self, line: u32) -> bool {
        line < self.lines
    }

    /// Returns the current binding of `line`, if any.
    pub fn source(&self, line: u32) -> Option<SourceEntry> {
        self.sources.lock().get(&line).cloned()
    }

    /// Records `entry` as the binding of `line`. The caller is expected to
    /// have checked that the line is empty; an existing entry is replaced.
    pub fn bind_source(&self, line: u32, entry: SourceEntry) -> Result<()> {
        if !self.contains_line(line) {
            return Err(IrqBindError::LineOutOfRange(line));
        }
        self.sources.lock().insert(line, entry);
        Ok(())
    }

    /// Raises `line` towards the vcpus.
    pub fn inject(&self, line: u32) {
        self.injector.inject(line);
    }

    /// Routes a guest end-of-interrupt on `line` back to its bound source.
    pub fn notify_eoi(&self, line: u32) {
        if let Some(SourceEntry::Passthrough(source)) = self.source(line) {
            source.eoi();
        }
    }
}

/// Reference to the controller an interrupt descriptor targets.
#[derive(Clone)]
pub enum IcRef {
    /// The virtual controller; its lines can receive host bindings.
    Virtual(Arc<VirtIc>),
    /// A controller outside this VMM; nothing to bind here.
    Foreign,
}

/// Resolves devicetree interrupt parents to controllers.
#[derive(Default)]
pub struct IcLookup {
    by_phandle: BTreeMap<Phandle, IcRef>,
}

impl IcLookup {
    pub fn new() -> IcLookup {
        IcLookup {
            by_phandle: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, phandle: Phandle, ic: IcRef) {
        self.by_phandle.insert(phandle, ic);
    }

    pub fn resolve(&self, phandle: Phandle) -> Option<&IcRef> {
        self.by_phandle.get(&phandle)
    }
}

/// Establishes or verifies a host-IRQ-to-guest-line route.
///
/// On an empty line a new `IrqSource` recording `host_irq` is allocated,
/// attached on the host side, entered into the binding table and issued
/// one synthetic EOI to clear latent pending state. Rebinding the same
/// pair is an idempotent no-op; a differing host IRQ is a conflict that
/// leaves the existing binding untouched.
pub fn bind_irq(
    ic: &Arc<VirtIc>,
    icu: &Arc<dyn HostIcu>,
    guest_line: u32,
    host_irq: u32,
    dev_name: &str,
) -> Result<Arc<IrqSource>> {
    if !ic.contains_line(guest_line) {
        return Err(IrqBindError::LineOutOfRange(guest_line));
    }

    match ic.source(guest_line) {
        None => {
            info!(
                "IO device '{}': registering irq {:#x} -> {:#x}",
                dev_name, host_irq, guest_line
            );
            let source = IrqSource::new(host_irq, icu.clone());
            icu.bind(host_irq, source.clone())
                .map_err(|e| IrqBindError::HostBind {
                    host_irq,
                    source: e,
                })?;

            // Point the source at ic:guest_line for upstream events
            // (interrupt delivery), and the table at the source for
            // downstream events (EOI handling).
            source.set_sink(ic, guest_line);
            ic.bind_source(guest_line, SourceEntry::Passthrough(source.clone()))?;

            source.eoi();
            Ok(source)
        }
        Some(SourceEntry::Passthrough(existing)) => {
            warn!(
                "IO device '{}': irq {:#x} -> {:#x} already registered",
                dev_name, host_irq, guest_line
            );
            if existing.host_irq() == host_irq {
                return Ok(existing);
            }
            Err(IrqBindError::Conflict {
                line: guest_line,
                bound: existing.host_irq(),
                requested: host_irq,
            })
        }
        Some(SourceEntry::Emulated) => Err(IrqBindError::ForeignSource { line: guest_line }),
    }
}
