// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeMap;

use remain::sorted;
use thiserror::Error as ThisError;

#[sorted]
#[derive(ThisError, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("reg index {0} is past the last entry")]
    BadIndex(usize),
    #[error("reg entry {0} is not translatable to a guest-physical address")]
    NotTranslatable(usize),
    #[error("reg entry {0} does not describe a usable range")]
    Range(usize),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Devicetree node reference as resolved by the frontend.
pub type Phandle = u32;

/// A guest-physical address range described by one `reg` entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MmioRange {
    pub base: u64,
    pub size: u64,
}

impl MmioRange {
    /// Last guest-physical address covered by the range.
    pub fn last(&self) -> u64 {
        self.base + self.size - 1
    }
}

/// One entry of a node's `reg` property.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DtReg {
    /// Entry translated into the guest-physical address space.
    Mmio(MmioRange),
    /// Entry addressed through a bus space this VMM does not manage.
    ///
    /// Foreign entries keep their position so that positional matching
    /// against bus resources stays stable, but they cannot be mapped.
    Foreign,
}

/// One entry of a node's `interrupts` property.
///
/// The interrupt parent is kept as a phandle; resolving it to an actual
/// controller is the consumer's job since the set of controllers is not
/// known to the tree view.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DtInterrupt {
    pub parent: Phandle,
    pub irq: u32,
    pub flags: u32,
}

/// A single parsed devicetree node.
pub struct DtNode {
    name: String,
    regs: Vec<DtReg>,
    interrupts: Vec<DtInterrupt>,
    props: BTreeMap<String, String>,
}

impl DtNode {
    pub fn new(name: &str) -> Self {
        DtNode {
            name: name.to_owned(),
            regs: Vec::new(),
            interrupts: Vec::new(),
            props: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends a translated `reg` entry.
    pub fn push_reg(&mut self, base: u64, size: u64) {
        self.regs.push(DtReg::Mmio(MmioRange { base, size }));
    }

    /// Appends a `reg` entry living in an unmanaged bus space.
    pub fn push_foreign_reg(&mut self) {
        self.regs.push(DtReg::Foreign);
    }

    pub fn push_interrupt(&mut self, parent: Phandle, irq: u32, flags: u32) {
        self.interrupts.push(DtInterrupt {
            parent,
            irq,
            flags,
        });
    }

    pub fn set_prop(&mut self, name: &str, value: &str) {
        self.props.insert(name.to_owned(), value.to_owned());
    }

    /// Number of `reg` entries, foreign ones included.
    pub fn reg_count(&self) -> usize {
        self.regs.len()
    }

    /// Returns the `index`-th `reg` entry as a guest-physical range.
    ///
    /// `Error::BadIndex` terminates iteration past the last entry;
    /// `Error::NotTranslatable` marks an entry of another bus space;
    /// `Error::Range` marks an entry whose base and size do not form a
    /// usable guest-physical range.
    pub fn reg_entry(&self, index: usize) -> Result<MmioRange> {
        match self.regs.get(index) {
            None => Err(Error::BadIndex(index)),
            Some(DtReg::Foreign) => Err(Error::NotTranslatable(index)),
            Some(DtReg::Mmio(range)) => {
                if range.size == 0 || range.base.checked_add(range.size - 1).is_none() {
                    Err(Error::Range(index))
                } else {
                    Ok(*range)
                }
            }
        }
    }

    pub fn interrupt_count(&self) -> usize {
        self.interrupts.len()
    }

    pub fn interrupt(&self, index: usize) -> Option<DtInterrupt> {
        self.interrupts.get(index).copied()
    }

    pub fn interrupts(&self) -> &[DtInterrupt] {
        &self.interrupts
    }

    pub fn prop_str(&self, name: &str) -> Option<&str> {
        self.props.get(name).map(|v| v.as_str())
    }
}
