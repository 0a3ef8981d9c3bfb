// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Named capabilities handed to the VMM by its environment.
//!
//! Devicetree nodes reference these by name through vendor properties;
//! factories look them up at construction time. The registry is filled
//! once during startup and read-only afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::bus::Dataspace;
use crate::irqchip::HostIcu;
use crate::optee::SmcccCall;

/// A secure-monitor capability: the call transport plus the resources
/// needed to expose the monitor to the guest.
#[derive(Clone)]
pub struct MonitorCap {
    /// Transport for fast secure monitor calls.
    pub call: Arc<dyn SmcccCall>,
    /// Backing memory out of which the monitor carves shared buffers.
    pub dataspace: Arc<dyn Dataspace>,
    /// Controller facet for monitor-raised notification interrupts.
    /// `None` when the transport cannot deliver notifications.
    pub notify_icu: Option<Arc<dyn HostIcu>>,
}

/// A capability as found in the registry.
#[derive(Clone)]
pub enum Capability {
    /// Plain memory, referenced by dataspace-typed vendor properties.
    Dataspace(Arc<dyn Dataspace>),
    /// A secure monitor endpoint.
    Monitor(MonitorCap),
}

/// Name-to-capability table for the whole VM.
#[derive(Default)]
pub struct CapRegistry {
    caps: BTreeMap<String, Capability>,
}

impl CapRegistry {
    pub fn new() -> CapRegistry {
        CapRegistry {
            caps: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, name: &str, cap: Capability) {
        self.caps.insert(name.to_owned(), cap);
    }

    pub fn get(&self, name: &str) -> Option<&Capability> {
        self.caps.get(name)
    }
}
