// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Read-only view of a parsed guest devicetree node.
//!
//! Tree loading, overlay merging and flattened-tree parsing happen in the
//! VMM frontend; device construction only ever sees individual nodes
//! through this view: the ordered `reg` entry list, the ordered interrupt
//! descriptor list and named string properties.

mod node;

pub use crate::node::DtInterrupt;
pub use crate::node::DtNode;
pub use crate::node::DtReg;
pub use crate::node::Error;
pub use crate::node::MmioRange;
pub use crate::node::Phandle;
pub use crate::node::Result;
