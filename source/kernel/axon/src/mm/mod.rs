// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual memory primitives: ref-counted frames, two-level page tables, address spaces.

pub mod address_space;
pub mod frame;
pub mod page_table;

use core::fmt;

pub use address_space::{Access, AddressSpace, PageFault};
pub use axon_abi::{Perm, PAGE_SIZE};
pub use frame::{FramePool, FrameRef};
pub use page_table::{PageTable, Pte};

/// Error returned by mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// No frame was available for the page or for an intermediate paging structure.
    OutOfMemory,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
