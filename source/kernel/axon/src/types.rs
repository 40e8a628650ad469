// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes for syscall decoding and frame bookkeeping
//! OWNERS: @kernel-team
//! PUBLIC API: VirtAddr, Pfn, EnvId (re-export)
//! DEPENDS_ON: axon-abi layout constants
//! INVARIANTS: VirtAddr is always below UTOP; Pfn only minted by the frame pool

use core::fmt;

use axon_abi::{page_round_down, PAGE_SIZE, PGSHIFT, UTOP};

pub use axon_abi::EnvId;

const PDXSHIFT: usize = 22;
const INDEX_MASK: usize = 0x3ff;

/// User virtual address, guaranteed to lie below `UTOP`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtAddr(usize);

impl VirtAddr {
    /// Accepts any address below `UTOP`.
    #[inline]
    pub fn user(addr: usize) -> Option<Self> {
        (addr < UTOP).then_some(Self(addr))
    }

    /// Accepts a page-aligned address below `UTOP`.
    #[inline]
    pub fn user_page(addr: usize) -> Option<Self> {
        Self::user(addr).filter(|va| va.is_page_aligned())
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    /// Page containing this address.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(page_round_down(self.0))
    }

    /// Page-directory index.
    #[inline]
    pub const fn pdx(self) -> usize {
        (self.0 >> PDXSHIFT) & INDEX_MASK
    }

    /// Page-table index.
    #[inline]
    pub const fn ptx(self) -> usize {
        (self.0 >> PGSHIFT) & INDEX_MASK
    }

    /// Rebuilds an address from directory and table indices.
    #[inline]
    pub(crate) const fn from_indices(pdx: usize, ptx: usize) -> Self {
        Self((pdx << PDXSHIFT) | (ptx << PGSHIFT))
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Physical frame number.
///
/// **Ownership**: only `FramePool` mints frame numbers; everything else sees them through a
/// `FrameRef`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Pfn(usize);

impl Pfn {
    #[inline]
    pub(crate) const fn from_index(index: usize) -> Self {
        Self(index)
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0
    }

    /// Emulated physical address of the frame.
    #[inline]
    pub const fn phys_addr(self) -> usize {
        self.0 << PGSHIFT
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pfn:{}", self.0)
    }
}
