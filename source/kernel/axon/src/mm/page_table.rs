// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Two-level (10/10/12) page table with lazy allocation of page-table pages.
//!
//! The directory and every page-table page are charged against the frame pool, so a map
//! can run out of memory while building the walk. That happens before the leaf entry is
//! touched, leaving the table exactly as it was.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;

use axon_abi::NPTENTRIES;

use super::{FramePool, FrameRef, MapError, Perm};
use crate::types::VirtAddr;

/// Leaf entry: a frame handle plus its permission bits.
#[derive(Clone, Debug)]
pub struct Pte {
    frame: FrameRef,
    perm: Perm,
}

impl Pte {
    pub fn new(frame: FrameRef, perm: Perm) -> Self {
        Self { frame, perm }
    }

    pub fn frame(&self) -> &FrameRef {
        &self.frame
    }

    pub fn perm(&self) -> Perm {
        self.perm
    }
}

struct TablePage {
    // Accounts for the page-table page in the frame pool.
    _backing: FrameRef,
    entries: Vec<Option<Pte>>,
    live: usize,
}

impl TablePage {
    fn new(backing: FrameRef) -> Self {
        let mut entries = Vec::with_capacity(NPTENTRIES);
        entries.resize_with(NPTENTRIES, || None);
        Self { _backing: backing, entries, live: 0 }
    }
}

/// Per-environment page table.
pub struct PageTable {
    _root: FrameRef,
    dir: Vec<Option<Box<TablePage>>>,
    mapped: usize,
}

impl PageTable {
    /// Allocates the root directory frame.
    #[must_use]
    pub fn new(pool: &FramePool) -> Result<Self, MapError> {
        let root = pool.alloc().ok_or(MapError::OutOfMemory)?;
        let mut dir = Vec::with_capacity(NPTENTRIES);
        dir.resize_with(NPTENTRIES, || None);
        Ok(Self { _root: root, dir, mapped: 0 })
    }

    /// Returns the leaf entry for the page containing `va`.
    pub fn lookup(&self, va: VirtAddr) -> Option<&Pte> {
        self.dir[va.pdx()].as_ref()?.entries[va.ptx()].as_ref()
    }

    /// Installs `pte` for the page containing `va`, returning the displaced entry.
    ///
    /// The caller drops the returned entry after the new one is in place, so re-inserting the
    /// same frame at the same address never transiently frees it.
    #[must_use]
    pub fn insert(
        &mut self,
        pool: &FramePool,
        va: VirtAddr,
        pte: Pte,
    ) -> Result<Option<Pte>, MapError> {
        let slot = &mut self.dir[va.pdx()];
        if slot.is_none() {
            let backing = pool.alloc().ok_or(MapError::OutOfMemory)?;
            *slot = Some(Box::new(TablePage::new(backing)));
        }
        let Some(table) = slot.as_deref_mut() else {
            return Err(MapError::OutOfMemory);
        };
        let old = table.entries[va.ptx()].replace(pte);
        if old.is_none() {
            table.live += 1;
            self.mapped += 1;
        }
        Ok(old)
    }

    /// Removes the entry for the page containing `va`, if any. A page-table page whose last
    /// entry goes away is returned to the pool.
    pub fn remove(&mut self, va: VirtAddr) -> Option<Pte> {
        let slot = &mut self.dir[va.pdx()];
        let table = slot.as_deref_mut()?;
        let old = table.entries[va.ptx()].take()?;
        table.live -= 1;
        if table.live == 0 {
            *slot = None;
        }
        self.mapped -= 1;
        Some(old)
    }

    /// Number of leaf entries.
    pub fn mapped(&self) -> usize {
        self.mapped
    }

    /// Number of page-table pages allocated so far (the directory excluded).
    pub fn table_pages(&self) -> usize {
        self.dir.iter().filter(|slot| slot.is_some()).count()
    }

    /// Iterates over leaf entries in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = (VirtAddr, &Pte)> + '_ {
        self.dir.iter().enumerate().flat_map(|(pdx, slot)| {
            slot.iter().flat_map(move |table| {
                table
                    .entries
                    .iter()
                    .enumerate()
                    .filter_map(move |(ptx, pte)| {
                        pte.as_ref().map(|pte| (VirtAddr::from_indices(pdx, ptx), pte))
                    })
            })
        })
    }
}
