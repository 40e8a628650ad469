// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-environment address space on top of the two-level page table
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace (lookup/map/unmap/perm/check/read/write), Access, PageFault
//! DEPENDS_ON: mm::page_table, mm::frame
//! INVARIANTS: map takes its own frame reference before the previous occupant is released;
//!             unmap of an empty slot is a no-op; user loads need PRESENT|USER, stores also
//!             WRITABLE

use axon_abi::{page_offset, page_round_down, FaultCode};

use super::{FramePool, FrameRef, MapError, PageTable, Perm, Pte, PAGE_SIZE};
use crate::types::VirtAddr;

/// Kind of user-mode memory access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Page fault raised by the emulated MMU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageFault {
    /// First faulting byte.
    pub va: usize,
    pub code: FaultCode,
}

/// Page-granular view of one environment's memory.
pub struct AddressSpace {
    table: PageTable,
}

impl AddressSpace {
    /// Creates an empty address space; fails if the root directory frame is unavailable.
    #[must_use]
    pub fn new(pool: &FramePool) -> Result<Self, MapError> {
        Ok(Self { table: PageTable::new(pool)? })
    }

    /// Returns the frame and permissions mapped at the page containing `va`.
    pub fn lookup(&self, va: VirtAddr) -> Option<(&FrameRef, Perm)> {
        self.table.lookup(va).map(|pte| (pte.frame(), pte.perm()))
    }

    /// Permission bits of the mapping at `va`, if any.
    pub fn perm(&self, va: VirtAddr) -> Option<Perm> {
        self.table.lookup(va).map(Pte::perm)
    }

    /// Maps `frame` at the page containing `va`, replacing any previous mapping.
    #[must_use]
    pub fn map(
        &mut self,
        pool: &FramePool,
        frame: &FrameRef,
        va: VirtAddr,
        perm: Perm,
    ) -> Result<(), MapError> {
        let displaced = self.table.insert(pool, va.page_down(), Pte::new(frame.clone(), perm))?;
        drop(displaced);
        Ok(())
    }

    /// Removes the mapping at the page containing `va`; succeeds if nothing was mapped.
    pub fn unmap(&mut self, va: VirtAddr) {
        drop(self.table.remove(va.page_down()));
    }

    pub fn mapped_pages(&self) -> usize {
        self.table.mapped()
    }

    pub fn table_pages(&self) -> usize {
        self.table.table_pages()
    }

    /// Iterates over `(page, perm)` pairs in ascending address order.
    pub fn mappings(&self) -> impl Iterator<Item = (VirtAddr, Perm)> + '_ {
        self.table.iter().map(|(va, pte)| (va, pte.perm()))
    }

    /// Runs the MMU checks for a user access of `len` bytes at `va`.
    pub fn check(&self, va: usize, len: usize, access: Access) -> Result<(), PageFault> {
        if len == 0 {
            return Ok(());
        }
        let mut code = FaultCode::USER;
        if access == Access::Write {
            code |= FaultCode::WRITE;
        }
        let last = va
            .checked_add(len - 1)
            .ok_or(PageFault { va, code })?;

        let mut page = page_round_down(va);
        while page <= last {
            let at = page.max(va);
            let perm = VirtAddr::user(page)
                .and_then(|page| self.perm(page))
                .filter(|perm| perm.contains(Perm::PRESENT));
            let Some(perm) = perm else {
                return Err(PageFault { va: at, code });
            };
            let denied = !perm.contains(Perm::USER)
                || (access == Access::Write && !perm.contains(Perm::WRITABLE));
            if denied {
                return Err(PageFault { va: at, code: code | FaultCode::PRESENT });
            }
            match page.checked_add(PAGE_SIZE) {
                Some(next) => page = next,
                None => break,
            }
        }
        Ok(())
    }

    /// User-mode load: checks the whole range, then copies it into `buf`.
    pub fn read(&self, va: usize, buf: &mut [u8]) -> Result<(), PageFault> {
        self.check(va, buf.len(), Access::Read)?;
        let mut done = 0;
        while done < buf.len() {
            let at = va + done;
            let chunk = (PAGE_SIZE - page_offset(at)).min(buf.len() - done);
            if let Some((frame, _)) = VirtAddr::user(at).and_then(|at| self.lookup(at)) {
                frame.read(page_offset(at), &mut buf[done..done + chunk]);
            }
            done += chunk;
        }
        Ok(())
    }

    /// User-mode store: checks the whole range, then copies `data` in.
    pub fn write(&self, va: usize, data: &[u8]) -> Result<(), PageFault> {
        self.check(va, data.len(), Access::Write)?;
        let mut done = 0;
        while done < data.len() {
            let at = va + done;
            let chunk = (PAGE_SIZE - page_offset(at)).min(data.len() - done);
            if let Some((frame, _)) = VirtAddr::user(at).and_then(|at| self.lookup(at)) {
                frame.write(page_offset(at), &data[done..done + chunk]);
            }
            done += chunk;
        }
        Ok(())
    }
}
