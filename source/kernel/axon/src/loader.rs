// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Program loader creating a runnable environment from a flat image
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel::spawn(image), ProgramImage, Spawned, SpawnError
//! DEPENDS_ON: env::EnvTable, mm::{FramePool, AddressSpace}
//! INVARIANTS: text is never writable; a failed spawn leaves no environment behind

use core::fmt;

use axon_abi::{page_round_up, EnvStatus, Perm, PAGE_SIZE, USTACKTOP, UTEXT};

use crate::env::{EnvError, Requester};
use crate::kernel::Kernel;
use crate::mm::{AddressSpace, FramePool, MapError};
use crate::types::{EnvId, VirtAddr};

/// Flat program image: `text` at `UTEXT`, `data` and `bss` on the following pages.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProgramImage<'a> {
    pub text: &'a [u8],
    pub data: &'a [u8],
    /// Zero-filled bytes after `data`.
    pub bss: usize,
}

/// A freshly loaded environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Spawned {
    pub id: EnvId,
    /// First page past the loaded image.
    pub brk: usize,
}

/// Errors surfaced while loading an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpawnError {
    /// No environment slot or root table available.
    Env(EnvError),
    /// A segment or stack page could not be backed.
    NoMemory,
    /// The image would overlap the user stack.
    TooLarge,
}

impl From<EnvError> for SpawnError {
    fn from(value: EnvError) -> Self {
        Self::Env(value)
    }
}

impl From<MapError> for SpawnError {
    fn from(_: MapError) -> Self {
        Self::NoMemory
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Env(err) => write!(f, "environment: {err}"),
            Self::NoMemory => f.write_str("out of memory"),
            Self::TooLarge => f.write_str("image overlaps the user stack"),
        }
    }
}

impl Kernel {
    /// Loads `image` into a new environment and makes it runnable.
    pub fn spawn(&mut self, image: &ProgramImage<'_>) -> Result<Spawned, SpawnError> {
        let data_start = page_round_up(UTEXT + image.text.len());
        let brk = data_start
            .checked_add(image.data.len())
            .and_then(|end| end.checked_add(image.bss))
            .map(page_round_up)
            .filter(|brk| *brk <= USTACKTOP - PAGE_SIZE)
            .ok_or(SpawnError::TooLarge)?;

        let id = self.envs.alloc(&self.frames, None)?;
        let loaded = self
            .envs
            .resolve_mut(id, Requester::Kernel, false)
            .map_err(SpawnError::from)
            .and_then(|env| {
                let space = env.space_mut();
                load_segment(
                    space,
                    &self.frames,
                    UTEXT,
                    image.text,
                    image.text.len(),
                    Perm::USER_PRESENT,
                )?;
                load_segment(
                    space,
                    &self.frames,
                    data_start,
                    image.data,
                    brk - data_start,
                    Perm::USER_PRESENT | Perm::WRITABLE,
                )?;
                load_segment(
                    space,
                    &self.frames,
                    USTACKTOP - PAGE_SIZE,
                    &[],
                    PAGE_SIZE,
                    Perm::USER_PRESENT | Perm::WRITABLE,
                )?;
                let frame = env.frame_mut();
                frame.sepc = UTEXT;
                frame.set_sp(USTACKTOP);
                env.set_status(EnvStatus::Runnable);
                Ok(())
            });

        if let Err(err) = loaded {
            crate::log_warn!(target: "loader", "spawn {} failed: {}", id, err);
            if let Err(destroy) = self.envs.destroy(id, &mut self.scheduler) {
                crate::log_warn!(target: "loader", "spawn {} cleanup: {}", id, destroy);
            }
            return Err(err);
        }
        self.scheduler.enqueue(id);
        crate::log_info!(
            target: "loader",
            "spawn {} text={}B data={}B bss={}B brk={:#x}",
            id,
            image.text.len(),
            image.data.len(),
            image.bss,
            brk
        );
        Ok(Spawned { id, brk })
    }
}

/// Backs `[va, va + len)` with fresh frames, copying `bytes` to the start of the range.
fn load_segment(
    space: &mut AddressSpace,
    pool: &FramePool,
    va: usize,
    bytes: &[u8],
    len: usize,
    perm: Perm,
) -> Result<(), SpawnError> {
    let mut offset = 0;
    while offset < len {
        let page = VirtAddr::user_page(va + offset).ok_or(SpawnError::TooLarge)?;
        let frame = pool.alloc().ok_or(SpawnError::NoMemory)?;
        if let Some(chunk) = bytes.get(offset..) {
            frame.write(0, &chunk[..chunk.len().min(PAGE_SIZE)]);
        }
        space.map(pool, &frame, page, perm)?;
        offset += PAGE_SIZE;
    }
    Ok(())
}
