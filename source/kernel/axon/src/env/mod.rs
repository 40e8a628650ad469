// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Environment registry (generation-checked arena of environments)
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: env::tests (resolve permissions, stale ids, alloc/destroy accounting)
//! PUBLIC API: EnvTable (alloc/resolve/get/get_mut/destroy), Env, EnvError, Requester
//! DEPENDS_ON: mm::AddressSpace, ipc::Mailbox, sched::Scheduler
//! INVARIANTS: Stale ids never resolve; EnvId::SELF names the requester; permission-checked
//!             resolution admits only the environment itself and its direct parent

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

use axon_abi::{EnvStatus, TrapFrame, SSTATUS_SPIE};

use crate::ipc::Mailbox;
use crate::mm::{AddressSpace, FramePool, MapError};
use crate::sched::Scheduler;

pub use crate::types::EnvId;

/// Errors returned by registry operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvError {
    /// Unknown, stale, or not accessible to the requester.
    BadEnv,
    /// All slots are in use.
    NoFreeEnv,
    /// The root paging structure could not be allocated.
    NoMemory,
    /// The environment exists but may not be put on a processor right now.
    NotRunnable,
}

impl From<MapError> for EnvError {
    fn from(_: MapError) -> Self {
        Self::NoMemory
    }
}

impl fmt::Display for EnvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Who is asking the registry to resolve an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requester {
    Kernel,
    Env(EnvId),
}

/// One environment: identity, status, address space, saved registers, upcall and mailbox.
pub struct Env {
    id: EnvId,
    parent: Option<EnvId>,
    status: EnvStatus,
    space: AddressSpace,
    frame: TrapFrame,
    pgfault_upcall: Option<usize>,
    mailbox: Mailbox,
}

impl Env {
    pub fn id(&self) -> EnvId {
        self.id
    }

    pub fn parent(&self) -> Option<EnvId> {
        self.parent
    }

    pub fn status(&self) -> EnvStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: EnvStatus) {
        self.status = status;
    }

    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    pub(crate) fn space_mut(&mut self) -> &mut AddressSpace {
        &mut self.space
    }

    pub fn frame(&self) -> &TrapFrame {
        &self.frame
    }

    pub(crate) fn frame_mut(&mut self) -> &mut TrapFrame {
        &mut self.frame
    }

    pub fn pgfault_upcall(&self) -> Option<usize> {
        self.pgfault_upcall
    }

    pub(crate) fn set_pgfault_upcall(&mut self, entry: usize) {
        self.pgfault_upcall = Some(entry);
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub(crate) fn mailbox_mut(&mut self) -> &mut Mailbox {
        &mut self.mailbox
    }

    /// Returns true if `other` is this environment's direct parent.
    pub fn is_child_of(&self, other: EnvId) -> bool {
        self.parent == Some(other)
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("status", &self.status)
            .field("pages", &self.space.mapped_pages())
            .field("upcall", &self.pgfault_upcall)
            .finish()
    }
}

struct Slot {
    generation: u32,
    env: Option<Env>,
}

/// Fixed-capacity arena of environments indexed by generation-checked ids.
pub struct EnvTable {
    slots: Vec<Slot>,
}

impl EnvTable {
    /// Creates a registry with `capacity` empty slots.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot { generation: 0, env: None });
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live environments.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.env.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocates an environment with an empty address space and a zeroed user-mode frame.
    /// The new environment starts NotRunnable.
    #[must_use]
    pub fn alloc(&mut self, pool: &FramePool, parent: Option<EnvId>) -> Result<EnvId, EnvError> {
        let index = self
            .slots
            .iter()
            .position(|slot| slot.env.is_none())
            .ok_or(EnvError::NoFreeEnv)?;
        let space = AddressSpace::new(pool)?;

        let slot = &mut self.slots[index];
        slot.generation = EnvId::next_generation(slot.generation);
        let id = EnvId::new(slot.generation, index);
        let frame = TrapFrame { sstatus: SSTATUS_SPIE, ..TrapFrame::default() };
        slot.env = Some(Env {
            id,
            parent,
            status: EnvStatus::NotRunnable,
            space,
            frame,
            pgfault_upcall: None,
            mailbox: Mailbox::default(),
        });
        crate::log_debug!(target: "env", "alloc {} parent={:?}", id, parent);
        Ok(id)
    }

    /// Resolves `id` on behalf of `requester`, returning the full id of the environment.
    ///
    /// `EnvId::SELF` names the requesting environment. With `require_permission` only the
    /// environment itself and its direct parent may resolve it; the kernel always may.
    #[must_use]
    pub fn resolve(
        &self,
        id: EnvId,
        requester: Requester,
        require_permission: bool,
    ) -> Result<EnvId, EnvError> {
        let target = match (id.is_self(), requester) {
            (true, Requester::Env(caller)) => caller,
            (true, Requester::Kernel) => return Err(EnvError::BadEnv),
            (false, _) => id,
        };
        let env = self.get(target)?;
        if let (true, Requester::Env(caller)) = (require_permission, requester) {
            if env.id != caller && !env.is_child_of(caller) {
                return Err(EnvError::BadEnv);
            }
        }
        Ok(env.id)
    }

    /// Looks up a live environment by its full id.
    pub fn get(&self, id: EnvId) -> Result<&Env, EnvError> {
        self.slots
            .get(id.index())
            .and_then(|slot| slot.env.as_ref())
            .filter(|env| env.id == id)
            .ok_or(EnvError::BadEnv)
    }

    /// Mutable lookup by full id.
    pub fn get_mut(&mut self, id: EnvId) -> Result<&mut Env, EnvError> {
        self.slots
            .get_mut(id.index())
            .and_then(|slot| slot.env.as_mut())
            .filter(|env| env.id == id)
            .ok_or(EnvError::BadEnv)
    }

    /// Resolves and borrows in one step.
    pub fn resolve_mut(
        &mut self,
        id: EnvId,
        requester: Requester,
        require_permission: bool,
    ) -> Result<&mut Env, EnvError> {
        let id = self.resolve(id, requester, require_permission)?;
        self.get_mut(id)
    }

    /// Tears an environment down: it leaves the run queue, every mapping is released (frame
    /// counts drop, frames at zero return to the pool) and the slot becomes free.
    #[must_use]
    pub fn destroy(&mut self, id: EnvId, scheduler: &mut Scheduler) -> Result<(), EnvError> {
        let slot = self
            .slots
            .get_mut(id.index())
            .filter(|slot| slot.env.as_ref().is_some_and(|env| env.id == id))
            .ok_or(EnvError::BadEnv)?;
        if let Some(env) = slot.env.as_mut() {
            env.status = EnvStatus::Dying;
        }
        scheduler.remove(id);
        let env = slot.env.take();
        crate::log_info!(
            target: "env",
            "free env {} ({} pages)",
            id,
            env.as_ref().map_or(0, |env| env.space.mapped_pages())
        );
        drop(env);
        Ok(())
    }

    /// Iterates over live environments.
    pub fn iter(&self) -> impl Iterator<Item = &Env> + '_ {
        self.slots.iter().filter_map(|slot| slot.env.as_ref())
    }
}

#[cfg(test)]
mod tests;
