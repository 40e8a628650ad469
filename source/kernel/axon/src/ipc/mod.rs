// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Rendezvous IPC (blocking receive, non-blocking send, optional page transfer)
//! OWNERS: @kernel-ipc-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: ipc::tests (state machine, page transfer, no side effects on failure)
//! PUBLIC API: Mailbox, SendRequest, IpcError, try_send(), recv()
//! DEPENDS_ON: env::EnvTable, mm::{AddressSpace, FramePool}, sched::Scheduler
//! INVARIANTS: Receiving -> Idle only through a successful send; the flag clear, the
//!             from/value/perm fill, the return value and the runnable status are committed
//!             together after every fallible step has succeeded

use core::fmt;

use axon_abi::{EnvStatus, Perm};

use crate::env::{EnvError, EnvTable, Requester};
use crate::mm::{FramePool, MapError};
use crate::sched::Scheduler;
use crate::types::{EnvId, VirtAddr};

/// Errors reported by the IPC paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// The target is not waiting in receive.
    NotReceiving,
    /// The offered source page is unmapped or the requested permission exceeds it.
    InvalidSource,
    /// Target (or caller) resolution failed.
    Env(EnvError),
    /// The receiver's page table could not grow.
    Map(MapError),
}

impl From<EnvError> for IpcError {
    fn from(value: EnvError) -> Self {
        Self::Env(value)
    }
}

impl From<MapError> for IpcError {
    fn from(value: MapError) -> Self {
        Self::Map(value)
    }
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Per-environment IPC state.
///
/// `from`, `value` and `perm` describe the last delivered message and are meaningful only
/// once `receiving` has been cleared by a sender.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mailbox {
    receiving: bool,
    dst_va: Option<VirtAddr>,
    from: EnvId,
    value: u32,
    perm: Perm,
}

impl Mailbox {
    pub fn is_receiving(&self) -> bool {
        self.receiving
    }

    /// Page the receiver asked for, if any.
    pub fn dst_va(&self) -> Option<VirtAddr> {
        self.dst_va
    }

    pub fn from(&self) -> EnvId {
        self.from
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    /// Permission of the transferred page; empty if no page changed hands.
    pub fn perm(&self) -> Perm {
        self.perm
    }

    fn begin_receive(&mut self, dst_va: Option<VirtAddr>) {
        self.receiving = true;
        self.dst_va = dst_va;
    }

    fn deliver(&mut self, from: EnvId, value: u32, perm: Perm) {
        self.receiving = false;
        self.from = from;
        self.value = value;
        self.perm = perm;
    }
}

/// Decoded send request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendRequest {
    pub target: EnvId,
    pub value: u32,
    /// Offered page and the permission to install it with.
    pub page: Option<(VirtAddr, Perm)>,
}

/// Attempts a rendezvous with `req.target`.
///
/// Fails with `NotReceiving` (no side effects) unless the target is blocked in receive.
/// On success the target is made runnable with a zero return value; a page is mapped only
/// when both the sender offered one and the receiver asked for one.
#[must_use]
pub fn try_send(
    envs: &mut EnvTable,
    frames: &FramePool,
    scheduler: &mut Scheduler,
    sender: EnvId,
    req: &SendRequest,
) -> Result<(), IpcError> {
    let target = envs.resolve(req.target, Requester::Env(sender), false)?;

    let offered = match req.page {
        Some((src_va, perm)) => {
            let (frame, current) =
                envs.get(sender)?.space().lookup(src_va).ok_or(IpcError::InvalidSource)?;
            if perm.contains(Perm::WRITABLE) && !current.contains(Perm::WRITABLE) {
                return Err(IpcError::InvalidSource);
            }
            Some((frame.clone(), perm))
        }
        None => None,
    };

    let receiver = envs.get_mut(target)?;
    if !receiver.mailbox().is_receiving() {
        return Err(IpcError::NotReceiving);
    }

    let perm = match (offered, receiver.mailbox().dst_va()) {
        (Some((frame, perm)), Some(dst_va)) => {
            receiver.space_mut().map(frames, &frame, dst_va, perm)?;
            perm
        }
        _ => Perm::empty(),
    };

    receiver.mailbox_mut().deliver(sender, req.value, perm);
    receiver.frame_mut().set_ret(0);
    receiver.set_status(EnvStatus::Runnable);
    scheduler.enqueue(target);
    crate::log_trace!(
        target: "ipc",
        "{} -> {} value={} perm={:?}",
        sender,
        target,
        req.value,
        perm
    );
    Ok(())
}

/// Puts `caller` into the Receiving state and takes it off the run queue.
///
/// The caller's return register is left alone; the sender writes it on delivery.
#[must_use]
pub fn recv(
    envs: &mut EnvTable,
    scheduler: &mut Scheduler,
    caller: EnvId,
    dst_va: Option<VirtAddr>,
) -> Result<(), IpcError> {
    let env = envs.get_mut(caller)?;
    env.mailbox_mut().begin_receive(dst_va);
    env.set_status(EnvStatus::NotRunnable);
    scheduler.remove(caller);
    Ok(())
}

#[cfg(test)]
mod tests;
