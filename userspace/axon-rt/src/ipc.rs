// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Message passing on top of the rendezvous primitives
//! OWNERS: @runtime
//! PUBLIC API: send(), try_send(), recv() -> PendingRecv, Message
//! DEPENDS_ON: sys::{ipc_try_send, ipc_recv, yield_now}
//! INVARIANTS: a receive completes only once a sender has cleared the receiving flag

use core::task::Poll;

use axon::Kernel;
use axon_abi::{EnvId, Errno, Perm};

use crate::process::Process;
use crate::sys;

/// Attempts [`send`] makes before giving up on an absent receiver.
pub const SEND_RETRIES: usize = 64;

/// Message delivered into a receiver's mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Message {
    /// Sender id.
    pub from: EnvId,
    /// 32-bit payload.
    pub value: u32,
    /// Permission of the transferred page; empty when no page was mapped.
    pub perm: Perm,
}

/// Single attempt to deliver `value` (and optionally the page at `page.0`) to `to`.
pub fn try_send(
    process: &Process,
    kernel: &mut Kernel,
    to: EnvId,
    value: u32,
    page: Option<(usize, Perm)>,
) -> Result<(), Errno> {
    sys::ipc_try_send(&mut process.cpu(kernel)?, to, value, page)
}

/// Delivers to `to`, yielding between attempts while it is not receiving.
///
/// Gives up with `Errno::IpcNotRecv` after [`SEND_RETRIES`] attempts; other errors are
/// returned immediately.
pub fn send(
    process: &Process,
    kernel: &mut Kernel,
    to: EnvId,
    value: u32,
    page: Option<(usize, Perm)>,
) -> Result<(), Errno> {
    for _ in 0..SEND_RETRIES {
        match try_send(process, kernel, to, value, page) {
            Err(Errno::IpcNotRecv) => sys::yield_now(&mut process.cpu(kernel)?)?,
            other => return other,
        }
    }
    axon::log_warn!(target: "user", "[{}] send to {} gave up", process.env_id(), to);
    Err(Errno::IpcNotRecv)
}

/// Blocks `process` in receive; a page, if the sender offers one, lands at `dst_va`.
pub fn recv(
    process: &Process,
    kernel: &mut Kernel,
    dst_va: Option<usize>,
) -> Result<PendingRecv, Errno> {
    sys::ipc_recv(&mut process.cpu(kernel)?, dst_va)?;
    Ok(PendingRecv { env: process.env_id() })
}

/// Receive in progress.
#[derive(Debug)]
#[must_use]
pub struct PendingRecv {
    env: EnvId,
}

impl PendingRecv {
    /// Ready once a sender delivered into the mailbox.
    pub fn poll(&mut self, kernel: &Kernel) -> Poll<Result<Message, Errno>> {
        let Ok(env) = kernel.env(self.env) else {
            return Poll::Ready(Err(Errno::BadEnv));
        };
        let mailbox = env.mailbox();
        if mailbox.is_receiving() {
            return Poll::Pending;
        }
        let ret = Errno::decode(env.frame().ret() as isize);
        Poll::Ready(ret.map(|_| Message {
            from: mailbox.from(),
            value: mailbox.value(),
            perm: mailbox.perm(),
        }))
    }
}
