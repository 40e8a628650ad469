// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Thin typed wrappers over the kernel primitives.
//!
//! Every wrapper issues exactly one `ecall` on the supplied [`Cpu`] and decodes the
//! negated-errno convention into `Result<_, Errno>`.

use axon::{Cpu, Ecall};
use axon_abi::{
    EnvId, EnvStatus, Errno, Perm, SYSCALL_ENV_DESTROY, SYSCALL_ENV_SET_PGFAULT_UPCALL,
    SYSCALL_ENV_SET_STATUS, SYSCALL_ENV_SET_TRAPFRAME, SYSCALL_EXOFORK, SYSCALL_GETENVID,
    SYSCALL_IPC_RECV, SYSCALL_IPC_TRY_SEND, SYSCALL_PAGE_ALLOC, SYSCALL_PAGE_MAP,
    SYSCALL_PAGE_UNMAP, SYSCALL_YIELD, UTOP,
};

fn syscall(cpu: &mut Cpu<'_>, number: usize, args: [usize; 5]) -> Result<usize, Errno> {
    match cpu.ecall(number, args) {
        Ecall::Returned(ret) => Errno::decode(ret),
        other => Err(unexpected(cpu, number, other)),
    }
}

/// Reports a control transfer the wrapper for `number` never asks for. The caller is no
/// longer running afterwards, so the wrapper fails with `BadEnv`.
#[cold]
fn unexpected(cpu: &Cpu<'_>, number: usize, outcome: Ecall) -> Errno {
    axon::log_error!(
        target: "user",
        "[{}] syscall {} ended in unexpected {:?}",
        cpu.env_id(),
        number,
        outcome
    );
    Errno::BadEnv
}

#[inline]
fn env(id: EnvId) -> usize {
    id.as_raw() as usize
}

#[inline]
fn perm(perm: Perm) -> usize {
    perm.bits() as usize
}

/// Returns the caller's full environment id.
pub fn getenvid(cpu: &mut Cpu<'_>) -> Result<EnvId, Errno> {
    let raw = syscall(cpu, SYSCALL_GETENVID, [0; 5])?;
    u32::try_from(raw).map(EnvId::from_raw).map_err(|_| Errno::Inval)
}

/// Destroys `id` (the caller or one of its children).
pub fn env_destroy(cpu: &mut Cpu<'_>, id: EnvId) -> Result<(), Errno> {
    match cpu.ecall(SYSCALL_ENV_DESTROY, [env(id), 0, 0, 0, 0]) {
        Ecall::Exited => Ok(()),
        Ecall::Returned(ret) => Errno::decode(ret).map(drop),
        other => Err(unexpected(cpu, SYSCALL_ENV_DESTROY, other)),
    }
}

/// Gives up the processor.
pub fn yield_now(cpu: &mut Cpu<'_>) -> Result<(), Errno> {
    syscall(cpu, SYSCALL_YIELD, [0; 5]).map(drop)
}

/// Allocates a zeroed page and maps it at `va` in `id`.
pub fn page_alloc(cpu: &mut Cpu<'_>, id: EnvId, va: usize, prot: Perm) -> Result<(), Errno> {
    syscall(cpu, SYSCALL_PAGE_ALLOC, [env(id), va, perm(prot), 0, 0]).map(drop)
}

/// Maps the page at `src_va` in `src` at `dst_va` in `dst`.
pub fn page_map(
    cpu: &mut Cpu<'_>,
    src: EnvId,
    src_va: usize,
    dst: EnvId,
    dst_va: usize,
    prot: Perm,
) -> Result<(), Errno> {
    syscall(cpu, SYSCALL_PAGE_MAP, [env(src), src_va, env(dst), dst_va, perm(prot)]).map(drop)
}

/// Removes the mapping at `va` in `id`; unmapped pages are fine.
pub fn page_unmap(cpu: &mut Cpu<'_>, id: EnvId, va: usize) -> Result<(), Errno> {
    syscall(cpu, SYSCALL_PAGE_UNMAP, [env(id), va, 0, 0, 0]).map(drop)
}

/// Creates a blank child environment that is not yet runnable.
///
/// Returns the child id; the child's saved registers hold zero in the return register.
pub fn exofork(cpu: &mut Cpu<'_>) -> Result<EnvId, Errno> {
    let raw = syscall(cpu, SYSCALL_EXOFORK, [0; 5])?;
    u32::try_from(raw).map(EnvId::from_raw).map_err(|_| Errno::Inval)
}

/// Sets `id` to `Runnable` or `NotRunnable`.
pub fn env_set_status(cpu: &mut Cpu<'_>, id: EnvId, status: EnvStatus) -> Result<(), Errno> {
    syscall(cpu, SYSCALL_ENV_SET_STATUS, [env(id), status as usize, 0, 0, 0]).map(drop)
}

/// Installs the register file stored at `frame_va` in the caller's memory into `id`.
pub fn env_set_trapframe(cpu: &mut Cpu<'_>, id: EnvId, frame_va: usize) -> Result<(), Errno> {
    syscall(cpu, SYSCALL_ENV_SET_TRAPFRAME, [env(id), frame_va, 0, 0, 0]).map(drop)
}

/// Registers the page-fault upcall entry for `id`.
pub fn env_set_pgfault_upcall(cpu: &mut Cpu<'_>, id: EnvId, entry: usize) -> Result<(), Errno> {
    syscall(cpu, SYSCALL_ENV_SET_PGFAULT_UPCALL, [env(id), entry, 0, 0, 0]).map(drop)
}

/// Single rendezvous attempt; `Errno::IpcNotRecv` when `to` is not waiting.
pub fn ipc_try_send(
    cpu: &mut Cpu<'_>,
    to: EnvId,
    value: u32,
    page: Option<(usize, Perm)>,
) -> Result<(), Errno> {
    let (src_va, prot) = page.map_or((UTOP, 0), |(va, prot)| (va, perm(prot)));
    syscall(cpu, SYSCALL_IPC_TRY_SEND, [env(to), value as usize, src_va, prot, 0]).map(drop)
}

/// Blocks the caller in receive, optionally accepting a page at `dst_va`.
///
/// `Ok(())` means the caller is now waiting; the message arrives in its mailbox.
pub fn ipc_recv(cpu: &mut Cpu<'_>, dst_va: Option<usize>) -> Result<(), Errno> {
    match cpu.ecall(SYSCALL_IPC_RECV, [dst_va.unwrap_or(UTOP), 0, 0, 0, 0]) {
        Ecall::Blocked => Ok(()),
        Ecall::Returned(ret) => Errno::decode(ret).map(drop),
        other => Err(unexpected(cpu, SYSCALL_IPC_RECV, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon::{Kernel, KernelConfig, ProgramImage};

    #[test]
    fn stray_block_is_logged() {
        let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
        let image = ProgramImage { text: &[0; 8], data: &[], bss: 0 };
        let id = kernel.spawn(&image).unwrap().id;
        let mut cpu = kernel.cpu(id).unwrap();
        assert_eq!(syscall(&mut cpu, SYSCALL_IPC_RECV, [UTOP, 0, 0, 0, 0]), Err(Errno::BadEnv));
        assert!(axon::log::contains(&format!(
            "[{id}] syscall {SYSCALL_IPC_RECV} ended in unexpected Blocked"
        )));
        assert!(kernel.env(id).unwrap().mailbox().is_receiving());
    }
}
