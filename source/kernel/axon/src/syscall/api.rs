// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: install_handlers(table), Context
//! DEPENDS_ON: env::EnvTable, mm::FramePool, sched::Scheduler, ipc
//! INVARIANTS: Decode→Check→Execute; every argument check precedes every side effect
//!
//! Check order per primitive:
//!
//! | primitive        | order                                                         |
//! |------------------|---------------------------------------------------------------|
//! | page_alloc       | va, perm, target (perm), frame alloc, map                     |
//! | page_map         | src va, dst va, perm, src (perm), dst (perm), src mapped, W   |
//! | page_unmap       | va, target (perm)                                             |
//! | set_pgfault      | target (perm)                                                 |
//! | ipc_try_send     | src va, perm, target, src mapped, W, receiving, map           |
//! | ipc_recv         | dst va                                                        |
//! | env_set_status   | status, target (perm)                                         |
//! | env_set_tf       | target (perm), frame copy-in                                  |
//! | env_destroy      | target (perm)                                                 |
//!
//! Address and permission failures (`Inval`) therefore win over identity failures
//! (`BadEnv`) on the page primitives; IPC send reports an unknown target before it looks
//! at the offered page.

use axon_abi::{
    EnvStatus, Perm, TrapFrame, SSTATUS_SPIE, SSTATUS_SPP, SYSCALL_ENV_DESTROY,
    SYSCALL_ENV_SET_PGFAULT_UPCALL, SYSCALL_ENV_SET_STATUS, SYSCALL_ENV_SET_TRAPFRAME,
    SYSCALL_EXOFORK, SYSCALL_GETENVID, SYSCALL_IPC_RECV, SYSCALL_IPC_TRY_SEND,
    SYSCALL_PAGE_ALLOC, SYSCALL_PAGE_MAP, SYSCALL_PAGE_UNMAP, SYSCALL_YIELD, UTOP,
};

use super::{Args, Error, SysResult, SyscallTable};
use crate::env::{EnvError, EnvTable, Requester};
use crate::ipc::{self, SendRequest};
use crate::mm::{FramePool, MapError};
use crate::sched::Scheduler;
use crate::types::{EnvId, VirtAddr};

/// Kernel state a handler may touch, plus the identity of the calling environment.
pub struct Context<'a> {
    pub caller: EnvId,
    pub envs: &'a mut EnvTable,
    pub frames: &'a FramePool,
    pub scheduler: &'a mut Scheduler,
}

impl<'a> Context<'a> {
    /// Creates a context for a syscall issued by `caller`.
    pub fn new(
        caller: EnvId,
        envs: &'a mut EnvTable,
        frames: &'a FramePool,
        scheduler: &'a mut Scheduler,
    ) -> Self {
        Self { caller, envs, frames, scheduler }
    }

    fn requester(&self) -> Requester {
        Requester::Env(self.caller)
    }
}

// Typed decoders for seL4-style Decode→Check→Execute

#[inline]
fn decode_env(raw: usize) -> Result<EnvId, Error> {
    u32::try_from(raw).map(EnvId::from_raw).map_err(|_| EnvError::BadEnv.into())
}

#[inline]
fn decode_page(raw: usize) -> Result<VirtAddr, Error> {
    VirtAddr::user_page(raw).ok_or(Error::InvalidArgument)
}

/// Optional page argument: anything at or above `UTOP` means "no page".
#[inline]
fn decode_optional_page(raw: usize) -> Result<Option<VirtAddr>, Error> {
    if raw >= UTOP {
        return Ok(None);
    }
    decode_page(raw).map(Some)
}

#[inline]
fn decode_perm(raw: usize) -> Result<Perm, Error> {
    Perm::from_raw(raw).ok_or(Error::InvalidArgument)
}

#[inline]
fn check_perm(perm: Perm) -> Result<(), Error> {
    if perm.is_user_settable() {
        Ok(())
    } else {
        Err(Error::InvalidArgument)
    }
}

#[derive(Copy, Clone)]
struct PageAllocArgsTyped {
    va: VirtAddr,
    perm: Perm,
    env: usize,
}

impl PageAllocArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let va = decode_page(args.get(1))?;
        let perm = decode_perm(args.get(2))?;
        Ok(Self { va, perm, env: args.get(0) })
    }

    /// Yields the target id once the value arguments are known to be valid.
    #[inline]
    fn check(&self) -> Result<EnvId, Error> {
        check_perm(self.perm)?;
        decode_env(self.env)
    }
}

#[derive(Copy, Clone)]
struct PageMapArgsTyped {
    src_va: VirtAddr,
    dst_va: VirtAddr,
    perm: Perm,
    src_env: usize,
    dst_env: usize,
}

impl PageMapArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let src_va = decode_page(args.get(1))?;
        let dst_va = decode_page(args.get(3))?;
        let perm = decode_perm(args.get(4))?;
        Ok(Self { src_va, dst_va, perm, src_env: args.get(0), dst_env: args.get(2) })
    }

    #[inline]
    fn check(&self) -> Result<(EnvId, EnvId), Error> {
        check_perm(self.perm)?;
        Ok((decode_env(self.src_env)?, decode_env(self.dst_env)?))
    }
}

#[derive(Copy, Clone)]
struct PageUnmapArgsTyped {
    va: VirtAddr,
    env: EnvId,
}

impl PageUnmapArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let va = decode_page(args.get(1))?;
        let env = decode_env(args.get(0))?;
        Ok(Self { va, env })
    }
}

#[derive(Copy, Clone)]
struct SendArgsTyped {
    env: usize,
    value: u32,
    page: Option<(VirtAddr, Perm)>,
}

impl SendArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let page = match decode_optional_page(args.get(2))? {
            Some(va) => Some((va, decode_perm(args.get(3))?)),
            None => None,
        };
        // Register value is 32-bit on the wire.
        let value = args.get(1) as u32;
        Ok(Self { env: args.get(0), value, page })
    }

    #[inline]
    fn check(&self) -> Result<EnvId, Error> {
        if let Some((_, perm)) = self.page {
            check_perm(perm)?;
        }
        decode_env(self.env)
    }
}

#[derive(Copy, Clone)]
struct SetStatusArgsTyped {
    status: EnvStatus,
    env: usize,
}

impl SetStatusArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let status = EnvStatus::from_raw(args.get(1)).ok_or(Error::InvalidArgument)?;
        Ok(Self { status, env: args.get(0) })
    }

    #[inline]
    fn check(&self) -> Result<EnvId, Error> {
        match self.status {
            EnvStatus::Runnable | EnvStatus::NotRunnable => decode_env(self.env),
            _ => Err(Error::InvalidArgument),
        }
    }
}

/// Registers the default set of syscall handlers.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(SYSCALL_GETENVID, sys_getenvid);
    table.register(SYSCALL_ENV_DESTROY, sys_env_destroy);
    table.register(SYSCALL_PAGE_ALLOC, sys_page_alloc);
    table.register(SYSCALL_PAGE_MAP, sys_page_map);
    table.register(SYSCALL_PAGE_UNMAP, sys_page_unmap);
    table.register(SYSCALL_EXOFORK, sys_exofork);
    table.register(SYSCALL_ENV_SET_STATUS, sys_env_set_status);
    table.register(SYSCALL_ENV_SET_TRAPFRAME, sys_env_set_trapframe);
    table.register(SYSCALL_ENV_SET_PGFAULT_UPCALL, sys_env_set_pgfault_upcall);
    table.register(SYSCALL_YIELD, sys_yield);
    table.register(SYSCALL_IPC_TRY_SEND, sys_ipc_try_send);
    table.register(SYSCALL_IPC_RECV, sys_ipc_recv);
}

fn sys_getenvid(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.caller.as_raw() as usize)
}

fn sys_env_destroy(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let env = decode_env(args.get(0))?;
    let target = ctx.envs.resolve(env, ctx.requester(), true)?;
    ctx.envs.destroy(target, ctx.scheduler)?;
    if target == ctx.caller {
        crate::log_info!(target: "syscall", "[{}] exiting gracefully", target);
        return Err(Error::EnvExit);
    }
    crate::log_info!(target: "syscall", "[{}] destroying {}", ctx.caller, target);
    Ok(0)
}

fn sys_yield(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    ctx.envs.get_mut(ctx.caller)?.set_status(EnvStatus::Runnable);
    ctx.scheduler.yield_current();
    if let Some(next) = ctx.scheduler.schedule_next() {
        if let Ok(env) = ctx.envs.get_mut(next) {
            env.set_status(EnvStatus::Running);
        }
    }
    Ok(0)
}

fn sys_exofork(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    let parent_frame = *ctx.envs.get(ctx.caller)?.frame();
    let child = ctx.envs.alloc(ctx.frames, Some(ctx.caller))?;
    let frame = ctx.envs.get_mut(child)?.frame_mut();
    *frame = parent_frame;
    // The child observes exofork returning zero.
    frame.set_ret(0);
    crate::log_debug!(target: "syscall", "[{}] exofork -> {}", ctx.caller, child);
    Ok(child.as_raw() as usize)
}

fn sys_env_set_status(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = SetStatusArgsTyped::decode(args)?;
    let env = typed.check()?;
    let target = ctx.envs.resolve(env, ctx.requester(), true)?;
    ctx.envs.get_mut(target)?.set_status(typed.status);
    match typed.status {
        EnvStatus::Runnable => ctx.scheduler.enqueue(target),
        _ => ctx.scheduler.remove(target),
    }
    Ok(0)
}

fn sys_env_set_trapframe(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let env = decode_env(args.get(0))?;
    let target = ctx.envs.resolve(env, ctx.requester(), true)?;

    let mut bytes = [0_u8; TrapFrame::SIZE];
    ctx.envs
        .get(ctx.caller)?
        .space()
        .read(args.get(1), &mut bytes)
        .map_err(|_| Error::InvalidArgument)?;
    let mut frame = TrapFrame::from_le_bytes(&bytes);
    // Always resume in user mode with interrupts enabled.
    frame.sstatus = (frame.sstatus | SSTATUS_SPIE) & !SSTATUS_SPP;
    *ctx.envs.get_mut(target)?.frame_mut() = frame;
    Ok(0)
}

fn sys_env_set_pgfault_upcall(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let env = decode_env(args.get(0))?;
    let entry = args.get(1);
    ctx.envs.resolve_mut(env, ctx.requester(), true)?.set_pgfault_upcall(entry);
    Ok(0)
}

fn sys_page_alloc(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = PageAllocArgsTyped::decode(args)?;
    let env = typed.check()?;
    let target = ctx.envs.resolve(env, ctx.requester(), true)?;
    let frame = ctx.frames.alloc().ok_or(MapError::OutOfMemory)?;
    ctx.envs.get_mut(target)?.space_mut().map(ctx.frames, &frame, typed.va, typed.perm)?;
    Ok(0)
}

fn sys_page_map(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = PageMapArgsTyped::decode(args)?;
    let (src_env, dst_env) = typed.check()?;
    let src = ctx.envs.resolve(src_env, ctx.requester(), true)?;
    let dst = ctx.envs.resolve(dst_env, ctx.requester(), true)?;

    let (frame, current) =
        ctx.envs.get(src)?.space().lookup(typed.src_va).ok_or(Error::InvalidArgument)?;
    if typed.perm.contains(Perm::WRITABLE) && !current.contains(Perm::WRITABLE) {
        return Err(Error::InvalidArgument);
    }
    let frame = frame.clone();
    ctx.envs.get_mut(dst)?.space_mut().map(ctx.frames, &frame, typed.dst_va, typed.perm)?;
    Ok(0)
}

fn sys_page_unmap(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = PageUnmapArgsTyped::decode(args)?;
    ctx.envs.resolve_mut(typed.env, ctx.requester(), true)?.space_mut().unmap(typed.va);
    Ok(0)
}

fn sys_ipc_try_send(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = SendArgsTyped::decode(args)?;
    let target = typed.check()?;
    let req = SendRequest { target, value: typed.value, page: typed.page };
    ipc::try_send(ctx.envs, ctx.frames, ctx.scheduler, ctx.caller, &req)?;
    Ok(0)
}

fn sys_ipc_recv(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let dst_va = decode_optional_page(args.get(0))?;
    ipc::recv(ctx.envs, ctx.scheduler, ctx.caller, dst_va)?;
    Err(Error::Blocked)
}
