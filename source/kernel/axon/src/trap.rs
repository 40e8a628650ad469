// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Trap paths of the emulated CPU: syscall entry and page-fault delivery
//! OWNERS: @kernel-team
//! PUBLIC API: handle_ecall(), deliver_page_fault(), encode_error(), Trap, Ecall, UpcallFrame
//! DEPENDS_ON: syscall::{SyscallTable, api}, env::EnvTable, sched::Scheduler
//! INVARIANTS: a faulting environment either gets an exception record inside its exception
//!             stack page or is destroyed; syscall errors reach user space as negated Errno

use axon_abi::{Errno, UTrapframe, PAGE_SIZE, REG_A0, REG_A7, UXSTACKTOP};

use crate::env::{EnvError, EnvTable};
use crate::ipc::IpcError;
use crate::mm::PageFault;
use crate::sched::Scheduler;
use crate::syscall::{api, Args, Error as SysError, SyscallTable};
use crate::types::EnvId;

/// Word the kernel leaves free below a nested exception record.
const SCRATCH_WORD: usize = 8;

/// Where the environment resumes after a fault was reflected to user space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpcallFrame {
    /// Registered upcall entry point; now the saved program counter.
    pub entry: usize,
    /// Address of the exception record; now the saved stack pointer.
    pub record_va: usize,
}

/// Outcome of a page fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trap {
    /// The record was pushed and the environment will resume in its upcall.
    Upcall(UpcallFrame),
    /// The environment was destroyed.
    Killed,
}

/// Outcome of a syscall trap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ecall {
    /// Raw value written to the caller's `a0`.
    Returned(isize),
    /// The caller is waiting in receive; a sender completes the call.
    Blocked,
    /// The caller destroyed itself.
    Exited,
}

/// Services the syscall encoded in the caller's saved registers (`a7` number, `a0..a5`
/// arguments) and stores the result back into `a0`.
pub fn handle_ecall(table: &SyscallTable, ctx: &mut api::Context<'_>) -> Ecall {
    let caller = ctx.caller;
    let (number, args) = match ctx.envs.get_mut(caller) {
        Ok(env) => {
            let frame = env.frame_mut();
            // Resume after the ecall instruction; children copied by exofork inherit this.
            frame.sepc = frame.sepc.wrapping_add(4);
            let x = &frame.x;
            (
                x[REG_A7],
                Args::new([
                    x[REG_A0],
                    x[REG_A0 + 1],
                    x[REG_A0 + 2],
                    x[REG_A0 + 3],
                    x[REG_A0 + 4],
                    x[REG_A0 + 5],
                ]),
            )
        }
        Err(_) => return Ecall::Exited,
    };

    let ret = match table.dispatch(number, ctx, &args) {
        Ok(value) => value as isize,
        Err(SysError::Blocked) => return Ecall::Blocked,
        Err(SysError::EnvExit) => return Ecall::Exited,
        Err(err) => {
            crate::log_debug!(target: "syscall", "[{}] syscall {} -> {}", caller, number, err);
            encode_error(err).as_ret()
        }
    };
    match ctx.envs.get_mut(caller) {
        Ok(env) => {
            env.frame_mut().set_ret(ret as usize);
            Ecall::Returned(ret)
        }
        // A handler may tear down the caller as a side effect (destroying a parent that
        // was itself).
        Err(_) => Ecall::Exited,
    }
}

/// Maps the dispatcher error onto the user-visible errno.
pub fn encode_error(err: SysError) -> Errno {
    match err {
        SysError::InvalidSyscall => Errno::NoSys,
        SysError::InvalidArgument => Errno::Inval,
        SysError::Env(env) => env_errno(env),
        SysError::Map(_) => Errno::NoMem,
        SysError::Ipc(IpcError::NotReceiving) => Errno::IpcNotRecv,
        SysError::Ipc(IpcError::InvalidSource) => Errno::Inval,
        SysError::Ipc(IpcError::Env(env)) => env_errno(env),
        SysError::Ipc(IpcError::Map(_)) => Errno::NoMem,
        // Never surfaced to user space; handle_ecall intercepts both.
        SysError::EnvExit | SysError::Blocked => Errno::Inval,
    }
}

fn env_errno(err: EnvError) -> Errno {
    match err {
        EnvError::BadEnv | EnvError::NotRunnable => Errno::BadEnv,
        EnvError::NoFreeEnv => Errno::NoFreeEnv,
        EnvError::NoMemory => Errno::NoMem,
    }
}

/// Reflects `fault` to the environment's upcall, or destroys the environment.
pub fn deliver_page_fault(
    envs: &mut EnvTable,
    scheduler: &mut Scheduler,
    id: EnvId,
    fault: PageFault,
) -> Trap {
    let Ok(env) = envs.get_mut(id) else {
        return Trap::Killed;
    };
    let regs = *env.frame();

    let Some(entry) = env.pgfault_upcall() else {
        crate::log_error!(
            target: "trap",
            "[{}] user fault va {:#010x} code {:?} ip {:#010x}",
            id,
            fault.va,
            fault.code,
            regs.sepc
        );
        kill(envs, scheduler, id);
        return Trap::Killed;
    };

    let stack_base = UXSTACKTOP - PAGE_SIZE;
    let sp = regs.sp();
    let top = if (stack_base..UXSTACKTOP).contains(&sp) {
        // Recursive fault: push below the running handler's frame.
        sp.checked_sub(SCRATCH_WORD)
    } else {
        Some(UXSTACKTOP)
    };
    let record_va = match top.and_then(|top| top.checked_sub(UTrapframe::SIZE)) {
        Some(va) if va >= stack_base => va,
        _ => {
            crate::log_error!(target: "trap", "[{}] exception stack overflow", id);
            kill(envs, scheduler, id);
            return Trap::Killed;
        }
    };

    let record = UTrapframe { fault_va: fault.va, err: fault.code, regs };
    if env.space().write(record_va, &record.to_le_bytes()).is_err() {
        crate::log_error!(
            target: "trap",
            "[{}] exception stack not mapped writable at {:#010x}",
            id,
            record_va
        );
        kill(envs, scheduler, id);
        return Trap::Killed;
    }

    let frame = env.frame_mut();
    frame.sepc = entry;
    frame.set_sp(record_va);
    crate::log_trace!(target: "trap", "[{}] upcall {:#x} record {:#x}", id, entry, record_va);
    Trap::Upcall(UpcallFrame { entry, record_va })
}

fn kill(envs: &mut EnvTable, scheduler: &mut Scheduler, id: EnvId) {
    if envs.destroy(id, scheduler).is_err() {
        crate::log_warn!(target: "trap", "[{}] already gone", id);
    }
}
