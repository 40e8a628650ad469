// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Copy-on-write fork built from page primitives and fault upcalls
//! OWNERS: @runtime
//! PUBLIC API: fork(), cow_fault(), ForkedChild, ForkError, ForkStep
//! DEPENDS_ON: sys, process::Process, pgfault
//! INVARIANTS: writable and COW pages are COW in both parent and child afterwards; the
//!             live stack is copied eagerly; exception stacks are never shared

use core::fmt;

use axon::{Cpu, Kernel};
use axon_abi::{
    page_round_down, EnvId, EnvStatus, Errno, FaultCode, Perm, UTrapframe, PAGE_SIZE, PFTEMP,
    USTACKTOP, UTEMP, UTEXT, UXSTACKTOP,
};

use crate::pgfault::UPCALL_ENTRY;
use crate::process::{Process, Runtime, UserPanic};
use crate::sys;

/// Fork step that failed after the child was created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkStep {
    /// Installing the copy-on-write fault handler.
    Handler,
    /// Sharing the program page at `va`.
    Duplicate {
        /// Page being shared.
        va: usize,
    },
    /// Copying the live stack page at `va`.
    Stack {
        /// Stack page being copied.
        va: usize,
    },
    /// Allocating the child's exception stack.
    ExceptionStack,
    /// Registering the child's upcall.
    Upcall,
    /// Marking the child runnable.
    Start,
}

impl fmt::Display for ForkStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handler => f.write_str("set_pgfault_handler"),
            Self::Duplicate { va } => write!(f, "duppage {va:#010x}"),
            Self::Stack { va } => write!(f, "copy stack {va:#010x}"),
            Self::ExceptionStack => f.write_str("exception stack"),
            Self::Upcall => f.write_str("set upcall"),
            Self::Start => f.write_str("set status"),
        }
    }
}

/// Why [`fork`] did not produce a child.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkError {
    /// No child could be created; the parent carries on.
    Exofork(Errno),
    /// The parent was destroyed part way through.
    Panicked(UserPanic),
}

impl fmt::Display for ForkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exofork(err) => write!(f, "exofork: {err}"),
            Self::Panicked(cause) => write!(f, "{cause}"),
        }
    }
}

/// Child returned by [`fork`]; its copy of the process-local state still names the parent
/// until [`ForkedChild::resume`] runs.
#[derive(Debug)]
#[must_use]
pub struct ForkedChild {
    id: EnvId,
    runtime: Runtime,
}

impl ForkedChild {
    /// Id of the new environment (the parent's return value from fork).
    pub fn id(&self) -> EnvId {
        self.id
    }

    /// Continues in the child: fork returns zero there, and the child refreshes its cached
    /// own id before doing anything else.
    pub fn resume(self, kernel: &mut Kernel) -> Result<Process, Errno> {
        let mut cpu = kernel.cpu(self.id).map_err(|_| Errno::BadEnv)?;
        let ret = cpu.frame().map_err(|_| Errno::BadEnv)?.ret();
        if ret != 0 {
            return Err(Errno::Inval);
        }
        let this_env = sys::getenvid(&mut cpu)?;
        Ok(Process::with_runtime(self.id, Runtime { this_env, ..self.runtime }))
    }
}

/// Copy-on-write fork of `parent`.
///
/// Failure to create the child is returned. Any later failure destroys `parent`.
pub fn fork(parent: &mut Process, kernel: &mut Kernel) -> Result<ForkedChild, ForkError> {
    if let Err(err) = parent.set_pgfault_handler(kernel, cow_fault) {
        return Err(abort(parent, kernel, ForkStep::Handler, err));
    }

    let child = parent
        .cpu(kernel)
        .and_then(|mut cpu| sys::exofork(&mut cpu))
        .map_err(ForkError::Exofork)?;

    let populated = parent
        .cpu(kernel)
        .map_err(|err| (ForkStep::Start, err))
        .and_then(|mut cpu| populate(&mut cpu, child, parent.brk()));
    if let Err((step, err)) = populated {
        return Err(abort(parent, kernel, step, err));
    }

    axon::log_debug!(target: "user", "[{}] fork -> {}", parent.env_id(), child);
    Ok(ForkedChild { id: child, runtime: parent.runtime })
}

fn abort(parent: &mut Process, kernel: &mut Kernel, step: ForkStep, err: Errno) -> ForkError {
    ForkError::Panicked(parent.fatal(kernel, UserPanic::Fork { step, err }))
}

/// Steps after exofork; all run on the parent's processor.
fn populate(cpu: &mut Cpu<'_>, child: EnvId, brk: usize) -> Result<(), (ForkStep, Errno)> {
    for va in (UTEXT..brk).step_by(PAGE_SIZE) {
        if let Some(perm) = cpu.query(va) {
            duppage(cpu, child, va, perm).map_err(|err| (ForkStep::Duplicate { va }, err))?;
        }
    }

    let sp = cpu.frame().map_err(|_| (ForkStep::Start, Errno::BadEnv))?.sp();
    // The stack grows down from USTACKTOP and always lies above the heap.
    let stack_bottom = page_round_down(sp.saturating_sub(1)).max(brk);
    for va in (stack_bottom..USTACKTOP).step_by(PAGE_SIZE) {
        if cpu.query(va).is_some() {
            copy_stack_page(cpu, child, va).map_err(|err| (ForkStep::Stack { va }, err))?;
        }
    }

    let rw = Perm::USER_PRESENT | Perm::WRITABLE;
    sys::page_alloc(cpu, child, UXSTACKTOP - PAGE_SIZE, rw)
        .map_err(|err| (ForkStep::ExceptionStack, err))?;
    sys::env_set_pgfault_upcall(cpu, child, UPCALL_ENTRY).map_err(|err| (ForkStep::Upcall, err))?;
    sys::env_set_status(cpu, child, EnvStatus::Runnable).map_err(|err| (ForkStep::Start, err))
}

/// Shares the page at `va` with `child`.
fn duppage(cpu: &mut Cpu<'_>, child: EnvId, va: usize, perm: Perm) -> Result<(), Errno> {
    if perm.intersects(Perm::WRITABLE | Perm::COW) {
        let cow = Perm::USER_PRESENT | Perm::COW;
        sys::page_map(cpu, EnvId::SELF, va, child, va, cow)?;
        // Downgrade our own mapping too, or the child would see our writes.
        sys::page_map(cpu, EnvId::SELF, va, EnvId::SELF, va, cow)
    } else {
        sys::page_map(cpu, EnvId::SELF, va, child, va, perm & Perm::SYSCALL)
    }
}

fn copy_stack_page(cpu: &mut Cpu<'_>, child: EnvId, va: usize) -> Result<(), Errno> {
    let rw = Perm::USER_PRESENT | Perm::WRITABLE;
    let mut page = vec![0_u8; PAGE_SIZE];
    sys::page_alloc(cpu, EnvId::SELF, UTEMP, rw)?;
    cpu.load(va, &mut page).map_err(|_| Errno::Fault)?;
    cpu.store(UTEMP, &page).map_err(|_| Errno::Fault)?;
    sys::page_map(cpu, EnvId::SELF, UTEMP, child, va, rw)?;
    sys::page_unmap(cpu, EnvId::SELF, UTEMP)
}

/// Page fault handler installed by [`fork`]: gives the faulting environment a private,
/// writable copy of a copy-on-write page.
///
/// Anything other than a write to a COW page is fatal.
pub fn cow_fault(
    process: &mut Process,
    kernel: &mut Kernel,
    utf: &UTrapframe,
) -> Result<(), UserPanic> {
    let va = page_round_down(utf.fault_va);
    let is_cow = process.query(kernel, va).is_some_and(|perm| perm.contains(Perm::COW));
    if !utf.err.contains(FaultCode::WRITE) || !is_cow {
        let cause = UserPanic::Fault { va: utf.fault_va, code: utf.err, ip: utf.regs.sepc };
        return Err(process.fatal(kernel, cause));
    }

    let copied = process
        .cpu(kernel)
        .map_err(|err| ("cpu", err))
        .and_then(|mut cpu| materialize(&mut cpu, va));
    match copied {
        Ok(()) => Ok(()),
        Err((op, err)) => Err(process.fatal(kernel, UserPanic::Syscall { op, err })),
    }
}

fn materialize(cpu: &mut Cpu<'_>, va: usize) -> Result<(), (&'static str, Errno)> {
    let rw = Perm::USER_PRESENT | Perm::WRITABLE;
    let mut page = vec![0_u8; PAGE_SIZE];
    sys::page_alloc(cpu, EnvId::SELF, PFTEMP, rw).map_err(|err| ("page_alloc", err))?;
    cpu.load(va, &mut page).map_err(|_| ("copy", Errno::Fault))?;
    cpu.store(PFTEMP, &page).map_err(|_| ("copy", Errno::Fault))?;
    sys::page_map(cpu, EnvId::SELF, PFTEMP, EnvId::SELF, va, rw).map_err(|err| ("page_map", err))?;
    sys::page_unmap(cpu, EnvId::SELF, PFTEMP).map_err(|err| ("page_unmap", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon::{KernelConfig, ProgramImage};

    fn boot(config: KernelConfig) -> (Kernel, Process) {
        let mut kernel = Kernel::new(config).unwrap();
        let image = ProgramImage { text: &[0x13; 32], data: &[7; 16], bss: PAGE_SIZE };
        let spawned = kernel.spawn(&image).unwrap();
        (kernel, Process::from_spawned(&spawned))
    }

    #[test]
    fn text_stays_shared_read_only() {
        let (mut kernel, mut parent) = boot(KernelConfig::default());
        let child = fork(&mut parent, &mut kernel).unwrap().resume(&mut kernel).unwrap();
        assert_eq!(parent.query(&mut kernel, UTEXT), Some(Perm::USER_PRESENT));
        assert_eq!(child.query(&mut kernel, UTEXT), Some(Perm::USER_PRESENT));
        let text = |id| {
            let env = kernel.env(id).unwrap();
            env.space().lookup(axon::types::VirtAddr::user_page(UTEXT).unwrap()).unwrap().0.pfn()
        };
        assert_eq!(text(parent.env_id()), text(child.env_id()));
    }

    #[test]
    fn stack_and_exception_stack_are_private() {
        let (mut kernel, mut parent) = boot(KernelConfig::default());
        let stack = USTACKTOP - PAGE_SIZE;
        parent.write_u32(&mut kernel, stack + 8, 0xaa).unwrap();
        let mut child = fork(&mut parent, &mut kernel).unwrap().resume(&mut kernel).unwrap();

        let rw = Some(Perm::USER_PRESENT | Perm::WRITABLE);
        for va in [stack, UXSTACKTOP - PAGE_SIZE] {
            assert_eq!(parent.query(&mut kernel, va), rw);
            assert_eq!(child.query(&mut kernel, va), rw);
            let frame = |id| {
                let env = kernel.env(id).unwrap();
                env.space().lookup(axon::types::VirtAddr::user_page(va).unwrap()).unwrap().0.pfn()
            };
            assert_ne!(frame(parent.env_id()), frame(child.env_id()));
        }
        assert_eq!(child.read_u32(&mut kernel, stack + 8), Ok(0xaa));
        assert_eq!(parent.query(&mut kernel, UTEMP), None);
    }

    #[test]
    fn child_refreshes_its_own_id() {
        let (mut kernel, mut parent) = boot(KernelConfig::default());
        let forked = fork(&mut parent, &mut kernel).unwrap();
        let id = forked.id();
        assert_eq!(forked.runtime.this_env, parent.env_id());
        let child = forked.resume(&mut kernel).unwrap();
        assert_eq!(child.env_id(), id);
        assert_eq!(child.this_env(), id);
        assert_eq!(parent.this_env(), parent.env_id());
        assert_eq!(kernel.env(id).unwrap().parent(), Some(parent.env_id()));
    }

    #[test]
    fn read_faults_are_fatal() {
        let (mut kernel, mut parent) = boot(KernelConfig::default());
        let _child = fork(&mut parent, &mut kernel).unwrap();
        let result = parent.read_u32(&mut kernel, 0x1000_0000);
        assert!(matches!(result, Err(UserPanic::Fault { va: 0x1000_0000, .. })));
        assert!(kernel.env(parent.env_id()).is_err());
    }

    #[test]
    fn writes_to_read_only_text_are_fatal() {
        let (mut kernel, mut parent) = boot(KernelConfig::default());
        let _child = fork(&mut parent, &mut kernel).unwrap();
        let result = parent.write_u32(&mut kernel, UTEXT, 0);
        assert!(matches!(
            result,
            Err(UserPanic::Fault { va: UTEXT, code, .. }) if code.contains(FaultCode::WRITE)
        ));
    }
}
