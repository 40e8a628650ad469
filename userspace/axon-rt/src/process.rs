// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: User-side view of one environment and its process-local state
//! OWNERS: @runtime
//! PUBLIC API: Process::{read, write, read_u32, write_u32, sbrk, query, cpu}, UserPanic
//! DEPENDS_ON: axon::Kernel::cpu, sys, pgfault
//! INVARIANTS: a fault is retried only after the registered handler ran and the trap-time
//!             registers were restored; every fatal condition is logged and ends the env

use core::fmt;

use axon::{Cpu, Kernel, Spawned, Trap, UpcallFrame};
use axon_abi::{page_round_up, EnvId, Errno, FaultCode, Perm, UTrapframe, PAGE_SIZE, USTACKTOP};

use crate::fork::ForkStep;
use crate::pgfault::{PgfaultHandler, UPCALL_ENTRY};
use crate::sys;

/// Consecutive deliveries at one address before the fault counts as unresolved.
pub const MAX_FAULT_RETRIES: usize = 4;

/// Fatal condition that ended an environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserPanic {
    /// Fault the registered handler refused to repair.
    Fault {
        /// Faulting address.
        va: usize,
        /// Fault cause.
        code: FaultCode,
        /// Program counter at the time of the fault.
        ip: usize,
    },
    /// The same access kept faulting after the handler ran.
    Unresolved {
        /// Faulting address.
        va: usize,
    },
    /// The kernel transferred control to an entry this runtime did not register.
    UnknownUpcall {
        /// Entry the kernel jumped to.
        entry: usize,
    },
    /// A fault arrived with no handler installed in the runtime.
    NoHandler {
        /// Faulting address.
        va: usize,
    },
    /// A primitive failed where the runtime cannot continue.
    Syscall {
        /// Operation that failed.
        op: &'static str,
        /// Kernel error.
        err: Errno,
    },
    /// A fork step after exofork failed; the half-built child cannot be used.
    Fork {
        /// Step that failed.
        step: ForkStep,
        /// Kernel error.
        err: Errno,
    },
    /// The kernel destroyed the environment (no upcall, or exception stack unusable).
    Killed,
}

impl fmt::Display for UserPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fault { va, code, ip } => {
                write!(f, "unrecoverable fault at va {va:#010x} code {code:?} ip {ip:#010x}")
            }
            Self::Unresolved { va } => write!(f, "fault at va {va:#010x} not resolved"),
            Self::UnknownUpcall { entry } => write!(f, "unknown upcall entry {entry:#010x}"),
            Self::NoHandler { va } => write!(f, "no page fault handler for va {va:#010x}"),
            Self::Syscall { op, err } => write!(f, "{op}: {err}"),
            Self::Fork { step, err } => write!(f, "fork: {step}: {err}"),
            Self::Killed => f.write_str("destroyed by the kernel"),
        }
    }
}

/// Process-local state; fork copies it into the child along with the rest of memory.
#[derive(Clone, Copy)]
pub(crate) struct Runtime {
    /// Cached own id (`thisenv`).
    pub(crate) this_env: EnvId,
    pub(crate) pgfault_handler: Option<PgfaultHandler>,
    pub(crate) brk: usize,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("this_env", &self.this_env)
            .field("pgfault_handler", &self.pgfault_handler.is_some())
            .field("brk", &self.brk)
            .finish()
    }
}

/// One environment as seen from user space.
#[derive(Debug)]
pub struct Process {
    env: EnvId,
    pub(crate) runtime: Runtime,
}

impl Process {
    /// Wraps an environment created by [`Kernel::spawn`].
    pub fn from_spawned(spawned: &Spawned) -> Self {
        Self::new(spawned.id, spawned.brk)
    }

    /// Wraps environment `env` whose program image ends at `brk`.
    pub fn new(env: EnvId, brk: usize) -> Self {
        Self { env, runtime: Runtime { this_env: env, pgfault_handler: None, brk } }
    }

    pub(crate) fn with_runtime(env: EnvId, runtime: Runtime) -> Self {
        Self { env, runtime }
    }

    /// Environment this process executes in.
    pub fn env_id(&self) -> EnvId {
        self.env
    }

    /// The process's cached notion of its own id.
    pub fn this_env(&self) -> EnvId {
        self.runtime.this_env
    }

    /// Current program break.
    pub fn brk(&self) -> usize {
        self.runtime.brk
    }

    /// Puts this environment on the processor.
    pub fn cpu<'k>(&self, kernel: &'k mut Kernel) -> Result<Cpu<'k>, Errno> {
        kernel.cpu(self.env).map_err(|_| Errno::BadEnv)
    }

    /// Permission bits of this process's own mapping at `va`.
    pub fn query(&self, kernel: &mut Kernel, va: usize) -> Option<Perm> {
        self.cpu(kernel).ok()?.query(va)
    }

    /// Grows the heap by `increment` bytes rounded up to whole pages; returns the old break.
    pub fn sbrk(&mut self, kernel: &mut Kernel, increment: usize) -> Result<usize, Errno> {
        let old = self.runtime.brk;
        let new = old
            .checked_add(increment)
            .map(page_round_up)
            .filter(|brk| *brk <= USTACKTOP - PAGE_SIZE)
            .ok_or(Errno::NoMem)?;
        let mut cpu = self.cpu(kernel)?;
        for va in (old..new).step_by(PAGE_SIZE) {
            sys::page_alloc(&mut cpu, EnvId::SELF, va, Perm::USER_PRESENT | Perm::WRITABLE)?;
        }
        self.runtime.brk = new;
        Ok(old)
    }

    /// Loads `buf.len()` bytes at `va`, servicing page faults on the way.
    pub fn read(
        &mut self,
        kernel: &mut Kernel,
        va: usize,
        buf: &mut [u8],
    ) -> Result<(), UserPanic> {
        self.access(kernel, |cpu| cpu.load(va, buf))
    }

    /// Stores `data` at `va`, servicing page faults on the way.
    pub fn write(
        &mut self,
        kernel: &mut Kernel,
        va: usize,
        data: &[u8],
    ) -> Result<(), UserPanic> {
        self.access(kernel, |cpu| cpu.store(va, data))
    }

    /// Repeats `op` until it completes. A span over several pages may fault once per page;
    /// only back-to-back faults at the same address count towards `MAX_FAULT_RETRIES`.
    fn access<F>(&mut self, kernel: &mut Kernel, mut op: F) -> Result<(), UserPanic>
    where
        F: FnMut(&mut Cpu<'_>) -> Result<(), Trap>,
    {
        let mut last_fault = None;
        let mut repeats = 0;
        loop {
            let trap = match op(&mut self.cpu(kernel).map_err(|_| UserPanic::Killed)?) {
                Ok(()) => return Ok(()),
                Err(trap) => trap,
            };
            let fault_va = self.upcall(kernel, trap)?;
            if last_fault == Some(fault_va) {
                repeats += 1;
            } else {
                last_fault = Some(fault_va);
                repeats = 1;
            }
            if repeats >= MAX_FAULT_RETRIES {
                return Err(self.fatal(kernel, UserPanic::Unresolved { va: fault_va }));
            }
        }
    }

    /// Loads a little-endian word.
    pub fn read_u32(&mut self, kernel: &mut Kernel, va: usize) -> Result<u32, UserPanic> {
        let mut raw = [0_u8; 4];
        self.read(kernel, va, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Stores a little-endian word.
    pub fn write_u32(
        &mut self,
        kernel: &mut Kernel,
        va: usize,
        value: u32,
    ) -> Result<(), UserPanic> {
        self.write(kernel, va, &value.to_le_bytes())
    }

    /// Runs the upcall the kernel redirected us to, then returns to the trap-time context.
    /// Yields the address that faulted.
    fn upcall(&mut self, kernel: &mut Kernel, trap: Trap) -> Result<usize, UserPanic> {
        let UpcallFrame { entry, record_va } = match trap {
            Trap::Upcall(frame) => frame,
            Trap::Killed => return Err(UserPanic::Killed),
        };
        if entry != UPCALL_ENTRY {
            return Err(self.fatal(kernel, UserPanic::UnknownUpcall { entry }));
        }

        let mut bytes = [0_u8; UTrapframe::SIZE];
        self.cpu(kernel)
            .map_err(|_| UserPanic::Killed)?
            .load(record_va, &mut bytes)
            .map_err(|_| UserPanic::Killed)?;
        let record = UTrapframe::from_le_bytes(&bytes);

        let Some(handler) = self.runtime.pgfault_handler else {
            return Err(self.fatal(kernel, UserPanic::NoHandler { va: record.fault_va }));
        };
        handler(self, kernel, &record)?;

        self.cpu(kernel)
            .map_err(|_| UserPanic::Killed)?
            .set_frame(record.regs)
            .map_err(|_| UserPanic::Killed)?;
        Ok(record.fault_va)
    }

    /// Logs `cause` and destroys this environment.
    pub fn fatal(&mut self, kernel: &mut Kernel, cause: UserPanic) -> UserPanic {
        axon::log_error!(target: "user", "[{}] user panic: {}", self.env, cause);
        if let Ok(mut cpu) = self.cpu(kernel) {
            if let Err(err) = sys::env_destroy(&mut cpu, EnvId::SELF) {
                axon::log_warn!(target: "user", "[{}] env_destroy: {}", self.env, err);
            }
        }
        cause
    }
}
