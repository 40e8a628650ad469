// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Emulated processor executing one environment
//! OWNERS: @kernel-team
//! PUBLIC API: Cpu::{load, store, load_u32, store_u32, ecall, frame, set_frame, mailbox, query}
//! DEPENDS_ON: kernel::Kernel, trap
//! INVARIANTS: every user access goes through the MMU check; a failing access traps before
//!             any byte is transferred

use axon_abi::{Perm, TrapFrame, REG_A0, REG_A7, SSTATUS_SPIE, SSTATUS_SPP};

use crate::ipc::Mailbox;
use crate::kernel::Kernel;
use crate::trap::{self, Ecall, Trap};
use crate::types::{EnvId, VirtAddr};

/// Processor currently running `env`; obtained from [`Kernel::cpu`].
pub struct Cpu<'k> {
    kernel: &'k mut Kernel,
    env: EnvId,
}

impl<'k> Cpu<'k> {
    pub(crate) fn new(kernel: &'k mut Kernel, env: EnvId) -> Self {
        Self { kernel, env }
    }

    pub fn env_id(&self) -> EnvId {
        self.env
    }

    /// Saved registers of the running environment.
    pub fn frame(&self) -> Result<TrapFrame, Trap> {
        self.kernel.envs.get(self.env).map(|env| *env.frame()).map_err(|_| Trap::Killed)
    }

    /// Replaces the register file; the privilege bits always describe user mode.
    pub fn set_frame(&mut self, mut frame: TrapFrame) -> Result<(), Trap> {
        frame.sstatus = (frame.sstatus | SSTATUS_SPIE) & !SSTATUS_SPP;
        let env = self.kernel.envs.get_mut(self.env).map_err(|_| Trap::Killed)?;
        *env.frame_mut() = frame;
        Ok(())
    }

    /// Snapshot of the environment's IPC mailbox.
    pub fn mailbox(&self) -> Result<Mailbox, Trap> {
        self.kernel.envs.get(self.env).map(|env| *env.mailbox()).map_err(|_| Trap::Killed)
    }

    /// Permission bits of the caller's own mapping at `va`.
    pub fn query(&self, va: usize) -> Option<Perm> {
        let env = self.kernel.envs.get(self.env).ok()?;
        VirtAddr::user(va).and_then(|va| env.space().perm(va))
    }

    /// User load of `buf.len()` bytes at `va`.
    pub fn load(&mut self, va: usize, buf: &mut [u8]) -> Result<(), Trap> {
        let env = self.kernel.envs.get(self.env).map_err(|_| Trap::Killed)?;
        match env.space().read(va, buf) {
            Ok(()) => Ok(()),
            Err(fault) => Err(self.fault(fault)),
        }
    }

    /// User store of `data` at `va`.
    pub fn store(&mut self, va: usize, data: &[u8]) -> Result<(), Trap> {
        let env = self.kernel.envs.get(self.env).map_err(|_| Trap::Killed)?;
        match env.space().write(va, data) {
            Ok(()) => Ok(()),
            Err(fault) => Err(self.fault(fault)),
        }
    }

    pub fn load_u32(&mut self, va: usize) -> Result<u32, Trap> {
        let mut raw = [0_u8; 4];
        self.load(va, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    pub fn store_u32(&mut self, va: usize, value: u32) -> Result<(), Trap> {
        self.store(va, &value.to_le_bytes())
    }

    /// Executes `ecall` with `number` in `a7` and `args` in `a0..a4`.
    pub fn ecall(&mut self, number: usize, args: [usize; 5]) -> Ecall {
        let Ok(env) = self.kernel.envs.get_mut(self.env) else {
            return Ecall::Exited;
        };
        let frame = env.frame_mut();
        frame.x[REG_A7] = number;
        frame.x[REG_A0..REG_A0 + args.len()].copy_from_slice(&args);
        self.kernel.handle_ecall(self.env)
    }

    fn fault(&mut self, fault: crate::mm::PageFault) -> Trap {
        crate::log_trace!(
            target: "trap",
            "[{}] fault va {:#x} {:?}",
            self.env,
            fault.va,
            fault.code
        );
        trap::deliver_page_fault(
            &mut self.kernel.envs,
            &mut self.kernel.scheduler,
            self.env,
            fault,
        )
    }
}
