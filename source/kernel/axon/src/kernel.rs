// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel state owner tying frames, environments, scheduler and syscalls together
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel::{new, cpu, spawn, env, envs, frames, scheduler, destroy_env, schedule_next}
//! DEPENDS_ON: config, env, mm, sched, syscall, trap
//! INVARIANTS: Single non-reentrant mutator of cross-environment state (not Send/Sync)

use core::marker::PhantomData;

use axon_abi::EnvStatus;

use crate::config::{ConfigError, KernelConfig};
use crate::cpu::Cpu;
use crate::env::{Env, EnvError, EnvTable};
use crate::mm::FramePool;
use crate::sched::Scheduler;
use crate::syscall::{api, SyscallTable};
use crate::trap::{self, Ecall};
use crate::types::EnvId;

/// The exokernel: owns the frame pool, the environment registry and the run queue.
pub struct Kernel {
    config: KernelConfig,
    pub(crate) frames: FramePool,
    pub(crate) envs: EnvTable,
    pub(crate) scheduler: Scheduler,
    syscalls: SyscallTable,
    _not_send_sync: PhantomData<*mut ()>,
}

static_assertions::assert_not_impl_any!(Kernel: Send, Sync);

impl Kernel {
    /// Boots a kernel sized by `config` with the default syscall table installed.
    pub fn new(config: KernelConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut syscalls = SyscallTable::new();
        api::install_handlers(&mut syscalls);
        crate::log_info!(
            target: "boot",
            "axon: {} frames, {} env slots",
            config.frames,
            config.max_envs
        );
        Ok(Self {
            config,
            frames: FramePool::new(config.frames),
            envs: EnvTable::new(config.max_envs),
            scheduler: Scheduler::new(),
            syscalls,
            _not_send_sync: PhantomData,
        })
    }

    pub fn config(&self) -> KernelConfig {
        self.config
    }

    /// Physical frame pool (accounting and failure injection).
    pub fn frames(&self) -> &FramePool {
        &self.frames
    }

    /// Read-only view of a live environment.
    pub fn env(&self, id: EnvId) -> Result<&Env, EnvError> {
        self.envs.get(id)
    }

    pub fn envs(&self) -> &EnvTable {
        &self.envs
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Destroys `id` on behalf of the kernel (no permission check).
    pub fn destroy_env(&mut self, id: EnvId) -> Result<(), EnvError> {
        self.envs.destroy(id, &mut self.scheduler)
    }

    /// Dispatches the next runnable environment, if any.
    pub fn schedule_next(&mut self) -> Option<EnvId> {
        self.preempt_current();
        let next = self.scheduler.schedule_next()?;
        if let Ok(env) = self.envs.get_mut(next) {
            env.set_status(EnvStatus::Running);
        }
        Some(next)
    }

    /// Puts `id` on the emulated processor.
    ///
    /// The environment must be Runnable or Running. A different environment that was
    /// running goes back to the run queue.
    pub fn cpu(&mut self, id: EnvId) -> Result<Cpu<'_>, EnvError> {
        if !self.envs.get(id)?.status().is_runnable() {
            return Err(EnvError::NotRunnable);
        }
        if self.scheduler.current() != Some(id) {
            self.preempt_current();
            self.scheduler.set_current(Some(id));
        }
        self.envs.get_mut(id)?.set_status(EnvStatus::Running);
        Ok(Cpu::new(self, id))
    }

    /// Sends the running environment, if any, back to the run queue.
    fn preempt_current(&mut self) {
        let Some(current) = self.scheduler.current() else {
            return;
        };
        if let Ok(env) = self.envs.get_mut(current) {
            if env.status() == EnvStatus::Running {
                env.set_status(EnvStatus::Runnable);
            }
        }
        self.scheduler.yield_current();
    }

    /// Trap entry for an `ecall` issued by `caller`.
    pub(crate) fn handle_ecall(&mut self, caller: EnvId) -> Ecall {
        let mut ctx = api::Context::new(caller, &mut self.envs, &self.frames, &mut self.scheduler);
        trap::handle_ecall(&self.syscalls, &mut ctx)
    }
}

impl core::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kernel")
            .field("config", &self.config)
            .field("frames", &self.frames)
            .field("envs", &self.envs.len())
            .field("current", &self.scheduler.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_configuration() {
        assert_eq!(Kernel::new(KernelConfig::new(0, 4)).err(), Some(ConfigError::NoFrames));
        assert_eq!(Kernel::new(KernelConfig::new(8, 0)).err(), Some(ConfigError::NoEnvSlots));
    }

    #[test]
    fn only_runnable_envs_get_the_cpu() {
        let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
        let id = kernel.envs.alloc(&kernel.frames, None).unwrap();
        assert_eq!(kernel.cpu(id).err(), Some(EnvError::NotRunnable));

        kernel.envs.get_mut(id).unwrap().set_status(EnvStatus::Runnable);
        assert!(kernel.cpu(id).is_ok());
        assert_eq!(kernel.scheduler().current(), Some(id));
        assert_eq!(kernel.env(id).unwrap().status(), EnvStatus::Running);
    }

    #[test]
    fn switching_cpus_requeues_the_previous_env() {
        let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
        let a = kernel.envs.alloc(&kernel.frames, None).unwrap();
        let b = kernel.envs.alloc(&kernel.frames, None).unwrap();
        for id in [a, b] {
            kernel.envs.get_mut(id).unwrap().set_status(EnvStatus::Runnable);
        }
        kernel.cpu(a).unwrap();
        kernel.cpu(b).unwrap();
        assert_eq!(kernel.env(a).unwrap().status(), EnvStatus::Runnable);
        assert!(kernel.scheduler().is_queued(a));
        assert_eq!(kernel.scheduler().current(), Some(b));
    }
}
