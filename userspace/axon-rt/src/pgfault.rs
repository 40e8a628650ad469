// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! User-level page fault handler registration.

use axon::Kernel;
use axon_abi::{EnvId, Errno, Perm, UTrapframe, PAGE_SIZE, UTEXT, UXSTACKTOP};

use crate::process::{Process, UserPanic};
use crate::sys;

/// Address of the runtime's upcall trampoline; the kernel jumps here with `sp` pointing at
/// the exception record.
pub const UPCALL_ENTRY: usize = UTEXT + 0x40;

/// Handler invoked for every delivered page fault.
pub type PgfaultHandler = fn(&mut Process, &mut Kernel, &UTrapframe) -> Result<(), UserPanic>;

impl Process {
    /// Installs `handler` for page faults in this process.
    ///
    /// The first call also allocates the exception stack and registers [`UPCALL_ENTRY`]
    /// with the kernel.
    pub fn set_pgfault_handler(
        &mut self,
        kernel: &mut Kernel,
        handler: PgfaultHandler,
    ) -> Result<(), Errno> {
        if self.runtime.pgfault_handler.is_none() {
            let mut cpu = self.cpu(kernel)?;
            sys::page_alloc(
                &mut cpu,
                EnvId::SELF,
                UXSTACKTOP - PAGE_SIZE,
                Perm::USER_PRESENT | Perm::WRITABLE,
            )?;
            sys::env_set_pgfault_upcall(&mut cpu, EnvId::SELF, UPCALL_ENTRY)?;
        }
        self.runtime.pgfault_handler = Some(handler);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon::{KernelConfig, ProgramImage};
    use axon_abi::FaultCode;

    const SCRATCH: usize = 0x1000_0000;

    // Lazily backs any page it is asked about.
    fn demand_zero(
        process: &mut Process,
        kernel: &mut Kernel,
        utf: &UTrapframe,
    ) -> Result<(), UserPanic> {
        let va = axon_abi::page_round_down(utf.fault_va);
        let mut cpu = process.cpu(kernel).map_err(|_| UserPanic::Killed)?;
        sys::page_alloc(&mut cpu, EnvId::SELF, va, Perm::USER_PRESENT | Perm::WRITABLE)
            .map_err(|err| UserPanic::Syscall { op: "page_alloc", err })
    }

    fn refuse(
        process: &mut Process,
        kernel: &mut Kernel,
        utf: &UTrapframe,
    ) -> Result<(), UserPanic> {
        let cause = UserPanic::Fault { va: utf.fault_va, code: utf.err, ip: utf.regs.sepc };
        Err(process.fatal(kernel, cause))
    }

    fn boot() -> (Kernel, Process) {
        let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
        let spawned = kernel.spawn(&ProgramImage { text: &[0; 4], data: &[], bss: 0 }).unwrap();
        (kernel, Process::from_spawned(&spawned))
    }

    #[test]
    fn first_registration_sets_up_the_exception_stack() {
        let (mut kernel, mut process) = boot();
        process.set_pgfault_handler(&mut kernel, demand_zero).unwrap();
        let env = kernel.env(process.env_id()).unwrap();
        assert_eq!(env.pgfault_upcall(), Some(UPCALL_ENTRY));
        assert_eq!(
            process.query(&mut kernel, UXSTACKTOP - PAGE_SIZE),
            Some(Perm::USER_PRESENT | Perm::WRITABLE)
        );

        // Re-registering swaps the handler without touching the stack.
        let used = kernel.frames().used_frames();
        process.set_pgfault_handler(&mut kernel, refuse).unwrap();
        assert_eq!(kernel.frames().used_frames(), used);
    }

    #[test]
    fn handler_repairs_and_access_is_retried() {
        let (mut kernel, mut process) = boot();
        process.set_pgfault_handler(&mut kernel, demand_zero).unwrap();
        let before = *kernel.env(process.env_id()).unwrap().frame();

        process.write_u32(&mut kernel, SCRATCH + 16, 0x5a5a).unwrap();
        assert_eq!(process.read_u32(&mut kernel, SCRATCH + 16), Ok(0x5a5a));
        // The trap-time registers are back in place after the upcall.
        let after = *kernel.env(process.env_id()).unwrap().frame();
        assert_eq!(after.sp(), before.sp());
        assert_eq!(after.sepc, before.sepc);
    }

    #[test]
    fn refusing_handler_ends_the_process() {
        let (mut kernel, mut process) = boot();
        process.set_pgfault_handler(&mut kernel, refuse).unwrap();
        let result = process.read_u32(&mut kernel, SCRATCH);
        assert!(matches!(
            result,
            Err(UserPanic::Fault { va: SCRATCH, code, .. }) if code == FaultCode::USER
        ));
        assert!(kernel.env(process.env_id()).is_err());
        assert!(axon::log::contains("unrecoverable fault at va 0x10000000"));
    }
}
