// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]
#![forbid(unsafe_code)]

//! CONTEXT: AXON exokernel substrate (page-granular VM, rendezvous IPC, fault upcalls)
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel, Cpu, KernelConfig, ProgramImage, syscall table, log_* macros
//! DEPENDS_ON: axon-abi, spin, static_assertions
//! INVARIANTS: Kernel is the sole non-reentrant mutator of cross-environment state;
//!             frames are only reachable through ref-counted FrameRef handles
//!
//! Physical memory, the MMU and the trap path are emulated so the whole substrate runs on
//! the build host. `Kernel::cpu` plays the role of the processor executing one environment.

extern crate alloc;

pub mod config;
pub mod cpu;
mod diag;
pub mod env;
pub mod ipc;
pub mod kernel;
pub mod loader;
pub mod mm;
pub mod sched;
pub mod syscall;
pub mod trap;
pub mod types;

pub use config::{ConfigError, KernelConfig};
pub use cpu::Cpu;
pub use diag::log;
pub use kernel::Kernel;
pub use loader::{ProgramImage, SpawnError, Spawned};
pub use trap::{Ecall, Trap, UpcallFrame};
