// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: User-space runtime for AXON environments
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: unit tests per module; tests/fork.rs, tests/ipc.rs
//!
//! PUBLIC API:
//!   - sys: one typed wrapper per kernel primitive
//!   - Process: one environment plus its process-local state (own id, fault handler, break)
//!   - fork(): copy-on-write fork composed from page primitives and fault upcalls
//!   - ipc: send/try_send/recv on top of the rendezvous primitives
//!   - UserPanic: fatal conditions that end the environment
//!
//! DEPENDENCIES:
//!   - axon: emulated processor (`Kernel::cpu`) every call is issued through
//!   - axon-abi: syscall numbers, layout constants, exception record

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

pub mod fork;
pub mod ipc;
pub mod pgfault;
pub mod process;
pub mod sys;

pub use fork::{fork, ForkError, ForkedChild};
pub use ipc::{Message, PendingRecv};
pub use pgfault::{PgfaultHandler, UPCALL_ENTRY};
pub use process::{Process, UserPanic};
