// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Shared ABI definitions between the axon kernel and its user runtime
//! OWNERS: @runtime
//! PUBLIC API: layout constants, Perm, FaultCode, Errno, EnvId, EnvStatus, SYSCALL_* IDs,
//!             TrapFrame, UTrapframe
//! DEPENDS_ON: bitflags
//! INVARIANTS: Stable syscall IDs; negative errno returns; fixed LE layouts for frames

mod frame;

use core::fmt;

pub use frame::{TrapFrame, UTrapframe, REG_A0, REG_A7, REG_SP, SSTATUS_SPIE, SSTATUS_SPP};

// ——— Memory layout ———

/// Page shift (log2 of the page size).
pub const PGSHIFT: usize = 12;
/// Size of one page: the allocation and alignment unit of every VM primitive.
pub const PAGE_SIZE: usize = 1 << PGSHIFT;
/// Entries per page-table page.
pub const NPTENTRIES: usize = 1024;
/// Bytes mapped by one page-table page.
pub const PTSIZE: usize = PAGE_SIZE * NPTENTRIES;

/// Upper bound (exclusive) for every user virtual address accepted by the kernel.
pub const UTOP: usize = 0xEEC0_0000;
/// Top of the one-page user exception stack.
pub const UXSTACKTOP: usize = UTOP;
/// Top of the normal user stack; one guard page separates it from the exception stack.
pub const USTACKTOP: usize = UTOP - 2 * PAGE_SIZE;
/// Where program text is loaded.
pub const UTEXT: usize = 0x0080_0000;
/// Scratch window used by user code for temporary mappings.
pub const UTEMP: usize = 0x0040_0000;
/// Scratch page used by the copy-on-write fault handler.
pub const PFTEMP: usize = UTEMP + PTSIZE - PAGE_SIZE;

/// Rounds `va` down to its page boundary.
#[inline]
pub const fn page_round_down(va: usize) -> usize {
    va & !(PAGE_SIZE - 1)
}

/// Rounds `va` up to the next page boundary (saturating at the top of the address range).
#[inline]
pub const fn page_round_up(va: usize) -> usize {
    match va.checked_add(PAGE_SIZE - 1) {
        Some(end) => page_round_down(end),
        None => page_round_down(usize::MAX),
    }
}

/// Returns the offset of `va` inside its page.
#[inline]
pub const fn page_offset(va: usize) -> usize {
    va & (PAGE_SIZE - 1)
}

// ——— Permissions ———

bitflags::bitflags! {
    /// Page-table entry permission bits as seen by the syscall layer.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Perm: u32 {
        /// Mapping is present.
        const PRESENT = 0x001;
        /// Mapping is writable.
        const WRITABLE = 0x002;
        /// Mapping is accessible from user mode.
        const USER = 0x004;
        /// Write-through caching (hardware only).
        const WRITE_THROUGH = 0x008;
        /// Cache disabled (hardware only).
        const CACHE_DISABLE = 0x010;
        /// Accessed bit (hardware only).
        const ACCESSED = 0x020;
        /// Dirty bit (hardware only).
        const DIRTY = 0x040;
        /// Large-page bit (hardware only).
        const LARGE = 0x080;
        /// Global bit (hardware only).
        const GLOBAL = 0x100;
        /// Bits reserved for software use by user code.
        const AVAIL = 0xE00;
        /// Copy-on-write marker, carved out of the software-available bits.
        const COW = 0x800;
    }
}

impl Perm {
    /// Bits a syscall caller is allowed to request.
    pub const SYSCALL: Self = Self::PRESENT
        .union(Self::WRITABLE)
        .union(Self::USER)
        .union(Self::AVAIL);

    /// Minimal permission every user mapping must carry.
    pub const USER_PRESENT: Self = Self::PRESENT.union(Self::USER);

    /// Decodes a raw syscall argument; `None` if it carries bits outside the known set.
    pub fn from_raw(raw: usize) -> Option<Self> {
        u32::try_from(raw).ok().and_then(Self::from_bits)
    }

    /// Returns true if a syscall may install a mapping with these bits.
    pub const fn is_user_settable(self) -> bool {
        self.contains(Self::USER_PRESENT) && Self::SYSCALL.contains(self)
    }
}

bitflags::bitflags! {
    /// Page-fault cause reported in an exception record.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct FaultCode: u32 {
        /// The page was present; the access violated its protection.
        const PRESENT = 0x1;
        /// The faulting access was a write.
        const WRITE = 0x2;
        /// The fault happened in user mode.
        const USER = 0x4;
    }
}

// ——— Errors ———

/// Error numbers returned (negated) by syscalls.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Errno {
    /// Environment id is unknown or the caller may not act on it.
    BadEnv = 2,
    /// Bad alignment, bounds or permission bits.
    Inval = 3,
    /// Frame or paging-structure allocation failed.
    NoMem = 4,
    /// Environment table is full.
    NoFreeEnv = 5,
    /// User memory could not be accessed.
    Fault = 6,
    /// IPC target is not waiting in receive.
    IpcNotRecv = 7,
    /// Unknown syscall number.
    NoSys = 8,
}

impl Errno {
    /// Positive error code.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Value placed in the return register.
    pub const fn as_ret(self) -> isize {
        -(self as i32 as isize)
    }

    /// Maps a positive error code back to an `Errno`.
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            2 => Some(Self::BadEnv),
            3 => Some(Self::Inval),
            4 => Some(Self::NoMem),
            5 => Some(Self::NoFreeEnv),
            6 => Some(Self::Fault),
            7 => Some(Self::IpcNotRecv),
            8 => Some(Self::NoSys),
            _ => None,
        }
    }

    /// Splits a raw syscall return into a value or an error.
    pub fn decode(ret: isize) -> core::result::Result<usize, Self> {
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let code = i32::try_from(ret.unsigned_abs()).unwrap_or(i32::MAX);
        Err(Self::from_code(code).unwrap_or(Self::Inval))
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::BadEnv => "bad environment",
            Self::Inval => "invalid parameter",
            Self::NoMem => "out of memory",
            Self::NoFreeEnv => "out of environments",
            Self::Fault => "segmentation fault",
            Self::IpcNotRecv => "env is not recving",
            Self::NoSys => "unknown syscall",
        };
        f.write_str(text)
    }
}

/// Result type returned by ABI helpers.
pub type Result<T> = core::result::Result<T, Errno>;

// ——— Environments ———

/// Number of low id bits holding the environment slot index.
pub const ENVGENSHIFT: u32 = 12;
/// Largest number of environment slots an id can address.
pub const MAX_ENV_SLOTS: usize = 1 << ENVGENSHIFT;

const INDEX_MASK: u32 = (1 << ENVGENSHIFT) - 1;
const GENERATION_MAX: u32 = u32::MAX >> ENVGENSHIFT;

/// Opaque environment identifier: slot index in the low bits, reuse generation above.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct EnvId(u32);

impl EnvId {
    /// Sentinel that always names the calling environment.
    pub const SELF: Self = Self(0);

    /// Builds an id from a slot generation and index.
    pub const fn new(generation: u32, index: usize) -> Self {
        Self((generation << ENVGENSHIFT) | (index as u32 & INDEX_MASK))
    }

    /// Wraps a raw id value.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw id value.
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Slot index encoded in the id.
    pub const fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    /// Reuse generation encoded in the id.
    pub const fn generation(self) -> u32 {
        self.0 >> ENVGENSHIFT
    }

    /// Returns true for the "caller" sentinel.
    pub const fn is_self(self) -> bool {
        self.0 == 0
    }

    /// Generation that follows `generation`; never zero, so real ids never collide with
    /// [`EnvId::SELF`].
    pub const fn next_generation(generation: u32) -> u32 {
        if generation >= GENERATION_MAX {
            1
        } else {
            generation + 1
        }
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Run status of an environment.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvStatus {
    /// Slot is unused.
    Free = 0,
    /// Being torn down.
    Dying = 1,
    /// Waiting in the run queue.
    Runnable = 2,
    /// Currently executing.
    Running = 3,
    /// Blocked (receiving, or created but not yet started).
    NotRunnable = 4,
}

impl EnvStatus {
    /// Decodes a raw status value.
    pub const fn from_raw(raw: usize) -> Option<Self> {
        match raw {
            0 => Some(Self::Free),
            1 => Some(Self::Dying),
            2 => Some(Self::Runnable),
            3 => Some(Self::Running),
            4 => Some(Self::NotRunnable),
            _ => None,
        }
    }

    /// Returns true if the environment may be picked by the scheduler.
    pub const fn is_runnable(self) -> bool {
        matches!(self, Self::Runnable | Self::Running)
    }
}

// ——— Syscall numbers (a7) ———

/// Returns the caller's environment id.
pub const SYSCALL_GETENVID: usize = 1;
/// Destroys an environment (self or a child).
pub const SYSCALL_ENV_DESTROY: usize = 2;
/// Allocates a zeroed page and maps it.
pub const SYSCALL_PAGE_ALLOC: usize = 3;
/// Shares the frame behind one mapping at another address (possibly in another env).
pub const SYSCALL_PAGE_MAP: usize = 4;
/// Removes a mapping.
pub const SYSCALL_PAGE_UNMAP: usize = 5;
/// Creates a not-yet-runnable child with a copy of the caller's registers.
pub const SYSCALL_EXOFORK: usize = 6;
/// Sets an environment's run status.
pub const SYSCALL_ENV_SET_STATUS: usize = 7;
/// Replaces an environment's saved register frame.
pub const SYSCALL_ENV_SET_TRAPFRAME: usize = 8;
/// Registers the page-fault upcall entry point.
pub const SYSCALL_ENV_SET_PGFAULT_UPCALL: usize = 9;
/// Gives up the processor.
pub const SYSCALL_YIELD: usize = 10;
/// Attempts a rendezvous send.
pub const SYSCALL_IPC_TRY_SEND: usize = 11;
/// Blocks until a message arrives.
pub const SYSCALL_IPC_RECV: usize = 12;
