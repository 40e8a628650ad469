// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Saved register state and the exception record pushed on the user exception stack.
//!
//! Both types travel through user memory, so they have fixed little-endian layouts made of
//! 64-bit words.

use crate::FaultCode;

/// Stack pointer register index.
pub const REG_SP: usize = 2;
/// First argument / return value register index.
pub const REG_A0: usize = 10;
/// Syscall number register index.
pub const REG_A7: usize = 17;

/// Previous privilege was supervisor.
pub const SSTATUS_SPP: usize = 1 << 8;
/// Interrupts were enabled before the trap.
pub const SSTATUS_SPIE: usize = 1 << 5;

const WORD: usize = 8;

fn put_word(buf: &mut [u8], index: usize, value: usize) {
    let at = index * WORD;
    buf[at..at + WORD].copy_from_slice(&(value as u64).to_le_bytes());
}

fn get_word(buf: &[u8], index: usize) -> usize {
    let at = index * WORD;
    let mut raw = [0_u8; WORD];
    raw.copy_from_slice(&buf[at..at + WORD]);
    u64::from_le_bytes(raw) as usize
}

/// User register file saved on trap entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    /// General purpose registers `x0..x31`.
    pub x: [usize; 32],
    /// Program counter to resume at.
    pub sepc: usize,
    /// Saved status register.
    pub sstatus: usize,
}

impl TrapFrame {
    const WORDS: usize = 34;
    /// Encoded size in bytes.
    pub const SIZE: usize = Self::WORDS * WORD;

    /// Stack pointer.
    pub const fn sp(&self) -> usize {
        self.x[REG_SP]
    }

    /// Sets the stack pointer.
    pub fn set_sp(&mut self, sp: usize) {
        self.x[REG_SP] = sp;
    }

    /// Return value register (`a0`).
    pub const fn ret(&self) -> usize {
        self.x[REG_A0]
    }

    /// Sets the return value register (`a0`).
    pub fn set_ret(&mut self, value: usize) {
        self.x[REG_A0] = value;
    }

    /// Serialises the frame to little-endian words.
    pub fn to_le_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0_u8; Self::SIZE];
        self.write_words(&mut buf);
        buf
    }

    /// Deserialises a frame from little-endian words.
    pub fn from_le_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self::read_words(bytes)
    }

    fn write_words(&self, buf: &mut [u8]) {
        for (index, value) in self.x.iter().enumerate() {
            put_word(buf, index, *value);
        }
        put_word(buf, 32, self.sepc);
        put_word(buf, 33, self.sstatus);
    }

    fn read_words(buf: &[u8]) -> Self {
        let mut frame = Self::default();
        for (index, slot) in frame.x.iter_mut().enumerate() {
            *slot = get_word(buf, index);
        }
        frame.sepc = get_word(buf, 32);
        frame.sstatus = get_word(buf, 33);
        frame
    }
}

/// Exception record the kernel writes onto the user exception stack before an upcall.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UTrapframe {
    /// Faulting virtual address.
    pub fault_va: usize,
    /// Fault cause.
    pub err: FaultCode,
    /// Registers at the time of the fault.
    pub regs: TrapFrame,
}

impl UTrapframe {
    /// Encoded size in bytes.
    pub const SIZE: usize = 2 * WORD + TrapFrame::SIZE;

    /// Serialises the record to little-endian words.
    pub fn to_le_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0_u8; Self::SIZE];
        put_word(&mut buf, 0, self.fault_va);
        put_word(&mut buf, 1, self.err.bits() as usize);
        self.regs.write_words(&mut buf[2 * WORD..]);
        buf
    }

    /// Deserialises a record; unknown fault-code bits are dropped.
    pub fn from_le_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let err = u32::try_from(get_word(bytes, 1)).unwrap_or(0);
        Self {
            fault_va: get_word(bytes, 0),
            err: FaultCode::from_bits_truncate(err),
            regs: TrapFrame::read_words(&bytes[2 * WORD..]),
        }
    }
}
