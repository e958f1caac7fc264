// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! The simulated machine: register file, physical memory, MMU.
//!
//! Accesses go through [`Machine::read_u8`]-style operations which translate
//! first and raise [`Exception`]s on failures, recording the faulting
//! address so the trap layer can decode it.

pub mod mmu;

use core::fmt;

use crate::config::{VmConfig, PAGE_SIZE};
use crate::types::{PhysFrame, VirtAddr};

use self::mmu::Mmu;

/// Hardware exceptions the memory system can raise.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Exception {
    /// Translation miss; resolvable by the fault coordinator.
    PageFault,
    /// Store to a page whose entry is marked read-only.
    ReadOnly,
    /// Access outside the address space, or an unaligned word access.
    AddressError,
    /// Translation produced a frame outside physical memory.
    BusError,
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Exception::PageFault => "page fault",
            Exception::ReadOnly => "read-only violation",
            Exception::AddressError => "address error",
            Exception::BusError => "bus error",
        };
        f.write_str(name)
    }
}

/// Index of the stack pointer in the general-purpose register file.
pub const SP_REG: usize = 29;

/// Number of general-purpose registers.
pub const NUM_GP_REGS: usize = 32;

/// The user-visible register file, saved and restored around context
/// switches by the task layer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterFile {
    pub gpr: [u32; NUM_GP_REGS],
    pub pc: u32,
    /// Successor of `pc`; kept separately for branch-delay semantics.
    pub next_pc: u32,
    pub prev_pc: u32,
    /// Address that caused the most recent memory exception.
    pub bad_vaddr: u32,
}

impl RegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zeroes every register.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Retires one instruction: the faulting-resume contract is that this
    /// is *not* called when a memory exception interrupted the access.
    pub fn advance_pc(&mut self) {
        self.prev_pc = self.pc;
        self.pc = self.next_pc;
        self.next_pc = self.next_pc.wrapping_add(4);
    }
}

/// Fixed pool of frame-sized physical memory.
pub struct PhysMemory {
    bytes: Vec<u8>,
}

impl PhysMemory {
    pub fn new(frames: usize) -> Self {
        Self { bytes: vec![0; frames * PAGE_SIZE] }
    }

    pub fn frame_count(&self) -> usize {
        self.bytes.len() / PAGE_SIZE
    }

    /// Borrows the bytes of one frame.
    pub fn frame(&self, frame: PhysFrame) -> &[u8] {
        let base = frame.base();
        &self.bytes[base..base + PAGE_SIZE]
    }

    pub fn frame_mut(&mut self, frame: PhysFrame) -> &mut [u8] {
        let base = frame.base();
        &mut self.bytes[base..base + PAGE_SIZE]
    }

    fn read(&self, paddr: usize) -> u8 {
        self.bytes[paddr]
    }

    fn write(&mut self, paddr: usize, value: u8) {
        self.bytes[paddr] = value;
    }
}

/// The machine as seen by the paging core.
pub struct Machine {
    pub memory: PhysMemory,
    pub regs: RegisterFile,
    pub mmu: Mmu,
}

impl Machine {
    pub fn new(config: &VmConfig) -> Self {
        Self {
            memory: PhysMemory::new(config.phys_frames),
            regs: RegisterFile::new(),
            mmu: Mmu::new(config.translation, config.phys_frames),
        }
    }

    /// Reads one byte of user memory.
    pub fn read_u8(&mut self, va: VirtAddr) -> Result<u8, Exception> {
        let paddr = self.translate(va, false)?;
        Ok(self.memory.read(paddr))
    }

    /// Writes one byte of user memory.
    pub fn write_u8(&mut self, va: VirtAddr, value: u8) -> Result<(), Exception> {
        let paddr = self.translate(va, true)?;
        self.memory.write(paddr, value);
        Ok(())
    }

    /// Reads an aligned little-endian word.
    pub fn read_u32(&mut self, va: VirtAddr) -> Result<u32, Exception> {
        self.check_word_alignment(va)?;
        let paddr = self.translate(va, false)?;
        let mut bytes = [0u8; 4];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self.memory.read(paddr + i);
        }
        Ok(u32::from_le_bytes(bytes))
    }

    /// Writes an aligned little-endian word.
    pub fn write_u32(&mut self, va: VirtAddr, value: u32) -> Result<(), Exception> {
        self.check_word_alignment(va)?;
        let paddr = self.translate(va, true)?;
        for (i, byte) in value.to_le_bytes().iter().enumerate() {
            self.memory.write(paddr + i, *byte);
        }
        Ok(())
    }

    fn check_word_alignment(&mut self, va: VirtAddr) -> Result<(), Exception> {
        if va.as_raw() % 4 != 0 {
            self.regs.bad_vaddr = va.as_raw();
            return Err(Exception::AddressError);
        }
        Ok(())
    }

    fn translate(&mut self, va: VirtAddr, write: bool) -> Result<usize, Exception> {
        match self.mmu.translate(va, write) {
            Ok(paddr) => Ok(paddr),
            Err(exception) => {
                self.regs.bad_vaddr = va.as_raw();
                Err(exception)
            }
        }
    }
}
