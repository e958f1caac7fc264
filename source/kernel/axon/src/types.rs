// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal newtypes for the paging core (debug-friendly, low overhead)
//! OWNERS: @kernel-team
//! PUBLIC API: VirtAddr, VirtPage, PhysFrame, SlotIndex, Pid
//! DEPENDS_ON: config::PAGE_SIZE
//! INVARIANTS: Page/frame numbers index fixed tables; prevent type confusion
//!             between virtual pages, physical frames and store slots.

use crate::config::PAGE_SIZE;
use core::fmt;

/// Virtual address inside a simulated 32-bit user address space.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct VirtAddr(u32);

impl VirtAddr {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Returns the virtual page containing this address.
    #[inline]
    pub const fn page(self) -> VirtPage {
        VirtPage((self.0 as usize / PAGE_SIZE) as u32)
    }

    /// Returns the byte offset of this address inside its page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 as usize % PAGE_SIZE
    }

    #[inline]
    pub const fn checked_add(self, bytes: u32) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Virtual page number (VPN).
///
/// **Ownership**: produced by address arithmetic and page-table walks; bounds
/// against a concrete address space are checked where the table is consulted.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct VirtPage(u32);

impl VirtPage {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Returns the page number as an index into page-table vectors.
    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }

    /// Returns the first virtual address of this page.
    #[inline]
    pub const fn base(self) -> VirtAddr {
        VirtAddr(self.0 * (PAGE_SIZE as u32))
    }
}

impl fmt::Display for VirtPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical frame number.
///
/// **Ownership**: only `CoreMap` assigns frames to (process, page) pairs;
/// everything else treats the value as an opaque index into physical memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PhysFrame(u32);

impl PhysFrame {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Returns the frame number as an index into frame-sized tables.
    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }

    /// Returns the first byte offset of this frame in physical memory.
    #[inline]
    pub const fn base(self) -> usize {
        self.0 as usize * PAGE_SIZE
    }
}

impl fmt::Display for PhysFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backing-store slot index (per-process swap file).
///
/// **Invariant**: slots grow monotonically and are never reassigned to a
/// different virtual page for the lifetime of the owning address space.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct SlotIndex(u32);

impl SlotIndex {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Returns the byte offset of this slot inside the backing file.
    #[inline]
    pub const fn byte_offset(self) -> u64 {
        self.0 as u64 * PAGE_SIZE as u64
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process identifier (PID).
///
/// **Ownership**: only `TaskTable` can create/destroy PIDs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    /// Creates a PID from a raw value (kernel-internal only).
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw PID value.
    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Returns the PID as an index into task-owned vectors.
    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Pid {
    #[inline]
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<Pid> for u32 {
    #[inline]
    fn from(pid: Pid) -> Self {
        pid.0
    }
}
