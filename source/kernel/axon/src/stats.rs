// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Paging counters, bumped along the fault path and read by tests.

/// Counters for one VM instance. All mutation happens under `&mut` on the
/// fault path, so plain integers are enough.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VmStats {
    /// Translation misses that reached the fault coordinator.
    pub faults: u64,
    /// Misses repaired by reinstalling an already-valid entry.
    pub stale_cache_repairs: u64,
    /// Pages filled from the executable image (incl. zero-fill pages).
    pub page_ins_image: u64,
    /// Pages filled from a backing store.
    pub page_ins_swap: u64,
    /// Dirty victim pages written to a backing store.
    pub page_outs: u64,
    /// Victim pages dropped without I/O because they were clean.
    pub evictions_clean: u64,
    /// Processes terminated by the trap layer.
    pub forced_kills: u64,
}

impl VmStats {
    /// Total evictions, regardless of whether the victim needed write-back.
    pub fn evictions(&self) -> u64 {
        self.page_outs + self.evictions_clean
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
