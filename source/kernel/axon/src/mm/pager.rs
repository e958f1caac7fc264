// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page-fault resolution.
//! OWNERS: kernel-mm
//! PUBLIC API: `Pager`, `PagerError`
//! DEPENDS_ON: frame map, address spaces, replacement policy, MMU cache
//! INVARIANTS:
//!   - Frame-map checks, victim selection and the ownership hand-over happen
//!     under one frame-map lock; the backing-store I/O happens outside it.
//!   - The new owner is recorded in the map before the victim's bytes are
//!     written out, so a concurrent fault can never pick the same frame.
//!   - Resolving a fault never advances the program counter; the faulting
//!     access simply runs again against the repaired cache.

use spin::Mutex;

use crate::config::{PolicyKind, VmConfig};
use crate::machine::Machine;
use crate::mm::address_space::{AddressSpaceError, PageSource};
use crate::mm::coremap::CoreMap;
use crate::mm::policy::{policy_for, ReplacementPolicy};
use crate::stats::VmStats;
use crate::task::TaskTable;
use crate::types::{PhysFrame, Pid, VirtAddr, VirtPage};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PagerError {
    /// Memory is full and eviction is disabled (or no frame qualifies).
    NoEvictableFrame,
    /// The faulting process is not in the task table.
    UnknownProcess,
    /// The faulting page lies outside the process's address space.
    IllegalAddress,
    /// Filling or flushing a page failed.
    Space(AddressSpaceError),
}

impl From<AddressSpaceError> for PagerError {
    fn from(err: AddressSpaceError) -> Self {
        Self::Space(err)
    }
}

/// Drives a page fault from raw virtual address to installed translation.
pub struct Pager {
    policy: Box<dyn ReplacementPolicy>,
    /// With eviction off, a fault past the last free frame is fatal.
    eviction: bool,
    /// Fault counter; doubles as the LRU use stamp.
    ticks: u64,
}

impl Pager {
    pub fn new(config: &VmConfig) -> Self {
        Self {
            policy: policy_for(config.policy, config.rng_seed),
            eviction: config.swap,
            ticks: 0,
        }
    }

    pub fn policy_kind(&self) -> PolicyKind {
        self.policy.kind()
    }

    /// Resolves one fault for `pid` at `va`.
    ///
    /// Phases: decode the page, classify the miss, acquire a frame (free or
    /// evicted), populate it, install the translation. A page whose table
    /// entry is already valid is a stale-cache miss and is repaired by
    /// re-installing the existing translation, with no I/O.
    pub fn resolve_fault(
        &mut self,
        pid: Pid,
        va: VirtAddr,
        tasks: &mut TaskTable,
        frames: &Mutex<CoreMap>,
        machine: &mut Machine,
        stats: &mut VmStats,
    ) -> Result<(), PagerError> {
        stats.faults += 1;
        self.ticks += 1;
        let tick = self.ticks;
        let vpn = va.page();

        let space = tasks.space(pid).ok_or(PagerError::UnknownProcess)?;
        let Some(entry) = space.entry(vpn).copied() else {
            return Err(PagerError::IllegalAddress);
        };

        if entry.is_valid() {
            let space = tasks.space_mut(pid).ok_or(PagerError::UnknownProcess)?;
            machine.mmu.install(entry, space.table_mut());
            if let Some(frame) = entry.frame {
                frames.lock().touch(frame, tick);
            }
            stats.stale_cache_repairs += 1;
            log::trace!(target: "pager", "pid {pid}: refreshed cached translation for page {vpn}");
            return Ok(());
        }

        let frame = self.acquire_frame(pid, vpn, tasks, frames, machine, stats)?;

        let space = tasks.space_mut(pid).ok_or(PagerError::UnknownProcess)?;
        let source = match space.load_page(vpn, frame, &mut machine.memory) {
            Ok(source) => source,
            Err(err) => {
                // The claim must not outlive the failed fill.
                frames.lock().clear(frame);
                return Err(err.into());
            }
        };
        match source {
            PageSource::FromBackingStore(_) => stats.page_ins_swap += 1,
            _ => stats.page_ins_image += 1,
        }

        let Some(entry) = space.entry(vpn).copied() else {
            return Err(PagerError::IllegalAddress);
        };
        machine.mmu.install(entry, space.table_mut());
        frames.lock().touch(frame, tick);
        log::debug!(
            target: "pager",
            "pid {pid}: fault at {va} resolved, page {vpn} in frame {frame}"
        );
        Ok(())
    }

    /// Finds a frame for (`pid`, `vpn`): a free one if any, otherwise the
    /// policy's victim, whose page is flushed out first. Ownership moves to
    /// the faulting page before the lock drops; the victim's write-back runs
    /// after.
    fn acquire_frame(
        &mut self,
        pid: Pid,
        vpn: VirtPage,
        tasks: &mut TaskTable,
        frames: &Mutex<CoreMap>,
        machine: &mut Machine,
        stats: &mut VmStats,
    ) -> Result<PhysFrame, PagerError> {
        let mut map = frames.lock();
        if let Some(frame) = map.find_free(pid, vpn) {
            return Ok(frame);
        }
        if !self.eviction {
            return Err(PagerError::NoEvictableFrame);
        }

        // The running process's USED and DIRTY bits live in the cache;
        // fold them into the table so the sweep sees current state.
        if let Some(space) = tasks.space_mut(pid) {
            machine.mmu.sync_flags(space.table_mut());
        }

        let victim = self
            .policy
            .pick_victim(&map, tasks)
            .ok_or(PagerError::NoEvictableFrame)?;
        let Some((victim_pid, victim_vpn)) = map.owner_of(victim) else {
            // The policy landed on a frame nobody owns; just take it.
            map.mark(victim, pid, vpn);
            return Ok(victim);
        };

        // If the victim belongs to the running process its cached copy may
        // carry bits the table lacks; merge and drop it before the flush.
        if victim_pid == pid {
            if let Some(space) = tasks.space_mut(pid) {
                machine.mmu.retire(victim_vpn, space.table_mut());
            }
        }
        map.mark(victim, pid, vpn);
        drop(map);

        let victim_space = tasks
            .space_mut(victim_pid)
            .ok_or(PagerError::UnknownProcess)?;
        let wrote = victim_space.write_to_swap(victim_vpn, victim, &machine.memory)?;
        if wrote {
            stats.page_outs += 1;
        } else {
            stats.evictions_clean += 1;
        }
        log::debug!(
            target: "pager",
            "evicted pid {victim_pid} page {victim_vpn} from frame {victim} (dirty={wrote}) for pid {pid} page {vpn}"
        );
        Ok(victim)
    }
}
