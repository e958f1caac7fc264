// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Victim selection for frame eviction.
//! OWNERS: kernel-mm
//! PUBLIC API: `ReplacementPolicy`, `FifoPolicy`, `ClockPolicy`,
//!   `LruCounterPolicy`, `RandomPolicy`, `policy_for`
//! DEPENDS_ON: coremap ownership records, page-table reference bits
//! INVARIANTS:
//!   - `pick_victim` selects; it never clears ownership and never does I/O.
//!   - The only page-table state a policy may change is the USED bit
//!     (clock aging). VALID, DIRTY and the frame binding stay untouched.
//!   - Policies are consulted only while the frame map holds no free frame,
//!     under the same lock that serializes frame-map mutation.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::config::PolicyKind;
use crate::mm::coremap::CoreMap;
use crate::mm::page_table::EntryFlags;
use crate::task::TaskTable;
use crate::types::PhysFrame;

/// A pluggable answer to "which frame do we steal next?".
///
/// Implementations may keep private scan state (cursors, RNG) and may age
/// USED bits through the owning page tables, but the caller alone commits
/// the eviction.
pub trait ReplacementPolicy: Send {
    fn kind(&self) -> PolicyKind;

    /// Picks the next victim frame. `None` only when the machine has no
    /// frames at all.
    fn pick_victim(&mut self, frames: &CoreMap, tasks: &mut TaskTable) -> Option<PhysFrame>;
}

/// Builds the policy selected by the paging configuration.
pub fn policy_for(kind: PolicyKind, rng_seed: u64) -> Box<dyn ReplacementPolicy> {
    match kind {
        PolicyKind::Fifo => Box::new(FifoPolicy::new()),
        PolicyKind::Clock => Box::new(ClockPolicy::new()),
        PolicyKind::LruCounter => Box::new(LruCounterPolicy::new()),
        PolicyKind::Random => Box::new(RandomPolicy::new(rng_seed)),
    }
}

/// Rotating-cursor FIFO. The cursor advances by exactly one frame per pick,
/// so over `len` consecutive picks every frame is chosen exactly once.
pub struct FifoPolicy {
    cursor: usize,
}

impl FifoPolicy {
    pub fn new() -> Self {
        Self { cursor: 0 }
    }
}

impl Default for FifoPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplacementPolicy for FifoPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Fifo
    }

    fn pick_victim(&mut self, frames: &CoreMap, _tasks: &mut TaskTable) -> Option<PhysFrame> {
        if frames.is_empty() {
            return None;
        }
        let victim = PhysFrame::from_raw((self.cursor % frames.len()) as u32);
        self.cursor = (self.cursor + 1) % frames.len();
        Some(victim)
    }
}

/// Second-chance clock over (USED, DIRTY) classes.
///
/// Sweeps from the cursor in up to four passes, alternating between the
/// clean-unreferenced and dirty-unreferenced classes. Every pass strips the
/// USED bit from pages it skips, so the later passes catch pages that were
/// still referenced when the sweep began. A frame whose owner can no longer
/// be resolved counts as immediately reclaimable. If all four passes come up
/// empty the frame immediately after the cursor is taken.
pub struct ClockPolicy {
    cursor: usize,
}

impl ClockPolicy {
    pub fn new() -> Self {
        Self { cursor: 0 }
    }

    fn take(&mut self, offset: usize, len: usize) -> PhysFrame {
        let index = (self.cursor + offset) % len;
        self.cursor = (index + 1) % len;
        PhysFrame::from_raw(index as u32)
    }
}

impl Default for ClockPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplacementPolicy for ClockPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Clock
    }

    fn pick_victim(&mut self, frames: &CoreMap, tasks: &mut TaskTable) -> Option<PhysFrame> {
        let len = frames.len();
        if len == 0 {
            return None;
        }
        for pass in 0..4 {
            let want_dirty = pass % 2 == 1;
            for offset in 0..len {
                let frame = PhysFrame::from_raw(((self.cursor + offset) % len) as u32);
                let Some((pid, vpn)) = frames.owner_of(frame) else {
                    return Some(self.take(offset, len));
                };
                let Some(space) = tasks.space_mut(pid) else {
                    return Some(self.take(offset, len));
                };
                let Some(entry) = space.table_mut().entry_mut(vpn) else {
                    continue;
                };
                if !entry.is_used() && entry.is_dirty() == want_dirty {
                    return Some(self.take(offset, len));
                }
                // Skipped: age the reference bit for the repeat passes.
                entry.flags.remove(EntryFlags::USED);
            }
        }
        Some(self.take(1, len))
    }
}

/// Approximate LRU driven by the per-frame use stamps the pager records on
/// each resolved fault. The frame with the oldest stamp loses; ties break
/// toward the lower frame number.
pub struct LruCounterPolicy;

impl LruCounterPolicy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LruCounterPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplacementPolicy for LruCounterPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::LruCounter
    }

    fn pick_victim(&mut self, frames: &CoreMap, _tasks: &mut TaskTable) -> Option<PhysFrame> {
        (0..frames.len())
            .map(|index| PhysFrame::from_raw(index as u32))
            .min_by_key(|frame| frames.last_use(*frame))
    }
}

/// Uniform random pick from a deterministic generator. Useful as the
/// baseline the smarter policies are measured against.
pub struct RandomPolicy {
    rng: SmallRng,
}

impl RandomPolicy {
    pub fn new(seed: u64) -> Self {
        Self { rng: SmallRng::seed_from_u64(seed) }
    }
}

impl ReplacementPolicy for RandomPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Random
    }

    fn pick_victim(&mut self, frames: &CoreMap, _tasks: &mut TaskTable) -> Option<PhysFrame> {
        if frames.is_empty() {
            return None;
        }
        let index = self.rng.gen_range(0..frames.len());
        Some(PhysFrame::from_raw(index as u32))
    }
}
