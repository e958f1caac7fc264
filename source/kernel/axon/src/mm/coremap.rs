// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical frame ownership table (the coremap)
//! OWNERS: @kernel-team
//! PUBLIC API: CoreMap, find_free, mark, clear, count_free, owner_of
//! DEPENDS_ON: types::{Pid, VirtPage, PhysFrame}
//! INVARIANTS: A frame has at most one (process, page) owner; the owned set
//!             equals the union of valid page-table entries across live
//!             address spaces. Callers serialize through one lock; the map
//!             itself performs no I/O and never touches page tables.

use crate::types::{PhysFrame, Pid, VirtPage};

/// Book-keeping for one physical frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct FrameInfo {
    owner: Option<(Pid, VirtPage)>,
    /// Tick of the last fault that installed or repaired this frame.
    /// Consumed by the LRU-counter policy only.
    last_use: u64,
}

impl FrameInfo {
    const FREE: Self = Self { owner: None, last_use: 0 };
}

/// Ownership map over the fixed pool of physical frames.
///
/// Lives behind a single `spin::Mutex` owned by the VM composition root and
/// is passed explicitly to every user.
#[derive(Clone, Debug)]
pub struct CoreMap {
    frames: Vec<FrameInfo>,
}

impl CoreMap {
    pub fn new(frame_count: usize) -> Self {
        Self { frames: vec![FrameInfo::FREE; frame_count] }
    }

    /// Number of frames in the pool.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Finds the lowest-numbered free frame and claims it for
    /// `(pid, vpn)` in the same step. Returns `None` when the pool is full.
    pub fn find_free(&mut self, pid: Pid, vpn: VirtPage) -> Option<PhysFrame> {
        let index = self.frames.iter().position(|f| f.owner.is_none())?;
        self.frames[index] = FrameInfo { owner: Some((pid, vpn)), last_use: 0 };
        Some(PhysFrame::from_raw(index as u32))
    }

    /// Records `(pid, vpn)` as the owner of `frame`, replacing any previous
    /// owner. The caller must have retired the previous owner's entry first.
    pub fn mark(&mut self, frame: PhysFrame, pid: Pid, vpn: VirtPage) {
        self.frames[frame.as_index()] = FrameInfo { owner: Some((pid, vpn)), last_use: 0 };
    }

    /// Releases `frame` back to the free pool.
    pub fn clear(&mut self, frame: PhysFrame) {
        self.frames[frame.as_index()] = FrameInfo::FREE;
    }

    /// Number of unclaimed frames.
    pub fn count_free(&self) -> usize {
        self.frames.iter().filter(|f| f.owner.is_none()).count()
    }

    pub fn is_free(&self, frame: PhysFrame) -> bool {
        self.owner_of(frame).is_none()
    }

    /// Returns the (process, page) pair owning `frame`, if any.
    pub fn owner_of(&self, frame: PhysFrame) -> Option<(Pid, VirtPage)> {
        self.frames.get(frame.as_index()).and_then(|f| f.owner)
    }

    /// Stamps `frame` with the given fault tick.
    pub fn touch(&mut self, frame: PhysFrame, tick: u64) {
        self.frames[frame.as_index()].last_use = tick;
    }

    pub fn last_use(&self, frame: PhysFrame) -> u64 {
        self.frames.get(frame.as_index()).map_or(0, |f| f.last_use)
    }

    /// Frees every frame owned by `pid`. Returns how many were released.
    pub fn release_owned_by(&mut self, pid: Pid) -> usize {
        let mut released = 0;
        for info in &mut self.frames {
            if matches!(info.owner, Some((owner, _)) if owner == pid) {
                *info = FrameInfo::FREE;
                released += 1;
            }
        }
        released
    }

    /// Iterates `(frame, owner)` pairs in frame order.
    pub fn iter(&self) -> impl Iterator<Item = (PhysFrame, Option<(Pid, VirtPage)>)> + '_ {
        self.frames
            .iter()
            .enumerate()
            .map(|(i, f)| (PhysFrame::from_raw(i as u32), f.owner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(raw: u32) -> Pid {
        Pid::from_raw(raw)
    }

    fn vpn(raw: u32) -> VirtPage {
        VirtPage::from_raw(raw)
    }

    #[test]
    fn claims_lowest_free_frame_first() {
        let mut map = CoreMap::new(3);
        assert_eq!(map.find_free(pid(1), vpn(0)), Some(PhysFrame::from_raw(0)));
        assert_eq!(map.find_free(pid(1), vpn(1)), Some(PhysFrame::from_raw(1)));
        map.clear(PhysFrame::from_raw(0));
        assert_eq!(map.find_free(pid(2), vpn(9)), Some(PhysFrame::from_raw(0)));
        assert_eq!(map.owner_of(PhysFrame::from_raw(0)), Some((pid(2), vpn(9))));
    }

    #[test]
    fn pool_exhaustion_returns_none() {
        let mut map = CoreMap::new(1);
        assert!(map.find_free(pid(1), vpn(0)).is_some());
        assert_eq!(map.find_free(pid(1), vpn(1)), None);
        assert_eq!(map.count_free(), 0);
    }

    #[test]
    fn mark_replaces_previous_owner() {
        let mut map = CoreMap::new(2);
        let frame = map.find_free(pid(1), vpn(4)).expect("claim");
        map.touch(frame, 17);
        map.mark(frame, pid(2), vpn(8));
        assert_eq!(map.owner_of(frame), Some((pid(2), vpn(8))));
        // Reassignment resets the recency stamp.
        assert_eq!(map.last_use(frame), 0);
    }

    #[test]
    fn release_owned_by_sweeps_only_that_process() {
        let mut map = CoreMap::new(4);
        map.find_free(pid(1), vpn(0));
        map.find_free(pid(2), vpn(0));
        map.find_free(pid(1), vpn(1));
        assert_eq!(map.release_owned_by(pid(1)), 2);
        assert_eq!(map.count_free(), 3);
        assert!(map.owner_of(PhysFrame::from_raw(1)).is_some());
    }
}
