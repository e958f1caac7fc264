// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Translation cache between the CPU and per-process page tables
//! OWNERS: @kernel-team
//! PUBLIC API: Mmu, translate, install, retire, activate, flush_all
//! DEPENDS_ON: mm::page_table::{PageTable, TranslationEntry}, config
//! INVARIANTS: The cache only ever mirrors entries of the active address
//!             space. Used/dirty bits accumulate in cached copies and reach
//!             the page table exclusively through the flush operations here.

use crate::config::{TranslationMode, TLB_SIZE};
use crate::machine::Exception;
use crate::mm::page_table::{EntryFlags, PageTable, TranslationEntry};
use crate::types::{VirtAddr, VirtPage};

enum TranslationCache {
    /// Small fully-associative TLB with a round-robin install cursor.
    Tlb { lines: [Option<TranslationEntry>; TLB_SIZE], cursor: usize },
    /// Installed copy of the active page table.
    Table { entries: Vec<TranslationEntry> },
}

/// The machine's address-translation unit.
pub struct Mmu {
    cache: TranslationCache,
    phys_frames: usize,
}

impl Mmu {
    pub fn new(mode: TranslationMode, phys_frames: usize) -> Self {
        let cache = match mode {
            TranslationMode::Tlb => TranslationCache::Tlb { lines: [None; TLB_SIZE], cursor: 0 },
            TranslationMode::PageTable => TranslationCache::Table { entries: Vec::new() },
        };
        Self { cache, phys_frames }
    }

    pub fn mode(&self) -> TranslationMode {
        match self.cache {
            TranslationCache::Tlb { .. } => TranslationMode::Tlb,
            TranslationCache::Table { .. } => TranslationMode::PageTable,
        }
    }

    /// Translates `va` to a physical byte offset, updating used/dirty bits
    /// on the cached entry. A miss raises `PageFault`; the fault path is
    /// expected to install the missing entry and re-run the access.
    pub fn translate(&mut self, va: VirtAddr, write: bool) -> Result<usize, Exception> {
        let vpn = va.page();
        let entry = match &mut self.cache {
            TranslationCache::Tlb { lines, .. } => lines
                .iter_mut()
                .flatten()
                .find(|entry| entry.is_valid() && entry.virtual_page == vpn)
                .ok_or(Exception::PageFault)?,
            TranslationCache::Table { entries } => {
                let entry = entries.get_mut(vpn.as_index()).ok_or(Exception::AddressError)?;
                if !entry.is_valid() {
                    return Err(Exception::PageFault);
                }
                entry
            }
        };
        if write && entry.is_read_only() {
            return Err(Exception::ReadOnly);
        }
        entry.flags.insert(EntryFlags::USED);
        if write {
            entry.flags.insert(EntryFlags::DIRTY);
        }
        let frame = entry.frame.ok_or(Exception::BusError)?;
        if frame.as_index() >= self.phys_frames {
            return Err(Exception::BusError);
        }
        Ok(frame.base() + va.page_offset())
    }

    /// Installs a fresh copy of `entry`, displacing an older line if needed.
    /// Displaced bits are flushed into `table` before they are lost.
    pub fn install(&mut self, entry: TranslationEntry, table: &mut PageTable) {
        match &mut self.cache {
            TranslationCache::Tlb { lines, cursor } => {
                // A page that is already cached is refreshed in place.
                let slot = lines
                    .iter()
                    .position(|line| {
                        matches!(line, Some(old) if old.virtual_page == entry.virtual_page)
                    })
                    .unwrap_or_else(|| {
                        let slot = *cursor;
                        *cursor = (*cursor + 1) % TLB_SIZE;
                        slot
                    });
                if let Some(old) = lines[slot].take() {
                    merge_flags(table, &old);
                }
                lines[slot] = Some(entry);
            }
            TranslationCache::Table { entries } => {
                if let Some(old) = entries.get_mut(entry.virtual_page.as_index()) {
                    merge_flags(table, old);
                    *old = entry;
                }
            }
        }
    }

    /// Drops any cached copy of `vpn` after merging its bits into `table`.
    /// Used when the page is evicted out from under the running process.
    pub fn retire(&mut self, vpn: VirtPage, table: &mut PageTable) {
        match &mut self.cache {
            TranslationCache::Tlb { lines, .. } => {
                for line in lines.iter_mut() {
                    if matches!(line, Some(entry) if entry.virtual_page == vpn) {
                        if let Some(old) = line.take() {
                            merge_flags(table, &old);
                        }
                    }
                }
            }
            TranslationCache::Table { entries } => {
                if let Some(entry) = entries.get_mut(vpn.as_index()) {
                    merge_flags(table, entry);
                    entry.detach();
                }
            }
        }
    }

    /// Propagates used/dirty bits of all cached entries into `table`
    /// without invalidating anything. The replacement sweep runs on
    /// freshly synced tables.
    pub fn sync_flags(&mut self, table: &mut PageTable) {
        match &mut self.cache {
            TranslationCache::Tlb { lines, .. } => {
                for entry in lines.iter_mut().flatten() {
                    merge_flags(table, entry);
                    entry.flags.remove(EntryFlags::USED | EntryFlags::DIRTY);
                }
            }
            TranslationCache::Table { entries } => {
                for entry in entries.iter_mut().filter(|e| e.is_valid()) {
                    merge_flags(table, entry);
                    entry.flags.remove(EntryFlags::USED | EntryFlags::DIRTY);
                }
            }
        }
    }

    /// Context-switch out: flush all cached bits into `table`, then drop
    /// every cached entry.
    pub fn flush_all(&mut self, table: &mut PageTable) {
        self.sync_flags(table);
        self.invalidate_all();
    }

    /// Context-switch in: install `table` wholesale in page-table mode, or
    /// start with a cold TLB that refills through faults.
    pub fn activate(&mut self, table: &PageTable) {
        match &mut self.cache {
            TranslationCache::Tlb { lines, cursor } => {
                *lines = [None; TLB_SIZE];
                *cursor = 0;
            }
            TranslationCache::Table { entries } => {
                *entries = table.iter().copied().collect();
            }
        }
    }

    pub fn invalidate_all(&mut self) {
        match &mut self.cache {
            TranslationCache::Tlb { lines, cursor } => {
                *lines = [None; TLB_SIZE];
                *cursor = 0;
            }
            TranslationCache::Table { entries } => entries.clear(),
        }
    }

    /// Returns the cached copy for `vpn`, if the cache currently holds one.
    pub fn cached_entry(&self, vpn: VirtPage) -> Option<TranslationEntry> {
        match &self.cache {
            TranslationCache::Tlb { lines, .. } => lines
                .iter()
                .flatten()
                .find(|entry| entry.is_valid() && entry.virtual_page == vpn)
                .copied(),
            TranslationCache::Table { entries } => {
                entries.get(vpn.as_index()).filter(|entry| entry.is_valid()).copied()
            }
        }
    }
}

/// Ors the used/dirty bits of a cached copy back into the owning table.
fn merge_flags(table: &mut PageTable, cached: &TranslationEntry) {
    if !cached.is_valid() {
        return;
    }
    if let Some(entry) = table.entry_mut(cached.virtual_page) {
        entry.flags.insert(cached.flags & (EntryFlags::USED | EntryFlags::DIRTY));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::types::PhysFrame;

    fn mapped_entry(vpn: u32, frame: u32) -> TranslationEntry {
        let mut entry = TranslationEntry::unmapped(VirtPage::from_raw(vpn));
        entry.attach(PhysFrame::from_raw(frame));
        entry
    }

    fn table_with(pages: usize, mapped: &[(u32, u32)]) -> PageTable {
        let mut table = PageTable::new_unmapped(pages);
        for &(vpn, frame) in mapped {
            table
                .entry_mut(VirtPage::from_raw(vpn))
                .expect("page in range")
                .attach(PhysFrame::from_raw(frame));
        }
        table
    }

    #[test]
    fn tlb_miss_raises_page_fault() {
        let mut mmu = Mmu::new(TranslationMode::Tlb, 4);
        let va = VirtAddr::from_raw(10);
        assert_eq!(mmu.translate(va, false), Err(Exception::PageFault));
    }

    #[test]
    fn install_then_hit_sets_used_and_dirty() {
        let mut table = table_with(2, &[(0, 1)]);
        let mut mmu = Mmu::new(TranslationMode::Tlb, 4);
        mmu.install(*table.entry(VirtPage::from_raw(0)).expect("entry"), &mut table);

        let pa = mmu.translate(VirtAddr::from_raw(5), true).expect("hit");
        assert_eq!(pa, PAGE_SIZE + 5);

        let cached = mmu.cached_entry(VirtPage::from_raw(0)).expect("cached");
        assert!(cached.is_used());
        assert!(cached.is_dirty());
        // Bits live in the cache until a flush.
        let entry = table.entry(VirtPage::from_raw(0)).expect("entry");
        assert!(!entry.is_used());

        mmu.flush_all(&mut table);
        let entry = table.entry(VirtPage::from_raw(0)).expect("entry");
        assert!(entry.is_used());
        assert!(entry.is_dirty());
        assert!(mmu.cached_entry(VirtPage::from_raw(0)).is_none());
    }

    #[test]
    fn stores_to_read_only_pages_are_refused() {
        let mut table = table_with(1, &[(0, 0)]);
        table.entry_mut(VirtPage::from_raw(0)).expect("entry").flags.insert(EntryFlags::READ_ONLY);
        let mut mmu = Mmu::new(TranslationMode::Tlb, 4);
        mmu.install(*table.entry(VirtPage::from_raw(0)).expect("entry"), &mut table);

        assert_eq!(mmu.translate(VirtAddr::from_raw(0), true), Err(Exception::ReadOnly));
        assert!(mmu.translate(VirtAddr::from_raw(0), false).is_ok());
    }

    #[test]
    fn round_robin_displacement_flushes_old_bits() {
        let mappings: Vec<(u32, u32)> = (0..5).map(|i| (i, i)).collect();
        let mut table = table_with(5, &mappings);
        let mut mmu = Mmu::new(TranslationMode::Tlb, 8);

        mmu.install(*table.entry(VirtPage::from_raw(0)).expect("entry"), &mut table);
        // Touch page 0 so its cached copy carries a used bit.
        mmu.translate(VirtAddr::from_raw(0), false).expect("hit");

        for vpn in 1..5u32 {
            let entry = *table.entry(VirtPage::from_raw(vpn)).expect("entry");
            mmu.install(entry, &mut table);
        }
        // Page 0 was displaced by the fifth install and its bits flushed.
        assert!(mmu.cached_entry(VirtPage::from_raw(0)).is_none());
        assert!(table.entry(VirtPage::from_raw(0)).expect("entry").is_used());
    }

    #[test]
    fn table_mode_bounds_raise_address_error() {
        let table = table_with(2, &[(0, 0), (1, 1)]);
        let mut mmu = Mmu::new(TranslationMode::PageTable, 4);
        mmu.activate(&table);

        assert!(mmu.translate(VirtAddr::from_raw(0), false).is_ok());
        let out_of_range = VirtAddr::from_raw(2 * PAGE_SIZE as u32);
        assert_eq!(mmu.translate(out_of_range, false), Err(Exception::AddressError));
    }

    #[test]
    fn retire_drops_the_cached_copy() {
        let mut table = table_with(1, &[(0, 0)]);
        let mut mmu = Mmu::new(TranslationMode::Tlb, 4);
        mmu.install(*table.entry(VirtPage::from_raw(0)).expect("entry"), &mut table);
        mmu.translate(VirtAddr::from_raw(1), true).expect("hit");

        mmu.retire(VirtPage::from_raw(0), &mut table);
        assert!(mmu.cached_entry(VirtPage::from_raw(0)).is_none());
        assert!(table.entry(VirtPage::from_raw(0)).expect("entry").is_dirty());
    }
}
