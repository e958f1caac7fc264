// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Single-level page tables.
//!
//! One [`TranslationEntry`] per virtual page of an address space. The entry
//! is the authoritative record; the machine's translation cache only ever
//! holds copies of it, reconciled through the MMU flush operations.

use bitflags::bitflags;

use crate::types::{PhysFrame, VirtPage};

bitflags! {
    /// Status bits shared between page-table entries and cache copies.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct EntryFlags: u8 {
        const VALID = 1 << 0;
        const READ_ONLY = 1 << 1;
        const USED = 1 << 2;
        const DIRTY = 1 << 3;
    }
}

/// Mapping state of one virtual page.
///
/// Invariant: `VALID` is set exactly when `frame` is `Some`, and then the
/// frame table records that frame as owned by this (process, page) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TranslationEntry {
    pub virtual_page: VirtPage,
    pub frame: Option<PhysFrame>,
    pub flags: EntryFlags,
}

impl TranslationEntry {
    /// An invalid entry with no frame and all status bits clear.
    pub fn unmapped(virtual_page: VirtPage) -> Self {
        Self { virtual_page, frame: None, flags: EntryFlags::empty() }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.flags.contains(EntryFlags::VALID)
    }

    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.flags.contains(EntryFlags::READ_ONLY)
    }

    #[inline]
    pub fn is_used(&self) -> bool {
        self.flags.contains(EntryFlags::USED)
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.flags.contains(EntryFlags::DIRTY)
    }

    /// Binds the entry to `frame` with fresh status bits. Preserves the
    /// read-only bit, which belongs to the page, not to the mapping.
    pub fn attach(&mut self, frame: PhysFrame) {
        self.frame = Some(frame);
        self.flags.insert(EntryFlags::VALID);
        self.flags.remove(EntryFlags::USED | EntryFlags::DIRTY);
    }

    /// Unbinds the entry from its frame. Returns whether the page was dirty
    /// at the moment of detachment.
    pub fn detach(&mut self) -> bool {
        let was_dirty = self.is_dirty();
        self.frame = None;
        self.flags.remove(EntryFlags::VALID | EntryFlags::USED | EntryFlags::DIRTY);
        was_dirty
    }
}

/// The page table of one address space.
#[derive(Clone, Debug)]
pub struct PageTable {
    entries: Vec<TranslationEntry>,
}

impl PageTable {
    /// Creates a table of `pages` unmapped entries.
    pub fn new_unmapped(pages: usize) -> Self {
        let entries = (0..pages)
            .map(|i| TranslationEntry::unmapped(VirtPage::from_raw(i as u32)))
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the entry for `vpn`, or `None` when the page is outside the
    /// address space.
    pub fn entry(&self, vpn: VirtPage) -> Option<&TranslationEntry> {
        self.entries.get(vpn.as_index())
    }

    pub fn entry_mut(&mut self, vpn: VirtPage) -> Option<&mut TranslationEntry> {
        self.entries.get_mut(vpn.as_index())
    }

    pub fn iter(&self) -> impl Iterator<Item = &TranslationEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TranslationEntry> {
        self.entries.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_and_detach_cycle_status_bits() {
        let mut entry = TranslationEntry::unmapped(VirtPage::from_raw(7));
        entry.flags.insert(EntryFlags::READ_ONLY);

        entry.attach(PhysFrame::from_raw(3));
        assert!(entry.is_valid());
        assert!(entry.is_read_only());
        assert!(!entry.is_used());
        assert!(!entry.is_dirty());

        entry.flags.insert(EntryFlags::DIRTY);
        assert!(entry.detach());
        assert!(!entry.is_valid());
        assert_eq!(entry.frame, None);
        // Read-only survives eviction; it describes the page itself.
        assert!(entry.is_read_only());
    }

    #[test]
    fn unmapped_table_has_no_valid_entries() {
        let table = PageTable::new_unmapped(5);
        assert_eq!(table.len(), 5);
        assert!(table.iter().all(|e| !e.is_valid() && e.frame.is_none()));
        assert!(table.entry(VirtPage::from_raw(5)).is_none());
    }
}
