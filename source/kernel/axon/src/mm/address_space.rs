// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-process virtual address space.
//! OWNERS: kernel-mm
//! PUBLIC API: `AddressSpace`, `AddressSpaceError`, `PageSource`
//! DEPENDS_ON: loader images, frame map, backing store, MMU cache
//! INVARIANTS:
//!   - The page table is the authority; the MMU only ever holds copies.
//!   - A page is VALID exactly while the frame map records this space as the
//!     owner of its frame.
//!   - Backing-store slots are assigned once and never move; a page that was
//!     ever swapped out refills from its slot, not from the image.
//!   - `write_to_swap` always invalidates the entry, and touches the store
//!     only when the page was dirty.

use core::fmt;

use spin::Mutex;

use crate::config::{LoadMode, PAGE_SIZE, STACK_SLACK, USER_STACK_SIZE};
use crate::loader::{ImageError, UserImage};
use crate::machine::mmu::Mmu;
use crate::machine::{PhysMemory, RegisterFile, SP_REG};
use crate::mm::coremap::CoreMap;
use crate::mm::page_table::{EntryFlags, PageTable, TranslationEntry};
use crate::mm::swap::{BackingStore, SwapError};
use crate::types::{PhysFrame, Pid, VirtPage};

/// Hard ceiling on pages per space, so a hostile image header cannot make us
/// allocate an absurd page table.
const MAX_SPACE_PAGES: usize = 1 << 20;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddressSpaceError {
    /// The program image is malformed or a segment read fell outside it.
    Image(ImageError),
    /// Eager construction found fewer free frames than the space needs.
    OutOfFrames,
    /// The image plus stack would exceed the per-space page ceiling.
    TooLarge,
    /// A page number outside this space reached a space operation.
    BadVirtualPage,
    /// A dirty page had to leave memory but the space has no backing store.
    SwapDisabled,
    /// The backing store failed after exhausting its retry budget.
    Swap(SwapError),
}

impl From<ImageError> for AddressSpaceError {
    fn from(err: ImageError) -> Self {
        Self::Image(err)
    }
}

impl From<SwapError> for AddressSpaceError {
    fn from(err: SwapError) -> Self {
        Self::Swap(err)
    }
}

/// Where the bytes of a page come from on its next fill.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PageSource {
    /// Slice of the code segment, as offset and length within the segment.
    FromCode { offset: u32, len: u32 },
    /// Slice of the initialized-data segment.
    FromData { offset: u32, len: u32 },
    /// Uninitialized data or stack; the frame stays zeroed.
    ZeroFill,
    /// The page was evicted dirty before; its slot is the only valid copy.
    FromBackingStore(crate::types::SlotIndex),
}

/// One contiguous run of page bytes, resolved against the image layout.
/// Pages that straddle a segment boundary decompose into several spans.
enum ImageSpan {
    Code { offset: u32, len: u32 },
    Data { offset: u32, len: u32 },
    Zero { len: u32 },
}

/// Everything the kernel knows about one user process's memory: the program
/// image it was created from, the page table, and the optional private
/// backing store for pages evicted dirty.
pub struct AddressSpace {
    pid: Pid,
    image: UserImage,
    table: PageTable,
    store: Option<BackingStore>,
    page_count: usize,
}

// Manual because `BackingStore` holds a `Box<dyn SectorStore>` with no
// `Debug` bound; the device is summarized by its slot count.
impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("pid", &self.pid)
            .field("image", &self.image)
            .field("table", &self.table)
            .field("store_slots", &self.store.as_ref().map(BackingStore::slot_count))
            .field("page_count", &self.page_count)
            .finish()
    }
}

impl AddressSpace {
    /// Builds the space for `image`.
    ///
    /// Under [`LoadMode::Eager`] every page is given a frame and filled
    /// immediately; the free-frame check and the claims happen under one
    /// frame-map lock so two spaces constructed back to back cannot both
    /// pass the check and then starve each other. Under
    /// [`LoadMode::Demand`] the table starts fully unmapped.
    pub fn new(
        image: UserImage,
        pid: Pid,
        load: LoadMode,
        store: Option<BackingStore>,
        frames: &Mutex<CoreMap>,
        memory: &mut PhysMemory,
    ) -> Result<Self, AddressSpaceError> {
        let bytes = image.size() as usize + USER_STACK_SIZE;
        let page_count = bytes.div_ceil(PAGE_SIZE);
        if page_count > MAX_SPACE_PAGES {
            return Err(AddressSpaceError::TooLarge);
        }

        let mut space = Self {
            pid,
            image,
            table: PageTable::new_unmapped(page_count),
            store,
            page_count,
        };
        space.protect_code_pages();
        log::debug!(
            target: "mm",
            "pid {pid}: address space of {page_count} pages ({bytes} bytes incl. stack), {load:?}"
        );

        if load == LoadMode::Eager {
            space.populate_eagerly(frames, memory)?;
        }
        Ok(space)
    }

    /// Marks pages that lie wholly inside the code segment read-only. A page
    /// shared between code and data stays writable.
    fn protect_code_pages(&mut self) {
        let (code_start, code_end) = self.image.code_span();
        if code_start == code_end {
            return;
        }
        for entry in self.table.iter_mut() {
            let base = entry.virtual_page.base().as_raw();
            let end = base + PAGE_SIZE as u32;
            if base >= code_start && end <= code_end {
                entry.flags.insert(EntryFlags::READ_ONLY);
            }
        }
    }

    fn populate_eagerly(
        &mut self,
        frames: &Mutex<CoreMap>,
        memory: &mut PhysMemory,
    ) -> Result<(), AddressSpaceError> {
        let claimed: Vec<PhysFrame> = {
            let mut map = frames.lock();
            if map.count_free() < self.page_count {
                return Err(AddressSpaceError::OutOfFrames);
            }
            (0..self.page_count)
                .filter_map(|index| map.find_free(self.pid, VirtPage::from_raw(index as u32)))
                .collect()
        };
        if claimed.len() != self.page_count {
            // Cannot happen while the lock above was held; bail cleanly
            // rather than trusting it.
            self.release_claims(frames, &claimed);
            return Err(AddressSpaceError::OutOfFrames);
        }
        for (index, frame) in claimed.iter().enumerate() {
            let vpn = VirtPage::from_raw(index as u32);
            if let Err(err) = self.load_page(vpn, *frame, memory) {
                self.release_claims(frames, &claimed);
                return Err(err);
            }
        }
        Ok(())
    }

    fn release_claims(&mut self, frames: &Mutex<CoreMap>, claimed: &[PhysFrame]) {
        let mut map = frames.lock();
        for frame in claimed {
            map.clear(*frame);
        }
        for entry in self.table.iter_mut() {
            if entry.is_valid() {
                entry.detach();
            }
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Pages in this space, program image plus stack.
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn table(&self) -> &PageTable {
        &self.table
    }

    pub(crate) fn table_mut(&mut self) -> &mut PageTable {
        &mut self.table
    }

    pub fn entry(&self, vpn: VirtPage) -> Option<&TranslationEntry> {
        self.table.entry(vpn)
    }

    /// Slots ever assigned in the backing store. Zero when swap is off.
    pub fn backing_slots(&self) -> usize {
        self.store.as_ref().map_or(0, BackingStore::slot_count)
    }

    /// Sets up the register file for first execution: everything zeroed,
    /// the program counter pair at the image entry point, and the stack
    /// pointer a small slack below the top of the space.
    pub fn init_registers(&self, regs: &mut RegisterFile) {
        regs.clear();
        regs.pc = self.image.entry();
        regs.next_pc = self.image.entry().wrapping_add(4);
        let stack_top = self.page_count * PAGE_SIZE - STACK_SLACK;
        regs.gpr[SP_REG] = stack_top as u32;
        log::debug!(target: "mm", "pid {}: initial stack pointer {:#x}", self.pid, stack_top);
    }

    /// Called when this process is descheduled: folds the cache's USED and
    /// DIRTY bits back into the table and drops every cached translation.
    pub fn save_state(&mut self, mmu: &mut Mmu) {
        mmu.flush_all(&mut self.table);
    }

    /// Called when this process is scheduled: hands the table to the MMU.
    /// In page-table mode the whole table is installed; in TLB mode the
    /// cache simply starts cold and refills through faults.
    pub fn restore_state(&self, mmu: &mut Mmu) {
        mmu.activate(&self.table);
    }

    /// Classifies where `vpn` would refill from right now. A page with an
    /// assigned slot always refills from the store; everything else is
    /// derived from the image layout.
    pub fn page_source(&self, vpn: VirtPage) -> PageSource {
        if let Some(store) = &self.store {
            if let Some(slot) = store.slot_of(vpn) {
                return PageSource::FromBackingStore(slot);
            }
        }
        match self.span_at(vpn.base().as_raw(), PAGE_SIZE as u32) {
            ImageSpan::Code { offset, len } => PageSource::FromCode { offset, len },
            ImageSpan::Data { offset, len } => PageSource::FromData { offset, len },
            ImageSpan::Zero { .. } => PageSource::ZeroFill,
        }
    }

    /// Resolves the image span starting at `vaddr`, clipped to `limit`
    /// bytes. Addresses outside both segments are zero-fill up to the next
    /// segment start.
    fn span_at(&self, vaddr: u32, limit: u32) -> ImageSpan {
        let (code_start, code_end) = self.image.code_span();
        let (data_start, data_end) = self.image.init_data_span();
        if vaddr >= code_start && vaddr < code_end {
            return ImageSpan::Code {
                offset: vaddr - code_start,
                len: (code_end - vaddr).min(limit),
            };
        }
        if vaddr >= data_start && vaddr < data_end {
            return ImageSpan::Data {
                offset: vaddr - data_start,
                len: (data_end - vaddr).min(limit),
            };
        }
        let mut len = limit;
        for start in [code_start, data_start] {
            if start > vaddr {
                len = len.min(start - vaddr);
            }
        }
        ImageSpan::Zero { len }
    }

    /// Fills `frame` with the current contents of `vpn` and marks the entry
    /// valid with both status bits clear. The caller owns the frame-map
    /// bookkeeping.
    pub fn load_page(
        &mut self,
        vpn: VirtPage,
        frame: PhysFrame,
        memory: &mut PhysMemory,
    ) -> Result<PageSource, AddressSpaceError> {
        if self.table.entry(vpn).is_none() {
            return Err(AddressSpaceError::BadVirtualPage);
        }
        let source = self.page_source(vpn);
        let dst = memory.frame_mut(frame);
        dst.fill(0);
        match source {
            PageSource::FromBackingStore(slot) => {
                let store = self.store.as_mut().ok_or(AddressSpaceError::SwapDisabled)?;
                store.read_page(slot, dst)?;
            }
            _ => self.fill_from_image(vpn, dst)?,
        }
        if let Some(entry) = self.table.entry_mut(vpn) {
            entry.attach(frame);
        }
        log::debug!(
            target: "mm",
            "pid {}: page {} -> frame {} ({source:?})",
            self.pid, vpn, frame
        );
        Ok(source)
    }

    /// Copies the image bytes belonging to `vpn` into an already zeroed
    /// frame, walking the spans so pages straddling code, data and bss all
    /// come out right.
    fn fill_from_image(&self, vpn: VirtPage, dst: &mut [u8]) -> Result<(), AddressSpaceError> {
        let base = vpn.base().as_raw();
        let mut filled: u32 = 0;
        while (filled as usize) < dst.len() {
            let remaining = dst.len() as u32 - filled;
            match self.span_at(base + filled, remaining) {
                ImageSpan::Code { offset, len } => {
                    let out = &mut dst[filled as usize..(filled + len) as usize];
                    self.image.read_code(out, offset)?;
                    filled += len;
                }
                ImageSpan::Data { offset, len } => {
                    let out = &mut dst[filled as usize..(filled + len) as usize];
                    self.image.read_init_data(out, offset)?;
                    filled += len;
                }
                ImageSpan::Zero { len } => {
                    filled += len;
                }
            }
        }
        Ok(())
    }

    /// Pushes `vpn` out of memory. The entry is detached unconditionally;
    /// the page's bytes are written to the store only when the entry was
    /// dirty. Returns whether a write happened.
    ///
    /// A clean page is safe to regenerate: either it was never written and
    /// refills from the image, or it went out dirty once and its slot still
    /// holds the bytes.
    pub fn write_to_swap(
        &mut self,
        vpn: VirtPage,
        frame: PhysFrame,
        memory: &PhysMemory,
    ) -> Result<bool, AddressSpaceError> {
        let entry = self
            .table
            .entry_mut(vpn)
            .ok_or(AddressSpaceError::BadVirtualPage)?;
        debug_assert_eq!(entry.frame, Some(frame));
        let was_dirty = entry.detach();
        if !was_dirty {
            return Ok(false);
        }
        let store = self.store.as_mut().ok_or(AddressSpaceError::SwapDisabled)?;
        let slot = store.assign(vpn);
        store.write_page(slot, memory.frame(frame))?;
        log::debug!(
            target: "mm",
            "pid {}: page {} -> swap slot {}",
            self.pid, vpn, slot
        );
        Ok(true)
    }

    /// Detaches every valid page and clears this space's frames from the
    /// map. Returns how many frames went back to the free pool.
    pub fn release_frames(&mut self, map: &mut CoreMap) -> usize {
        let mut detached = 0usize;
        for entry in self.table.iter_mut() {
            if entry.is_valid() {
                entry.detach();
                detached += 1;
            }
        }
        let released = map.release_owned_by(self.pid);
        debug_assert_eq!(detached, released);
        released
    }
}
