// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-process backing store for evicted dirty pages
//! OWNERS: @kernel-team
//! PUBLIC API: BackingStore, SectorStore, FileStore, MemStore, SwapError
//! DEPENDS_ON: config::{PAGE_SIZE, IO_RETRIES}, types::{SlotIndex, VirtPage}
//! INVARIANTS: Slot assignment is monotonic; a slot is never reused for a
//!             different virtual page. One slot holds exactly one page.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::config::{IO_RETRIES, PAGE_SIZE};
use crate::types::{Pid, SlotIndex, VirtPage};

/// Errors reported by backing-store operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SwapError {
    /// Device I/O kept failing after [`IO_RETRIES`] attempts.
    Io(io::ErrorKind),
    /// A read or write addressed a slot that was never assigned.
    SlotOutOfRange,
}

/// Block device abstraction under a backing store. Offsets are bytes.
pub trait SectorStore: Send {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;
}

/// File-backed store, one `swap.<pid>` file per process. The file is
/// removed when the store is dropped, alongside its address space.
pub struct FileStore {
    file: File,
    path: PathBuf,
}

impl FileStore {
    pub fn create(dir: &Path, pid: Pid) -> io::Result<Self> {
        let path = dir.join(format!("swap.{pid}"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        log::debug!(target: "swap", "pid {pid}: backing file {}", path.display());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SectorStore for FileStore {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            log::warn!(target: "swap", "failed to remove {}: {err}", self.path.display());
        }
    }
}

/// In-memory store used by unit tests and swapless experiments.
#[derive(Default)]
pub struct MemStore {
    bytes: Vec<u8>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SectorStore for MemStore {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.bytes.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of store"));
        }
        buf.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.bytes.len() {
            self.bytes.resize(end, 0);
        }
        self.bytes[start..end].copy_from_slice(buf);
        Ok(())
    }
}

/// Maps a process's virtual pages to slots in its private store.
pub struct BackingStore {
    /// Slot assigned to each virtual page, if the page was ever paged out.
    slots: Vec<Option<SlotIndex>>,
    next_slot: u32,
    dev: Box<dyn SectorStore>,
}

impl BackingStore {
    pub fn new(dev: Box<dyn SectorStore>) -> Self {
        Self { slots: Vec::new(), next_slot: 0, dev }
    }

    /// Returns the slot holding `vpn`, if one was ever assigned.
    pub fn slot_of(&self, vpn: VirtPage) -> Option<SlotIndex> {
        self.slots.get(vpn.as_index()).copied().flatten()
    }

    /// Assigns a slot to `vpn` on first use and returns it. Assignments
    /// are permanent for the lifetime of the store.
    pub fn assign(&mut self, vpn: VirtPage) -> SlotIndex {
        if vpn.as_index() >= self.slots.len() {
            self.slots.resize(vpn.as_index() + 1, None);
        }
        match self.slots[vpn.as_index()] {
            Some(slot) => slot,
            None => {
                let slot = SlotIndex::from_raw(self.next_slot);
                self.next_slot += 1;
                self.slots[vpn.as_index()] = Some(slot);
                slot
            }
        }
    }

    /// Number of slots assigned so far. Grows monotonically.
    pub fn slot_count(&self) -> usize {
        self.next_slot as usize
    }

    /// Writes one page into `slot`, retrying transient device errors.
    pub fn write_page(&mut self, slot: SlotIndex, bytes: &[u8]) -> Result<(), SwapError> {
        debug_assert_eq!(bytes.len(), PAGE_SIZE);
        if slot.as_raw() >= self.next_slot {
            return Err(SwapError::SlotOutOfRange);
        }
        retry("write", slot, || dev_write(self.dev.as_mut(), slot.byte_offset(), bytes))
    }

    /// Reads one page out of `slot`, retrying transient device errors.
    pub fn read_page(&mut self, slot: SlotIndex, buf: &mut [u8]) -> Result<(), SwapError> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        if slot.as_raw() >= self.next_slot {
            return Err(SwapError::SlotOutOfRange);
        }
        let dev = self.dev.as_mut();
        let offset = slot.byte_offset();
        retry("read", slot, || dev.read_at(offset, &mut buf[..]))
    }
}

fn dev_write(dev: &mut dyn SectorStore, offset: u64, bytes: &[u8]) -> io::Result<()> {
    #[cfg(feature = "failpoints")]
    if failpoints::take_write_failure() {
        return Err(io::Error::new(io::ErrorKind::Other, "injected store failure"));
    }
    dev.write_at(offset, bytes)
}

fn retry<T>(
    op: &str,
    slot: SlotIndex,
    mut attempt: impl FnMut() -> io::Result<T>,
) -> Result<T, SwapError> {
    let mut last = io::ErrorKind::Other;
    for n in 1..=IO_RETRIES {
        match attempt() {
            Ok(value) => return Ok(value),
            Err(err) => {
                log::warn!(
                    target: "swap",
                    "{op} slot {slot} failed (attempt {n}/{IO_RETRIES}): {err}"
                );
                last = err.kind();
            }
        }
    }
    Err(SwapError::Io(last))
}

#[cfg(feature = "failpoints")]
pub mod failpoints {
    use std::cell::Cell;

    thread_local! {
        // Thread-local so concurrently running tests cannot observe each
        // other's injected failures.
        static FAIL_WRITES: Cell<usize> = Cell::new(0);
    }

    /// Forces the next `n` backing-store write attempts on this thread to
    /// fail with a simulated device error. Each retry consumes one failure.
    pub fn fail_writes(n: usize) {
        FAIL_WRITES.with(|count| count.set(n));
    }

    pub(super) fn take_write_failure() -> bool {
        FAIL_WRITES.with(|count| {
            let n = count.get();
            if n == 0 {
                false
            } else {
                count.set(n - 1);
                true
            }
        })
    }
}
