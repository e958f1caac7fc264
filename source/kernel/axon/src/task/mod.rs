// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process bookkeeping for the paging core.
//! OWNERS: kernel-mm
//! PUBLIC API: `TaskTable`, `Process`, `SpawnError`, `TaskError`
//! DEPENDS_ON: address spaces, frame map, machine state
//! INVARIANTS:
//!   - Pids are slot indices; a pid is live exactly while its slot is
//!     occupied, and may be reused after termination.
//!   - At most one process is current, and only the current process's
//!     translations are in the MMU cache.
//!   - Termination returns every owned frame and drops the backing store,
//!     which removes its swap file.

use std::io;

use spin::Mutex;

use crate::config::{SwapBackend, VmConfig, MAX_PROCS};
use crate::loader::{ImageError, UserImage};
use crate::machine::mmu::Mmu;
use crate::machine::{Machine, PhysMemory};
use crate::mm::address_space::{AddressSpace, AddressSpaceError};
use crate::mm::coremap::CoreMap;
use crate::mm::swap::{BackingStore, FileStore, MemStore};
use crate::types::Pid;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SpawnError {
    /// The program image failed to parse.
    Image(ImageError),
    /// Address-space construction failed, e.g. eager load without frames.
    Space(AddressSpaceError),
    /// All process slots are occupied.
    TableFull,
    /// The per-process swap file could not be created.
    SwapSetup(io::ErrorKind),
}

impl From<ImageError> for SpawnError {
    fn from(err: ImageError) -> Self {
        Self::Image(err)
    }
}

impl From<AddressSpaceError> for SpawnError {
    fn from(err: AddressSpaceError) -> Self {
        Self::Space(err)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskError {
    UnknownProcess,
}

/// One live user process.
pub struct Process {
    pub pid: Pid,
    pub space: AddressSpace,
    /// Registers are initialized on the first switch-in, not at spawn.
    started: bool,
}

/// Fixed-capacity table of live processes, indexed by pid.
pub struct TaskTable {
    slots: Vec<Option<Process>>,
    current: Option<Pid>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self { slots: Vec::new(), current: None }
    }

    /// Parses `image_bytes` and creates a process for it. With swap enabled
    /// every space gets a private backing store, whatever its load mode: an
    /// eagerly loaded space can still lose frames to someone else's fault.
    pub fn spawn(
        &mut self,
        image_bytes: Vec<u8>,
        config: &VmConfig,
        frames: &Mutex<CoreMap>,
        memory: &mut PhysMemory,
    ) -> Result<Pid, SpawnError> {
        let slot = match self.slots.iter().position(Option::is_none) {
            Some(free) => free,
            None if self.slots.len() < MAX_PROCS => {
                self.slots.push(None);
                self.slots.len() - 1
            }
            None => return Err(SpawnError::TableFull),
        };
        let pid = Pid::from_raw(slot as u32);

        let image = UserImage::parse(image_bytes)?;
        let store = if config.swap {
            Some(match config.swap_backend {
                SwapBackend::File => BackingStore::new(Box::new(
                    FileStore::create(&config.swap_dir, pid)
                        .map_err(|err| SpawnError::SwapSetup(err.kind()))?,
                )),
                SwapBackend::Memory => BackingStore::new(Box::new(MemStore::new())),
            })
        } else {
            None
        };
        let space = AddressSpace::new(image, pid, config.load, store, frames, memory)?;

        log::info!(
            target: "task",
            "pid {pid}: spawned, {} pages, {:?} load",
            space.page_count(),
            config.load
        );
        self.slots[slot] = Some(Process { pid, space, started: false });
        Ok(pid)
    }

    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    /// Live processes.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    fn process(&self, pid: Pid) -> Option<&Process> {
        self.slots.get(pid.as_index()).and_then(Option::as_ref)
    }

    fn process_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.slots.get_mut(pid.as_index()).and_then(Option::as_mut)
    }

    pub fn space(&self, pid: Pid) -> Option<&AddressSpace> {
        self.process(pid).map(|proc| &proc.space)
    }

    pub fn space_mut(&mut self, pid: Pid) -> Option<&mut AddressSpace> {
        self.process_mut(pid).map(|proc| &mut proc.space)
    }

    /// Makes `pid` the running process: the outgoing space's cache state is
    /// flushed to its table, the incoming table is handed to the MMU, and on
    /// a first switch-in the register file is set up for entry.
    pub fn switch_to(&mut self, pid: Pid, machine: &mut Machine) -> Result<(), TaskError> {
        if self.process(pid).is_none() {
            return Err(TaskError::UnknownProcess);
        }
        if self.current == Some(pid) {
            return Ok(());
        }
        if let Some(previous) = self.current {
            if let Some(proc) = self.process_mut(previous) {
                proc.space.save_state(&mut machine.mmu);
            }
        }
        let Some(proc) = self.process_mut(pid) else {
            return Err(TaskError::UnknownProcess);
        };
        proc.space.restore_state(&mut machine.mmu);
        if !proc.started {
            proc.space.init_registers(&mut machine.regs);
            proc.started = true;
        }
        self.current = Some(pid);
        log::debug!(target: "task", "pid {pid}: now running");
        Ok(())
    }

    /// Destroys `pid`: returns its frames to the pool, drops its cached
    /// translations if it was running, and deletes its swap file by
    /// dropping the store. Returns false for an unknown pid.
    pub fn terminate(&mut self, pid: Pid, frames: &Mutex<CoreMap>, mmu: &mut Mmu) -> bool {
        let Some(mut proc) = self
            .slots
            .get_mut(pid.as_index())
            .and_then(Option::take)
        else {
            return false;
        };
        let released = proc.space.release_frames(&mut frames.lock());
        if self.current == Some(pid) {
            self.current = None;
            mmu.invalidate_all();
        }
        log::info!(target: "task", "pid {pid}: terminated, {released} frames released");
        true
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}
