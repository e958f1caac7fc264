// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Top-level paging core: machine, frame map, tasks, pager.
//! OWNERS: kernel-mm
//! PUBLIC API: `Vm`, `AccessError`
//! DEPENDS_ON: every mm, machine and task module
//! INVARIANTS:
//!   - User memory is reached only through the retrying accessors here, so
//!     every translation miss funnels through the trap layer.
//!   - A faulting access is re-executed, never resumed mid-way; the access
//!     that caused a resolved fault observes the repaired cache.

use spin::Mutex;

use crate::config::{PolicyKind, VmConfig};
use crate::machine::{Exception, Machine, RegisterFile};
use crate::mm::coremap::CoreMap;
use crate::mm::page_table::TranslationEntry;
use crate::mm::pager::Pager;
use crate::stats::VmStats;
use crate::task::{SpawnError, TaskError, TaskTable};
use crate::trap::{self, FatalFault, FaultOutcome};
use crate::types::{PhysFrame, Pid, VirtAddr, VirtPage};

/// Resolved faults per access before the access itself is declared broken.
/// A single access touches one page, so one repaired miss normally suffices.
const RESOLVE_ATTEMPTS: usize = 4;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessError {
    /// No process is current.
    NoProcess,
    /// The access raised an exception the kernel could not serve; the
    /// process was terminated.
    Fault(FatalFault),
}

/// The paging core in one piece: physical memory and MMU, the frame map,
/// the process table, and the fault coordinator, wired the way the kernel
/// proper wires them.
pub struct Vm {
    config: VmConfig,
    machine: Machine,
    frames: Mutex<CoreMap>,
    tasks: TaskTable,
    pager: Pager,
    stats: VmStats,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        log::info!(
            target: "vm",
            "paging core: {} frames, {:?} load, {:?} policy, {:?} cache, swap={}",
            config.phys_frames, config.load, config.policy, config.translation, config.swap
        );
        Self {
            machine: Machine::new(&config),
            frames: Mutex::new(CoreMap::new(config.phys_frames)),
            tasks: TaskTable::new(),
            pager: Pager::new(&config),
            stats: VmStats::default(),
            config,
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn policy_kind(&self) -> PolicyKind {
        self.pager.policy_kind()
    }

    /// Creates a process from raw image bytes. The new process is not
    /// scheduled; call [`Vm::switch_to`].
    pub fn spawn(&mut self, image_bytes: &[u8]) -> Result<Pid, SpawnError> {
        self.tasks.spawn(
            image_bytes.to_vec(),
            &self.config,
            &self.frames,
            &mut self.machine.memory,
        )
    }

    pub fn switch_to(&mut self, pid: Pid) -> Result<(), TaskError> {
        self.tasks.switch_to(pid, &mut self.machine)
    }

    pub fn current(&self) -> Option<Pid> {
        self.tasks.current()
    }

    pub fn live_processes(&self) -> usize {
        self.tasks.live()
    }

    pub fn terminate(&mut self, pid: Pid) -> bool {
        self.tasks.terminate(pid, &self.frames, &mut self.machine.mmu)
    }

    /// Reads one byte of the current process's memory, faulting pages in as
    /// needed.
    pub fn read_u8(&mut self, va: VirtAddr) -> Result<u8, AccessError> {
        self.access(|machine| machine.read_u8(va))
    }

    /// Writes one byte of the current process's memory.
    pub fn write_u8(&mut self, va: VirtAddr, value: u8) -> Result<(), AccessError> {
        self.access(|machine| machine.write_u8(va, value))
    }

    /// Reads an aligned word, little-endian.
    pub fn read_u32(&mut self, va: VirtAddr) -> Result<u32, AccessError> {
        self.access(|machine| machine.read_u32(va))
    }

    /// Writes an aligned word, little-endian.
    pub fn write_u32(&mut self, va: VirtAddr, value: u32) -> Result<(), AccessError> {
        self.access(|machine| machine.write_u32(va, value))
    }

    /// Copies `buf.len()` bytes out of user memory, byte by byte so page
    /// boundaries and faults fall out of the single-byte path.
    pub fn read_buf(&mut self, va: VirtAddr, buf: &mut [u8]) -> Result<(), AccessError> {
        let mut addr = va;
        for index in 0..buf.len() {
            buf[index] = self.read_u8(addr)?;
            if index + 1 < buf.len() {
                addr = self.step(addr)?;
            }
        }
        Ok(())
    }

    /// Copies `bytes` into user memory.
    pub fn write_buf(&mut self, va: VirtAddr, bytes: &[u8]) -> Result<(), AccessError> {
        let mut addr = va;
        for (index, byte) in bytes.iter().enumerate() {
            self.write_u8(addr, *byte)?;
            if index + 1 < bytes.len() {
                addr = self.step(addr)?;
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> &VmStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    pub fn regs(&self) -> &RegisterFile {
        &self.machine.regs
    }

    pub fn regs_mut(&mut self) -> &mut RegisterFile {
        &mut self.machine.regs
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn free_frames(&self) -> usize {
        self.frames.lock().count_free()
    }

    /// Current owner of `frame`, as (pid, page).
    pub fn frame_owner(&self, frame: PhysFrame) -> Option<(Pid, VirtPage)> {
        self.frames.lock().owner_of(frame)
    }

    /// Copy of a process's page-table entry, for inspection.
    pub fn page_entry(&self, pid: Pid, vpn: VirtPage) -> Option<TranslationEntry> {
        self.tasks.space(pid).and_then(|space| space.entry(vpn)).copied()
    }

    pub fn space_pages(&self, pid: Pid) -> Option<usize> {
        self.tasks.space(pid).map(|space| space.page_count())
    }

    /// Backing-store slots a process has ever used.
    pub fn backing_slots(&self, pid: Pid) -> Option<usize> {
        self.tasks.space(pid).map(|space| space.backing_slots())
    }

    /// Runs `op` against the machine, letting the trap layer repair
    /// translation misses in between attempts. An access that keeps
    /// faulting after repeated repairs takes its process down.
    fn access<T>(
        &mut self,
        mut op: impl FnMut(&mut Machine) -> Result<T, Exception>,
    ) -> Result<T, AccessError> {
        let pid = self.tasks.current().ok_or(AccessError::NoProcess)?;
        for _ in 0..RESOLVE_ATTEMPTS {
            match op(&mut self.machine) {
                Ok(value) => return Ok(value),
                Err(exception) => {
                    match trap::handle_exception(
                        exception,
                        pid,
                        &mut self.tasks,
                        &self.frames,
                        &mut self.pager,
                        &mut self.machine,
                        &mut self.stats,
                    ) {
                        FaultOutcome::Resolved => continue,
                        FaultOutcome::ProcessKilled(fault) => {
                            return Err(AccessError::Fault(fault))
                        }
                    }
                }
            }
        }
        let vaddr = VirtAddr::from_raw(self.machine.regs.bad_vaddr);
        log::error!(target: "vm", "pid {pid}: access at {vaddr} did not converge");
        Err(AccessError::Fault(trap::kill(
            Exception::PageFault,
            pid,
            vaddr,
            &mut self.tasks,
            &self.frames,
            &mut self.machine,
            &mut self.stats,
        )))
    }

    /// Advances a buffer cursor by one byte. Running off the end of the
    /// 32-bit space is an address error and kills the process.
    fn step(&mut self, addr: VirtAddr) -> Result<VirtAddr, AccessError> {
        match addr.checked_add(1) {
            Some(next) => Ok(next),
            None => {
                let pid = self.tasks.current().ok_or(AccessError::NoProcess)?;
                log::error!(
                    target: "vm",
                    "pid {pid}: buffer access ran past the end of the address space at {addr}"
                );
                self.machine.regs.bad_vaddr = addr.as_raw();
                Err(AccessError::Fault(trap::kill(
                    Exception::AddressError,
                    pid,
                    addr,
                    &mut self.tasks,
                    &self.frames,
                    &mut self.machine,
                    &mut self.stats,
                )))
            }
        }
    }
}
