// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: User exception dispatch.
//! OWNERS: kernel-mm
//! PUBLIC API: `handle_exception`, `FaultOutcome`, `FatalFault`
//! DEPENDS_ON: pager, task table, machine state
//! INVARIANTS:
//!   - A resolved fault leaves the program counter untouched; the access
//!     reruns against the repaired cache.
//!   - Every fatal path logs the faulting address and page before the
//!     process is torn down.

use spin::Mutex;

use crate::machine::{Exception, Machine};
use crate::mm::coremap::CoreMap;
use crate::mm::pager::Pager;
use crate::stats::VmStats;
use crate::task::TaskTable;
use crate::types::{Pid, VirtAddr, VirtPage};

/// Record of a process killed by an unservable exception.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FatalFault {
    pub pid: Pid,
    pub exception: Exception,
    pub vaddr: VirtAddr,
    pub page: VirtPage,
}

/// What the trap layer did about an exception.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[must_use]
pub enum FaultOutcome {
    /// The translation was repaired; rerun the access.
    Resolved,
    /// The exception could not be served and the process is gone.
    ProcessKilled(FatalFault),
}

/// Entry point for exceptions raised by user memory accesses. Page faults go
/// to the pager; everything else is fatal to the faulting process.
pub fn handle_exception(
    exception: Exception,
    pid: Pid,
    tasks: &mut TaskTable,
    frames: &Mutex<CoreMap>,
    pager: &mut Pager,
    machine: &mut Machine,
    stats: &mut VmStats,
) -> FaultOutcome {
    let vaddr = VirtAddr::from_raw(machine.regs.bad_vaddr);
    match exception {
        Exception::PageFault => {
            match pager.resolve_fault(pid, vaddr, tasks, frames, machine, stats) {
                Ok(()) => FaultOutcome::Resolved,
                Err(err) => {
                    log::error!(
                        target: "trap",
                        "pid {pid}: unservable fault at {vaddr} (page {}): {err:?}",
                        vaddr.page()
                    );
                    FaultOutcome::ProcessKilled(kill(
                        exception, pid, vaddr, tasks, frames, machine, stats,
                    ))
                }
            }
        }
        Exception::ReadOnly => {
            log::error!(
                target: "trap",
                "pid {pid}: write to read-only page {} at {vaddr}",
                vaddr.page()
            );
            FaultOutcome::ProcessKilled(kill(exception, pid, vaddr, tasks, frames, machine, stats))
        }
        Exception::AddressError | Exception::BusError => {
            log::error!(target: "trap", "pid {pid}: {exception} at {vaddr}");
            FaultOutcome::ProcessKilled(kill(exception, pid, vaddr, tasks, frames, machine, stats))
        }
    }
}

/// Tears down `pid` and reports the kill. Also used by the access layer when
/// an address computation leaves the 32-bit space entirely.
pub(crate) fn kill(
    exception: Exception,
    pid: Pid,
    vaddr: VirtAddr,
    tasks: &mut TaskTable,
    frames: &Mutex<CoreMap>,
    machine: &mut Machine,
    stats: &mut VmStats,
) -> FatalFault {
    tasks.terminate(pid, frames, &mut machine.mmu);
    stats.forced_kills += 1;
    FatalFault {
        pid,
        exception,
        vaddr,
        page: vaddr.page(),
    }
}
