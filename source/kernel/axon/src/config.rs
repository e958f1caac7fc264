// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration for the paging core.
//!
//! Every knob that used to be a build-time variant of the machine (eager vs
//! demand loading, swap on/off, translation cache shape, replacement policy)
//! is an ordinary value here so one binary can exercise all of them.

use std::path::PathBuf;

use static_assertions::const_assert;

/// Size of a page and of a frame in bytes. Matches the backing-store sector
/// size so one slot holds exactly one page.
pub const PAGE_SIZE: usize = 128;

/// Number of entries in the translation lookaside buffer.
pub const TLB_SIZE: usize = 4;

/// Bytes of stack appended above the program image.
pub const USER_STACK_SIZE: usize = 1024;

/// Safety margin subtracted from the initial stack pointer so the first
/// frames of user code cannot reference past the end of the space.
pub const STACK_SLACK: usize = 16;

/// Attempts per backing-store block operation before the fault escalates.
pub const IO_RETRIES: usize = 3;

/// Frames in the default physical memory configuration.
pub const DEFAULT_PHYS_FRAMES: usize = 32;

/// Upper bound on simultaneously live processes.
pub const MAX_PROCS: usize = 16;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(TLB_SIZE >= 1);
const_assert!(STACK_SLACK < USER_STACK_SIZE);

/// How an address space is populated with its program image.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoadMode {
    /// Claim every frame and copy all segments at construction time.
    Eager,
    /// Start fully unmapped; pages arrive on first touch via the fault path.
    Demand,
}

/// Victim selection strategy when no frame is free.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PolicyKind {
    /// Rotating cursor, advanced by one on every pick.
    Fifo,
    /// Four-pass not-recently-used sweep over (used, dirty) classes.
    Clock,
    /// Smallest last-use tick wins; ticks are stamped on fault resolution.
    LruCounter,
    /// Uniform choice from a seeded generator; differential-testing baseline.
    Random,
}

/// Shape of the hardware translation cache.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TranslationMode {
    /// Small software-managed TLB; misses trap even for resident pages.
    Tlb,
    /// Full-size installed copy of the active page table.
    PageTable,
}

/// Where per-process backing stores live.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SwapBackend {
    /// One `swap.<pid>` file per process under `swap_dir`.
    File,
    /// In-memory store, used by unit tests.
    Memory,
}

/// Top-level paging configuration handed to [`crate::vm::Vm::new`].
#[derive(Clone, Debug)]
pub struct VmConfig {
    pub load: LoadMode,
    /// Enables eviction to per-process backing stores. With swap disabled a
    /// demand-paged workload that exceeds physical memory faults fatally.
    pub swap: bool,
    pub policy: PolicyKind,
    pub translation: TranslationMode,
    pub swap_backend: SwapBackend,
    pub phys_frames: usize,
    /// Seed for `PolicyKind::Random`; fixed so runs are reproducible.
    pub rng_seed: u64,
    pub swap_dir: PathBuf,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            load: LoadMode::Demand,
            swap: true,
            policy: PolicyKind::Clock,
            translation: TranslationMode::Tlb,
            swap_backend: SwapBackend::File,
            phys_frames: DEFAULT_PHYS_FRAMES,
            rng_seed: 0x6e65_7875_735f_766d,
            swap_dir: PathBuf::from("."),
        }
    }
}
