// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]

//! CONTEXT: Demand-paged virtual memory for user programs on a simulated
//!   32-bit machine: frame ownership, per-process backing stores, pluggable
//!   replacement, and a fault path that repairs translations in place.
//! OWNERS: @kernel-mm
//! PUBLIC API: `vm::Vm` plus the `config`, `loader`, `machine`, `mm`,
//!   `task` and `trap` modules it is assembled from
//! DEPENDS_ON: bitflags, log, rand, spin, static_assertions
//! INVARIANTS: page tables are the authority and the MMU holds copies; a
//!   frame is owned exactly while some table maps a valid page onto it.

pub mod config;
pub mod loader;
pub mod machine;
pub mod mm;
pub mod stats;
pub mod task;
pub mod trap;
pub mod types;
pub mod vm;
