// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the paging core
//! OWNERS: @kernel-mm
//! NOTE: Tests only; no kernel logic. Ensures frame ownership and page
//!   contents stay sound under arbitrary workloads and every policy.
//!
//! TEST_SCOPE:
//!   - Frame map and page tables agree after every access, kill included
//!   - Page bytes survive arbitrary eviction and swap round-trips
//!   - Fault and eviction counters add up after random workloads
//!
//! TEST_SCENARIOS:
//!   - frame_ownership_stays_bijective(): owned frame <-> valid entry, both ways
//!   - bytes_survive_eviction_round_trips(): read-back equals last write or image byte
//!   - fault_accounting_stays_consistent(): stats identities hold for every policy

use std::collections::HashMap;

use proptest::prelude::*;

use crate::config::{LoadMode, PolicyKind, SwapBackend, TranslationMode, VmConfig, PAGE_SIZE};
use crate::loader::UserImage;
use crate::types::{PhysFrame, Pid, VirtAddr, VirtPage};
use crate::vm::Vm;

const CODE_FILL: u8 = 0x5A;
const DATA_FILL: u8 = 0xA5;
/// One code page + half a page of data + the stack slack: ten pages total.
const SPACE_PAGES: u32 = 10;

fn image() -> Vec<u8> {
    UserImage::synthesize(&[CODE_FILL; PAGE_SIZE], &[DATA_FILL; PAGE_SIZE / 2], 0)
        .as_bytes()
        .to_vec()
}

fn vm_with(policy: PolicyKind, frames: usize) -> Vm {
    Vm::new(VmConfig {
        load: LoadMode::Demand,
        swap: true,
        policy,
        translation: TranslationMode::Tlb,
        swap_backend: SwapBackend::Memory,
        phys_frames: frames,
        ..VmConfig::default()
    })
}

/// What an address reads as before anyone writes to it.
fn initial_byte(addr: u32) -> u8 {
    let page_size = PAGE_SIZE as u32;
    if addr < page_size {
        CODE_FILL
    } else if addr < page_size + page_size / 2 {
        DATA_FILL
    } else {
        0
    }
}

fn arb_policy() -> impl Strategy<Value = PolicyKind> {
    prop_oneof![
        Just(PolicyKind::Fifo),
        Just(PolicyKind::Clock),
        Just(PolicyKind::LruCounter),
        Just(PolicyKind::Random),
    ]
}

/// `(use second process, page, offset, write value or read)`
fn arb_ops() -> impl Strategy<Value = Vec<(bool, u32, u32, Option<u8>)>> {
    prop::collection::vec(
        (
            any::<bool>(),
            0..SPACE_PAGES,
            0..PAGE_SIZE as u32,
            prop::option::of(any::<u8>()),
        ),
        1..40,
    )
}

/// Every owned frame must point at a valid entry that points back, and
/// every valid entry must own its frame. Free plus owned covers the pool.
fn assert_ownership_bijective(vm: &Vm, live: &[Pid]) -> Result<(), TestCaseError> {
    let mut owned = 0usize;
    for index in 0..vm.frame_count() {
        let frame = PhysFrame::from_raw(index as u32);
        if let Some((pid, vpn)) = vm.frame_owner(frame) {
            owned += 1;
            let entry = vm.page_entry(pid, vpn);
            prop_assert!(
                entry.is_some_and(|e| e.is_valid() && e.frame == Some(frame)),
                "frame {} claims ({}, {}) but the entry disagrees",
                frame,
                pid,
                vpn
            );
        }
    }
    prop_assert_eq!(vm.free_frames() + owned, vm.frame_count());

    for &pid in live {
        let pages = vm.space_pages(pid).unwrap_or(0) as u32;
        for page in 0..pages {
            let vpn = VirtPage::from_raw(page);
            let Some(entry) = vm.page_entry(pid, vpn) else {
                continue;
            };
            if let Some(frame) = entry.frame {
                prop_assert!(entry.is_valid());
                prop_assert_eq!(vm.frame_owner(frame), Some((pid, vpn)));
            } else {
                prop_assert!(!entry.is_valid());
            }
        }
    }
    Ok(())
}

proptest! {
    #[test]
    fn frame_ownership_stays_bijective(policy in arb_policy(), ops in arb_ops()) {
        let mut vm = vm_with(policy, 3);
        let pid_a = vm.spawn(&image()).expect("spawn a");
        let pid_b = vm.spawn(&image()).expect("spawn b");
        let mut dead = [false, false];

        for (second, page, offset, write) in ops {
            let (pid, slot) = if second { (pid_b, 1) } else { (pid_a, 0) };
            if dead[slot] {
                continue;
            }
            vm.switch_to(pid).expect("switch to live process");
            let va = VirtAddr::from_raw(page * PAGE_SIZE as u32 + offset);
            // Writes to the read-only code page kill the process; the
            // ownership invariant has to survive that too.
            let outcome = match write {
                Some(value) => vm.write_u8(va, value),
                None => vm.read_u8(va).map(|_| ()),
            };
            if outcome.is_err() {
                dead[slot] = true;
            }
            let live: Vec<Pid> = [(pid_a, 0usize), (pid_b, 1)]
                .iter()
                .filter(|(_, s)| !dead[*s])
                .map(|(p, _)| *p)
                .collect();
            assert_ownership_bijective(&vm, &live)?;
        }
    }

    #[test]
    fn bytes_survive_eviction_round_trips(
        writes in prop::collection::vec(
            (PAGE_SIZE as u32..SPACE_PAGES * PAGE_SIZE as u32, any::<u8>()),
            1..48,
        )
    ) {
        // Two frames against ten pages: everything cycles through swap.
        let mut vm = vm_with(PolicyKind::Fifo, 2);
        let pid = vm.spawn(&image()).expect("spawn");
        vm.switch_to(pid).expect("switch");

        let mut model: HashMap<u32, u8> = HashMap::new();
        for (addr, value) in writes {
            vm.write_u8(VirtAddr::from_raw(addr), value).expect("write");
            model.insert(addr, value);
        }

        for (addr, value) in &model {
            prop_assert_eq!(
                vm.read_u8(VirtAddr::from_raw(*addr)).expect("read back"),
                *value,
                "written byte at {} lost in a round trip",
                addr
            );
        }
        // Untouched bytes still read as the image left them.
        for page in 0..SPACE_PAGES {
            let addr = page * PAGE_SIZE as u32;
            if !model.contains_key(&addr) {
                prop_assert_eq!(
                    vm.read_u8(VirtAddr::from_raw(addr)).expect("read"),
                    initial_byte(addr)
                );
            }
        }
    }

    #[test]
    fn fault_accounting_stays_consistent(policy in arb_policy(), ops in arb_ops()) {
        let mut vm = vm_with(policy, 3);
        let pid = vm.spawn(&image()).expect("spawn");
        vm.switch_to(pid).expect("switch");

        for (_, page, offset, write) in ops {
            let va = VirtAddr::from_raw(page * PAGE_SIZE as u32 + offset);
            let outcome = match write {
                Some(value) => vm.write_u8(va, value),
                None => vm.read_u8(va).map(|_| ()),
            };
            if outcome.is_err() {
                break;
            }
        }

        let stats = vm.stats();
        prop_assert_eq!(
            stats.faults,
            stats.page_ins_image + stats.page_ins_swap + stats.stale_cache_repairs
        );
        // Each eviction freed a frame for exactly one page-in.
        prop_assert!(stats.evictions() <= stats.page_ins_image + stats.page_ins_swap);
        // A slot can be read many times, but never before its first write.
        prop_assert!(stats.page_ins_swap == 0 || stats.page_outs > 0);
    }
}
