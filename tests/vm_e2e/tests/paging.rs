//! CONTEXT: Virtual-memory end-to-end tests
//! INTENT: Whole-lifecycle paging against real file-backed swap
//! DEPS: axon (paging core), tempfile (scratch swap directories)
//! TESTS: Swap file lifecycle, dirty round-trips through a real file,
//!   deterministic replacement, demand-paged instruction fetch, per-process
//!   store isolation

use std::fs;
use std::path::Path;

use axon::config::{LoadMode, PolicyKind, SwapBackend, TranslationMode, VmConfig, PAGE_SIZE};
use axon::loader::UserImage;
use axon::types::{PhysFrame, VirtAddr, VirtPage};
use axon::vm::Vm;

fn file_config(dir: &Path, frames: usize) -> VmConfig {
    VmConfig {
        load: LoadMode::Demand,
        swap: true,
        policy: PolicyKind::Fifo,
        translation: TranslationMode::Tlb,
        swap_backend: SwapBackend::File,
        swap_dir: dir.to_path_buf(),
        phys_frames: frames,
        ..VmConfig::default()
    }
}

/// One code page; data, bss and stack are all zero-fill.
fn code_image(fill: u8) -> Vec<u8> {
    UserImage::synthesize(&[fill; PAGE_SIZE], &[], 0).as_bytes().to_vec()
}

fn addr(page: u32, offset: u32) -> VirtAddr {
    VirtAddr::from_raw(page * PAGE_SIZE as u32 + offset)
}

#[test]
fn swap_files_live_and_die_with_their_process() {
    let dir = tempfile::tempdir().expect("tempdir");
    let swap_a = dir.path().join("swap.0");
    let swap_b = dir.path().join("swap.1");

    {
        let mut vm = Vm::new(file_config(dir.path(), 2));
        let a = vm.spawn(&code_image(0xAA)).expect("spawn a");
        assert!(swap_a.exists(), "backing file appears at spawn");
        let _b = vm.spawn(&code_image(0xBB)).expect("spawn b");
        assert!(swap_b.exists());

        // Dirty two pages, then fault a third in: the oldest dirty page
        // must be written out to a's file.
        vm.switch_to(a).expect("switch");
        vm.write_u8(addr(1, 0), 0x11).expect("dirty p1");
        vm.write_u8(addr(2, 0), 0x22).expect("dirty p2");
        vm.read_u8(addr(3, 0)).expect("fault p3");
        assert_eq!(vm.stats().page_outs, 1);
        let written = fs::metadata(&swap_a).expect("metadata").len();
        assert!(written >= PAGE_SIZE as u64, "page-out reached the file");

        assert!(vm.terminate(a));
        assert!(!swap_a.exists(), "termination deletes the backing file");
        assert!(swap_b.exists(), "other processes keep theirs");
    }
    // Dropping the whole VM tears the remaining stores down too.
    assert!(!swap_b.exists());
}

#[test]
fn dirty_bytes_round_trip_through_the_backing_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut vm = Vm::new(file_config(dir.path(), 2));
    let pid = vm.spawn(&code_image(0x5C)).expect("spawn");
    vm.switch_to(pid).expect("switch");

    // Five marked pages through two frames: every marker is evicted at
    // least once before it is read back.
    for page in 1..=5u32 {
        vm.write_u8(addr(page, page), 0x60 + page as u8).expect("mark");
    }
    for page in 1..=5u32 {
        assert_eq!(
            vm.read_u8(addr(page, page)).expect("read marker"),
            0x60 + page as u8
        );
        // The rest of the page stayed zero-fill.
        assert_eq!(vm.read_u8(addr(page, page + 7)).expect("read hole"), 0);
    }

    let stats = vm.stats();
    assert!(stats.page_outs >= 3, "markers were flushed to the file");
    assert!(stats.page_ins_swap >= 3, "markers were read back from the file");
    assert_eq!(vm.stats().forced_kills, 0);
}

#[test]
fn fifo_paging_is_deterministic_end_to_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut vm = Vm::new(file_config(dir.path(), 3));
    let pid = vm.spawn(&code_image(0x42)).expect("spawn");
    vm.switch_to(pid).expect("switch");

    // Seven pages through three frames, reads only.
    for page in 0..=6u32 {
        vm.read_u8(addr(page, 0)).expect("touch");
    }
    assert_eq!(vm.frame_owner(PhysFrame::from_raw(0)), Some((pid, VirtPage::from_raw(6))));
    assert_eq!(vm.frame_owner(PhysFrame::from_raw(1)), Some((pid, VirtPage::from_raw(4))));
    assert_eq!(vm.frame_owner(PhysFrame::from_raw(2)), Some((pid, VirtPage::from_raw(5))));

    let stats = vm.stats();
    assert_eq!(stats.faults, 7);
    assert_eq!(stats.page_ins_image, 7);
    assert_eq!(stats.evictions(), 4);
    // Clean pages regenerate from the image; the file never grows.
    assert_eq!(stats.page_outs, 0);
    assert_eq!(fs::metadata(dir.path().join("swap.0")).expect("metadata").len(), 0);
}

#[test]
fn code_fetch_loop_pages_instructions_on_demand() {
    let dir = tempfile::tempdir().expect("tempdir");
    // Two pages of recognizable instruction words.
    let words = 2 * PAGE_SIZE / 4;
    let code: Vec<u8> = (0..words as u32)
        .flat_map(|i| (0xA000_0000 | i).to_le_bytes())
        .collect();
    let image = UserImage::synthesize(&code, &[], 0).as_bytes().to_vec();

    let mut vm = Vm::new(file_config(dir.path(), 2));
    let pid = vm.spawn(&image).expect("spawn");
    vm.switch_to(pid).expect("switch");
    assert_eq!(vm.regs().pc, 0, "execution starts at the image entry");

    for i in 0..words as u32 {
        let pc = vm.regs().pc;
        let word = vm.read_u32(VirtAddr::from_raw(pc)).expect("fetch");
        assert_eq!(word, 0xA000_0000 | i);
        vm.regs_mut().advance_pc();
    }
    assert_eq!(vm.regs().pc, code.len() as u32);

    // One fault per code page, nothing written back.
    let stats = vm.stats();
    assert_eq!(stats.faults, 2);
    assert_eq!(stats.page_ins_image, 2);
    assert_eq!(stats.page_outs, 0);
    assert!(vm
        .page_entry(pid, VirtPage::from_raw(0))
        .is_some_and(|e| e.is_read_only()));
}

#[test]
fn processes_keep_private_swap_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut vm = Vm::new(file_config(dir.path(), 2));
    let a = vm.spawn(&code_image(0xAA)).expect("spawn a");
    let b = vm.spawn(&code_image(0xBB)).expect("spawn b");
    let spot = addr(1, 4);

    vm.switch_to(a).expect("to a");
    vm.write_u8(spot, 0x11).expect("a marks");
    vm.switch_to(b).expect("to b");
    vm.write_u8(spot, 0x22).expect("b marks");
    // Push both dirty pages out through b's faults.
    vm.read_u8(addr(2, 0)).expect("pressure");
    vm.read_u8(addr(3, 0)).expect("pressure");
    assert_eq!(vm.stats().page_outs, 2);

    // Each process reads its own byte back from its own file.
    vm.switch_to(a).expect("back to a");
    assert_eq!(vm.read_u8(spot).expect("a reads"), 0x11);
    vm.switch_to(b).expect("back to b");
    assert_eq!(vm.read_u8(spot).expect("b reads"), 0x22);

    assert!(vm.terminate(a));
    assert!(vm.terminate(b));
    assert_eq!(vm.live_processes(), 0);
    assert_eq!(vm.free_frames(), vm.frame_count());
    assert!(!dir.path().join("swap.0").exists());
    assert!(!dir.path().join("swap.1").exists());
}
