//! End-to-end scenarios exercising the assembled kernel: growth into the
//! double-indirect region, delete-while-open, directory trees, stack
//! growth, eviction to swap and back, and an mmap round trip (spec.md §8).
use std::sync::Arc;

use strata_core::error::KernelError;
use strata_core::facade::{BlockDevice, DeviceRole, Mmu, ThreadId, VirtAddr};
use strata_core::testing::{MemBlockDevice, MockMmu};
use strata_kernel::{Config, Kernel};
use strata_vm::{FaultOutcome, Location};

fn boot(fs_sectors: u32, swap_sectors: u32, config: Config) -> Kernel {
    let fs_dev: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(fs_sectors, DeviceRole::Filesys));
    let swap_dev: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(swap_sectors, DeviceRole::Swap));
    let mmu: Arc<dyn Mmu> = Arc::new(MockMmu::new());
    Kernel::format(fs_dev, swap_dev, mmu, config).unwrap()
}

#[test]
fn growth_into_double_indirect_region() {
    // An 8 MiB volume: 8 * 1024 * 1024 / 512 sectors.
    let kernel = boot(8 * 1024 * 1024 / 512, 64, Config::default());
    let vm = kernel.spawn_process();

    kernel.fs().create(vm.cwd(), "/big", 0).unwrap();
    let fd = kernel.open_file(&vm, "/big").unwrap();
    let file = vm.file(fd).unwrap();

    let offset = 4 * 1024 * 1024u64;
    file.write_at(offset, &[0xA5]).unwrap();
    assert_eq!(file.length(), offset + 1);

    let mut out = [0u8; 1];
    file.read_at(offset, &mut out).unwrap();
    assert_eq!(out[0], 0xA5);

    vm.close_fd(fd);
}

#[test]
fn delete_while_open_frees_sectors_on_last_close() {
    let kernel = boot(1 << 15, 64, Config::default());
    let vm = kernel.spawn_process();

    let before = kernel.fs().free_map().count_allocated();
    kernel.fs().create(vm.cwd(), "/foo", 0).unwrap();

    let fd_a = kernel.open_file(&vm, "/foo").unwrap();
    let fd_b = kernel.open_file(&vm, "/foo").unwrap();

    kernel.fs().remove(vm.cwd(), "/foo").unwrap();
    assert!(!kernel.fs().exists(vm.cwd(), "/foo").unwrap());

    vm.file(fd_a).unwrap().write_at(0, b"abc").unwrap();
    let mut buf = [0u8; 3];
    vm.file(fd_b).unwrap().read_at(0, &mut buf).unwrap();
    assert_eq!(&buf, b"abc");

    vm.close_fd(fd_a);
    vm.close_fd(fd_b);

    assert_eq!(kernel.fs().free_map().count_allocated(), before);
}

#[test]
fn directory_tree_mkdir_chdir_readdir_remove() {
    let kernel = boot(1 << 15, 64, Config::default());
    let vm = kernel.spawn_process();

    kernel.fs().mkdir(vm.cwd(), "/a").unwrap();
    kernel.fs().mkdir(vm.cwd(), "/a/b").unwrap();

    kernel.chdir(&vm, "/a").unwrap();

    let dir_fd = kernel.open_dir(&vm, "").unwrap();
    assert_eq!(vm.readdir(dir_fd).unwrap(), Some("b".to_string()));
    assert_eq!(vm.readdir(dir_fd).unwrap(), None);
    vm.close_fd(dir_fd);

    let root = kernel.fs().root_sector();
    assert_eq!(kernel.fs().remove(root, "/a").unwrap_err(), KernelError::NotEmpty);
    kernel.fs().remove(root, "/a/b").unwrap();
    kernel.fs().remove(root, "/a").unwrap();
}

#[test]
fn stack_grows_within_slack_and_reads_back_zeroed() {
    let kernel = boot(1 << 15, 64, Config::default());
    let vm = kernel.spawn_process();

    let esp = 0xbffffe00usize;
    let fault_addr = VirtAddr(0xbffffdfc);
    let outcome = kernel.page_fault(&vm, ThreadId(0), esp, fault_addr, true).unwrap();
    assert_eq!(outcome, FaultOutcome::Resolved);

    let spte = vm.spt.lookup(fault_addr).unwrap();
    let snap = spte.snapshot();
    assert_eq!(snap.location, Location::Memory);

    let mut page = [0xffu8; 4096];
    kernel.frame_table().read(snap.frame.unwrap(), &mut page);
    assert_eq!(&page[..4], &[0u8; 4]);
}

#[test]
fn eviction_round_trips_distinct_content_through_swap() {
    let mut config = Config::default();
    config.frame_pool_size = 4;
    let kernel = boot(1 << 15, 64, config);
    let vm = kernel.spawn_process();

    let base = 0x4000_0000usize;
    let mut vaddrs = Vec::new();
    for i in 0..4u8 {
        let vaddr = VirtAddr(base + i as usize * 4096);
        let spte = vm.spt.alloc(vaddr, true, kernel.frame_table(), kernel.swap(), vm.pagedir, ThreadId(0)).unwrap();
        let frame = spte.snapshot().frame.unwrap();
        kernel.frame_table().fill(frame, &[i; 16]);
        vaddrs.push(vaddr);
    }
    assert_eq!(kernel.frame_table().occupancy(), (4, 4));

    // A fifth allocation forces an eviction of one of the first four.
    let fifth = VirtAddr(base + 10 * 4096);
    vm.spt.alloc(fifth, true, kernel.frame_table(), kernel.swap(), vm.pagedir, ThreadId(0)).unwrap();
    assert_eq!(kernel.frame_table().occupancy(), (4, 4));
    assert!(kernel.swap().occupied() >= 1);

    let evicted = vaddrs
        .iter()
        .find(|v| vm.spt.lookup(**v).unwrap().location() == Location::Swap)
        .copied()
        .expect("exactly one of the four pages was evicted to swap");
    let marker = ((evicted.0 - base) / 4096) as u8;

    let outcome = kernel.page_fault(&vm, ThreadId(0), 0, evicted, false).unwrap();
    assert_eq!(outcome, FaultOutcome::Resolved);

    let spte = vm.spt.lookup(evicted).unwrap();
    assert_eq!(spte.location(), Location::Memory);
    let mut page = [0u8; 4096];
    kernel.frame_table().read(spte.snapshot().frame.unwrap(), &mut page);
    assert_eq!(&page[..16], &[marker; 16]);
}

#[test]
fn mmap_write_evict_munmap_reopen_round_trip() {
    let mut config = Config::default();
    config.frame_pool_size = 1;
    let kernel = boot(1 << 15, 64, config);
    let vm = kernel.spawn_process();

    kernel.fs().create(vm.cwd(), "/hello", 0).unwrap();
    let fd = kernel.open_file(&vm, "/hello").unwrap();
    vm.file(fd).unwrap().write_at(0, b"hello").unwrap();
    vm.close_fd(fd);

    let addr = VirtAddr(0x1000_0000);
    let mapid = kernel.mmap(&vm, "/hello", addr).unwrap();

    let outcome = kernel.page_fault(&vm, ThreadId(0), 0, addr, false).unwrap();
    assert_eq!(outcome, FaultOutcome::Resolved);

    let spte = vm.spt.lookup(addr).unwrap();
    let frame = spte.snapshot().frame.unwrap();
    let mut page = [0u8; 4096];
    kernel.frame_table().read(frame, &mut page);
    assert_eq!(&page[..5], b"hello");

    // Simulate a write through the mapping, then force eviction.
    kernel.frame_table().fill(frame, b"HELLO");
    kernel.frame_table().evict(kernel.swap()).unwrap();
    assert_eq!(vm.spt.lookup(addr).unwrap().location(), Location::Filesys);

    kernel.munmap(&vm, mapid).unwrap();
    assert!(vm.spt.lookup(addr).is_none());

    let fd2 = kernel.open_file(&vm, "/hello").unwrap();
    let mut buf = [0u8; 5];
    vm.file(fd2).unwrap().read_at(0, &mut buf).unwrap();
    assert_eq!(&buf, b"HELLO");
    vm.close_fd(fd2);
}
