/*
  ____                 __               __ __                 __
 / __ \__ _____ ____  / /___ ____ _    / //_/__ _______  ___ / /
/ /_/ / // / _ `/ _ \/ __/ // /  ' \  / ,< / -_) __/ _ \/ -_) /
\___\_\_,_/\_,_/_//_/\__/\_,_/_/_/_/ /_/|_|\__/_/ /_//_/\__/_/
  Part of the Quantum OS Kernel

Copyright 2025 Gavin Kellam

Permission is hereby granted, free of charge, to any person obtaining a copy of this software and
associated documentation files (the "Software"), to deal in the Software without restriction,
including without limitation the rights to use, copy, modify, merge, publish, distribute,
sublicense, and/or sell copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:

The above copyright notice and this permission notice shall be included in all copies or substantial
portions of the Software.

THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR IMPLIED, INCLUDING BUT
NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM,
DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT
OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.
*/

//! Virtual memory manager behavior: mapping validation, file backing,
//! permissions, pinning, and the kernel heap.

use std::sync::Arc;

use fern::{HeapFlags, Kernel, KernelError};
use fern::vmm::MapFlags;
use fern::vnode::{FileHandle, MemoryFile};
use mem::addr::{PhysAddr, VirtAddr};
use util::consts::PAGE_4K;

fn hosted(frames: usize) -> Arc<Kernel> {
    let kernel = Kernel::hosted(frames);
    kernel.prevent_scheduler();
    kernel
}

fn anon_flags() -> MapFlags {
    MapFlags::READ | MapFlags::WRITE | MapFlags::LOCAL
}

#[test]
fn map_flag_validation() {
    let kernel = hosted(128);
    let vas = kernel.create_vas();
    let file = FileHandle::new(MemoryFile::new(vec![0; PAGE_4K]), true, false);

    let cases: &[(PhysAddr, MapFlags, Option<Arc<FileHandle>>, KernelError)] = &[
        // A physical hint only makes sense for hardware or relocatable maps.
        (
            PhysAddr::new(0x5000),
            MapFlags::READ,
            None,
            KernelError::InvalidArgument,
        ),
        // Hardware mappings must be locked.
        (
            PhysAddr::new(0x5000),
            MapFlags::READ | MapFlags::MAP_HARDWARE,
            None,
            KernelError::InvalidArgument,
        ),
        // FILE requires a file handle.
        (
            PhysAddr::new(0),
            MapFlags::READ | MapFlags::FILE,
            None,
            KernelError::InvalidArgument,
        ),
        // FILE and LOCK are mutually exclusive.
        (
            PhysAddr::new(0),
            MapFlags::READ | MapFlags::FILE | MapFlags::LOCK,
            Some(file.clone()),
            KernelError::InvalidArgument,
        ),
        // A file handle without FILE makes no sense.
        (
            PhysAddr::new(0),
            MapFlags::READ,
            Some(file.clone()),
            KernelError::InvalidArgument,
        ),
        // Relocatable implies file backing.
        (
            PhysAddr::new(0x1000),
            MapFlags::READ | MapFlags::RELOCATABLE,
            None,
            KernelError::InvalidArgument,
        ),
        // Locked pages can't be shared across fork.
        (
            PhysAddr::new(0),
            MapFlags::READ | MapFlags::LOCK | MapFlags::SHARE_ON_FORK,
            None,
            KernelError::InvalidArgument,
        ),
        // Writable mapping of a read-only file.
        (
            PhysAddr::new(0),
            MapFlags::READ | MapFlags::WRITE | MapFlags::FILE,
            Some(file.clone()),
            KernelError::AccessDenied,
        ),
    ];

    for (physical, flags, file, expected) in cases {
        let result = kernel.map_virt(
            &vas,
            *physical,
            VirtAddr::new(0),
            1,
            *flags | MapFlags::LOCAL,
            file.clone(),
            0,
        );
        assert_eq!(result, Err(*expected), "flags {:?}", flags);
    }
}

#[test]
fn fixed_virt_conflict() {
    let kernel = hosted(128);
    let vas = kernel.create_vas();

    let addr = kernel
        .map_virt(&vas, PhysAddr::new(0), VirtAddr::new(0), 1, anon_flags(), None, 0)
        .unwrap();

    // Without FIXED_VIRT the kernel relocates the request.
    let relocated = kernel
        .map_virt(&vas, PhysAddr::new(0), addr, 1, anon_flags(), None, 0)
        .unwrap();
    assert_ne!(relocated, addr);

    // With it, the conflict is an error.
    assert_eq!(
        kernel.map_virt(
            &vas,
            PhysAddr::new(0),
            addr,
            1,
            anon_flags() | MapFlags::FIXED_VIRT,
            None,
            0
        ),
        Err(KernelError::Exists)
    );
}

#[test]
fn file_backed_mapping_demand_loads() {
    let kernel = hosted(128);
    let vas = kernel.create_vas();

    // One and a half pages of pattern; the rest of page 1 must read zero.
    let mut contents = vec![0u8; PAGE_4K + PAGE_4K / 2];
    for (i, byte) in contents.iter_mut().enumerate() {
        *byte = (i % 256) as u8;
    }
    let file = FileHandle::new(MemoryFile::new(contents), true, false);

    let addr = kernel
        .map_virt(
            &vas,
            PhysAddr::new(0),
            VirtAddr::new(0),
            2,
            MapFlags::READ | MapFlags::FILE | MapFlags::LOCAL,
            Some(file),
            0,
        )
        .unwrap();

    assert_eq!(kernel.read_virt_u8(&vas, addr.offset(5)).unwrap(), 5);
    assert_eq!(
        kernel.read_virt_u8(&vas, addr.offset(PAGE_4K + 1)).unwrap(),
        ((PAGE_4K + 1) % 256) as u8
    );

    // Past the end of the file but inside the mapping: zeroes.
    assert_eq!(
        kernel
            .read_virt_u8(&vas, addr.offset(PAGE_4K + PAGE_4K / 2 + 10))
            .unwrap(),
        0
    );
}

#[test]
fn file_mapping_at_offset() {
    let kernel = hosted(128);
    let vas = kernel.create_vas();

    let mut contents = vec![0u8; 3 * PAGE_4K];
    contents[2 * PAGE_4K] = 0xEE;
    let file = FileHandle::new(MemoryFile::new(contents), true, false);

    let addr = kernel
        .map_virt(
            &vas,
            PhysAddr::new(0),
            VirtAddr::new(0),
            1,
            MapFlags::READ | MapFlags::FILE | MapFlags::LOCAL,
            Some(file),
            (2 * PAGE_4K) as u64,
        )
        .unwrap();

    assert_eq!(kernel.read_virt_u8(&vas, addr).unwrap(), 0xEE);
}

#[test]
fn write_to_read_only_page_is_refused() {
    let kernel = hosted(128);
    let vas = kernel.create_vas();

    let addr = kernel
        .map_virt(
            &vas,
            PhysAddr::new(0),
            VirtAddr::new(0),
            1,
            MapFlags::READ | MapFlags::LOCAL,
            None,
            0,
        )
        .unwrap();

    assert_eq!(
        kernel.write_virt_u8(&vas, addr, 1),
        Err(KernelError::AccessDenied)
    );

    // Reading is fine, and the page stays intact afterwards.
    assert_eq!(kernel.read_virt_u8(&vas, addr).unwrap(), 0);
    assert_eq!(
        kernel.write_virt_u8(&vas, addr, 1),
        Err(KernelError::AccessDenied)
    );
}

#[test]
fn access_to_unmapped_address_is_refused() {
    let kernel = hosted(128);
    let vas = kernel.create_vas();

    assert_eq!(
        kernel.read_virt_u8(&vas, VirtAddr::new(0x7000_0000)),
        Err(KernelError::NotFound)
    );
}

#[test]
fn set_permissions_splits_and_applies() {
    let kernel = hosted(128);
    let vas = kernel.create_vas();

    let addr = kernel
        .map_virt(
            &vas,
            PhysAddr::new(0),
            VirtAddr::new(0),
            4,
            anon_flags(),
            None,
            0,
        )
        .unwrap();

    // Four pages came in as one entry; changing page 2 splits it apart.
    assert_eq!(kernel.mapping_entry_snapshot(&vas, addr).unwrap().pages, 4);

    let target = addr.offset(2 * PAGE_4K);
    kernel
        .set_virt_permissions(&vas, target, MapFlags::empty(), MapFlags::WRITE)
        .unwrap();

    assert_eq!(kernel.mapping_entry_snapshot(&vas, target).unwrap().pages, 1);
    assert!(!kernel.get_virt_permissions(&vas, target).contains(MapFlags::WRITE));

    // Neighbours keep their write permission.
    assert!(kernel.get_virt_permissions(&vas, addr).contains(MapFlags::WRITE));
    assert!(
        kernel
            .get_virt_permissions(&vas, addr.offset(3 * PAGE_4K))
            .contains(MapFlags::WRITE)
    );

    assert_eq!(
        kernel.write_virt_u8(&vas, target, 9),
        Err(KernelError::AccessDenied)
    );
    kernel.write_virt_u8(&vas, addr, 9).unwrap();

    // Setting a bit overrides clearing it.
    kernel
        .set_virt_permissions(&vas, target, MapFlags::WRITE, MapFlags::WRITE)
        .unwrap();
    kernel.write_virt_u8(&vas, target, 9).unwrap();
}

#[test]
fn lock_virt_pins_page_resident() {
    let kernel = hosted(128);
    let vas = kernel.create_vas();

    let addr = kernel
        .map_virt(&vas, PhysAddr::new(0), VirtAddr::new(0), 1, anon_flags(), None, 0)
        .unwrap();

    let was_locked = kernel.lock_virt(&vas, addr).unwrap();
    assert!(!was_locked);

    let entry = kernel.mapping_entry_snapshot(&vas, addr).unwrap();
    assert!(entry.locked);
    assert!(entry.in_ram);

    kernel.unlock_virt(&vas, addr).unwrap();
    assert!(!kernel.mapping_entry_snapshot(&vas, addr).unwrap().locked);
}

#[test]
fn locked_mapping_gets_frame_immediately_and_reads_zero() {
    let kernel = hosted(128);
    let vas = kernel.create_vas();

    let free_before = kernel.frames_free();

    let addr = kernel
        .map_virt(
            &vas,
            PhysAddr::new(0),
            VirtAddr::new(0),
            2,
            anon_flags() | MapFlags::LOCK,
            None,
            0,
        )
        .unwrap();

    assert_eq!(kernel.frames_free(), free_before - 2);
    assert_eq!(kernel.read_virt_u8(&vas, addr).unwrap(), 0);
    assert_eq!(kernel.read_virt_u8(&vas, addr.offset(PAGE_4K)).unwrap(), 0);

    kernel.unmap_virt(&vas, addr, 2, false).unwrap();
    assert_eq!(kernel.frames_free(), free_before);
}

#[test]
fn hardware_mapping_does_not_touch_the_frame_table() {
    let kernel = hosted(128);
    let vas = kernel.create_vas();

    let free_before = kernel.frames_free();

    let addr = kernel
        .map_virt(
            &vas,
            PhysAddr::new(64 * PAGE_4K),
            VirtAddr::new(0),
            1,
            anon_flags() | MapFlags::LOCK | MapFlags::MAP_HARDWARE,
            None,
            0,
        )
        .unwrap();

    // No frame was allocated for it, and unmapping frees nothing.
    assert_eq!(kernel.frames_free(), free_before);

    let entry = kernel.mapping_entry_snapshot(&vas, addr).unwrap();
    assert!(entry.in_ram);
    assert!(!entry.allocated);

    kernel.unmap_virt(&vas, addr, 1, false).unwrap();
    assert_eq!(kernel.frames_free(), free_before);
}

#[test]
fn multi_page_threshold() {
    let kernel = hosted(128);
    let vas = kernel.create_vas();

    // Two pages: separate entries. Three: one entry that splits on demand.
    let two = kernel
        .map_virt(&vas, PhysAddr::new(0), VirtAddr::new(0), 2, anon_flags(), None, 0)
        .unwrap();
    assert_eq!(kernel.mapping_entry_snapshot(&vas, two).unwrap().pages, 1);

    let three = kernel
        .map_virt(&vas, PhysAddr::new(0), VirtAddr::new(0), 3, anon_flags(), None, 0)
        .unwrap();
    assert_eq!(kernel.mapping_entry_snapshot(&vas, three).unwrap().pages, 3);

    kernel.read_virt_u8(&vas, three.offset(PAGE_4K)).unwrap();

    // The touched page stands alone now; its neighbours flank it.
    assert_eq!(
        kernel
            .mapping_entry_snapshot(&vas, three.offset(PAGE_4K))
            .unwrap()
            .pages,
        1
    );
    assert_eq!(kernel.mapping_entry_snapshot(&vas, three).unwrap().pages, 1);
    assert_eq!(
        kernel
            .mapping_entry_snapshot(&vas, three.offset(2 * PAGE_4K))
            .unwrap()
            .pages,
        1
    );
}

#[test]
fn evict_first_mapping_is_preferred_under_pressure() {
    let kernel = hosted(96);
    let swap = FileHandle::new(MemoryFile::new_fixed(64), true, true);
    kernel.set_swap_file(swap).unwrap();

    let vas = &kernel.kernel_vas.clone();

    let victim = kernel
        .map_virt(
            vas,
            PhysAddr::new(0),
            VirtAddr::new(0),
            1,
            MapFlags::READ | MapFlags::WRITE | MapFlags::EVICT_FIRST,
            None,
            0,
        )
        .unwrap();
    kernel.write_virt_u8(vas, victim, 0x77).unwrap();

    let keeper = kernel
        .map_virt(
            vas,
            PhysAddr::new(0),
            VirtAddr::new(0),
            1,
            MapFlags::READ | MapFlags::WRITE | MapFlags::LOCK,
            None,
            0,
        )
        .unwrap();
    kernel.write_virt_u8(vas, keeper, 0x88).unwrap();

    kernel.evict_virt();

    let victim_entry = kernel.mapping_entry_snapshot(vas, victim).unwrap();
    let keeper_entry = kernel.mapping_entry_snapshot(vas, keeper).unwrap();

    assert!(!victim_entry.in_ram);
    assert!(victim_entry.swapfile);
    assert!(keeper_entry.in_ram);

    // And it comes back intact when touched.
    assert_eq!(kernel.read_virt_u8(vas, victim).unwrap(), 0x77);
    assert_eq!(kernel.mapping_entry_snapshot(vas, victim).unwrap().times_swapped, 1);
}

#[test]
fn dirty_file_page_written_back_on_unmap() {
    let kernel = hosted(128);
    let vas = kernel.create_vas();

    let node = MemoryFile::new(vec![0u8; PAGE_4K]);
    let file = FileHandle::new(node.clone(), true, true);

    let addr = kernel
        .map_virt(
            &vas,
            PhysAddr::new(0),
            VirtAddr::new(0),
            1,
            MapFlags::READ | MapFlags::WRITE | MapFlags::FILE | MapFlags::LOCAL,
            Some(file),
            0,
        )
        .unwrap();

    kernel.write_virt_u8(&vas, addr.offset(100), 0x5A).unwrap();
    kernel.unmap_virt(&vas, addr, 1, false).unwrap();

    assert_eq!(node.contents()[100], 0x5A);
}

#[test]
fn clean_file_page_not_written_back() {
    let kernel = hosted(128);
    let vas = kernel.create_vas();

    let node = MemoryFile::new(vec![0x11u8; PAGE_4K]);
    let file = FileHandle::new(node.clone(), true, true);

    let addr = kernel
        .map_virt(
            &vas,
            PhysAddr::new(0),
            VirtAddr::new(0),
            1,
            MapFlags::READ | MapFlags::WRITE | MapFlags::FILE | MapFlags::LOCAL,
            Some(file),
            0,
        )
        .unwrap();

    // Touch it read-only so it loads but never dirties.
    assert_eq!(kernel.read_virt_u8(&vas, addr).unwrap(), 0x11);

    node.set_fail_io(true);
    kernel.unmap_virt(&vas, addr, 1, false).unwrap();
    node.set_fail_io(false);

    // The unmap never went to disk, or the failing write would have
    // clobbered nothing but logged loudly; contents are untouched either
    // way.
    assert_eq!(node.contents()[0], 0x11);
}

#[test]
fn kernel_heap_allocations() {
    let kernel = hosted(128);

    let a = kernel.heap_alloc(64, HeapFlags::ZERO).unwrap();
    let b = kernel.heap_alloc(128, HeapFlags::empty()).unwrap();
    assert_ne!(a, b);

    unsafe {
        assert_eq!((a as *const u8).read(), 0);
        (a as *mut u8).write(0x42);
        assert_eq!((a as *const u8).read(), 0x42);
    }

    kernel.heap_free(a, false);
    kernel.heap_free(b, false);

    // The pageable heap is its own pool.
    let c = kernel.heap_alloc(256, HeapFlags::FORCE_PAGING).unwrap();
    kernel.heap_free(c, true);

    // No-fault allocations come from the emergency pool and are permanent.
    let d = kernel.heap_alloc(96, HeapFlags::NO_FAULT | HeapFlags::ZERO).unwrap();
    unsafe {
        assert_eq!((d as *const u8).read(), 0);
    }
}

#[test]
fn contiguous_frame_allocation() {
    let kernel = hosted(256);

    let addr = kernel
        .alloc_frames_contiguous(8, PhysAddr::new(0), PhysAddr::new(0), 0)
        .unwrap();
    assert!(addr.is_aligned_to(PAGE_4K));

    kernel.free_frames_contiguous(addr, 8);
}
