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

//! End-to-end memory scenarios driven through the software machine.

use std::sync::{Arc, Mutex};

use fern::Kernel;
use fern::irql::{DeferredWork, IrqLevel};
use fern::vmm::MapFlags;
use fern::vnode::{FileHandle, MemoryFile};
use mem::addr::{PhysAddr, VirtAddr};
use util::consts::PAGE_4K;

fn hosted(frames: usize) -> Arc<Kernel> {
    let kernel = Kernel::hosted(frames);
    kernel.prevent_scheduler();
    kernel
}

#[test]
fn demand_zero_fault() {
    let kernel = hosted(128);
    let vas = kernel.create_vas();

    let free_before = kernel.frames_free();

    let addr = kernel
        .map_virt(
            &vas,
            PhysAddr::new(0),
            VirtAddr::new(0),
            1,
            MapFlags::READ | MapFlags::WRITE | MapFlags::LOCAL,
            None,
            0,
        )
        .unwrap();

    // Nothing is resident until the first touch.
    assert_eq!(kernel.frames_free(), free_before);

    assert_eq!(kernel.read_virt_u8(&vas, addr).unwrap(), 0);
    assert_eq!(kernel.frames_free(), free_before - 1);

    kernel.unmap_virt(&vas, addr, 1, false).unwrap();
    assert_eq!(kernel.frames_free(), free_before);
}

#[test]
fn map_unmap_of_file_mapping_leaves_free_count_unchanged() {
    let kernel = hosted(128);
    let vas = kernel.create_vas();

    let file = FileHandle::new(MemoryFile::new(vec![0xCD; 4 * PAGE_4K]), true, false);
    let free_before = kernel.frames_free();

    let addr = kernel
        .map_virt(
            &vas,
            PhysAddr::new(0),
            VirtAddr::new(0),
            4,
            MapFlags::READ | MapFlags::FILE | MapFlags::LOCAL,
            Some(file),
            0,
        )
        .unwrap();

    kernel.unmap_virt(&vas, addr, 4, false).unwrap();
    assert_eq!(kernel.frames_free(), free_before);
}

#[test]
fn copy_on_write_across_fork() {
    let kernel = hosted(128);
    let parent = kernel.create_vas();

    let addr = kernel
        .map_virt(
            &parent,
            PhysAddr::new(0),
            VirtAddr::new(0),
            1,
            MapFlags::READ | MapFlags::WRITE | MapFlags::LOCAL,
            None,
            0,
        )
        .unwrap();

    kernel.write_virt_u8(&parent, addr, 0x55).unwrap();

    let child = kernel.fork_vas(&parent).unwrap();

    // The child reads the parent's value through the shared page.
    assert_eq!(kernel.read_virt_u8(&child, addr).unwrap(), 0x55);
    assert_eq!(
        kernel.mapping_entry_snapshot(&parent, addr).unwrap().ref_count,
        2
    );

    // The child's write copies; the parent's view is untouched.
    kernel.write_virt_u8(&child, addr, 0xAA).unwrap();
    assert_eq!(kernel.read_virt_u8(&child, addr).unwrap(), 0xAA);
    assert_eq!(kernel.read_virt_u8(&parent, addr).unwrap(), 0x55);

    // Both sides settle back to sole ownership.
    let parent_entry = kernel.mapping_entry_snapshot(&parent, addr).unwrap();
    let child_entry = kernel.mapping_entry_snapshot(&child, addr).unwrap();
    assert_eq!(parent_entry.ref_count, 1);
    assert_eq!(child_entry.ref_count, 1);
    assert!(!child_entry.cow);

    // The parent can still write through its (no longer shared) page.
    kernel.write_virt_u8(&parent, addr, 0x66).unwrap();
    assert_eq!(kernel.read_virt_u8(&parent, addr).unwrap(), 0x66);
    assert_eq!(kernel.read_virt_u8(&child, addr).unwrap(), 0xAA);
}

#[test]
fn swap_round_trip_overcommitted_memory() {
    const RAM_FRAMES: usize = 300;
    const MAPPED_PAGES: usize = 400;

    let kernel = hosted(RAM_FRAMES);

    let swap = FileHandle::new(MemoryFile::new_fixed(320), true, true);
    kernel.set_swap_file(swap).unwrap();

    let base = kernel
        .map_virt(
            &kernel.kernel_vas.clone(),
            PhysAddr::new(0),
            VirtAddr::new(0),
            MAPPED_PAGES,
            MapFlags::READ | MapFlags::WRITE,
            None,
            0,
        )
        .unwrap();

    let magic = |i: usize| ((i * 7 + 13) % 251) as u8;

    // Write a distinct value into each of the 400 pages of a 300 page
    // machine; eviction has to move pages to swap to keep up.
    for i in 0..MAPPED_PAGES {
        let addr = base.offset(i * PAGE_4K + (i % PAGE_4K));
        kernel
            .write_virt_u8(&kernel.kernel_vas.clone(), addr, magic(i))
            .unwrap();
    }

    assert!(kernel.swap_slots_used() > 0);

    // Every byte reads back, wherever it ended up.
    for i in 0..MAPPED_PAGES {
        let addr = base.offset(i * PAGE_4K + (i % PAGE_4K));
        assert_eq!(
            kernel.read_virt_u8(&kernel.kernel_vas.clone(), addr).unwrap(),
            magic(i),
            "page {} lost its contents",
            i
        );
    }

    // Untouched bytes of a swapped-and-reloaded page still read zero (the
    // magic byte of page 3 sits at offset 3, not 17).
    let probe = base.offset(3 * PAGE_4K + 17);
    assert_eq!(
        kernel.read_virt_u8(&kernel.kernel_vas.clone(), probe).unwrap(),
        0
    );
}

#[test]
fn deferred_work_drains_highest_level_first() {
    let kernel = hosted(64);

    let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

    let previous = kernel.raise_irql(IrqLevel::High);

    for (level, tag) in [
        (IrqLevel::Timer, 3u32),
        (IrqLevel::Driver, 2),
        (IrqLevel::Standard, 1),
    ] {
        let order = order.clone();
        kernel.defer(
            level,
            DeferredWork::Boxed(Box::new(move |_kernel| {
                order.lock().unwrap().push(tag);
            })),
        );
    }

    assert!(order.lock().unwrap().is_empty());

    kernel.lower_irql(previous);

    assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
}

#[test]
fn deferred_work_at_same_level_runs_immediately_and_in_order() {
    let kernel = hosted(64);

    let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

    // At the same IRQL the work runs before defer returns.
    {
        let order = order.clone();
        kernel.defer(
            IrqLevel::Standard,
            DeferredWork::Boxed(Box::new(move |_kernel| {
                order.lock().unwrap().push(7);
            })),
        );
    }
    assert_eq!(*order.lock().unwrap(), vec![7]);

    // Queued entries at one level keep their queue order.
    let previous = kernel.raise_irql(IrqLevel::Scheduler);
    for tag in [10u32, 11, 12] {
        let order = order.clone();
        kernel.defer(
            IrqLevel::Standard,
            DeferredWork::Boxed(Box::new(move |_kernel| {
                order.lock().unwrap().push(tag);
            })),
        );
    }
    kernel.lower_irql(previous);

    assert_eq!(*order.lock().unwrap(), vec![7, 10, 11, 12]);
}

#[test]
#[should_panic]
fn deferring_upward_panics() {
    let kernel = hosted(64);

    kernel.defer(
        IrqLevel::Timer,
        DeferredWork::Boxed(Box::new(|_kernel| {})),
    );
}
