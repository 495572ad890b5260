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

//! Fern: the core kernel services.
//!
//! The virtual memory manager, physical frame services, preemptive
//! scheduler with its IRQL interrupt model, and the synchronization
//! primitives everything else is built on. The architecture sits behind the
//! [`arch::Arch`] trait; everything above it is portable, and the whole
//! core can run against the software machine in `arch::soft` for testing.

#![no_std]

extern crate alloc;

pub mod arch;
pub mod irql;
pub mod proc;
pub mod sched;
pub mod sync;
pub mod vmm;
pub mod vnode;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use arch::{Arch, KERNEL_ARCH_VAS};
use irql::{IrqLevel, IrqlState};
use mem::addr::{PhysAddr, VirtAddr};
use mem::heap::Heap;
use mem::page::PhysPage;
use mem::phys::FrameTable;
use proc::ProcessTable;
use sched::Scheduler;
use sync::spin::SpinLock;
use util::consts::PAGE_4K;
use vmm::evict::{VictimHistory, evict_pages_if_needed};
use vmm::swap::SwapFile;
use vmm::{MappingTree, Vas};

/// The error values operations hand back when something recoverable goes
/// wrong. Contract violations don't get errors; they panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    OutOfMemory,
    TimedOut,
    Exists,
    InvalidArgument,
    AccessDenied,
    Interrupted,
    Cancelled,
    NotFound,
    Io,
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The driver loader's hook for patching relocatable pages as they come in.
pub trait PageRelocator: Send + Sync {
    fn relocate_page(
        &self,
        kernel: &Kernel,
        vas: &Arc<Vas>,
        relocation_base: usize,
        virt: VirtAddr,
    );
}

bitflags::bitflags! {
    /// Flags for [`Kernel::heap_alloc`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeapFlags: u32 {
        /// Zero the memory before returning it.
        const ZERO          = 1 << 0;
        /// Allocate from the pageable heap.
        const PAGEABLE      = 1 << 1;
        /// Let large allocations be promoted to the pageable heap.
        const ALLOW_PAGING  = 1 << 2;
        /// Always use the pageable heap.
        const FORCE_PAGING  = 1 << 3;
        /// Neither the allocation path nor the memory may ever fault; comes
        /// out of the emergency pool.
        const NO_FAULT      = 1 << 4;
    }
}

/// Requests at or above this size count as "large" for ALLOW_PAGING.
const HEAP_PAGING_PROMOTION_SIZE: usize = 1024;

/// How much emergency heap the refill task keeps on hand.
const EMERGENCY_POOL_TARGET: usize = 16 * 1024;

/// The whole kernel, behind one context pointer. Subsystem state lives here
/// rather than in module statics so the hosted test suites can run several
/// kernels side by side.
pub struct Kernel {
    pub(crate) arch: Arc<dyn Arch>,
    pub(crate) irql: IrqlState,
    pub(crate) frames: SpinLock<FrameTable>,
    pub(crate) locked_heap: SpinLock<Heap>,
    pub(crate) pageable_heap: SpinLock<Heap>,
    pub(crate) sched: Scheduler,
    pub(crate) global_mappings: MappingTree,
    pub kernel_vas: Arc<Vas>,
    pub(crate) procs: ProcessTable,
    pub(crate) swap: spin::RwLock<Option<SwapFile>>,
    pub(crate) relocator: spin::RwLock<Option<Arc<dyn PageRelocator>>>,
    pub(crate) victim_history: spin::Mutex<VictimHistory>,
    pub(crate) in_eviction: AtomicBool,
    time_ns: AtomicU64,
    rand_state: AtomicU32,
    pub(crate) kernel_alloc_next: AtomicUsize,
}

impl Kernel {
    /// Bring the core up on `arch` with the given physical memory ranges.
    pub fn new(arch: Arc<dyn Arch>, memory: &[(PhysAddr, PhysAddr)]) -> Arc<Kernel> {
        let kernel = Arc::new(Kernel {
            arch,
            irql: IrqlState::new(),
            frames: SpinLock::new("phys", IrqLevel::Scheduler, FrameTable::new()),
            locked_heap: SpinLock::new("heap", IrqLevel::Scheduler, Heap::new(false)),
            pageable_heap: SpinLock::new("pageable heap", IrqLevel::Scheduler, Heap::new(true)),
            sched: Scheduler::new(),
            global_mappings: MappingTree::new("global mappings"),
            kernel_vas: Kernel::make_kernel_vas(KERNEL_ARCH_VAS),
            procs: ProcessTable::new(),
            swap: spin::RwLock::new(None),
            relocator: spin::RwLock::new(None),
            victim_history: spin::Mutex::new(VictimHistory::new()),
            in_eviction: AtomicBool::new(false),
            time_ns: AtomicU64::new(0),
            rand_state: AtomicU32::new(0x1234_5678),
            kernel_alloc_next: AtomicUsize::new(vmm::layout::KERNEL_SBRK_BASE),
        });

        {
            let mut frames = kernel.frames.lock(&kernel);
            for (start, end) in memory {
                frames
                    .add_region(*start, *end)
                    .expect("Bad physical memory map");
            }
        }

        kernel.enable_deferred_work();
        kernel.frames.lock(&kernel).enable_stack();
        kernel.arch.set_vas(KERNEL_ARCH_VAS);

        // Seed the emergency heap pool so no-fault allocations work from the
        // first moment.
        kernel.refill_emergency_pool_now();

        kernel
    }

    /// Bring the core up on the software machine with `frames` pages of
    /// RAM. This is the configuration the test suites run.
    pub fn hosted(frames: usize) -> Arc<Kernel> {
        let arch = Arc::new(arch::soft::SoftArch::new(frames));
        Self::new(
            arch,
            &[(PhysAddr::new(0), PhysAddr::new(frames * PAGE_4K))],
        )
    }

    pub fn arch(&self) -> &Arc<dyn Arch> {
        &self.arch
    }

    /// Allocate one physical frame, scheduling eviction first if memory is
    /// getting low so the system never actually hits the wall.
    pub fn alloc_frame(&self) -> Result<PhysPage, KernelError> {
        self.assert_max_irql(IrqLevel::Scheduler);

        self.defer_call(IrqLevel::Standard, evict_pages_if_needed, 0);

        self.frames
            .lock(self)
            .alloc()
            .map_err(|_| KernelError::OutOfMemory)
    }

    pub fn free_frame(&self, page: PhysPage) {
        self.assert_max_irql(IrqLevel::Scheduler);
        self.frames.lock(self).free(page);
    }

    /// Allocate physically contiguous frames under placement constraints;
    /// drivers need this, nothing else should. See
    /// [`mem::phys::FrameTable::alloc_contiguous`].
    pub fn alloc_frames_contiguous(
        &self,
        pages: usize,
        min_addr: PhysAddr,
        max_addr: PhysAddr,
        boundary: usize,
    ) -> Option<PhysAddr> {
        self.frames
            .lock(self)
            .alloc_contiguous(pages, min_addr, max_addr, boundary)
    }

    pub fn free_frames_contiguous(&self, addr: PhysAddr, pages: usize) {
        self.frames.lock(self).free_contiguous(addr, pages);
    }

    pub fn frames_free(&self) -> usize {
        self.frames.lock(self).frames_free()
    }

    pub fn frames_total(&self) -> usize {
        self.frames.lock(self).frames_total()
    }

    pub fn frames_low(&self) -> bool {
        self.frames.lock(self).is_low()
    }

    /// Allocate kernel heap memory. Large requests should be whole-page
    /// mappings instead; the heap serves the small stuff.
    pub fn heap_alloc(&self, size: usize, flags: HeapFlags) -> Result<usize, KernelError> {
        let zero = flags.contains(HeapFlags::ZERO);

        if flags.contains(HeapFlags::NO_FAULT) {
            let ptr = self.locked_heap.lock(self).alloc_no_fault(size);
            self.defer_call(IrqLevel::Standard, refill_emergency_pool, 0);
            if zero {
                unsafe { (ptr as *mut u8).write_bytes(0, size) };
            }
            return Ok(ptr);
        }

        let pageable = flags.contains(HeapFlags::FORCE_PAGING)
            || flags.contains(HeapFlags::PAGEABLE)
            || (flags.contains(HeapFlags::ALLOW_PAGING) && size >= HEAP_PAGING_PROMOTION_SIZE);

        let heap = if pageable {
            &self.pageable_heap
        } else {
            &self.locked_heap
        };

        for _ in 0..2 {
            let result = heap.lock(self).alloc(size, zero);
            match result {
                Ok(ptr) => return Ok(ptr),
                Err(mem::MemoryError::OutOfAllocMemory) => {
                    self.grow_heap(heap)?;
                }
                Err(_) => return Err(KernelError::InvalidArgument),
            }
        }

        Err(KernelError::OutOfMemory)
    }

    pub fn heap_free(&self, ptr: usize, pageable: bool) {
        let heap = if pageable {
            &self.pageable_heap
        } else {
            &self.locked_heap
        };
        heap.lock(self).free(ptr);
    }

    pub fn heap_realloc(
        &self,
        ptr: usize,
        new_size: usize,
        pageable: bool,
    ) -> Result<usize, KernelError> {
        let heap = if pageable {
            &self.pageable_heap
        } else {
            &self.locked_heap
        };
        heap.lock(self)
            .realloc(ptr, new_size)
            .map_err(|_| KernelError::OutOfMemory)
    }

    /// Feed a heap one more locked page, reached through the direct-map
    /// window so tags and links can be written in place.
    fn grow_heap(&self, heap: &SpinLock<Heap>) -> Result<(), KernelError> {
        let virt = self.map_virt(
            &self.kernel_vas.clone(),
            PhysAddr::new(0),
            VirtAddr::new(0),
            1,
            vmm::MapFlags::READ | vmm::MapFlags::WRITE | vmm::MapFlags::LOCK,
            None,
            0,
        )?;

        let frame = {
            let entry = self
                .get_entry(&self.kernel_vas, mem::page::VirtPage::containing_addr(virt))
                .unwrap();
            let st = entry.state.lock();
            st.physical.unwrap()
        };

        let window = self.arch.frame_ptr(frame);
        unsafe { heap.lock(self).add_region(window as usize, PAGE_4K) };

        Ok(())
    }

    /// Top the emergency pool back up, synchronously. The deferred refill
    /// task calls this at Standard IRQL.
    fn refill_emergency_pool_now(&self) {
        loop {
            let (largest, total) = self.locked_heap.lock(self).emergency_status();
            if largest >= PAGE_4K && total >= EMERGENCY_POOL_TARGET {
                break;
            }

            let Ok(virt) = self.map_virt(
                &self.kernel_vas.clone(),
                PhysAddr::new(0),
                VirtAddr::new(0),
                1,
                vmm::MapFlags::READ | vmm::MapFlags::WRITE | vmm::MapFlags::LOCK,
                None,
                0,
            ) else {
                loam::warnln!("Unable to refill the emergency heap pool");
                return;
            };

            let frame = {
                let entry = self
                    .get_entry(&self.kernel_vas, mem::page::VirtPage::containing_addr(virt))
                    .unwrap();
                let st = entry.state.lock();
                st.physical.unwrap()
            };

            let window = self.arch.frame_ptr(frame);
            unsafe {
                self.locked_heap
                    .lock(self)
                    .add_emergency_block(window as usize, PAGE_4K)
            };
        }
    }

    /// The system timer, in nanoseconds since boot. Advanced by
    /// [`Kernel::timer_tick`].
    pub fn system_time(&self) -> u64 {
        self.time_ns.load(Ordering::Relaxed)
    }

    pub(crate) fn advance_time(&self, delta_ns: u64) {
        self.time_ns.fetch_add(delta_ns, Ordering::Relaxed);
    }

    /// A tiny deterministic generator for tie-breaking decisions; nothing
    /// here needs real randomness.
    pub(crate) fn next_random(&self) -> u32 {
        let next = self
            .rand_state
            .load(Ordering::Relaxed)
            .wrapping_mul(1_103_515_245)
            .wrapping_add(12345);
        self.rand_state.store(next, Ordering::Relaxed);
        next >> 16
    }

    pub fn set_page_relocator(&self, relocator: Arc<dyn PageRelocator>) {
        *self.relocator.write() = Some(relocator);
    }
}

fn refill_emergency_pool(kernel: &Kernel, _context: usize) {
    kernel.assert_exact_irql(IrqLevel::Standard);
    kernel.refill_emergency_pool_now();
}

#[cfg(test)]
pub(crate) fn test_kernel(frames: usize) -> Arc<Kernel> {
    let kernel = Kernel::hosted(frames);
    // Keep the hosted scheduler from actually switching; tests drive thread
    // state explicitly.
    kernel.prevent_scheduler();
    kernel
}
