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

//! The virtual memory manager.
//!
//! Every page visible to the kernel is described by a mapping entry: one or
//! more contiguous pages sharing identical attributes. Entries live in an
//! ordered per-address-space tree, plus one global tree whose mappings
//! appear in every address space. Lookup walks local then global. Entries
//! are reference counted so fork can share them copy-on-write.

pub mod access;
pub mod evict;
pub mod fault;
pub mod layout;
pub mod swap;

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::{ArchMapping, ArchVasId, KERNEL_ARCH_VAS};
use crate::irql::IrqLevel;
use crate::sync::spin::SpinLock;
use crate::vnode::FileHandle;
use crate::{Kernel, KernelError};
use mem::addr::{PhysAddr, VirtAddr};
use mem::page::{PhysPage, VirtPage};
use util::consts::PAGE_4K;

bitflags::bitflags! {
    /// Flags accepted by [`Kernel::map_virt`]. The permission subset
    /// (READ/WRITE/EXEC/USER) doubles as the access kind reported to the
    /// page fault handler.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const READ          = 1 << 0;
        const WRITE         = 1 << 1;
        const USER          = 1 << 2;
        const EXEC          = 1 << 3;
        /// Allocate a frame immediately and keep the page resident.
        const LOCK          = 1 << 4;
        /// Backed by a file; demand loaded.
        const FILE          = 1 << 5;
        /// Fail rather than relocate when the requested address is taken.
        const FIXED_VIRT    = 1 << 6;
        /// The physical hint names device memory, not a RAM frame.
        const MAP_HARDWARE  = 1 << 7;
        /// Insert into this address space only, not the global tree.
        const LOCAL         = 1 << 8;
        /// The caller already holds the address space lock.
        const RECURSIVE     = 1 << 9;
        /// A driver image that needs fixups applied on every page-in.
        const RELOCATABLE   = 1 << 10;
        /// Prefer this mapping when looking for eviction victims.
        const EVICT_FIRST   = 1 << 11;
        /// fork() shares the memory instead of marking it copy-on-write.
        const SHARE_ON_FORK = 1 << 12;
        /// File read failures during page-in panic instead of zero-filling.
        const HARD_IO_FAIL  = 1 << 13;
    }
}

/// The bookkeeping for one run of contiguous pages sharing attributes.
#[derive(Debug, Clone)]
pub struct EntryState {
    pub base: VirtPage,
    pub pages: usize,

    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub user: bool,

    /// In the global tree (visible in every address space) rather than one
    /// address space's tree.
    pub global: bool,
    /// Pinned in RAM; never an eviction candidate.
    pub locked: bool,
    /// Backed by a physical page right now.
    pub in_ram: bool,
    /// The physical page must be returned to the frame table on teardown.
    /// Differs from `in_ram` for hardware mappings.
    pub allocated: bool,
    pub cow: bool,
    /// The content currently lives in a swap slot.
    pub swapfile: bool,
    pub share_on_fork: bool,
    pub evict_first: bool,
    pub relocatable: bool,
    /// Relocatable images skip fixups on their very first load; the loader
    /// does the full pass itself.
    pub first_load: bool,
    /// Someone is already servicing a page-in; fault again later.
    pub load_in_progress: bool,
    /// Lets internal code write through a read-only mapping, e.g. to refill
    /// a reloaded page.
    pub allow_temp_write: bool,
    pub hard_io_fail: bool,

    pub times_swapped: u8,
    pub file_node: Option<Arc<FileHandle>>,
    pub file_offset: u64,
    pub physical: Option<PhysPage>,
    pub swap_slot: Option<usize>,
    pub relocation_base: usize,
    pub ref_count: usize,
}

pub struct MappingEntry {
    pub(crate) state: spin::Mutex<EntryState>,
}

impl MappingEntry {
    pub fn snapshot(&self) -> EntryState {
        self.state.lock().clone()
    }
}

impl core::fmt::Debug for MappingEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.state.lock().fmt(f)
    }
}

/// Build the page table entry view of one page of an entry.
pub(crate) fn arch_mapping_for(st: &EntryState, page_index: usize) -> ArchMapping {
    ArchMapping {
        vpage: st.base.offset(page_index),
        ppage: if st.in_ram { st.physical } else { None },
        present: st.in_ram,
        writable: (st.write && !st.cow) || st.allow_temp_write,
        user: st.user,
        exec: st.exec,
    }
}

/// An ordered map from base page to mapping entry, under its own lock.
pub struct MappingTree {
    pub(crate) entries: SpinLock<BTreeMap<usize, Arc<MappingEntry>>>,
}

impl MappingTree {
    pub(crate) const fn new(name: &'static str) -> Self {
        Self {
            entries: SpinLock::new(name, IrqLevel::Scheduler, BTreeMap::new()),
        }
    }

    /// Find the entry covering `page`, if any.
    pub(crate) fn find(&self, kernel: &Kernel, page: VirtPage) -> Option<Arc<MappingEntry>> {
        let map = self.entries.lock(kernel);

        let (_, entry) = map.range(..=page.page()).next_back()?;
        let st = entry.state.lock();

        if st.base.page() + st.pages > page.page() {
            let found = entry.clone();
            drop(st);
            Some(found)
        } else {
            None
        }
    }

    pub(crate) fn insert(&self, kernel: &Kernel, entry: Arc<MappingEntry>) {
        let base = entry.state.lock().base.page();
        self.entries.lock(kernel).insert(base, entry);
    }

    pub(crate) fn remove(&self, kernel: &Kernel, base: VirtPage) -> Option<Arc<MappingEntry>> {
        self.entries.lock(kernel).remove(&base.page())
    }

    pub(crate) fn collect(&self, kernel: &Kernel) -> Vec<Arc<MappingEntry>> {
        self.entries.lock(kernel).values().cloned().collect()
    }

    pub(crate) fn len(&self, kernel: &Kernel) -> usize {
        self.entries.lock(kernel).len()
    }
}

/// One virtual address space: the per-process mapping tree plus the arch
/// page table handle.
pub struct Vas {
    pub(crate) tree: MappingTree,
    arch_id: ArchVasId,
    local_alloc_next: AtomicUsize,
}

impl Vas {
    pub fn arch_id(&self) -> ArchVasId {
        self.arch_id
    }

    /// The number of mapping entries local to this address space.
    pub fn entry_count(&self, kernel: &Kernel) -> usize {
        self.tree.len(kernel)
    }
}

impl Kernel {
    pub(crate) fn make_kernel_vas(arch_id: ArchVasId) -> Arc<Vas> {
        Arc::new(Vas {
            tree: MappingTree::new("vas"),
            arch_id,
            local_alloc_next: AtomicUsize::new(layout::USER_MMAP_BASE),
        })
    }

    /// Create a fresh, empty address space.
    pub fn create_vas(&self) -> Arc<Vas> {
        self.assert_max_irql(IrqLevel::Scheduler);

        Arc::new(Vas {
            tree: MappingTree::new("vas"),
            arch_id: self.arch.create_vas(),
            local_alloc_next: AtomicUsize::new(layout::USER_MMAP_BASE),
        })
    }

    pub(crate) fn arch_vas_of(&self, vas: &Arc<Vas>, st: &EntryState) -> ArchVasId {
        if st.global { KERNEL_ARCH_VAS } else { vas.arch_id }
    }

    pub(crate) fn tree_of<'a>(&'a self, vas: &'a Arc<Vas>, global: bool) -> &'a MappingTree {
        if global { &self.global_mappings } else { &vas.tree }
    }

    /// Look a page up in the local tree, falling back to the global tree.
    pub(crate) fn get_entry(&self, vas: &Arc<Vas>, page: VirtPage) -> Option<Arc<MappingEntry>> {
        vas.tree
            .find(self, page)
            .or_else(|| self.global_mappings.find(self, page))
    }

    /// A copy of the bookkeeping for whatever entry covers `virt`, for
    /// diagnostics and invariant checks.
    pub fn mapping_entry_snapshot(&self, vas: &Arc<Vas>, virt: VirtAddr) -> Option<EntryState> {
        self.get_entry(vas, VirtPage::containing_addr(virt))
            .map(|entry| entry.snapshot())
    }

    fn is_range_in_use(&self, vas: &Arc<Vas>, virt: VirtAddr, pages: usize) -> bool {
        let base = VirtPage::containing_addr(virt);

        for i in 0..pages {
            if vas.tree.find(self, base.offset(i)).is_some() {
                return true;
            }
        }

        for i in 0..pages {
            if self.global_mappings.find(self, base.offset(i)).is_some() {
                return true;
            }
        }

        false
    }

    /// Hand out an unused virtual range. A bump allocator per space (and one
    /// for the kernel); ranges are not recycled yet, which is fine for the
    /// lifetimes the kernel currently has.
    fn alloc_virt_range(&self, vas: &Arc<Vas>, pages: usize, local: bool) -> VirtAddr {
        let bytes = pages * PAGE_4K;

        let base = if local {
            vas.local_alloc_next.fetch_add(bytes, Ordering::Relaxed)
        } else {
            self.kernel_alloc_next.fetch_add(bytes, Ordering::Relaxed)
        };

        VirtAddr::new(base)
    }

    /// Create a virtual memory mapping.
    ///
    /// All mapped pages read as zero on first use (locked pages are zeroed
    /// at allocation), except hardware and file mappings. Reading a file
    /// mapping past the end of the file, but within the mapped range, reads
    /// zeroes. Returns the virtual base actually used.
    pub fn map_virt(
        &self,
        vas: &Arc<Vas>,
        physical: PhysAddr,
        virt: VirtAddr,
        pages: usize,
        flags: MapFlags,
        file: Option<Arc<FileHandle>>,
        file_offset: u64,
    ) -> Result<VirtAddr, KernelError> {
        self.assert_max_irql(IrqLevel::Scheduler);

        let fail_if = |cond: bool, err: KernelError| if cond { Err(err) } else { Ok(()) };

        fail_if(pages == 0, KernelError::InvalidArgument)?;
        fail_if(
            !physical.is_null()
                && !flags.intersects(MapFlags::MAP_HARDWARE | MapFlags::RELOCATABLE),
            KernelError::InvalidArgument,
        )?;
        fail_if(
            flags.contains(MapFlags::MAP_HARDWARE) && !flags.contains(MapFlags::LOCK),
            KernelError::InvalidArgument,
        )?;
        fail_if(
            flags.contains(MapFlags::FILE) && flags.contains(MapFlags::MAP_HARDWARE),
            KernelError::InvalidArgument,
        )?;
        fail_if(
            flags.contains(MapFlags::FILE) && file.is_none(),
            KernelError::InvalidArgument,
        )?;
        fail_if(
            flags.contains(MapFlags::FILE) && flags.contains(MapFlags::LOCK),
            KernelError::InvalidArgument,
        )?;
        fail_if(
            !flags.contains(MapFlags::FILE) && (file.is_some() || file_offset != 0),
            KernelError::InvalidArgument,
        )?;
        fail_if(
            flags.contains(MapFlags::RELOCATABLE) && !flags.contains(MapFlags::FILE),
            KernelError::InvalidArgument,
        )?;
        fail_if(
            flags.contains(MapFlags::RELOCATABLE) && flags.contains(MapFlags::USER),
            KernelError::InvalidArgument,
        )?;
        fail_if(
            flags.contains(MapFlags::RELOCATABLE) && physical.is_null(),
            KernelError::InvalidArgument,
        )?;
        fail_if(
            flags.contains(MapFlags::LOCK) && flags.contains(MapFlags::SHARE_ON_FORK),
            KernelError::InvalidArgument,
        )?;

        if let Some(ref file) = file {
            fail_if(!file.can_read, KernelError::AccessDenied)?;
            fail_if(
                flags.contains(MapFlags::WRITE) && !file.can_write,
                KernelError::AccessDenied,
            )?;
        }

        // Find a virtual range that isn't already taken.
        let virt = if virt.is_null() {
            self.alloc_virt_range(vas, pages, flags.contains(MapFlags::LOCAL))
        } else if self.is_range_in_use(vas, virt, pages) {
            if flags.contains(MapFlags::FIXED_VIRT) {
                return Err(KernelError::Exists);
            }
            self.alloc_virt_range(vas, pages, flags.contains(MapFlags::LOCAL))
        } else {
            virt
        };

        // There's no point making a multi-page entry out of only 2 pages; the
        // later splitting costs more than two entries up front.
        let multi_page = !flags.contains(MapFlags::LOCK)
            && !flags.contains(MapFlags::MAP_HARDWARE)
            && pages >= 3;

        let entry_count = if multi_page { 1 } else { pages };
        for i in 0..entry_count {
            self.add_mapping(
                vas,
                if physical.is_null() || flags.contains(MapFlags::RELOCATABLE) {
                    physical
                } else {
                    physical.offset(i * PAGE_4K)
                },
                virt.offset(i * PAGE_4K),
                if multi_page { pages } else { 1 },
                flags,
                file.clone(),
                file_offset + (i * PAGE_4K) as u64,
            )?;
        }

        self.arch.flush_tlb(vas.arch_id());

        Ok(virt)
    }

    fn add_mapping(
        &self,
        vas: &Arc<Vas>,
        physical: PhysAddr,
        virt: VirtAddr,
        pages: usize,
        flags: MapFlags,
        file: Option<Arc<FileHandle>>,
        file_offset: u64,
    ) -> Result<(), KernelError> {
        let locked = flags.contains(MapFlags::LOCK);
        let relocatable = flags.contains(MapFlags::RELOCATABLE);

        let mut allocated = false;
        let physical_page = if locked {
            if flags.contains(MapFlags::MAP_HARDWARE) {
                // Hardware pages may name memory outside the frame table;
                // don't second-guess them.
                Some(PhysPage::containing_addr(physical))
            } else {
                allocated = true;
                Some(self.alloc_frame()?)
            }
        } else {
            None
        };

        let st = EntryState {
            base: VirtPage::containing_addr(virt),
            pages,
            read: flags.contains(MapFlags::READ),
            write: flags.contains(MapFlags::WRITE),
            exec: flags.contains(MapFlags::EXEC),
            user: flags.contains(MapFlags::USER),
            global: !flags.contains(MapFlags::LOCAL),
            locked,
            in_ram: locked,
            allocated,
            cow: false,
            swapfile: false,
            share_on_fork: flags.contains(MapFlags::SHARE_ON_FORK),
            evict_first: flags.contains(MapFlags::EVICT_FIRST),
            relocatable,
            first_load: relocatable,
            load_in_progress: false,
            allow_temp_write: false,
            hard_io_fail: flags.contains(MapFlags::HARD_IO_FAIL),
            times_swapped: 0,
            file_node: file,
            file_offset,
            physical: physical_page,
            swap_slot: None,
            relocation_base: if relocatable { physical.addr() } else { 0 },
            ref_count: 1,
        };

        let arch_vas = self.arch_vas_of(vas, &st);
        let global = st.global;
        let zero_pages = locked && !flags.contains(MapFlags::MAP_HARDWARE);
        let frame = st.physical;

        for i in 0..pages {
            self.arch.add_mapping(arch_vas, &arch_mapping_for(&st, i));
        }

        let entry = Arc::new(MappingEntry {
            state: spin::Mutex::new(st),
        });
        self.tree_of(vas, global).insert(self, entry);

        if zero_pages {
            // Pages have to read as zero on first use; locked ones have
            // their first use now.
            self.arch.with_frame(frame.unwrap(), &mut |bytes| bytes.fill(0));
        }

        Ok(())
    }

    /// Break a multi-page entry apart so that the page containing `virt`
    /// gets its own single-page entry. Needed before any per-page state
    /// change (fault-in, unmap, permission change).
    pub(crate) fn split_to_single(&self, vas: &Arc<Vas>, entry: &Arc<MappingEntry>, virt: VirtAddr) {
        let global = entry.state.lock().global;
        let tree = self.tree_of(vas, global);
        let mut map = tree.entries.lock(self);
        let mut st = entry.state.lock();

        if st.pages == 1 {
            return;
        }

        if st.ref_count != 1 {
            loam::warnln!("Splitting a shared multi-page mapping; both holders see the split");
        }

        assert!(!st.allocated && !st.swapfile && !st.in_ram);

        let target = VirtPage::containing_addr(virt);
        let old_base = st.base;

        // Split off anything before the target page.
        if st.base < target {
            let pages_before = target.page() - st.base.page();

            let mut pre = st.clone();
            pre.pages = pages_before;

            st.pages -= pages_before;
            st.base = target;
            if st.file_node.is_some() {
                st.file_offset += (pages_before * PAGE_4K) as u64;
            }

            map.insert(
                pre.base.page(),
                Arc::new(MappingEntry {
                    state: spin::Mutex::new(pre),
                }),
            );
        }

        // Now split off anything after it.
        if st.pages > 1 {
            let mut post = st.clone();
            post.base = st.base.offset(1);
            post.pages = st.pages - 1;
            if post.file_node.is_some() {
                post.file_offset += PAGE_4K as u64;
            }

            st.pages = 1;

            map.insert(
                post.base.page(),
                Arc::new(MappingEntry {
                    state: spin::Mutex::new(post),
                }),
            );
        }

        // Our base key may have moved.
        if old_base != st.base {
            let ours = map.remove(&old_base.page());
            debug_assert!(ours.is_some());
            map.insert(st.base.page(), ours.unwrap());
        }
    }

    /// Drop one reference to an entry. At zero the entry's resources are
    /// torn down: dirty file pages get written back, frames and swap slots
    /// are freed, and the arch mapping is removed. Returns whether a TLB
    /// flush became necessary.
    pub(crate) fn dereference_entry(&self, vas: &Arc<Vas>, entry: &Arc<MappingEntry>) -> bool {
        let mut st = entry.state.lock();
        assert!(st.ref_count > 0);
        st.ref_count -= 1;

        let arch_vas = self.arch_vas_of(vas, &st);
        let mut needs_tlb_flush = false;

        if st.ref_count == 0 {
            if st.file_node.is_some() && st.write && st.in_ram {
                let (_, dirty) = self.arch.page_usage_bits(arch_vas, st.base);
                if dirty {
                    let file = st.file_node.clone().unwrap();
                    let offset = st.file_offset;
                    let frame = st.physical.unwrap();
                    drop(st);
                    self.stage_page_write(frame, file, offset, false);
                    st = entry.state.lock();
                }
            }

            if st.in_ram {
                self.arch.unmap(arch_vas, st.base, st.pages);
                needs_tlb_flush = true;
            }

            if let Some(slot) = st.swap_slot.take() {
                assert!(!st.allocated);
                let swap = self.swap.read();
                swap.as_ref()
                    .expect("Swap slot recorded with no swap file")
                    .dealloc_slot(slot);
            }

            if st.allocated {
                assert!(!st.swapfile);
                self.free_frame(st.physical.take().unwrap());
            }

            self.arch.clear_page_usage_bits(arch_vas, st.base);

            let global = st.global;
            let base = st.base;
            drop(st);
            self.tree_of(vas, global).remove(self, base);
        } else {
            // Someone else still holds this entry; this address space just
            // lets go of its view.
            let global = st.global;
            let base = st.base;
            drop(st);
            if !global {
                vas.tree.remove(self, base);
            }
        }

        needs_tlb_flush
    }

    /// Remove `pages` pages of mapping starting at `virt`. Each page's entry
    /// loses one reference; fully released entries free their backing.
    pub fn unmap_virt(
        &self,
        vas: &Arc<Vas>,
        virt: VirtAddr,
        pages: usize,
        allow_non_exist: bool,
    ) -> Result<(), KernelError> {
        let mut needs_tlb_flush = false;

        for i in 0..pages {
            let addr = virt.offset(i * PAGE_4K);
            let Some(entry) = self.get_entry(vas, VirtPage::containing_addr(addr)) else {
                if allow_non_exist {
                    continue;
                }
                return Err(KernelError::InvalidArgument);
            };

            self.split_to_single(vas, &entry, addr);
            needs_tlb_flush |= self.dereference_entry(vas, &entry);
        }

        if needs_tlb_flush {
            self.arch.flush_tlb(vas.arch_id());
        }

        Ok(())
    }

    /// Change the permission bits on the page containing `virt`. Setting a
    /// bit overrides clearing it. Adding write to a read-only file mapping
    /// requires the underlying file be writable, except for relocatable
    /// images receiving loader fixups.
    pub fn set_virt_permissions(
        &self,
        vas: &Arc<Vas>,
        virt: VirtAddr,
        set: MapFlags,
        clear: MapFlags,
    ) -> Result<(), KernelError> {
        let permission_bits = MapFlags::READ | MapFlags::WRITE | MapFlags::EXEC | MapFlags::USER;
        if !permission_bits.contains(set | clear) {
            return Err(KernelError::InvalidArgument);
        }

        let Some(entry) = self.get_entry(vas, VirtPage::containing_addr(virt)) else {
            return Err(KernelError::NotFound);
        };

        {
            let st = entry.state.lock();
            if let Some(ref file) = st.file_node {
                if set.contains(MapFlags::WRITE) && !file.can_write && !st.relocatable {
                    return Err(KernelError::AccessDenied);
                }
            }
        }

        self.split_to_single(vas, &entry, virt);

        let mut st = entry.state.lock();
        st.read = set.contains(MapFlags::READ) || (st.read && !clear.contains(MapFlags::READ));
        st.write = set.contains(MapFlags::WRITE) || (st.write && !clear.contains(MapFlags::WRITE));
        st.exec = set.contains(MapFlags::EXEC) || (st.exec && !clear.contains(MapFlags::EXEC));
        st.user = set.contains(MapFlags::USER) || (st.user && !clear.contains(MapFlags::USER));

        let arch_vas = self.arch_vas_of(vas, &st);
        self.arch.update_mapping(arch_vas, &arch_mapping_for(&st, 0));
        drop(st);

        self.arch.flush_tlb(vas.arch_id());
        Ok(())
    }

    /// The flags view of whatever entry covers `virt` (empty if none).
    pub fn get_virt_permissions(&self, vas: &Arc<Vas>, virt: VirtAddr) -> MapFlags {
        let Some(entry) = self.get_entry(vas, VirtPage::containing_addr(virt)) else {
            return MapFlags::empty();
        };

        let st = entry.state.lock();
        let mut flags = MapFlags::empty();

        flags.set(MapFlags::READ, st.read);
        flags.set(MapFlags::WRITE, st.write);
        flags.set(MapFlags::EXEC, st.exec);
        flags.set(MapFlags::USER, st.user);
        flags.set(MapFlags::LOCK, st.locked);
        flags.set(MapFlags::FILE, st.file_node.is_some());
        flags.set(MapFlags::LOCAL, !st.global);
        flags.set(MapFlags::RELOCATABLE, st.relocatable);

        flags
    }

    /// Force the page containing `virt` resident and pin it. Returns the
    /// previous pin state so nested lock/unlock pairs can restore it.
    pub fn lock_virt(&self, vas: &Arc<Vas>, virt: VirtAddr) -> Result<bool, KernelError> {
        let Some(entry) = self.get_entry(vas, VirtPage::containing_addr(virt)) else {
            return Err(KernelError::NotFound);
        };

        if !entry.state.lock().in_ram {
            self.split_to_single(vas, &entry, virt);
            self.fault_in_entry(vas, &entry, virt)?;

            if !entry.state.lock().in_ram {
                panic!("Unable to make a page resident to lock it");
            }
        }

        let mut st = entry.state.lock();
        let old = st.locked;
        st.locked = true;
        Ok(old)
    }

    /// Unpin the page containing `virt`.
    pub fn unlock_virt(&self, vas: &Arc<Vas>, virt: VirtAddr) -> Result<(), KernelError> {
        let Some(entry) = self.get_entry(vas, VirtPage::containing_addr(virt)) else {
            return Err(KernelError::NotFound);
        };

        self.split_to_single(vas, &entry, virt);
        entry.state.lock().locked = false;
        Ok(())
    }

    /// Copy an address space for fork. Locked mappings are deep copied; all
    /// others become copy-on-write in both spaces (unless marked
    /// share-on-fork) with their reference count bumped.
    pub fn fork_vas(&self, src: &Arc<Vas>) -> Result<Arc<Vas>, KernelError> {
        self.assert_max_irql(IrqLevel::PageFault);

        let new_vas = self.create_vas();
        let entries = src.tree.collect(self);

        for entry in entries {
            // Allocating can trigger eviction, which wants entry locks of
            // its own, so take the frame before locking anything.
            let fresh_frame = if entry.state.lock().locked {
                Some(self.alloc_frame()?)
            } else {
                None
            };

            let mut st = entry.state.lock();

            if st.locked {
                // Locked pages must stay resident in both spaces; nothing
                // for it but a real copy.
                assert!(st.in_ram);
                assert!(!st.share_on_fork);

                if !st.allocated {
                    panic!("Cannot fork a hardware-mapped page");
                }

                let mut copy = st.clone();
                copy.ref_count = 1;
                copy.physical = Some(fresh_frame.unwrap());

                let mut buffer = [0u8; PAGE_4K];
                self.arch
                    .with_frame(st.physical.unwrap(), &mut |bytes| {
                        buffer.copy_from_slice(bytes)
                    });
                self.arch
                    .with_frame(copy.physical.unwrap(), &mut |bytes| {
                        bytes.copy_from_slice(&buffer)
                    });

                self.arch
                    .add_mapping(new_vas.arch_id(), &arch_mapping_for(&copy, 0));

                drop(st);
                new_vas.tree.insert(
                    self,
                    Arc::new(MappingEntry {
                        state: spin::Mutex::new(copy),
                    }),
                );
            } else {
                // Entries on swap or still demand-zero are fine to share as
                // well: they fault back in as copy-on-write and the copy
                // happens then. File mappings also become copy-on-write for
                // now; the last writer's changes win at close, until shared
                // mappings exist.
                if !st.share_on_fork {
                    st.cow = true;
                }
                st.ref_count += 1;

                for i in 0..st.pages {
                    self.arch
                        .update_mapping(src.arch_id(), &arch_mapping_for(&st, i));
                    self.arch
                        .add_mapping(new_vas.arch_id(), &arch_mapping_for(&st, i));
                }

                drop(st);
                new_vas.tree.insert(self, entry.clone());
            }
        }

        self.arch.flush_tlb(src.arch_id());
        self.arch.flush_tlb(new_vas.arch_id());

        Ok(new_vas)
    }

    /// Tear down every user-range mapping in an address space; exec calls
    /// this before loading the new image. The user stacks (below the stack
    /// limit) and the program loader survive.
    pub fn wipe_user_mappings(&self, vas: &Arc<Vas>) {
        let entries = vas.tree.collect(self);

        for entry in entries {
            let base = entry.state.lock().base.addr().addr();
            if base >= layout::USER_STACK_LIMIT && base < layout::PROG_LOADER_BASE {
                self.dereference_entry(vas, &entry);
            }
        }

        self.arch.flush_tlb(vas.arch_id());
    }

    /// Destroy an address space, dropping every mapping it holds. The
    /// address space must not be the one the CPU is executing in.
    pub fn destroy_vas(&self, vas: &Arc<Vas>) {
        if let Some(current) = self.current_thread() {
            if Arc::ptr_eq(&current.vas, vas) {
                panic!("An address space cannot destroy itself");
            }
        }

        let entries = vas.tree.collect(self);
        for entry in entries {
            self.dereference_entry(vas, &entry);
        }

        self.arch.destroy_vas(vas.arch_id());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_kernel;
    use crate::vnode::{FileHandle, MemoryFile};

    extern crate std;
    use std::sync::Mutex as StdMutex;
    use std::vec::Vec as StdVec;

    fn anon_flags() -> MapFlags {
        MapFlags::READ | MapFlags::WRITE | MapFlags::LOCAL
    }

    #[test]
    fn test_split_keeps_file_offsets_lined_up() {
        let kernel = test_kernel(128);
        let vas = kernel.create_vas();

        let mut contents = std::vec![0u8; 4 * PAGE_4K];
        for page in 0..4 {
            contents[page * PAGE_4K] = page as u8 + 1;
        }
        let file = FileHandle::new(MemoryFile::new(contents), true, false);

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

        // Touch the third page first; the split must keep every sibling's
        // file offset pointing at its own page of the file.
        assert_eq!(
            kernel.read_virt_u8(&vas, addr.offset(2 * PAGE_4K)).unwrap(),
            3
        );
        assert_eq!(kernel.read_virt_u8(&vas, addr).unwrap(), 1);
        assert_eq!(
            kernel.read_virt_u8(&vas, addr.offset(3 * PAGE_4K)).unwrap(),
            4
        );
        assert_eq!(
            kernel.read_virt_u8(&vas, addr.offset(PAGE_4K)).unwrap(),
            2
        );

        let third = kernel
            .mapping_entry_snapshot(&vas, addr.offset(2 * PAGE_4K))
            .unwrap();
        assert_eq!(third.pages, 1);
        assert_eq!(third.file_offset, (2 * PAGE_4K) as u64);
    }

    #[test]
    fn test_destroy_vas_releases_everything() {
        let kernel = test_kernel(128);
        let vas = kernel.create_vas();

        let free_before = kernel.frames_free();

        let anon = kernel
            .map_virt(&vas, PhysAddr::new(0), VirtAddr::new(0), 2, anon_flags(), None, 0)
            .unwrap();
        let locked = kernel
            .map_virt(
                &vas,
                PhysAddr::new(0),
                VirtAddr::new(0),
                1,
                anon_flags() | MapFlags::LOCK,
                None,
                0,
            )
            .unwrap();

        kernel.write_virt_u8(&vas, anon, 1).unwrap();
        kernel.write_virt_u8(&vas, locked, 2).unwrap();

        assert_eq!(kernel.frames_free(), free_before - 2);

        kernel.destroy_vas(&vas);
        assert_eq!(kernel.frames_free(), free_before);
    }

    #[test]
    fn test_unmap_of_missing_page_honours_allow_flag() {
        let kernel = test_kernel(64);
        let vas = kernel.create_vas();

        assert_eq!(
            kernel.unmap_virt(&vas, VirtAddr::new(0x6000_0000), 1, false),
            Err(crate::KernelError::InvalidArgument)
        );
        assert!(
            kernel
                .unmap_virt(&vas, VirtAddr::new(0x6000_0000), 1, true)
                .is_ok()
        );
    }

    struct RecordingRelocator {
        calls: StdMutex<StdVec<(usize, usize)>>,
    }

    impl crate::PageRelocator for RecordingRelocator {
        fn relocate_page(
            &self,
            _kernel: &crate::Kernel,
            _vas: &Arc<Vas>,
            relocation_base: usize,
            virt: VirtAddr,
        ) {
            self.calls.lock().unwrap().push((relocation_base, virt.addr()));
        }
    }

    #[test]
    fn test_relocatable_pages_are_fixed_up_on_reload_only() {
        let kernel = test_kernel(128);
        let vas = kernel.kernel_vas.clone();

        let relocator = Arc::new(RecordingRelocator {
            calls: StdMutex::new(StdVec::new()),
        });
        kernel.set_page_relocator(relocator.clone());

        let file = FileHandle::new(MemoryFile::new(std::vec![0x42u8; PAGE_4K]), true, false);
        let addr = kernel
            .map_virt(
                &vas,
                PhysAddr::new(0x0008_0000),
                VirtAddr::new(0),
                1,
                MapFlags::READ | MapFlags::FILE | MapFlags::RELOCATABLE,
                Some(file),
                0,
            )
            .unwrap();

        // First load: the loader has already done the full relocation pass,
        // so no per-page fixup runs.
        assert_eq!(kernel.read_virt_u8(&vas, addr).unwrap(), 0x42);
        assert!(relocator.calls.lock().unwrap().is_empty());

        // Push it out and touch it again: now the fixup must run.
        let entry = kernel.get_entry(&vas, VirtPage::containing_addr(addr)).unwrap();
        let arch_vas = kernel.arch_vas_of(&vas, &entry.state.lock());
        kernel.evict_page(&entry, arch_vas);

        assert_eq!(kernel.read_virt_u8(&vas, addr).unwrap(), 0x42);
        assert_eq!(
            *relocator.calls.lock().unwrap(),
            std::vec![(0x0008_0000, addr.addr())]
        );
    }

    #[test]
    fn test_relocatable_entry_gains_temporary_write_permission() {
        let kernel = test_kernel(128);
        let vas = kernel.kernel_vas.clone();

        let file = FileHandle::new(MemoryFile::new(std::vec![0u8; PAGE_4K]), true, false);
        let addr = kernel
            .map_virt(
                &vas,
                PhysAddr::new(0x0008_0000),
                VirtAddr::new(0),
                1,
                MapFlags::READ | MapFlags::FILE | MapFlags::RELOCATABLE,
                Some(file),
                0,
            )
            .unwrap();

        // The file is read-only, but a relocatable image may take write
        // permission to receive its fixups.
        assert!(
            kernel
                .set_virt_permissions(&vas, addr, MapFlags::WRITE, MapFlags::empty())
                .is_ok()
        );

        // An ordinary read-only file mapping may not.
        let plain_file = FileHandle::new(MemoryFile::new(std::vec![0u8; PAGE_4K]), true, false);
        let plain = kernel
            .map_virt(
                &vas,
                PhysAddr::new(0),
                VirtAddr::new(0),
                1,
                MapFlags::READ | MapFlags::FILE | MapFlags::LOCAL,
                Some(plain_file),
                0,
            )
            .unwrap();
        assert_eq!(
            kernel.set_virt_permissions(&vas, plain, MapFlags::WRITE, MapFlags::empty()),
            Err(crate::KernelError::AccessDenied)
        );
    }
}
