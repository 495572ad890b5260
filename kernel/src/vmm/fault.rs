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

//! The page fault resolver.
//!
//! Every fault lands here. Resolution depends on what the covering entry
//! says the page is: a copy-on-write hit copies, file and swap pages are
//! demand loaded through a deferred disk read, untouched anonymous pages
//! get a zeroed frame, and anything else is an unhandled fault for the
//! caller to turn into a signal.

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;

use super::{MapFlags, MappingEntry, Vas, arch_mapping_for};
use crate::irql::{DeferredWork, IrqLevel};
use crate::vnode::{FileHandle, Transfer, TransferDirection};
use crate::{Kernel, KernelError};
use mem::addr::VirtAddr;
use mem::page::VirtPage;
use util::consts::PAGE_4K;

impl Kernel {
    /// Handle a page fault against `vas` at `addr`. `access` describes the
    /// faulting access: WRITE for stores, READ otherwise, USER when it came
    /// from user mode, EXEC for instruction fetches.
    ///
    /// An error return means the fault could not be resolved; the caller
    /// decides whether that kills a process or panics the kernel.
    pub fn page_fault(
        &self,
        vas: &Arc<Vas>,
        addr: VirtAddr,
        access: MapFlags,
    ) -> Result<(), KernelError> {
        if self.irql() >= IrqLevel::Scheduler {
            panic!(
                "Page fault at {} while IRQL is {:?}; pageable memory was touched with a spinlock held",
                addr,
                self.irql()
            );
        }

        let Some(entry) = self.get_entry(vas, VirtPage::containing_addr(addr)) else {
            return Err(KernelError::NotFound);
        };

        {
            let st = entry.state.lock();

            if st.load_in_progress {
                // Another thread is already servicing this page; let it
                // finish and make the access try again.
                drop(st);
                self.schedule();
                return Ok(());
            }

            assert!(!(st.in_ram && st.swapfile));
            assert!(!(st.file_node.is_some() && st.swapfile));
            assert!(!(!st.in_ram && st.locked));
            assert!(!(st.cow && st.locked));

            if st.cow && access.contains(MapFlags::WRITE) && st.in_ram {
                drop(st);
                return self.resolve_cow_write(vas, &entry);
            }

            if st.file_node.is_some() && !st.in_ram {
                drop(st);
                self.split_to_single(vas, &entry, addr);
                return self.begin_page_in(vas, &entry, false);
            }

            if st.swapfile {
                assert_eq!(st.pages, 1);
                drop(st);
                return self.begin_page_in(vas, &entry, true);
            }

            if !st.in_ram {
                drop(st);
                self.split_to_single(vas, &entry, addr);
                return self.resolve_demand_zero(vas, &entry, access);
            }

            // The entry is resident. Either the access really was illegal,
            // or this address space's page table entry is stale: a shared
            // entry can be populated through the other holder's space, and
            // the last holder of a copy-on-write page keeps a write
            // protected mapping after the other side copied away.
            if (access.contains(MapFlags::READ) && !st.read)
                || (access.contains(MapFlags::WRITE) && !st.write)
                || (access.contains(MapFlags::WRITE) && st.cow)
                || (access.contains(MapFlags::EXEC) && !st.exec)
                || (access.contains(MapFlags::USER) && !st.user)
            {
                return Err(KernelError::AccessDenied);
            }

            let arch_vas = self.arch_vas_of(vas, &st);
            self.arch.update_mapping(arch_vas, &arch_mapping_for(&st, 0));
        }

        self.arch.flush_tlb(vas.arch_id());
        Ok(())
    }

    /// The entry point for faults raised by user-mode execution. A fault
    /// the resolver cannot handle turns into a SIGSEGV against the faulting
    /// thread; a process with no handler installed dies with the signal
    /// recorded as its exit status.
    pub fn handle_user_fault(&self, addr: VirtAddr, access: MapFlags) {
        let Some(thr) = self.current_thread() else {
            panic!("User fault at {} with no running thread", addr);
        };

        let vas = thr.vas.clone();
        if self.page_fault(&vas, addr, access | MapFlags::USER).is_err() {
            let _ = self.raise_signal(&thr, crate::sched::signal::SIGSEGV);
        }
    }

    /// Bring the page an entry describes into memory whatever its backing,
    /// used by lock_virt which cannot tolerate a deferred completion.
    pub(crate) fn fault_in_entry(
        &self,
        vas: &Arc<Vas>,
        entry: &Arc<MappingEntry>,
        addr: VirtAddr,
    ) -> Result<(), KernelError> {
        let st = entry.state.lock();

        if st.in_ram {
            return Ok(());
        }

        if st.file_node.is_some() {
            drop(st);
            return self.begin_page_in(vas, entry, false);
        }
        if st.swapfile {
            drop(st);
            return self.begin_page_in(vas, entry, true);
        }

        drop(st);
        self.resolve_demand_zero(vas, entry, MapFlags::empty())
    }

    /// A write hit a copy-on-write page. If we are the last holder the page
    /// simply stops being copy-on-write; otherwise the contents move into a
    /// private frame behind a fresh entry.
    fn resolve_cow_write(&self, vas: &Arc<Vas>, entry: &Arc<MappingEntry>) -> Result<(), KernelError> {
        {
            let mut st = entry.state.lock();
            assert_eq!(st.pages, 1);

            if st.ref_count == 1 {
                st.cow = false;
                let arch_vas = self.arch_vas_of(vas, &st);
                self.arch.update_mapping(arch_vas, &arch_mapping_for(&st, 0));
                drop(st);
                self.arch.flush_tlb(vas.arch_id());
                return Ok(());
            }
        }

        let frame = self.alloc_frame()?;

        let mut buffer = [0u8; PAGE_4K];
        let mut st = entry.state.lock();

        self.arch.with_frame(st.physical.unwrap(), &mut |bytes| {
            buffer.copy_from_slice(bytes)
        });

        st.ref_count -= 1;
        if st.ref_count == 1 {
            // The other holder has the page to itself now; its next fault
            // clears its write protection.
            st.cow = false;
        }

        let mut private = st.clone();
        private.ref_count = 1;
        private.cow = false;
        private.physical = Some(frame);
        private.allocated = true;

        let base = st.base;
        drop(st);

        let new_entry = Arc::new(MappingEntry {
            state: spin::Mutex::new(private),
        });

        vas.tree.remove(self, base);
        vas.tree.insert(self, new_entry.clone());

        {
            let st = new_entry.state.lock();
            self.arch
                .update_mapping(vas.arch_id(), &arch_mapping_for(&st, 0));
        }

        self.arch.with_frame(frame, &mut |bytes| {
            bytes.copy_from_slice(&buffer)
        });
        self.arch.flush_tlb(vas.arch_id());

        Ok(())
    }

    /// An untouched anonymous page: allocate a frame, zero it, map it.
    fn resolve_demand_zero(
        &self,
        vas: &Arc<Vas>,
        entry: &Arc<MappingEntry>,
        access: MapFlags,
    ) -> Result<(), KernelError> {
        {
            let st = entry.state.lock();

            if (access.contains(MapFlags::READ) && !st.read)
                || (access.contains(MapFlags::WRITE) && !st.write)
                || (access.contains(MapFlags::EXEC) && !st.exec)
                || (access.contains(MapFlags::USER) && !st.user)
            {
                return Err(KernelError::AccessDenied);
            }
        }

        let frame = self.alloc_frame()?;

        let mut st = entry.state.lock();
        assert_eq!(st.pages, 1);
        assert!(!st.swapfile);

        st.physical = Some(frame);
        st.allocated = true;
        st.in_ram = true;

        let arch_vas = self.arch_vas_of(vas, &st);
        self.arch.update_mapping(arch_vas, &arch_mapping_for(&st, 0));
        drop(st);

        self.arch.with_frame(frame, &mut |bytes| bytes.fill(0));
        self.arch.flush_tlb(vas.arch_id());

        Ok(())
    }

    /// Start a demand load from the entry's backing file (or the swap
    /// file). The entry is marked load-in-progress and a deferred disk read
    /// finishes the job at Standard IRQL; faults in the meantime retry.
    fn begin_page_in(
        &self,
        vas: &Arc<Vas>,
        entry: &Arc<MappingEntry>,
        from_swap: bool,
    ) -> Result<(), KernelError> {
        let (file, offset) = {
            let mut st = entry.state.lock();
            st.load_in_progress = true;

            let arch_vas = self.arch_vas_of(vas, &st);
            self.arch.update_mapping(arch_vas, &arch_mapping_for(&st, 0));

            if from_swap {
                let slot = st.swap_slot.expect("Swap-resident entry without a slot");
                let swap = self.swap.read();
                let swap = swap.as_ref().expect("Swap-resident entry with no swap file");
                (swap.file(), (slot * PAGE_4K) as u64)
            } else {
                (st.file_node.clone().unwrap(), st.file_offset)
            }
        };

        self.arch.flush_tlb(vas.arch_id());

        let vas = vas.clone();
        let entry = entry.clone();
        self.defer(
            IrqLevel::Standard,
            DeferredWork::Boxed(Box::new(move |kernel: &Kernel| {
                finish_page_in(kernel, &vas, &entry, &file, offset, from_swap);
            })),
        );

        Ok(())
    }

    /// Copy a frame's current contents out through a staging mapping and
    /// queue a deferred write of them to `file` at `offset`. Used by
    /// eviction write-back and by the final unmap of a dirty file page. The
    /// copy is taken now so the frame may be freed immediately.
    pub(crate) fn stage_page_write(
        &self,
        frame: mem::page::PhysPage,
        file: Arc<FileHandle>,
        offset: u64,
        failure_is_fatal: bool,
    ) {
        let staging = self
            .map_virt(
                &self.kernel_vas.clone(),
                mem::addr::PhysAddr::new(0),
                VirtAddr::new(0),
                1,
                MapFlags::READ | MapFlags::WRITE | MapFlags::LOCK,
                None,
                0,
            )
            .expect("Unable to map a write-back staging page");

        let staging_frame = {
            let entry = self
                .get_entry(&self.kernel_vas, VirtPage::containing_addr(staging))
                .unwrap();
            let st = entry.state.lock();
            st.physical.unwrap()
        };

        let mut buffer = [0u8; PAGE_4K];
        self.arch
            .with_frame(frame, &mut |bytes| buffer.copy_from_slice(bytes));
        self.arch
            .with_frame(staging_frame, &mut |bytes| bytes.copy_from_slice(&buffer));

        self.defer(
            IrqLevel::Standard,
            DeferredWork::Boxed(Box::new(move |kernel: &Kernel| {
                let mut tr = Transfer::new_kernel(
                    &kernel.kernel_vas,
                    staging,
                    PAGE_4K,
                    offset,
                    TransferDirection::Write,
                );

                let result = file.node.write(kernel, &mut tr);
                if result.is_err() {
                    if failure_is_fatal {
                        // The page content exists nowhere else; there is no
                        // way to limp on from here.
                        panic!("Disk failure writing the swap file");
                    }
                    loam::errorln!(
                        "Disk failure writing back a file page at offset {}; data lost",
                        offset
                    );
                }

                let _ = kernel.unmap_virt(&kernel.kernel_vas.clone(), staging, 1, false);
            })),
        );
    }
}

/// The deferred half of a demand load: read the backing into a staging
/// page, then allocate the real frame and install it under the entry lock.
fn finish_page_in(
    kernel: &Kernel,
    vas: &Arc<Vas>,
    entry: &Arc<MappingEntry>,
    file: &Arc<FileHandle>,
    offset: u64,
    from_swap: bool,
) {
    kernel.assert_exact_irql(IrqLevel::Standard);

    // Read into a staging page first: the real page must not become visible
    // half filled, and the file read cannot happen with the entry locked.
    let staging = kernel
        .map_virt(
            &kernel.kernel_vas.clone(),
            mem::addr::PhysAddr::new(0),
            VirtAddr::new(0),
            1,
            MapFlags::READ | MapFlags::WRITE | MapFlags::LOCK,
            None,
            0,
        )
        .expect("Unable to map a page-in staging page");

    let mut tr = Transfer::new_kernel(
        &kernel.kernel_vas,
        staging,
        PAGE_4K,
        offset,
        TransferDirection::Read,
    );

    let read_result = file.node.read(kernel, &mut tr);
    if read_result.is_err() {
        let hard_failure = from_swap || entry.state.lock().hard_io_fail;
        if hard_failure {
            // A swap slot is the only copy of the page there is.
            panic!("Disk failure reading a page back in");
        }

        // Reads past the end of the file (or outright failures on ordinary
        // files) leave the unread part zeroed, which the staging page
        // already is.
        loam::warnln!("Disk error during a file page-in; filling with zeroes");
    }

    let staging_frame = {
        let staging_entry = kernel
            .get_entry(&kernel.kernel_vas, VirtPage::containing_addr(staging))
            .unwrap();
        let st = staging_entry.state.lock();
        st.physical.unwrap()
    };

    let frame = kernel
        .alloc_frame()
        .expect("Out of physical memory completing a page-in");

    let needs_relocations;
    let relocation_base;
    {
        let mut st = entry.state.lock();

        st.physical = Some(frame);
        st.allocated = true;
        st.swapfile = false;
        st.locked = true;

        // Fill the frame before the mapping goes live.
        let mut buffer = [0u8; PAGE_4K];
        kernel
            .arch
            .with_frame(staging_frame, &mut |bytes| buffer.copy_from_slice(bytes));
        kernel
            .arch
            .with_frame(frame, &mut |bytes| bytes.copy_from_slice(&buffer));

        st.in_ram = true;

        if from_swap {
            let slot = st.swap_slot.take().expect("Page-in from swap without a slot");
            let swap = kernel.swap.read();
            swap.as_ref().unwrap().dealloc_slot(slot);
        }

        // The first load of a relocatable image is when the loader performs
        // its full relocation pass, so the per-page fixups only run on
        // loads after that.
        needs_relocations = st.relocatable && !st.first_load;
        relocation_base = st.relocation_base;

        if needs_relocations {
            // The fixups have to land in what is usually a read-only image.
            st.allow_temp_write = true;
        } else {
            st.first_load = false;
            st.load_in_progress = false;
            st.locked = false;
        }

        let arch_vas = kernel.arch_vas_of(vas, &st);
        kernel
            .arch
            .update_mapping(arch_vas, &arch_mapping_for(&st, 0));
    }

    kernel.arch.flush_tlb(vas.arch_id());
    let _ = kernel.unmap_virt(&kernel.kernel_vas.clone(), staging, 1, false);

    if needs_relocations {
        // The page stays locked while fixups run; otherwise loading the
        // relocation data could evict the page we are patching.
        let base = entry.state.lock().base.addr();

        let relocator = kernel.relocator.read().clone();
        if let Some(relocator) = relocator {
            relocator.relocate_page(kernel, vas, relocation_base, base);
        } else {
            loam::errorln!("Relocatable page loaded with no relocator registered");
        }

        let mut st = entry.state.lock();
        st.first_load = false;
        st.load_in_progress = false;
        st.locked = false;
        st.allow_temp_write = false;

        let arch_vas = kernel.arch_vas_of(vas, &st);
        kernel
            .arch
            .update_mapping(arch_vas, &arch_mapping_for(&st, 0));
        drop(st);
        kernel.arch.flush_tlb(vas.arch_id());
    }
}
