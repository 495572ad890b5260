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

//! A software MMU implementation of the arch shim.
//!
//! Page tables are maps, frames are byte buffers, and "the CPU" is whoever
//! calls [`Arch::probe`]. This is the port the hosted test suites run on; it
//! emulates exactly the contract a real port provides, including accessed
//! and dirty bit tracking.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use super::{Arch, ArchMapping, ArchVasId, KERNEL_ARCH_VAS, ProbeFault};
use mem::addr::VirtAddr;
use mem::page::{PhysPage, VirtPage};
use util::consts::PAGE_4K;

#[derive(Debug, Clone, Copy)]
struct SoftPte {
    ppage: Option<PhysPage>,
    present: bool,
    writable: bool,
    user: bool,
    exec: bool,
    accessed: bool,
    dirty: bool,
}

pub struct SoftArch {
    tables: spin::Mutex<BTreeMap<ArchVasId, BTreeMap<usize, SoftPte>>>,
    frames: Vec<spin::Mutex<Box<[u8; PAGE_4K]>>>,
    next_vas: AtomicUsize,
    active_vas: AtomicUsize,
    irql: AtomicU8,
    interrupts_enabled: AtomicBool,
    switches: spin::Mutex<Vec<(usize, usize)>>,
}

impl SoftArch {
    /// Build a machine with `frames` pages of RAM.
    pub fn new(frames: usize) -> Self {
        let mut tables = BTreeMap::new();
        tables.insert(KERNEL_ARCH_VAS, BTreeMap::new());

        Self {
            tables: spin::Mutex::new(tables),
            frames: (0..frames)
                .map(|_| spin::Mutex::new(Box::new([0u8; PAGE_4K])))
                .collect(),
            next_vas: AtomicUsize::new(1),
            active_vas: AtomicUsize::new(KERNEL_ARCH_VAS),
            irql: AtomicU8::new(0),
            interrupts_enabled: AtomicBool::new(true),
            switches: spin::Mutex::new(Vec::new()),
        }
    }

    pub fn total_frames(&self) -> usize {
        self.frames.len()
    }

    /// The context switches recorded so far, oldest first.
    pub fn recorded_switches(&self) -> Vec<(usize, usize)> {
        self.switches.lock().clone()
    }

    fn pte_of(mapping: &ArchMapping) -> SoftPte {
        SoftPte {
            ppage: mapping.ppage,
            present: mapping.present,
            writable: mapping.writable,
            user: mapping.user,
            exec: mapping.exec,
            accessed: false,
            dirty: false,
        }
    }
}

impl Arch for SoftArch {
    fn create_vas(&self) -> ArchVasId {
        let id = self.next_vas.fetch_add(1, Ordering::Relaxed);
        self.tables.lock().insert(id, BTreeMap::new());
        id
    }

    fn destroy_vas(&self, vas: ArchVasId) {
        assert_ne!(vas, KERNEL_ARCH_VAS, "Destroying the kernel page tables");
        self.tables.lock().remove(&vas);
    }

    fn add_mapping(&self, vas: ArchVasId, mapping: &ArchMapping) {
        let mut tables = self.tables.lock();
        let table = tables.get_mut(&vas).expect("No such address space");
        table.insert(mapping.vpage.page(), Self::pte_of(mapping));
    }

    fn update_mapping(&self, vas: ArchVasId, mapping: &ArchMapping) {
        let mut tables = self.tables.lock();
        let table = tables.get_mut(&vas).expect("No such address space");

        let page = mapping.vpage.page();
        let usage = table
            .get(&page)
            .map(|pte| (pte.accessed, pte.dirty))
            .unwrap_or((false, false));

        let mut pte = Self::pte_of(mapping);
        pte.accessed = usage.0;
        pte.dirty = usage.1;
        table.insert(page, pte);
    }

    fn unmap(&self, vas: ArchVasId, vpage: VirtPage, pages: usize) {
        let mut tables = self.tables.lock();
        let table = tables.get_mut(&vas).expect("No such address space");

        for i in 0..pages {
            table.remove(&(vpage.page() + i));
        }
    }

    fn flush_tlb(&self, _vas: ArchVasId) {
        // There is no TLB to shoot down; the tables are the truth.
    }

    fn page_usage_bits(&self, vas: ArchVasId, vpage: VirtPage) -> (bool, bool) {
        let tables = self.tables.lock();

        let pte = tables
            .get(&vas)
            .and_then(|table| table.get(&vpage.page()))
            .or_else(|| {
                tables
                    .get(&KERNEL_ARCH_VAS)
                    .and_then(|table| table.get(&vpage.page()))
            });

        pte.map(|pte| (pte.accessed, pte.dirty)).unwrap_or((false, false))
    }

    fn clear_page_usage_bits(&self, vas: ArchVasId, vpage: VirtPage) {
        let mut tables = self.tables.lock();

        for id in [vas, KERNEL_ARCH_VAS] {
            if let Some(pte) = tables
                .get_mut(&id)
                .and_then(|table| table.get_mut(&vpage.page()))
            {
                pte.accessed = false;
                pte.dirty = false;
            }
        }
    }

    fn set_vas(&self, vas: ArchVasId) {
        self.active_vas.store(vas, Ordering::Relaxed);
    }

    fn probe(
        &self,
        vas: ArchVasId,
        vpage: VirtPage,
        write: bool,
        exec: bool,
        user: bool,
    ) -> Result<PhysPage, ProbeFault> {
        let mut tables = self.tables.lock();

        // Walk the local table first, then the kernel's global one, the same
        // way the hardware sees kernel mappings in every address space.
        let mut found = None;
        for id in [vas, KERNEL_ARCH_VAS] {
            if tables
                .get(&id)
                .is_some_and(|table| table.contains_key(&vpage.page()))
            {
                found = Some(id);
                break;
            }
        }

        let Some(id) = found else {
            return Err(ProbeFault::NotPresent);
        };

        let pte = tables
            .get_mut(&id)
            .and_then(|table| table.get_mut(&vpage.page()))
            .unwrap();

        if !pte.present {
            return Err(ProbeFault::NotPresent);
        }
        if write && !pte.writable {
            return Err(ProbeFault::Protection);
        }
        if user && !pte.user {
            return Err(ProbeFault::Protection);
        }
        if exec && !pte.exec {
            return Err(ProbeFault::Protection);
        }

        let Some(ppage) = pte.ppage else {
            return Err(ProbeFault::NotPresent);
        };

        pte.accessed = true;
        if write {
            pte.dirty = true;
        }

        Ok(ppage)
    }

    fn with_frame(&self, page: PhysPage, f: &mut dyn FnMut(&mut [u8])) {
        let mut frame = self.frames[page.page()].lock();
        f(&mut frame[..]);
    }

    fn frame_ptr(&self, page: PhysPage) -> *mut u8 {
        self.frames[page.page()].lock().as_mut_ptr()
    }

    fn switch_thread(&self, from: usize, to: usize) {
        // Register state is a fiction here; remember the hand-off so tests
        // can assert on scheduling decisions.
        self.switches.lock().push((from, to));
    }

    fn prepare_stack(&self, stack_top: VirtAddr) -> VirtAddr {
        // A real port pushes the bootstrap frame; the software machine only
        // needs somewhere plausible for the stack pointer to sit.
        VirtAddr::new(stack_top.addr() - 5 * size_of::<usize>())
    }

    fn switch_to_user(&self, entry: VirtAddr, stack: VirtAddr, _arg: usize) -> ! {
        panic!(
            "The software machine has no user mode (entry {}, stack {})",
            entry, stack
        );
    }

    fn disable_interrupts(&self) {
        self.interrupts_enabled.store(false, Ordering::Relaxed);
    }

    fn enable_interrupts(&self) {
        self.interrupts_enabled.store(true, Ordering::Relaxed);
    }

    fn set_irql(&self, level: u8) {
        self.irql.store(level, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_probe_respects_permissions() {
        let arch = SoftArch::new(4);
        let vas = arch.create_vas();

        arch.add_mapping(
            vas,
            &ArchMapping {
                vpage: VirtPage::new(16),
                ppage: Some(PhysPage::new(1)),
                present: true,
                writable: false,
                user: true,
                exec: false,
            },
        );

        assert!(arch.probe(vas, VirtPage::new(16), false, false, true).is_ok());
        assert_eq!(
            arch.probe(vas, VirtPage::new(16), true, false, true),
            Err(ProbeFault::Protection)
        );
        assert_eq!(
            arch.probe(vas, VirtPage::new(17), false, false, true),
            Err(ProbeFault::NotPresent)
        );
    }

    #[test]
    fn test_usage_bits_follow_probes() {
        let arch = SoftArch::new(4);
        let vas = arch.create_vas();
        let vpage = VirtPage::new(8);

        arch.add_mapping(
            vas,
            &ArchMapping {
                vpage,
                ppage: Some(PhysPage::new(2)),
                present: true,
                writable: true,
                user: false,
                exec: false,
            },
        );

        assert_eq!(arch.page_usage_bits(vas, vpage), (false, false));

        arch.probe(vas, vpage, false, false, false).unwrap();
        assert_eq!(arch.page_usage_bits(vas, vpage), (true, false));

        arch.probe(vas, vpage, true, false, false).unwrap();
        assert_eq!(arch.page_usage_bits(vas, vpage), (true, true));

        arch.clear_page_usage_bits(vas, vpage);
        assert_eq!(arch.page_usage_bits(vas, vpage), (false, false));
    }

    #[test]
    fn test_global_mappings_visible_everywhere() {
        let arch = SoftArch::new(4);
        let vas = arch.create_vas();

        arch.add_mapping(
            KERNEL_ARCH_VAS,
            &ArchMapping {
                vpage: VirtPage::new(100),
                ppage: Some(PhysPage::new(3)),
                present: true,
                writable: true,
                user: false,
                exec: false,
            },
        );

        assert!(arch.probe(vas, VirtPage::new(100), true, false, false).is_ok());
    }

    #[test]
    fn test_frame_contents() {
        let arch = SoftArch::new(2);

        arch.with_frame(PhysPage::new(1), &mut |bytes| {
            bytes[0] = 0x55;
            bytes[4095] = 0xAA;
        });

        arch.with_frame(PhysPage::new(1), &mut |bytes| {
            assert_eq!(bytes[0], 0x55);
            assert_eq!(bytes[4095], 0xAA);
        });
    }
}
