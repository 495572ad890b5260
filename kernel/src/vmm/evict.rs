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

//! Page eviction.
//!
//! When physical memory runs low the allocator schedules this: walk the
//! current address space and the global tree, rank every resident unlocked
//! page, and push the worst one out. Dirty file pages are written back
//! first; anonymous pages move to a swap slot. A short history of recent
//! victims stops a page that just faulted back in from being chosen again
//! immediately.

extern crate alloc;

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use super::MappingEntry;
use crate::Kernel;
use crate::arch::ArchVasId;
use crate::irql::IrqLevel;
use util::consts::PAGE_4K;

/// Don't let any of the last evictions repeat straight away: one
/// instruction can need half a dozen pages at once, and re-evicting a page
/// the fault handler just brought back gets the machine nowhere.
pub(crate) const VICTIM_HISTORY_LIMIT: usize = 64;

pub(crate) struct VictimHistory {
    recent: heapless::Vec<Weak<MappingEntry>, VICTIM_HISTORY_LIMIT>,
    next: usize,
}

impl VictimHistory {
    pub(crate) const fn new() -> Self {
        Self {
            recent: heapless::Vec::new(),
            next: 0,
        }
    }

    fn contains(&self, entry: &Arc<MappingEntry>) -> bool {
        self.recent
            .iter()
            .any(|weak| weak.upgrade().is_some_and(|held| Arc::ptr_eq(&held, entry)))
    }

    fn push(&mut self, entry: &Arc<MappingEntry>) {
        let weak = Arc::downgrade(entry);

        if self.recent.len() < VICTIM_HISTORY_LIMIT {
            let _ = self.recent.push(weak);
        } else {
            self.recent[self.next % VICTIM_HISTORY_LIMIT] = weak;
        }
        self.next = self.next.wrapping_add(1);
    }
}

/// Deferred whenever a frame allocation notices memory is low. Runs at
/// Standard IRQL so the disk I/O eviction needs is legal, and loops so that
/// evictions which themselves consumed memory are made up for.
pub(crate) fn evict_pages_if_needed(kernel: &Kernel, _context: usize) {
    kernel.assert_exact_irql(IrqLevel::Standard);

    // Eviction allocates staging pages of its own; if those allocations land
    // back here the reserve is what keeps them fed, not more eviction.
    if kernel.in_eviction.swap(true, Ordering::Relaxed) {
        return;
    }

    let mut attempts = 0;
    while kernel.frames_low() && attempts < 10 {
        loam::logln!("Evicting ({} frames left)", kernel.frames_free());
        kernel.evict_virt();
        attempts += 1;
    }

    kernel.in_eviction.store(false, Ordering::Relaxed);

    if kernel.frames_free() == 0 {
        panic!("Out of physical memory");
    }
}

/// Lower rank means evict sooner.
fn eviction_rank(kernel: &Kernel, arch_vas: ArchVasId, entry: &Arc<MappingEntry>) -> i32 {
    let st = entry.state.lock();
    let (accessed, dirty) = kernel.arch.page_usage_bits(arch_vas, st.base);

    let penalty = if st.global { 3 } else { 0 } + st.times_swapped as i32 * 8;

    if st.evict_first {
        st.times_swapped as i32
    } else if st.relocatable {
        150
    } else if st.cow {
        90 + penalty
    } else if st.file_node.is_some() && !st.write {
        (if accessed { 30 } else { 10 }) + penalty
    } else if st.file_node.is_some() && st.write {
        (if dirty {
            70
        } else if accessed {
            40
        } else {
            20
        }) + penalty
    } else if !dirty {
        (if accessed { 60 } else { 50 }) + penalty
    } else {
        80 + penalty
    }
}

impl Kernel {
    /// Find and evict one page of virtual memory to free physical memory.
    /// Walks the current address space and the global mappings; does
    /// nothing when no swap file is attached (anonymous memory would have
    /// nowhere to go).
    pub fn evict_virt(&self) {
        self.assert_max_irql(IrqLevel::PageFault);

        if self.swap.read().is_none() {
            return;
        }

        let vas = match self.current_thread() {
            Some(thr) => thr.vas.clone(),
            None => self.kernel_vas.clone(),
        };

        let mut candidates: Vec<(Arc<MappingEntry>, ArchVasId)> = Vec::new();
        for entry in vas.tree.collect(self) {
            candidates.push((entry, vas.arch_id()));
        }
        for entry in self.global_mappings.collect(self) {
            candidates.push((entry, crate::arch::KERNEL_ARCH_VAS));
        }

        let mut lowest_rank = i32::MAX;
        let mut lowest: Option<(Arc<MappingEntry>, ArchVasId)> = None;
        let mut scanned = 0;

        for (entry, arch_vas) in candidates {
            // A best-possible page has already been found; stop looking.
            if lowest_rank < 10 {
                break;
            }

            scanned += 1;

            // After enough scanning, settle for anything reasonable.
            if scanned > 500 && lowest_rank < ((scanned - 500) / 75) + 10 {
                break;
            }

            {
                let st = entry.state.lock();
                if st.locked || st.cow || !st.in_ram || !st.allocated || st.load_in_progress {
                    continue;
                }

                // A shared resident page is mapped in address spaces this
                // walk cannot see; leave it alone.
                if st.ref_count != 1 {
                    continue;
                }
            }

            if self.victim_history.lock().contains(&entry) {
                continue;
            }

            let rank = eviction_rank(self, arch_vas, &entry);

            // Mix up who gets evicted on ties so repeated passes cycle
            // through the equally-ranked pages.
            let accept_tie = rank == lowest_rank && (self.next_random() & 3) == 0;

            if rank < lowest_rank || accept_tie {
                lowest_rank = rank;
                lowest = Some((entry, arch_vas));
            }
        }

        if let Some((victim, arch_vas)) = lowest {
            self.victim_history.lock().push(&victim);
            self.evict_page(&victim, arch_vas);
            let mut st = victim.state.lock();
            st.times_swapped = st.times_swapped.saturating_add(1);
        }
    }

    /// Push one resident page out of memory, freeing its frame. Dirty
    /// writable file pages are written back; anonymous pages go to a swap
    /// slot (swap write failure is fatal, there is no other copy).
    pub(crate) fn evict_page(&self, entry: &Arc<MappingEntry>, arch_vas: ArchVasId) {
        self.assert_exact_irql(IrqLevel::Standard);

        let (frame, base, pages, is_file) = {
            let st = entry.state.lock();

            assert!(!st.locked);
            assert!(!st.cow);
            assert!(st.in_ram);

            (
                st.physical.unwrap(),
                st.base,
                st.pages,
                st.file_node.is_some(),
            )
        };

        if is_file {
            let (write_back, file, offset) = {
                let st = entry.state.lock();
                let (_, dirty) = self.arch.page_usage_bits(arch_vas, st.base);
                (
                    st.write && !st.relocatable && dirty,
                    st.file_node.clone().unwrap(),
                    st.file_offset,
                )
            };

            if write_back {
                self.stage_page_write(frame, file, offset, false);
            }

            let mut st = entry.state.lock();
            st.in_ram = false;
            st.allocated = false;
            st.physical = None;
            drop(st);
        } else {
            let slot = {
                let swap = self.swap.read();
                swap.as_ref().and_then(|swap| swap.alloc_slot())
            };

            // With every swap slot taken this page cannot leave memory.
            let Some(slot) = slot else {
                return;
            };

            let (swap_file, fatal) = {
                let swap = self.swap.read();
                (swap.as_ref().unwrap().file(), true)
            };

            self.stage_page_write(frame, swap_file, (slot * PAGE_4K) as u64, fatal);

            let mut st = entry.state.lock();
            st.swapfile = true;
            st.swap_slot = Some(slot);
            st.in_ram = false;
            st.allocated = false;
            st.physical = None;
            drop(st);
        }

        self.arch.unmap(arch_vas, base, pages);
        self.arch.clear_page_usage_bits(arch_vas, base);
        self.free_frame(frame);
        self.arch.flush_tlb(arch_vas);
    }
}
