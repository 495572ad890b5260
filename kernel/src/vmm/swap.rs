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

//! The swap file.
//!
//! One file whose size in page-sized blocks bounds how many anonymous pages
//! can be out of memory at once. Slots are identified by index; the
//! allocator is a plain bitmap. Contents are ephemeral; nothing survives a
//! reboot.

extern crate alloc;

use alloc::sync::Arc;

use crate::vnode::FileHandle;
use crate::{Kernel, KernelError};
use boolmap::BoolMap;
use util::consts::PAGE_4K;

pub struct SwapFile {
    file: Arc<FileHandle>,
    slots: spin::Mutex<BoolMap>,
    num_slots: usize,
}

impl SwapFile {
    pub fn new(file: Arc<FileHandle>) -> Result<Self, KernelError> {
        if !file.can_read || !file.can_write {
            return Err(KernelError::AccessDenied);
        }

        let stat = file.node.stat();
        let num_slots = (stat.size as usize) / PAGE_4K;

        if num_slots == 0 {
            return Err(KernelError::InvalidArgument);
        }

        Ok(Self {
            file,
            slots: spin::Mutex::new(BoolMap::new()),
            num_slots,
        })
    }

    pub fn file(&self) -> Arc<FileHandle> {
        self.file.clone()
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub fn slots_used(&self) -> usize {
        self.slots.lock().count_of(true)
    }

    /// Claim a free slot, or `None` when the swap file is full.
    pub fn alloc_slot(&self) -> Option<usize> {
        let mut slots = self.slots.lock();

        let slot = slots.find_first_of(false)?;
        if slot >= self.num_slots {
            return None;
        }

        slots.set(slot, true);
        Some(slot)
    }

    /// Return a slot for reuse. Freeing a slot that isn't allocated is a
    /// programmer error.
    pub fn dealloc_slot(&self, slot: usize) {
        let mut slots = self.slots.lock();

        if !slots.get(slot) {
            panic!("Double free of swap slot {}", slot);
        }

        slots.set(slot, false);
    }
}

impl Kernel {
    /// Attach the swap file. Until one is attached, anonymous pages cannot
    /// leave memory and eviction is inert.
    pub fn set_swap_file(&self, file: Arc<FileHandle>) -> Result<(), KernelError> {
        let swap = SwapFile::new(file)?;
        *self.swap.write() = Some(swap);
        Ok(())
    }

    pub fn swap_slots_used(&self) -> usize {
        self.swap
            .read()
            .as_ref()
            .map(|swap| swap.slots_used())
            .unwrap_or(0)
    }
}
