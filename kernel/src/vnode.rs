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

//! The vnode collaborator surface and transfer descriptors.
//!
//! The filesystem proper lives outside the core; the VMM and swap consume
//! exactly three operations from it: read, write, and stat. All data moves
//! through [`Transfer`] descriptors, which carry the untrusted side of a
//! copy and know how to validate user ranges and advance (or rewind) the
//! cursor.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::vmm::layout::{USER_AREA_BASE, USER_AREA_LIMIT};
use crate::vmm::{MapFlags, Vas};
use crate::{Kernel, KernelError};
use mem::addr::VirtAddr;
use util::consts::PAGE_4K;

/// Direction of a transfer, from the kernel's point of view: `Read` means
/// kernel data flows out into the transfer's memory, `Write` means the
/// transfer's memory flows into the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Read,
    Write,
}

pub struct Transfer {
    pub vas: Arc<Vas>,
    pub address: VirtAddr,
    pub direction: TransferDirection,
    pub length_remaining: usize,
    pub offset: u64,
    pub is_user: bool,
    pub blockable: bool,
}

impl Transfer {
    /// A transfer wholly within kernel memory; no user validation happens.
    pub fn new_kernel(
        vas: &Arc<Vas>,
        address: VirtAddr,
        length: usize,
        offset: u64,
        direction: TransferDirection,
    ) -> Self {
        Self {
            vas: vas.clone(),
            address,
            direction,
            length_remaining: length,
            offset,
            is_user: false,
            blockable: true,
        }
    }

    /// A transfer writing kernel data out to user memory (the user is doing
    /// an untrusted read of kernel data).
    pub fn new_writing_to_user(vas: &Arc<Vas>, address: VirtAddr, length: usize, offset: u64) -> Self {
        Self {
            vas: vas.clone(),
            address,
            direction: TransferDirection::Read,
            length_remaining: length,
            offset,
            is_user: true,
            blockable: true,
        }
    }

    /// A transfer reading untrusted user memory into the kernel.
    pub fn new_reading_from_user(vas: &Arc<Vas>, address: VirtAddr, length: usize, offset: u64) -> Self {
        Self {
            vas: vas.clone(),
            address,
            direction: TransferDirection::Write,
            length_remaining: length,
            offset,
            is_user: true,
            blockable: true,
        }
    }
}

fn validate_user_copy(
    kernel: &Kernel,
    tr: &Transfer,
    size: usize,
    storing_to_user: bool,
) -> Result<(), KernelError> {
    let initial = tr.address.addr();
    let Some(final_address) = initial.checked_add(size) else {
        return Err(KernelError::InvalidArgument);
    };

    if initial < USER_AREA_BASE || initial >= USER_AREA_LIMIT {
        return Err(KernelError::InvalidArgument);
    }
    if final_address < USER_AREA_BASE || final_address >= USER_AREA_LIMIT {
        return Err(KernelError::InvalidArgument);
    }

    let initial_page = initial / PAGE_4K;
    let final_page = (initial + size - 1) / PAGE_4K;
    for i in 0..=(final_page - initial_page) {
        let permissions =
            kernel.get_virt_permissions(&tr.vas, VirtAddr::new((initial_page + i) * PAGE_4K));

        if !permissions.contains(MapFlags::READ) || !permissions.contains(MapFlags::USER) {
            return Err(KernelError::InvalidArgument);
        }
        if storing_to_user && !permissions.contains(MapFlags::WRITE) {
            return Err(KernelError::InvalidArgument);
        }
        if storing_to_user && permissions.contains(MapFlags::EXEC) {
            return Err(KernelError::InvalidArgument);
        }
    }

    Ok(())
}

/// Move up to `len` bytes between the trusted buffer and the transfer's
/// memory, advancing the cursor. The trusted buffer is never trashed, which
/// is what makes [`revert_transfer`] possible.
pub fn perform_transfer(
    kernel: &Kernel,
    trusted: &mut [u8],
    tr: &mut Transfer,
    len: usize,
) -> Result<(), KernelError> {
    let amount = len.min(tr.length_remaining).min(trusted.len());
    if amount == 0 {
        return Ok(());
    }

    if tr.is_user {
        validate_user_copy(kernel, tr, amount, tr.direction == TransferDirection::Read)?;
    }

    match tr.direction {
        TransferDirection::Read => {
            kernel.copy_to_virt(&tr.vas, tr.address, &trusted[..amount], tr.is_user)?;
        }
        TransferDirection::Write => {
            kernel.copy_from_virt(&tr.vas, tr.address, &mut trusted[..amount], tr.is_user)?;
        }
    }

    tr.length_remaining -= amount;
    tr.offset += amount as u64;
    tr.address = tr.address.offset(amount);

    Ok(())
}

/// Rewind a transfer cursor by `amount` bytes, exactly undoing that much of
/// a [`perform_transfer`]. Useful when a larger operation fails and has to
/// be retried.
pub fn revert_transfer(tr: &mut Transfer, amount: usize) {
    tr.length_remaining += amount;
    tr.offset -= amount as u64;
    tr.address = VirtAddr::new(tr.address.addr() - amount);
}

#[derive(Debug, Clone, Copy)]
pub struct VnodeStat {
    pub size: u64,
    pub block_size: usize,
}

/// The three operations the core consumes from the filesystem layer.
pub trait Vnode: Send + Sync {
    /// Fill the transfer's memory from the file, starting at the transfer's
    /// offset. Returns how many bytes were moved; short reads past the end
    /// of the file are not an error.
    fn read(&self, kernel: &Kernel, tr: &mut Transfer) -> Result<usize, KernelError>;

    /// Write the transfer's memory into the file at the transfer's offset.
    fn write(&self, kernel: &Kernel, tr: &mut Transfer) -> Result<usize, KernelError>;

    fn stat(&self) -> VnodeStat;
}

/// An open file: a vnode plus the access rights it was opened with.
pub struct FileHandle {
    pub node: Arc<dyn Vnode>,
    pub can_read: bool,
    pub can_write: bool,
}

impl FileHandle {
    pub fn new(node: Arc<dyn Vnode>, can_read: bool, can_write: bool) -> Arc<Self> {
        Arc::new(Self {
            node,
            can_read,
            can_write,
        })
    }
}

impl core::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileHandle")
            .field("can_read", &self.can_read)
            .field("can_write", &self.can_write)
            .finish()
    }
}

/// A RAM-backed vnode. The hosted machine's disk: backs the swap file and
/// file mappings in the test suites, and can be told to fail I/O to exercise
/// error paths.
pub struct MemoryFile {
    data: spin::Mutex<Vec<u8>>,
    fixed_size: bool,
    fail_io: AtomicBool,
}

impl MemoryFile {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: spin::Mutex::new(data),
            fixed_size: false,
            fail_io: AtomicBool::new(false),
        })
    }

    /// A preallocated, fixed-size file: the shape a swap partition has.
    pub fn new_fixed(blocks: usize) -> Arc<Self> {
        let mut data = Vec::new();
        data.resize(blocks * PAGE_4K, 0);

        Arc::new(Self {
            data: spin::Mutex::new(data),
            fixed_size: true,
            fail_io: AtomicBool::new(false),
        })
    }

    /// Make every subsequent read and write fail, as a dying disk would.
    pub fn set_fail_io(&self, fail: bool) {
        self.fail_io.store(fail, Ordering::Relaxed);
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl Vnode for MemoryFile {
    fn read(&self, kernel: &Kernel, tr: &mut Transfer) -> Result<usize, KernelError> {
        if self.fail_io.load(Ordering::Relaxed) {
            return Err(KernelError::Io);
        }

        let mut data = self.data.lock();
        let start = (tr.offset as usize).min(data.len());
        let amount = tr.length_remaining.min(data.len() - start);

        if amount > 0 {
            perform_transfer(kernel, &mut data[start..start + amount], tr, amount)?;
        }

        Ok(amount)
    }

    fn write(&self, kernel: &Kernel, tr: &mut Transfer) -> Result<usize, KernelError> {
        if self.fail_io.load(Ordering::Relaxed) {
            return Err(KernelError::Io);
        }

        let mut data = self.data.lock();
        let start = tr.offset as usize;
        let amount = tr.length_remaining;

        if start + amount > data.len() {
            if self.fixed_size {
                return Err(KernelError::Io);
            }
            data.resize(start + amount, 0);
        }

        perform_transfer(kernel, &mut data[start..start + amount], tr, amount)?;

        Ok(amount)
    }

    fn stat(&self) -> VnodeStat {
        VnodeStat {
            size: self.data.lock().len() as u64,
            block_size: PAGE_4K,
        }
    }
}
