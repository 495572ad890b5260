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

//! Kernel-initiated access to pageable virtual memory.
//!
//! Copies walk the page tables the way the MMU would, and when a page is
//! missing they raise the same fault the hardware would and retry. This is
//! the path every transfer descriptor resolves through.

extern crate alloc;

use alloc::sync::Arc;

use super::{MapFlags, Vas};
use crate::{Kernel, KernelError};
use mem::addr::VirtAddr;
use mem::page::VirtPage;
use util::consts::PAGE_4K;

/// How many times one access retries its fault before giving up; if a page
/// cannot be made resident in this many attempts something is wrong below
/// us.
const MAX_FAULT_RETRIES: usize = 64;

impl Kernel {
    fn virt_access(
        &self,
        vas: &Arc<Vas>,
        addr: VirtAddr,
        len: usize,
        write: bool,
        user: bool,
        f: &mut dyn FnMut(usize, &mut [u8]),
    ) -> Result<(), KernelError> {
        let mut done = 0;

        while done < len {
            let current = addr.offset(done);
            let vpage = VirtPage::containing_addr(current);
            let page_offset = current.addr() % PAGE_4K;
            let chunk = (PAGE_4K - page_offset).min(len - done);

            let mut retries = 0;
            loop {
                match self.arch.probe(vas.arch_id(), vpage, write, false, user) {
                    Ok(ppage) => {
                        self.arch.with_frame(ppage, &mut |bytes| {
                            f(done, &mut bytes[page_offset..page_offset + chunk])
                        });
                        break;
                    }
                    Err(_probe_fault) => {
                        retries += 1;
                        if retries > MAX_FAULT_RETRIES {
                            return Err(KernelError::AccessDenied);
                        }

                        let mut kind = if write { MapFlags::WRITE } else { MapFlags::READ };
                        if user {
                            kind |= MapFlags::USER;
                        }

                        self.page_fault(vas, current, kind)?;
                    }
                }
            }

            done += chunk;
        }

        Ok(())
    }

    /// Copy `bytes` into virtual memory, faulting pages in as needed.
    pub fn copy_to_virt(
        &self,
        vas: &Arc<Vas>,
        addr: VirtAddr,
        bytes: &[u8],
        user: bool,
    ) -> Result<(), KernelError> {
        self.virt_access(vas, addr, bytes.len(), true, user, &mut |done, chunk| {
            chunk.copy_from_slice(&bytes[done..done + chunk.len()]);
        })
    }

    /// Copy virtual memory out into `buffer`, faulting pages in as needed.
    pub fn copy_from_virt(
        &self,
        vas: &Arc<Vas>,
        addr: VirtAddr,
        buffer: &mut [u8],
        user: bool,
    ) -> Result<(), KernelError> {
        self.virt_access(vas, addr, buffer.len(), false, user, &mut |done, chunk| {
            buffer[done..done + chunk.len()].copy_from_slice(chunk);
        })
    }

    /// Read one byte of virtual memory, the way a load instruction would.
    pub fn read_virt_u8(&self, vas: &Arc<Vas>, addr: VirtAddr) -> Result<u8, KernelError> {
        let mut byte = [0u8; 1];
        self.copy_from_virt(vas, addr, &mut byte, false)?;
        Ok(byte[0])
    }

    /// Write one byte of virtual memory, the way a store instruction would.
    pub fn write_virt_u8(&self, vas: &Arc<Vas>, addr: VirtAddr, value: u8) -> Result<(), KernelError> {
        self.copy_to_virt(vas, addr, &[value], false)
    }

    /// As [`Kernel::read_virt_u8`] but performing a user-mode access, so
    /// supervisor pages fault.
    pub fn user_read_u8(&self, vas: &Arc<Vas>, addr: VirtAddr) -> Result<u8, KernelError> {
        let mut byte = [0u8; 1];
        self.copy_from_virt(vas, addr, &mut byte, true)?;
        Ok(byte[0])
    }

    pub fn user_write_u8(&self, vas: &Arc<Vas>, addr: VirtAddr, value: u8) -> Result<(), KernelError> {
        self.copy_to_virt(vas, addr, &[value], true)
    }
}
