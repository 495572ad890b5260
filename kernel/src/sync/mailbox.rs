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

//! Blocking byte mailboxes.
//!
//! Fixed-size byte queues that block on add when full and on get when
//! empty. Two outer mutexes serialize whole multi-byte transfers so bulk
//! writes and reads never interleave; the inner mutex only guards the ring
//! indices. Useful for implementing pipes and ptys.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use super::semaphore::{DestroyMode, Semaphore};
use crate::vnode::{Transfer, TransferDirection, perform_transfer, revert_transfer};
use crate::{Kernel, KernelError};

struct MailboxRing {
    data: Vec<u8>,
    start: usize,
    end: usize,
    used: usize,
}

pub struct Mailbox {
    capacity: usize,
    ring: spin::Mutex<MailboxRing>,
    /// Counts bytes sitting in the ring; get blocks on it.
    full_sem: Arc<Semaphore>,
    /// Counts free space in the ring; add blocks on it.
    empty_sem: Arc<Semaphore>,
    add_mtx: Arc<Semaphore>,
    get_mtx: Arc<Semaphore>,
    inner_mtx: Arc<Semaphore>,
}

impl Mailbox {
    pub fn new(capacity: usize) -> Arc<Self> {
        assert!(capacity > 0, "Mailbox of zero capacity");

        Arc::new(Self {
            capacity,
            ring: spin::Mutex::new(MailboxRing {
                data: vec![0; capacity],
                start: 0,
                end: 0,
                used: 0,
            }),
            full_sem: Semaphore::new("mbfull", capacity, 0),
            empty_sem: Semaphore::new("mbempty", capacity, capacity),
            add_mtx: Semaphore::mutex("mbadd"),
            get_mtx: Semaphore::mutex("mbget"),
            inner_mtx: Semaphore::mutex("mbinner"),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.ring.lock().used
    }

    pub fn destroy(self: &Arc<Self>, kernel: &Kernel) {
        self.full_sem.destroy(kernel, DestroyMode::DontCare);
        self.empty_sem.destroy(kernel, DestroyMode::DontCare);
        self.add_mtx.destroy(kernel, DestroyMode::DontCare);
        self.get_mtx.destroy(kernel, DestroyMode::DontCare);
        self.inner_mtx.destroy(kernel, DestroyMode::DontCare);
    }

    fn push_byte(&self, byte: u8) {
        let mut ring = self.ring.lock();
        let end = ring.end;
        ring.data[end] = byte;
        ring.end = (ring.end + 1) % self.capacity;
        ring.used += 1;
    }

    fn pop_byte(&self) -> u8 {
        let mut ring = self.ring.lock();
        let byte = ring.data[ring.start];
        ring.start = (ring.start + 1) % self.capacity;
        ring.used -= 1;
        byte
    }

    /// Hold the add mutex and a unit of space. On failure, nothing is held.
    fn wait_addable_internal(self: &Arc<Self>, kernel: &Kernel, timeout: i64) -> Result<(), KernelError> {
        self.add_mtx.acquire(kernel, timeout)?;

        if let Err(err) = self.empty_sem.acquire(kernel, timeout) {
            self.add_mtx.release(kernel);
            return Err(err);
        }

        Ok(())
    }

    /// Wait until at least one byte can be added, without adding anything.
    pub fn wait_addable(self: &Arc<Self>, kernel: &Kernel, timeout: i64) -> Result<(), KernelError> {
        self.wait_addable_internal(kernel, timeout)?;
        self.empty_sem.release(kernel);
        self.add_mtx.release(kernel);
        Ok(())
    }

    fn wait_gettable_internal(self: &Arc<Self>, kernel: &Kernel, timeout: i64) -> Result<(), KernelError> {
        self.get_mtx.acquire(kernel, timeout)?;

        if let Err(err) = self.full_sem.acquire(kernel, timeout) {
            self.get_mtx.release(kernel);
            return Err(err);
        }

        Ok(())
    }

    /// Wait until at least one byte can be read, without reading anything.
    pub fn wait_gettable(self: &Arc<Self>, kernel: &Kernel, timeout: i64) -> Result<(), KernelError> {
        self.wait_gettable_internal(kernel, timeout)?;
        self.full_sem.release(kernel);
        self.get_mtx.release(kernel);
        Ok(())
    }

    /// Add one byte, blocking up to `timeout` while the mailbox is full.
    pub fn add(self: &Arc<Self>, kernel: &Kernel, timeout: i64, byte: u8) -> Result<(), KernelError> {
        self.wait_addable_internal(kernel, timeout)?;

        self.inner_mtx.acquire(kernel, -1)?;
        self.push_byte(byte);
        self.inner_mtx.release(kernel);
        self.add_mtx.release(kernel);
        self.full_sem.release(kernel);

        Ok(())
    }

    /// Add as many of `bytes` as currently fit (at least one; blocks for the
    /// first according to `timeout`). Returns how many were added.
    pub fn add_many(
        self: &Arc<Self>,
        kernel: &Kernel,
        timeout: i64,
        bytes: &[u8],
    ) -> Result<usize, KernelError> {
        if bytes.is_empty() {
            return Err(KernelError::InvalidArgument);
        }

        self.wait_addable_internal(kernel, timeout)?;

        let mut acquisitions = 1;
        while acquisitions < bytes.len() && self.empty_sem.acquire(kernel, 0).is_ok() {
            acquisitions += 1;
        }

        self.inner_mtx.acquire(kernel, -1)?;
        for &byte in &bytes[..acquisitions] {
            self.push_byte(byte);
        }
        self.inner_mtx.release(kernel);
        self.add_mtx.release(kernel);
        self.full_sem.release_many(kernel, acquisitions);

        Ok(acquisitions)
    }

    /// Read one byte, blocking up to `timeout` while the mailbox is empty.
    pub fn get(self: &Arc<Self>, kernel: &Kernel, timeout: i64) -> Result<u8, KernelError> {
        self.wait_gettable_internal(kernel, timeout)?;

        self.inner_mtx.acquire(kernel, -1)?;
        let byte = self.pop_byte();
        self.inner_mtx.release(kernel);
        self.get_mtx.release(kernel);
        self.empty_sem.release(kernel);

        Ok(byte)
    }

    /// Read as many bytes as are currently available into `out` (at least
    /// one; blocks for the first according to `timeout`). Returns how many
    /// were read.
    pub fn get_many(
        self: &Arc<Self>,
        kernel: &Kernel,
        timeout: i64,
        out: &mut [u8],
    ) -> Result<usize, KernelError> {
        if out.is_empty() {
            return Err(KernelError::InvalidArgument);
        }

        self.wait_gettable_internal(kernel, timeout)?;

        let mut acquisitions = 1;
        while acquisitions < out.len() && self.full_sem.acquire(kernel, 0).is_ok() {
            acquisitions += 1;
        }

        self.inner_mtx.acquire(kernel, -1)?;
        for slot in out[..acquisitions].iter_mut() {
            *slot = self.pop_byte();
        }
        self.inner_mtx.release(kernel);
        self.get_mtx.release(kernel);
        self.empty_sem.release_many(kernel, acquisitions);

        Ok(acquisitions)
    }

    /// Move bytes between a transfer descriptor and the mailbox: the adapter
    /// file read/write paths use. Blocks only for the first chunk (and only
    /// when the transfer allows blocking); a partial move after any progress
    /// still counts as success.
    pub fn access(self: &Arc<Self>, kernel: &Kernel, tr: &mut Transfer) -> Result<(), KernelError> {
        const CHUNK_SIZE: usize = 256;

        let write = tr.direction == TransferDirection::Write;
        if tr.length_remaining == 0 {
            return if write {
                self.wait_addable(kernel, 0)
            } else {
                self.wait_gettable(kernel, 0)
            };
        }

        let mut done_any = false;
        while tr.length_remaining > 0 {
            let can_block = tr.blockable && !done_any;
            let timeout = if can_block { -1 } else { 0 };
            let mut chunk = [0u8; CHUNK_SIZE];
            let len = tr.length_remaining.min(CHUNK_SIZE);

            if write {
                let old_remaining = tr.length_remaining;
                perform_transfer(kernel, &mut chunk[..len], tr, len)?;
                let transferred = old_remaining - tr.length_remaining;

                match self.add_many(kernel, timeout, &chunk[..transferred]) {
                    Ok(added) => {
                        if added < transferred {
                            revert_transfer(tr, transferred - added);
                        }
                    }
                    Err(err) => {
                        revert_transfer(tr, transferred);
                        return if done_any { Ok(()) } else { Err(err) };
                    }
                }
            } else {
                match self.get_many(kernel, timeout, &mut chunk[..len]) {
                    Ok(added) => {
                        perform_transfer(kernel, &mut chunk[..added], tr, added)?;
                    }
                    Err(err) => {
                        return if done_any { Ok(()) } else { Err(err) };
                    }
                }
            }

            done_any = true;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_kernel;

    extern crate std;

    #[test]
    fn test_add_then_get() {
        let kernel = test_kernel(64);
        let mbox = Mailbox::new(16);

        mbox.add(&kernel, 0, 0x41).unwrap();
        mbox.add(&kernel, 0, 0x42).unwrap();
        assert_eq!(mbox.used(), 2);

        assert_eq!(mbox.get(&kernel, 0).unwrap(), 0x41);
        assert_eq!(mbox.get(&kernel, 0).unwrap(), 0x42);
        assert_eq!(mbox.used(), 0);
    }

    #[test]
    fn test_full_mailbox_times_out() {
        let kernel = test_kernel(64);
        let mbox = Mailbox::new(2);

        mbox.add(&kernel, 0, 1).unwrap();
        mbox.add(&kernel, 0, 2).unwrap();

        assert_eq!(mbox.add(&kernel, 0, 3), Err(KernelError::TimedOut));
        assert_eq!(mbox.wait_addable(&kernel, 0), Err(KernelError::TimedOut));
    }

    #[test]
    fn test_empty_mailbox_times_out() {
        let kernel = test_kernel(64);
        let mbox = Mailbox::new(2);

        assert_eq!(mbox.get(&kernel, 0), Err(KernelError::TimedOut));
        assert_eq!(mbox.wait_gettable(&kernel, 0), Err(KernelError::TimedOut));

        mbox.add(&kernel, 0, 9).unwrap();
        assert!(mbox.wait_gettable(&kernel, 0).is_ok());
        // Waiting must not have consumed the byte.
        assert_eq!(mbox.get(&kernel, 0).unwrap(), 9);
    }

    #[test]
    fn test_bulk_transfers_partial_success() {
        let kernel = test_kernel(64);
        let mbox = Mailbox::new(8);

        // Only 8 of 12 fit; add_many reports how many made it.
        let added = mbox.add_many(&kernel, 0, b"hello, world").unwrap();
        assert_eq!(added, 8);

        let mut out = [0u8; 12];
        let got = mbox.get_many(&kernel, 0, &mut out).unwrap();
        assert_eq!(got, 8);
        assert_eq!(&out[..8], b"hello, w");
    }

    #[test]
    fn test_ring_wraps_around() {
        let kernel = test_kernel(64);
        let mbox = Mailbox::new(4);

        for round in 0..10u8 {
            mbox.add(&kernel, 0, round).unwrap();
            mbox.add(&kernel, 0, round.wrapping_add(1)).unwrap();
            assert_eq!(mbox.get(&kernel, 0).unwrap(), round);
            assert_eq!(mbox.get(&kernel, 0).unwrap(), round.wrapping_add(1));
        }
    }
}
