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

//! Signals.
//!
//! Each thread carries a pending mask and a blocked mask. KILL, STOP and
//! CONT act on the sending side (a stopped thread cannot run a handler to
//! receive them); everything else is drained one signal at a time on the way
//! back to user mode.

extern crate alloc;

use alloc::sync::Arc;

use super::thread::{Thread, ThreadState, WakeStatus};
use crate::{Kernel, KernelError};

pub const SIGKILL: u32 = 9;
pub const SIGSEGV: u32 = 11;
pub const SIGCONT: u32 = 18;
pub const SIGSTOP: u32 = 19;
pub const SIG_UPPER_BOUND: u32 = 32;

pub type SigSet = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigMaskHow {
    Block,
    Unblock,
    SetMask,
}

fn protect_special_signals(blocked: &mut SigSet) {
    *blocked &= !((1 << SIGKILL) | (1 << SIGSTOP) | (1 << SIGCONT));
}

impl Kernel {
    /// Raise `sig_num` against a thread. Special signals are honoured here
    /// directly; a thread blocked waiting for a signal (or in an
    /// interruptible semaphore wait) is woken.
    pub fn raise_signal(&self, thr: &Arc<Thread>, sig_num: u32) -> Result<(), KernelError> {
        if sig_num >= SIG_UPPER_BOUND {
            return Err(KernelError::InvalidArgument);
        }

        let mut guard = self.sched.inner.lock(self);

        {
            let mut sched = thr.sched.lock();
            sched.signal_intr = true;
            sched.pending_signals |= 1 << sig_num;
        }

        if sig_num == SIGKILL {
            thr.sched.lock().needs_termination = true;
        } else if sig_num == SIGSTOP {
            thr.sched.lock().needs_stopping = true;
        } else if sig_num == SIGCONT {
            if thr.sched.lock().state == ThreadState::Stopped {
                self.unblock_locked(&mut guard, thr);
            }
        }

        let state = thr.sched.lock().state;
        match state {
            ThreadState::WaitingSignal => {
                self.unblock_locked(&mut guard, thr);
            }
            ThreadState::WaitingSemaphore | ThreadState::WaitingSemaphoreTimed
                if thr.sched.lock().wait_interruptible =>
            {
                // Interruptible waits give up with an interrupted status.
                thr.sched.lock().wake_status = Some(WakeStatus::Interrupted);
                self.unblock_locked(&mut guard, thr);
            }
            _ => {}
        }

        Ok(())
    }

    /// Raise a signal against every process in a process group.
    pub fn raise_signal_to_process_group(&self, pgid: usize, sig_num: u32) {
        for process in self.processes_with_pgid(pgid) {
            if let Some(thr) = process.any_thread() {
                let _ = self.raise_signal(&thr, sig_num);
            }
        }
    }

    /// Has the running thread been signalled since it last handled one?
    pub fn has_been_signalled(&self) -> bool {
        self.current_thread()
            .is_some_and(|thr| thr.sched.lock().signal_intr)
    }

    /// Called on the way back to user mode. If an unblocked signal is
    /// pending, blocks it, clears its pending bit, and returns its number.
    pub fn find_signal_to_handle(&self) -> Option<u32> {
        let thr = self.current_thread()?;
        let mut sched = thr.sched.lock();

        let available = sched.pending_signals & !sched.blocked_signals;
        if available == 0 {
            return None;
        }

        sched.signal_intr = false;

        let index = available.trailing_zeros();
        sched.pending_signals &= !(1 << index);
        sched.blocked_signals |= 1 << index;

        Some(index)
    }

    /// Resolve where execution goes to handle `sig_num`: the process' common
    /// user handler, or nowhere because the process must die (no handler is
    /// installed). Returns the handler address when there is one.
    pub fn handle_signal(&self, sig_num: u32) -> Option<usize> {
        let thr = self
            .current_thread()
            .expect("Handling a signal with no running thread");
        let mut sched = thr.sched.lock();

        // If the signal ran it can't have been blocked by the user, so the
        // block came from find_signal_to_handle; revert it.
        sched.blocked_signals &= !(1 << sig_num);

        if sched.user_signal_handler == 0 {
            sched.needs_termination = true;
            drop(sched);

            if let Some(pid) = thr.process() {
                self.record_process_signal_exit(pid, sig_num);
            }

            return None;
        }

        Some(sched.user_signal_handler)
    }

    pub fn set_user_signal_handler(&self, thr: &Arc<Thread>, handler: usize) {
        thr.sched.lock().user_signal_handler = handler;
    }

    /// `sigprocmask`. Setting a bit blocks the signal; KILL, STOP and CONT
    /// cannot be blocked unless `protect` is off (kernel-internal callers).
    pub fn set_blocked_signals(
        &self,
        how: SigMaskHow,
        changes: SigSet,
        protect: bool,
    ) -> Result<SigSet, KernelError> {
        let thr = self
            .current_thread()
            .ok_or(KernelError::InvalidArgument)?;

        let _guard = self.sched.inner.lock(self);
        let mut sched = thr.sched.lock();
        let old = sched.blocked_signals;

        match how {
            SigMaskHow::Block => sched.blocked_signals |= changes,
            SigMaskHow::Unblock => sched.blocked_signals &= !changes,
            SigMaskHow::SetMask => sched.blocked_signals = changes,
        }

        if protect {
            protect_special_signals(&mut sched.blocked_signals);
        }

        Ok(old)
    }

    /// `sigsuspend`: swap in a temporary mask and block until a signal
    /// arrives.
    pub fn suspend_for_signal(&self, new_mask: SigSet, protect: bool) -> Result<(), KernelError> {
        let thr = self
            .current_thread()
            .ok_or(KernelError::InvalidArgument)?;

        {
            let mut guard = self.sched.inner.lock(self);
            {
                let mut sched = thr.sched.lock();
                sched.prev_blocked_signals = sched.blocked_signals;
                sched.blocked_signals = new_mask;
                if protect {
                    protect_special_signals(&mut sched.blocked_signals);
                }
            }
            self.block_current(&mut guard, ThreadState::WaitingSignal);
        }

        self.schedule();

        {
            let _guard = self.sched.inner.lock(self);
            let mut sched = thr.sched.lock();
            sched.blocked_signals = sched.prev_blocked_signals;
        }

        Err(KernelError::Interrupted)
    }

    /// `pause`: block until any signal arrives.
    pub fn pause_for_signal(&self) -> Result<(), KernelError> {
        {
            let mut guard = self.sched.inner.lock(self);
            self.block_current(&mut guard, ThreadState::WaitingSignal);
        }

        self.schedule();
        Err(KernelError::Interrupted)
    }

    /// SIGSTOP support: stop a thread. Stopping the running thread blocks it
    /// here; a foreign thread is flagged and stops when it next runs.
    pub fn stop_thread(&self, thr: &Arc<Thread>) {
        let mut guard = self.sched.inner.lock(self);

        let is_current = self
            .current_thread()
            .is_some_and(|current| Arc::ptr_eq(&current, thr));

        if is_current {
            thr.sched.lock().needs_stopping = false;
            self.block_current(&mut guard, ThreadState::Stopped);
        } else {
            thr.sched.lock().needs_stopping = true;
        }
    }

    pub fn continue_thread(&self, thr: &Arc<Thread>) {
        let mut guard = self.sched.inner.lock(self);

        if thr.sched.lock().state == ThreadState::Stopped {
            self.unblock_locked(&mut guard, thr);
        }
    }
}
