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

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;

use crate::Kernel;
use crate::sync::semaphore::Semaphore;
use crate::vmm::Vas;
use mem::addr::VirtAddr;

/// Thread states. Everything that is not `Running` or `Ready` is a blocked
/// state whose value doubles as the reason for the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Ready,
    Sleeping,
    WaitingSemaphore,
    WaitingSemaphoreTimed,
    Terminated,
    Stopped,
    WaitingSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePolicy {
    /// The priority value is used untouched.
    Fixed,
    UserHigher,
    UserNormal,
    UserLower,
}

impl SchedulePolicy {
    pub fn min_priority(&self) -> u8 {
        match self {
            SchedulePolicy::Fixed => 0,
            SchedulePolicy::UserHigher => 50,
            SchedulePolicy::UserNormal => 100,
            SchedulePolicy::UserLower => 150,
        }
    }

    pub fn max_priority(&self) -> u8 {
        match self {
            SchedulePolicy::Fixed => 255,
            policy => policy.min_priority() + 100,
        }
    }
}

pub const FIXED_PRIORITY_KERNEL_HIGH: u8 = 0;
pub const FIXED_PRIORITY_KERNEL_NORMAL: u8 = 30;
pub const FIXED_PRIORITY_IDLE: u8 = 255;

/// Why a blocked thread was made runnable again. Read by the wait that
/// blocked once the thread is scheduled back in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeStatus {
    /// Woken by an ordinary release/unblock; the wait succeeded.
    Normal,
    TimedOut,
    Interrupted,
    Cancelled,
}

pub type ThreadEntry = fn(&Kernel, usize);

/// The fields of a thread the scheduler moves around. Guarded by the thread's
/// own short-lived lock; consistent views across threads are the scheduler
/// lock's job.
#[derive(Debug)]
pub struct ThreadSched {
    pub state: ThreadState,
    pub policy: SchedulePolicy,
    pub priority: u8,
    pub stack_pointer: VirtAddr,
    pub process: Option<usize>,
    pub timeslice_expiry: u64,
    pub gifted_timeslice: u64,
    pub sleep_expiry: u64,
    pub time_used: u64,
    pub wake_status: Option<WakeStatus>,
    pub waiting_on: Option<Arc<Semaphore>>,
    /// Whether the wait the thread is blocked in may be broken by a signal.
    pub wait_interruptible: bool,
    pub needs_termination: bool,
    pub needs_stopping: bool,
    pub signal_intr: bool,
    pub pending_signals: u64,
    pub blocked_signals: u64,
    pub prev_blocked_signals: u64,
    pub user_signal_handler: usize,
}

pub struct Thread {
    pub id: usize,
    pub name: String,
    pub vas: Arc<Vas>,
    pub(crate) entry: ThreadEntry,
    pub(crate) argument: usize,
    pub kernel_stack_top: VirtAddr,
    pub kernel_stack_size: usize,
    pub(crate) canary_base: VirtAddr,
    pub(crate) sched: spin::Mutex<ThreadSched>,
}

impl Thread {
    pub fn state(&self) -> ThreadState {
        self.sched.lock().state
    }

    pub fn priority(&self) -> u8 {
        self.sched.lock().priority
    }

    pub fn process(&self) -> Option<usize> {
        self.sched.lock().process
    }

    pub fn wake_status(&self) -> Option<WakeStatus> {
        self.sched.lock().wake_status
    }

    /// Whether the thread has been sentenced and will self-terminate the
    /// next time it runs.
    pub fn needs_termination(&self) -> bool {
        self.sched.lock().needs_termination
    }

    pub fn needs_stopping(&self) -> bool {
        self.sched.lock().needs_stopping
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}
