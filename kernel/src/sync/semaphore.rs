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

//! Counting semaphores.
//!
//! The counter holds the number of available units. Acquire takes one,
//! blocking while none are left; release returns units and wakes waiters in
//! FIFO order. Timeouts are in milliseconds: 0 is a non-blocking try, -1
//! waits forever. A mutex is a semaphore with a maximum of one.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use crate::irql::IrqLevel;
use crate::sched::thread::{Thread, ThreadState, WakeStatus};
use crate::{Kernel, KernelError};
use util::consts::NS_PER_MS;

/// What to do about outstanding holders when a semaphore is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyMode {
    /// Outstanding holders and waiters are abandoned; waiters wake with a
    /// cancelled status.
    DontCare,
    /// The caller asserts every unit has been returned; holders remaining is
    /// a programmer error.
    RequireUnheld,
}

struct SemInner {
    count: usize,
    waiters: VecDeque<Arc<Thread>>,
    destroyed: bool,
}

pub struct Semaphore {
    name: &'static str,
    max: usize,
    inner: spin::Mutex<SemInner>,
}

enum AcquireOutcome {
    Done(Result<(), KernelError>),
    Blocked(Arc<Thread>),
}

impl Semaphore {
    pub fn new(name: &'static str, max: usize, initial: usize) -> Arc<Self> {
        assert!(initial <= max, "Semaphore starts above its maximum");

        Arc::new(Self {
            name,
            max,
            inner: spin::Mutex::new(SemInner {
                count: initial,
                waiters: VecDeque::new(),
                destroyed: false,
            }),
        })
    }

    /// A mutex is just a semaphore of one, starting available.
    pub fn mutex(name: &'static str) -> Arc<Self> {
        Self::new(name, 1, 1)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Units currently available.
    pub fn count(&self) -> usize {
        self.inner.lock().count
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Remove a thread from the wait queue, used when it is woken through a
    /// path other than release (timeout, signal, explicit unblock).
    pub(crate) fn cancel_waiter(&self, thr: &Arc<Thread>) {
        self.inner
            .lock()
            .waiters
            .retain(|other| !Arc::ptr_eq(other, thr));
    }

    /// Acquire one unit, waiting up to `timeout_ms` (-1 for forever, 0 for a
    /// non-blocking try). The wait may be broken by a delivered signal.
    pub fn acquire(self: &Arc<Self>, kernel: &Kernel, timeout_ms: i64) -> Result<(), KernelError> {
        self.acquire_ex(kernel, timeout_ms, true)
    }

    /// As [`Semaphore::acquire`], with control over signal interruption.
    pub fn acquire_ex(
        self: &Arc<Self>,
        kernel: &Kernel,
        timeout_ms: i64,
        interruptible: bool,
    ) -> Result<(), KernelError> {
        kernel.assert_max_irql(IrqLevel::Scheduler);

        let outcome = kernel.with_sched_lock(|sched_inner| {
            {
                let mut inner = self.inner.lock();

                if inner.destroyed {
                    return AcquireOutcome::Done(Err(KernelError::Cancelled));
                }

                if inner.count > 0 {
                    inner.count -= 1;
                    return AcquireOutcome::Done(Ok(()));
                }

                if timeout_ms == 0 {
                    return AcquireOutcome::Done(Err(KernelError::TimedOut));
                }

                let Some(thr) = kernel.current_thread() else {
                    panic!(
                        "Blocking acquire of semaphore '{}' with no running thread",
                        self.name
                    );
                };

                if interruptible && thr.sched.lock().signal_intr {
                    return AcquireOutcome::Done(Err(KernelError::Interrupted));
                }

                {
                    let mut sched = thr.sched.lock();
                    sched.wake_status = None;
                    sched.waiting_on = Some(self.clone());
                    sched.wait_interruptible = interruptible;
                }
                inner.waiters.push_back(thr.clone());
            }

            let thr = kernel.current_thread().unwrap();
            if timeout_ms > 0 {
                thr.sched.lock().sleep_expiry =
                    kernel.system_time() + timeout_ms as u64 * NS_PER_MS;
                sched_inner.sleepers.push(thr.clone());
                kernel.block_current(sched_inner, ThreadState::WaitingSemaphoreTimed);
            } else {
                kernel.block_current(sched_inner, ThreadState::WaitingSemaphore);
            }

            AcquireOutcome::Blocked(thr)
        });

        match outcome {
            AcquireOutcome::Done(result) => result,
            AcquireOutcome::Blocked(thr) => {
                kernel.schedule();

                match thr.sched.lock().wake_status.take() {
                    Some(WakeStatus::TimedOut) => Err(KernelError::TimedOut),
                    Some(WakeStatus::Interrupted) => Err(KernelError::Interrupted),
                    Some(WakeStatus::Cancelled) => Err(KernelError::Cancelled),
                    Some(WakeStatus::Normal) | None => Ok(()),
                }
            }
        }
    }

    /// Return `quantity` units, waking up to that many waiters in FIFO
    /// order. A unit given to a waiter transfers directly and never touches
    /// the counter.
    pub fn release_many(self: &Arc<Self>, kernel: &Kernel, quantity: usize) {
        kernel.with_sched_lock(|sched_inner| {
            for _ in 0..quantity {
                let waiter = self.inner.lock().waiters.pop_front();

                match waiter {
                    Some(thr) => {
                        thr.sched.lock().wake_status = Some(WakeStatus::Normal);
                        kernel.unblock_locked(sched_inner, &thr);
                    }
                    None => {
                        let mut inner = self.inner.lock();
                        assert!(
                            inner.count < self.max,
                            "Releasing semaphore '{}' beyond its maximum",
                            self.name
                        );
                        inner.count += 1;
                    }
                }
            }
        });
    }

    pub fn release(self: &Arc<Self>, kernel: &Kernel) {
        self.release_many(kernel, 1);
    }

    /// Release one unit, gifting the caller's remaining timeslice to the
    /// woken waiter so a hand-off runs with minimum latency.
    pub fn release_gifting(self: &Arc<Self>, kernel: &Kernel) {
        kernel.with_sched_lock(|sched_inner| {
            let waiter = self.inner.lock().waiters.pop_front();

            match waiter {
                Some(thr) => {
                    thr.sched.lock().wake_status = Some(WakeStatus::Normal);
                    kernel.unblock_gifting_locked(sched_inner, &thr);
                }
                None => {
                    let mut inner = self.inner.lock();
                    assert!(
                        inner.count < self.max,
                        "Releasing semaphore '{}' beyond its maximum",
                        self.name
                    );
                    inner.count += 1;
                }
            }
        });
    }

    /// Tear the semaphore down. With [`DestroyMode::RequireUnheld`] the
    /// caller asserts that no holders remain; with [`DestroyMode::DontCare`]
    /// any waiters wake with a cancelled status.
    pub fn destroy(self: &Arc<Self>, kernel: &Kernel, mode: DestroyMode) {
        kernel.with_sched_lock(|sched_inner| {
            let waiters: VecDeque<Arc<Thread>> = {
                let mut inner = self.inner.lock();

                if mode == DestroyMode::RequireUnheld {
                    assert!(
                        inner.count == self.max && inner.waiters.is_empty(),
                        "Destroying semaphore '{}' with outstanding holders",
                        self.name
                    );
                }

                inner.destroyed = true;
                core::mem::take(&mut inner.waiters)
            };

            for thr in waiters {
                thr.sched.lock().wake_status = Some(WakeStatus::Cancelled);
                kernel.unblock_locked(sched_inner, &thr);
            }
        });
    }
}

impl core::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Semaphore")
            .field("name", &self.name)
            .field("count", &inner.count)
            .field("max", &self.max)
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}
