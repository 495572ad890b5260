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

//! The thread scheduler.
//!
//! Single CPU, preemptive above Standard IRQL. The ready list is ordered by
//! priority (0 is the highest, 255 is the idle thread); the head always runs
//! next. Threads drift within their policy's priority band depending on
//! whether they yield early or burn their whole timeslice.

pub mod signal;
pub mod thread;

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::Kernel;
use crate::irql::IrqLevel;
use crate::sync::spin::SpinLock;
use crate::vmm::{MapFlags, Vas};
use mem::addr::VirtAddr;
use util::bytes_to_pages;
use util::consts::NS_PER_MS;

use thread::{
    FIXED_PRIORITY_IDLE, FIXED_PRIORITY_KERNEL_HIGH, FIXED_PRIORITY_KERNEL_NORMAL, SchedulePolicy,
    Thread, ThreadEntry, ThreadSched, ThreadState, WakeStatus,
};

pub const DEFAULT_KERNEL_STACK_KB: usize = 16;

/// Bytes of canary at the base of every kernel stack, and the pattern they
/// hold. A mismatch at switch time means the stack overflowed.
pub const CANARY_BYTES: usize = 8 * 1024;
pub const CANARY_VALUE: u32 = 0x8BAD_F00D;

pub(crate) struct SchedInner {
    /// Runnable threads, head first. The running thread is not on this list.
    pub(crate) ready: Vec<Arc<Thread>>,
    /// Threads with a pending sleep or wait timeout.
    pub(crate) sleepers: Vec<Arc<Thread>>,
    /// Dead threads waiting for the cleaner to free their stacks.
    pub(crate) terminated: Vec<Arc<Thread>>,
}

impl SchedInner {
    /// Insert in priority order, after any thread of equal priority so equal
    /// priorities round-robin.
    fn insert_ready(&mut self, thr: Arc<Thread>) {
        let priority = thr.priority();
        let position = self
            .ready
            .iter()
            .position(|other| other.priority() > priority)
            .unwrap_or(self.ready.len());

        self.ready.insert(position, thr);
    }

    fn remove_ready(&mut self, thr: &Arc<Thread>) {
        self.ready.retain(|other| !Arc::ptr_eq(other, thr));
    }

    fn remove_sleeper(&mut self, thr: &Arc<Thread>) {
        self.sleepers.retain(|other| !Arc::ptr_eq(other, thr));
    }
}

pub struct Scheduler {
    inner: SpinLock<SchedInner>,
    current: spin::RwLock<Option<Arc<Thread>>>,
    next_tid: AtomicUsize,
    prevent: AtomicUsize,
}

impl Scheduler {
    pub(crate) const fn new() -> Self {
        Self {
            inner: SpinLock::new(
                "scheduler",
                IrqLevel::Scheduler,
                SchedInner {
                    ready: Vec::new(),
                    sleepers: Vec::new(),
                    terminated: Vec::new(),
                },
            ),
            current: spin::RwLock::new(None),
            next_tid: AtomicUsize::new(0),
            prevent: AtomicUsize::new(0),
        }
    }
}

fn timeslice_length_ns(priority: u8) -> u64 {
    if priority == FIXED_PRIORITY_IDLE {
        0
    } else {
        (20 + priority as u64 / 4) * NS_PER_MS
    }
}

fn update_timeslice_expiry(kernel: &Kernel, thr: &Arc<Thread>) {
    let mut sched = thr.sched.lock();
    sched.timeslice_expiry =
        kernel.system_time() + sched.gifted_timeslice + timeslice_length_ns(sched.priority);
    sched.gifted_timeslice = 0;
}

/// Drift a thread's priority inside its policy band: a thread that yielded
/// early gets better (-1), one that burned its slice gets worse (+1).
fn update_priority(thr: &Arc<Thread>, yielded: bool) {
    let mut sched = thr.sched.lock();
    let policy = sched.policy;

    if policy != SchedulePolicy::Fixed {
        let new_value = if yielded {
            sched.priority.saturating_sub(1)
        } else {
            sched.priority.saturating_add(1)
        };

        if new_value >= policy.min_priority() && new_value <= policy.max_priority() {
            sched.priority = new_value;
        }
    }
}

impl Kernel {
    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        self.sched.current.read().clone()
    }

    /// Make `thr` the thread the calling context is executing as. Used once
    /// at bring-up to turn the boot context into a real thread, and by the
    /// hosted harness to drive thread bodies.
    pub fn adopt_thread(&self, thr: &Arc<Thread>) {
        {
            let mut guard = self.sched.inner.lock(self);
            guard.remove_ready(thr);
        }

        thr.sched.lock().state = ThreadState::Running;
        update_timeslice_expiry(self, thr);
        self.arch.set_vas(thr.vas.arch_id());
        *self.sched.current.write() = Some(thr.clone());
    }

    pub fn create_thread(
        &self,
        entry: ThreadEntry,
        argument: usize,
        vas: &Arc<Vas>,
        name: &str,
    ) -> Arc<Thread> {
        self.create_thread_ex(
            entry,
            argument,
            vas,
            name,
            self.current_process_id(),
            SchedulePolicy::Fixed,
            FIXED_PRIORITY_KERNEL_NORMAL,
            DEFAULT_KERNEL_STACK_KB,
        )
    }

    pub fn create_thread_ex(
        &self,
        entry: ThreadEntry,
        argument: usize,
        vas: &Arc<Vas>,
        name: &str,
        process: Option<usize>,
        policy: SchedulePolicy,
        priority: u8,
        kernel_stack_kb: usize,
    ) -> Arc<Thread> {
        self.assert_max_irql(IrqLevel::Scheduler);

        let stack_kb = if kernel_stack_kb == 0 {
            DEFAULT_KERNEL_STACK_KB
        } else {
            kernel_stack_kb
        };
        let stack_bytes =
            (bytes_to_pages(stack_kb * 1024) + bytes_to_pages(CANARY_BYTES)) * util::consts::PAGE_4K;

        let stack_base = self
            .map_virt(
                &self.kernel_vas.clone(),
                mem::addr::PhysAddr::new(0),
                VirtAddr::new(0),
                bytes_to_pages(stack_bytes),
                MapFlags::READ | MapFlags::WRITE | MapFlags::LOCK,
                None,
                0,
            )
            .expect("Unable to map a kernel stack");
        let stack_top = stack_base.offset(stack_bytes);

        self.write_canary(stack_base);

        let thr = Arc::new(Thread {
            id: self.sched.next_tid.fetch_add(1, Ordering::Relaxed),
            name: String::from(name),
            vas: vas.clone(),
            entry,
            argument,
            kernel_stack_top: stack_top,
            kernel_stack_size: stack_bytes,
            canary_base: stack_base,
            sched: spin::Mutex::new(ThreadSched {
                state: ThreadState::Ready,
                policy,
                priority,
                stack_pointer: self.arch.prepare_stack(stack_top),
                process,
                timeslice_expiry: 0,
                gifted_timeslice: 0,
                sleep_expiry: 0,
                time_used: 0,
                wake_status: None,
                waiting_on: None,
                wait_interruptible: true,
                needs_termination: false,
                needs_stopping: false,
                signal_intr: false,
                pending_signals: 0,
                blocked_signals: 0,
                prev_blocked_signals: 0,
                user_signal_handler: 0,
            }),
        });

        if let Some(pid) = process {
            self.add_thread_to_process(pid, &thr);
        }

        let mut guard = self.sched.inner.lock(self);
        guard.insert_ready(thr.clone());
        drop(guard);

        thr
    }

    fn write_canary(&self, canary_base: VirtAddr) {
        let pattern = CANARY_VALUE.to_ne_bytes();
        let mut page = [0u8; util::consts::PAGE_4K];
        for chunk in page.chunks_exact_mut(4) {
            chunk.copy_from_slice(&pattern);
        }

        for i in 0..CANARY_BYTES / util::consts::PAGE_4K {
            self.copy_to_virt(
                &self.kernel_vas,
                canary_base.offset(i * util::consts::PAGE_4K),
                &page,
                false,
            )
            .expect("Unable to seed a stack canary");
        }
    }

    fn check_canary(&self, thr: &Arc<Thread>) {
        let mut page = [0u8; util::consts::PAGE_4K];

        for i in 0..CANARY_BYTES / util::consts::PAGE_4K {
            self.copy_from_virt(
                &self.kernel_vas,
                thr.canary_base.offset(i * util::consts::PAGE_4K),
                &mut page,
                false,
            )
            .expect("Unable to read a stack canary");

            for chunk in page.chunks_exact(4) {
                if u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) != CANARY_VALUE {
                    panic!(
                        "Stack canary died on thread {} '{}': kernel stack overflow",
                        thr.id, thr.name
                    );
                }
            }
        }
    }

    /// Mark the running thread as blocked for `reason`. The actual switch is
    /// postponed until the IRQL returns to Standard. Must be called with the
    /// scheduler lock held.
    pub(crate) fn block_current(&self, _guard: &mut SchedInner, reason: ThreadState) {
        assert!(
            reason != ThreadState::Ready && reason != ThreadState::Running,
            "Blocking for a runnable state"
        );

        let current = self
            .current_thread()
            .expect("Blocking with no running thread");
        assert_eq!(current.sched.lock().state, ThreadState::Running);

        current.sched.lock().state = reason;
        self.postpone_reschedule();
    }

    /// Return a blocked thread to the ready list. Must be called with the
    /// scheduler lock held.
    pub(crate) fn unblock_locked(&self, guard: &mut SchedInner, thr: &Arc<Thread>) {
        {
            let mut sched = thr.sched.lock();

            if matches!(
                sched.state,
                ThreadState::Ready | ThreadState::Running | ThreadState::Terminated
            ) {
                return;
            }

            if matches!(
                sched.state,
                ThreadState::WaitingSemaphore | ThreadState::WaitingSemaphoreTimed
            ) {
                if let Some(sem) = sched.waiting_on.take() {
                    drop(sched);
                    sem.cancel_waiter(thr);
                    sched = thr.sched.lock();
                }
            }

            if sched.wake_status.is_none() {
                sched.wake_status = Some(WakeStatus::Normal);
            }
            sched.state = ThreadState::Ready;
            sched.waiting_on = None;
        }

        guard.remove_sleeper(thr);
        guard.insert_ready(thr.clone());

        if let Some(current) = self.current_thread() {
            if thr.priority() < current.priority() {
                self.postpone_reschedule();
            }
        }
    }

    pub fn unblock_thread(&self, thr: &Arc<Thread>) {
        let mut guard = self.sched.inner.lock(self);
        self.unblock_locked(&mut guard, thr);
    }

    /// Unblock `thr` and hand it the rest of the releaser's timeslice, so a
    /// hand-off wakes with minimum latency. The woken thread goes to the
    /// front of the ready list and the caller's slice ends now.
    pub(crate) fn unblock_gifting_locked(&self, guard: &mut SchedInner, thr: &Arc<Thread>) {
        let now = self.system_time();

        if let Some(current) = self.current_thread() {
            let mut cur_sched = current.sched.lock();
            if cur_sched.timeslice_expiry >= now {
                thr.sched.lock().gifted_timeslice += cur_sched.timeslice_expiry - now;
            }
            cur_sched.timeslice_expiry = now;
        }

        {
            let mut sched = thr.sched.lock();

            if matches!(
                sched.state,
                ThreadState::Ready | ThreadState::Running | ThreadState::Terminated
            ) {
                self.postpone_reschedule();
                return;
            }

            if matches!(
                sched.state,
                ThreadState::WaitingSemaphore | ThreadState::WaitingSemaphoreTimed
            ) {
                if let Some(sem) = sched.waiting_on.take() {
                    drop(sched);
                    sem.cancel_waiter(thr);
                    sched = thr.sched.lock();
                }
            }

            if sched.wake_status.is_none() {
                sched.wake_status = Some(WakeStatus::Normal);
            }
            sched.state = ThreadState::Ready;
            sched.waiting_on = None;
        }

        guard.remove_sleeper(thr);
        guard.ready.insert(0, thr.clone());

        self.postpone_reschedule();
    }

    /// Stop the scheduler from switching; postponed reschedules queue up.
    pub fn prevent_scheduler(&self) {
        self.sched.prevent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unprevent_scheduler(&self) {
        self.sched.prevent.fetch_sub(1, Ordering::Relaxed);
    }

    /// Pick the next thread to run and switch to it. Above the page-fault
    /// IRQL (or while prevented) this only latches a postponed reschedule.
    pub fn schedule(&self) {
        if self.irql() > IrqLevel::PageFault || self.sched.prevent.load(Ordering::Relaxed) != 0 {
            self.postpone_reschedule();
            return;
        }

        {
            let mut guard = self.sched.inner.lock(self);
            self.schedule_locked(&mut guard);
        }

        // A foreign terminate can't yank a blocked thread off whatever list
        // it is on; it flags the thread and we finish the job the next time
        // it passes through here.
        if let Some(current) = self.current_thread() {
            if current.sched.lock().needs_termination {
                self.terminate_thread(&current);
            }
        }
    }

    fn schedule_locked(&self, guard: &mut SchedInner) {
        let old = self.current_thread();

        let Some(old) = old else {
            // Multitasking is not up yet; start it if someone is ready.
            if let Some(new) = guard.ready.first().cloned() {
                guard.ready.remove(0);
                new.sched.lock().state = ThreadState::Running;
                *self.sched.current.write() = Some(new.clone());
                update_timeslice_expiry(self, &new);
                self.arch.set_vas(new.vas.arch_id());
                self.arch.switch_thread(usize::MAX, new.id);
            }
            return;
        };

        if guard.ready.is_empty() {
            return;
        }

        self.check_canary(&old);

        let now = self.system_time();
        let yielded = old.sched.lock().timeslice_expiry > now;
        update_priority(&old, yielded);

        // Put the old task back on the ready list, unless it blocked.
        if old.sched.lock().state == ThreadState::Running {
            old.sched.lock().state = ThreadState::Ready;
            guard.insert_ready(old.clone());
        }

        let new = guard.ready.first().cloned().unwrap();
        guard.ready.remove(0);

        if Arc::ptr_eq(&new, &old) {
            new.sched.lock().state = ThreadState::Running;
            return;
        }

        new.sched.lock().state = ThreadState::Running;
        *self.sched.current.write() = Some(new.clone());
        update_timeslice_expiry(self, &new);

        if !Arc::ptr_eq(&new.vas, &old.vas) {
            self.arch.set_vas(new.vas.arch_id());
        }

        self.arch.switch_thread(old.id, new.id);
    }

    /// Advance the system timer by `delta_ns`, as the timer interrupt
    /// handler would. Sleep wake-ups run as deferred work at the scheduler
    /// level, and an expired timeslice latches a reschedule for when the
    /// IRQL next returns to Standard.
    pub fn timer_tick(&self, delta_ns: u64) {
        let previous = self.raise_irql(IrqLevel::Timer);

        self.advance_time(delta_ns);
        self.defer_call(IrqLevel::Scheduler, wake_sleepers, 0);

        if let Some(current) = self.current_thread() {
            if current.sched.lock().timeslice_expiry <= self.system_time() {
                self.postpone_reschedule();
            }
        }

        self.lower_irql(previous);
    }

    /// Sleep the calling thread until the system timer reaches
    /// `system_time_ns`.
    pub fn sleep_until(&self, system_time_ns: u64) {
        self.assert_exact_irql(IrqLevel::Standard);

        let current = self
            .current_thread()
            .expect("Sleeping with no running thread");

        {
            let mut guard = self.sched.inner.lock(self);
            {
                let mut sched = current.sched.lock();
                sched.sleep_expiry = system_time_ns;
                sched.wake_status = None;
            }
            guard.sleepers.push(current.clone());
            self.block_current(&mut guard, ThreadState::Sleeping);
        }

        self.schedule();
    }

    pub fn sleep_milli(&self, ms: u64) {
        self.sleep_until(self.system_time() + ms * NS_PER_MS);
    }

    /// Terminate a thread. Terminating the running thread never returns on a
    /// real port; a foreign thread is flagged and self-terminates the next
    /// time it is scheduled.
    pub fn terminate_thread(&self, thr: &Arc<Thread>) {
        let is_current = self
            .current_thread()
            .is_some_and(|current| Arc::ptr_eq(&current, thr));

        let mut guard = self.sched.inner.lock(self);

        if is_current {
            {
                let mut sched = thr.sched.lock();
                sched.state = ThreadState::Terminated;
                sched.needs_termination = false;
            }
            guard.terminated.push(thr.clone());
            *self.sched.current.write() = None;
            drop(guard);
            self.schedule();
        } else {
            let mut sched = thr.sched.lock();
            if sched.state == ThreadState::Ready {
                sched.state = ThreadState::Terminated;
                sched.needs_termination = false;
                drop(sched);
                guard.remove_ready(thr);
                guard.terminated.push(thr.clone());
            } else {
                sched.needs_termination = true;
            }
        }
    }

    pub fn set_thread_priority(
        &self,
        thr: &Arc<Thread>,
        policy: Option<SchedulePolicy>,
        priority: u8,
    ) -> Result<(), crate::KernelError> {
        let mut sched = thr.sched.lock();

        let target_policy = policy.unwrap_or(sched.policy);
        let clamped = priority
            .max(target_policy.min_priority())
            .min(target_policy.max_priority());

        if let Some(policy) = policy {
            sched.policy = policy;
        }
        sched.priority = clamped;

        Ok(())
    }

    /// Free the stacks of threads that have terminated. This is the cleaner
    /// thread's whole job.
    pub fn reap_terminated_threads(&self) {
        let dead = {
            let mut guard = self.sched.inner.lock(self);
            core::mem::take(&mut guard.terminated)
        };

        for thr in dead {
            let base = thr.canary_base;
            let pages = bytes_to_pages(thr.kernel_stack_size);
            let _ = self.unmap_virt(&self.kernel_vas.clone(), base, pages, false);
        }
    }

    /// Execute a thread's body in the calling context, the way the kernel
    /// thread bootstrap does after the first switch into a fresh stack: make
    /// it current, run the entry function, then self-terminate.
    pub fn run_thread_body(&self, thr: &Arc<Thread>) {
        self.adopt_thread(thr);
        (thr.entry)(self, thr.argument);
        self.terminate_thread(thr);
    }

    /// Threads that currently sit on the ready list, head first.
    pub fn ready_thread_ids(&self) -> Vec<usize> {
        let guard = self.sched.inner.lock(self);
        guard.ready.iter().map(|thr| thr.id).collect()
    }

    pub(crate) fn with_sched_lock<R>(&self, f: impl FnOnce(&mut SchedInner) -> R) -> R {
        let mut guard = self.sched.inner.lock(self);
        f(&mut guard)
    }
}

fn wake_sleepers(kernel: &Kernel, _context: usize) {
    let now = kernel.system_time();

    let expired: Vec<Arc<Thread>> = kernel.with_sched_lock(|inner| {
        let mut expired = Vec::new();
        inner.sleepers.retain(|thr| {
            let sched = thr.sched.lock();
            let is_expired = sched.sleep_expiry <= now
                && matches!(
                    sched.state,
                    ThreadState::Sleeping | ThreadState::WaitingSemaphoreTimed
                );
            if is_expired {
                expired.push(thr.clone());
            }
            !is_expired
        });
        expired
    });

    for thr in expired {
        {
            let mut sched = thr.sched.lock();
            if sched.state == ThreadState::WaitingSemaphoreTimed {
                sched.wake_status = Some(WakeStatus::TimedOut);
            }
        }

        kernel.with_sched_lock(|inner| {
            kernel.unblock_locked(inner, &thr);
        });
    }
}

/// The idle thread: run whenever nothing else is ready.
pub fn idle_thread_entry(kernel: &Kernel, _argument: usize) {
    loop {
        kernel.schedule();
    }
}

/// The cleaner thread: reap terminated threads, then get out of the way.
pub fn cleaner_thread_entry(kernel: &Kernel, _argument: usize) {
    loop {
        kernel.reap_terminated_threads();
        kernel.schedule();
    }
}

/// Create the idle and cleaner threads and perform the first switch. On a
/// real port this never returns.
pub fn start_multitasking(kernel: &Kernel) {
    let kernel_vas = kernel.kernel_vas.clone();

    kernel.create_thread_ex(
        idle_thread_entry,
        0,
        &kernel_vas,
        "idle",
        None,
        SchedulePolicy::Fixed,
        FIXED_PRIORITY_IDLE,
        0,
    );
    kernel.create_thread_ex(
        cleaner_thread_entry,
        0,
        &kernel_vas,
        "cleaner",
        None,
        SchedulePolicy::Fixed,
        FIXED_PRIORITY_KERNEL_HIGH,
        0,
    );

    kernel.schedule();
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Kernel;
    use crate::test_kernel;
    use alloc::vec;

    extern crate std;

    fn noop_entry(_kernel: &Kernel, _argument: usize) {}

    fn fixed(kernel: &Kernel, name: &str, priority: u8) -> Arc<Thread> {
        let vas = kernel.kernel_vas.clone();
        kernel.create_thread_ex(
            noop_entry,
            0,
            &vas,
            name,
            None,
            SchedulePolicy::Fixed,
            priority,
            0,
        )
    }

    #[test]
    fn test_ready_list_is_priority_ordered() {
        let kernel = test_kernel(128);

        let low = fixed(&kernel, "low", 200);
        let high = fixed(&kernel, "high", 10);
        let mid_a = fixed(&kernel, "mid a", 100);
        let mid_b = fixed(&kernel, "mid b", 100);

        // Head first, and equal priorities keep arrival order.
        assert_eq!(
            kernel.ready_thread_ids(),
            vec![high.id, mid_a.id, mid_b.id, low.id]
        );
    }

    #[test]
    fn test_schedule_picks_the_head() {
        let kernel = Kernel::hosted(128);

        let runner = fixed(&kernel, "runner", 100);
        let next = fixed(&kernel, "next", 10);

        kernel.adopt_thread(&runner);
        kernel.schedule();

        // The higher priority thread takes over; the runner yielded early
        // and goes back on the list.
        let current = kernel.current_thread().unwrap();
        assert_eq!(current.id, next.id);
        assert_eq!(runner.state(), ThreadState::Ready);
        assert!(kernel.ready_thread_ids().contains(&runner.id));
    }

    #[test]
    fn test_priority_drifts_within_band() {
        let kernel = Kernel::hosted(128);
        let vas = kernel.kernel_vas.clone();

        let drifter = kernel.create_thread_ex(
            noop_entry,
            0,
            &vas,
            "drifter",
            None,
            SchedulePolicy::UserNormal,
            150,
            0,
        );
        let other = fixed(&kernel, "other", 10);

        // Yielding before the slice expires improves the priority by one.
        kernel.adopt_thread(&drifter);
        kernel.schedule();
        assert_eq!(kernel.current_thread().unwrap().id, other.id);
        assert_eq!(drifter.priority(), 149);

        // Burning the whole slice costs one.
        kernel.adopt_thread(&drifter);
        let third = fixed(&kernel, "third", 10);
        let expiry = drifter.sched.lock().timeslice_expiry;
        kernel.timer_tick(expiry - kernel.system_time() + 1);
        assert_eq!(kernel.current_thread().unwrap().id, third.id);
        assert_eq!(drifter.priority(), 150);
    }

    #[test]
    fn test_priority_stays_inside_the_band() {
        let kernel = test_kernel(128);
        let vas = kernel.kernel_vas.clone();

        let thr = kernel.create_thread_ex(
            noop_entry,
            0,
            &vas,
            "clamped",
            None,
            SchedulePolicy::UserHigher,
            50,
            0,
        );

        // Requests outside the band clamp to it.
        kernel
            .set_thread_priority(&thr, Some(SchedulePolicy::UserHigher), 10)
            .unwrap();
        assert_eq!(thr.priority(), 50);

        kernel
            .set_thread_priority(&thr, None, 255)
            .unwrap();
        assert_eq!(thr.priority(), 150);
    }

    #[test]
    fn test_timeslice_length_follows_priority() {
        assert_eq!(timeslice_length_ns(0), 20 * NS_PER_MS);
        assert_eq!(timeslice_length_ns(100), 45 * NS_PER_MS);
        assert_eq!(timeslice_length_ns(FIXED_PRIORITY_IDLE), 0);
    }

    #[test]
    fn test_sleep_wakes_on_tick() {
        let kernel = test_kernel(128);

        let sleeper = fixed(&kernel, "sleeper", 100);
        let driver = fixed(&kernel, "driver", 100);

        kernel.adopt_thread(&sleeper);
        kernel.sleep_milli(50);
        assert_eq!(sleeper.state(), ThreadState::Sleeping);

        kernel.adopt_thread(&driver);

        kernel.timer_tick(30 * NS_PER_MS);
        assert_eq!(sleeper.state(), ThreadState::Sleeping);

        kernel.timer_tick(30 * NS_PER_MS);
        assert_eq!(sleeper.state(), ThreadState::Ready);
    }

    #[test]
    fn test_terminate_ready_thread_and_reap_its_stack() {
        let kernel = Kernel::hosted(128);

        let victim = fixed(&kernel, "victim", 100);
        let runner = fixed(&kernel, "runner", 50);

        kernel.adopt_thread(&runner);

        // A ready thread dies in place.
        kernel.terminate_thread(&victim);
        assert_eq!(victim.state(), ThreadState::Terminated);
        assert!(!kernel.ready_thread_ids().contains(&victim.id));

        // The cleaner gives its stack back.
        let free_before = kernel.frames_free();
        kernel.reap_terminated_threads();
        assert!(kernel.frames_free() > free_before);
    }

    #[test]
    #[should_panic]
    fn test_stack_canary_overflow_is_fatal() {
        let kernel = Kernel::hosted(128);

        let victim = fixed(&kernel, "victim", 100);
        let other = fixed(&kernel, "other", 10);
        let _ = other;

        kernel.adopt_thread(&victim);

        // Scribble over the canary the way a runaway stack would.
        let garbage = [0u8; 64];
        kernel
            .copy_to_virt(&kernel.kernel_vas, victim.canary_base, &garbage, false)
            .unwrap();

        kernel.schedule();
    }
}
