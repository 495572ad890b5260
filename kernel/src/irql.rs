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

//! The IRQL dispatcher.
//!
//! IRQL is a totally ordered set of interrupt priority levels. Work that has
//! to run at a *lower* level than the caller is deferred; on every lower the
//! queue drains greatest level first, and entries at the same level run in
//! the order they were queued. Deferring to a higher level is a programmer
//! error and panics.

extern crate alloc;

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use crate::Kernel;

/// Interrupt request levels, lowest first. Higher levels mask lower ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum IrqLevel {
    Standard = 0,
    PageFault = 1,
    Scheduler = 2,
    Driver = 3,
    Timer = 4,
    High = 5,
}

impl IrqLevel {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Standard,
            1 => Self::PageFault,
            2 => Self::Scheduler,
            3 => Self::Driver,
            4 => Self::Timer,
            _ => Self::High,
        }
    }
}

/// How many deferments can be outstanding before the heap exists.
const DEFER_QUEUE_CAPACITY: usize = 128;

pub enum DeferredWork {
    Call { func: fn(&Kernel, usize), context: usize },
    Boxed(Box<dyn FnOnce(&Kernel) + Send>),
}

impl DeferredWork {
    fn run(self, kernel: &Kernel) {
        match self {
            DeferredWork::Call { func, context } => func(kernel, context),
            DeferredWork::Boxed(func) => func(kernel),
        }
    }
}

struct DeferredEntry {
    level: IrqLevel,
    seq: u64,
    work: DeferredWork,
}

pub struct IrqlState {
    current: AtomicU8,
    seq: AtomicU64,
    postponed_reschedule: AtomicBool,
    init_done: AtomicBool,
    queue: spin::Mutex<heapless::Vec<DeferredEntry, DEFER_QUEUE_CAPACITY>>,
}

impl IrqlState {
    pub const fn new() -> Self {
        Self {
            current: AtomicU8::new(IrqLevel::Standard as u8),
            seq: AtomicU64::new(0),
            postponed_reschedule: AtomicBool::new(false),
            init_done: AtomicBool::new(false),
            queue: spin::Mutex::new(heapless::Vec::new()),
        }
    }
}

impl Kernel {
    /// The CPU's current IRQL.
    pub fn irql(&self) -> IrqLevel {
        IrqLevel::from_raw(self.irql.current.load(Ordering::Relaxed))
    }

    /// Panic unless the current IRQL is at most `level`. Callers use this to
    /// enforce their documented ceiling.
    pub fn assert_max_irql(&self, level: IrqLevel) {
        let current = self.irql();
        if current > level {
            panic!(
                "Operation with a ceiling of {:?} invoked at IRQL {:?}",
                level, current
            );
        }
    }

    /// Panic unless the current IRQL is exactly `level`.
    pub fn assert_exact_irql(&self, level: IrqLevel) {
        let current = self.irql();
        if current != level {
            panic!(
                "Operation requiring IRQL {:?} invoked at IRQL {:?}",
                level, current
            );
        }
    }

    /// Raise the IRQL to at least `level` and return the previous level.
    /// Lowering through this function is a programmer error.
    pub fn raise_irql(&self, level: IrqLevel) -> IrqLevel {
        self.arch.disable_interrupts();

        let existing = self.irql();
        if level < existing {
            panic!("Raising IRQL from {:?} down to {:?}", existing, level);
        }

        self.irql.current.store(level as u8, Ordering::Relaxed);
        self.arch.set_irql(level as u8);

        existing
    }

    /// Lower the IRQL back to `target`, draining deferred work at levels in
    /// between, greatest first. A reschedule that was postponed while the
    /// IRQL was above the scheduler level happens once Standard is reached.
    pub fn lower_irql(&self, target: IrqLevel) {
        self.arch.disable_interrupts();

        let current = self.irql();
        if target > current {
            panic!("Lowering IRQL from {:?} up to {:?}", current, target);
        }

        if self.irql.init_done.load(Ordering::Relaxed) {
            loop {
                let mut queue = self.irql.queue.lock();

                // Highest level first; equal levels in queue order.
                let mut best: Option<usize> = None;
                for (i, entry) in queue.iter().enumerate() {
                    debug_assert!(entry.level <= self.irql());
                    if entry.level < target {
                        continue;
                    }
                    match best {
                        Some(b)
                            if (queue[b].level, core::cmp::Reverse(queue[b].seq))
                                >= (entry.level, core::cmp::Reverse(entry.seq)) => {}
                        _ => best = Some(i),
                    }
                }

                let Some(index) = best else {
                    break;
                };

                // Take the entry off the queue and set the IRQL before
                // running it, so a handler that raises and lowers doesn't
                // retrigger itself.
                let entry = queue.swap_remove(index);
                drop(queue);

                self.irql.current.store(entry.level as u8, Ordering::Relaxed);
                self.arch.set_irql(entry.level as u8);

                entry.work.run(self);
            }
        }

        self.irql.current.store(target as u8, Ordering::Relaxed);
        self.arch.set_irql(target as u8);

        if target == IrqLevel::Standard
            && self
                .irql
                .postponed_reschedule
                .swap(false, Ordering::Relaxed)
        {
            self.schedule();
        }

        if target == IrqLevel::Standard {
            self.arch.enable_interrupts();
        }
    }

    /// Run `work` at an IRQL lower than or equal to the current one. Equal
    /// runs immediately; lower is queued until the IRQL drops to it. Before
    /// [`Kernel::enable_deferred_work`] is called, requests that would queue
    /// are silently ignored (this is needed to bootstrap the physical memory
    /// manager, et al.).
    pub fn defer(&self, level: IrqLevel, work: DeferredWork) {
        let current = self.irql();

        if level == current {
            work.run(self);
        } else if level > current {
            panic!("Deferring from IRQL {:?} up to {:?}", current, level);
        } else if self.irql.init_done.load(Ordering::Relaxed) {
            let entry = DeferredEntry {
                level,
                seq: self.irql.seq.fetch_add(1, Ordering::Relaxed),
                work,
            };

            if self.irql.queue.lock().push(entry).is_err() {
                loam::warnln!("Deferred work queue overflow; dropping an entry");
            }
        }
    }

    /// Convenience wrapper for deferring a plain function.
    pub fn defer_call(&self, level: IrqLevel, func: fn(&Kernel, usize), context: usize) {
        self.defer(level, DeferredWork::Call { func, context });
    }

    /// Latch a reschedule to happen when the IRQL next returns to Standard.
    pub fn postpone_reschedule(&self) {
        self.irql.postponed_reschedule.store(true, Ordering::Relaxed);
    }

    pub(crate) fn reschedule_is_postponed(&self) -> bool {
        self.irql.postponed_reschedule.load(Ordering::Relaxed)
    }

    /// Allow deferred work to queue. Called once early in bring-up.
    pub fn enable_deferred_work(&self) {
        self.irql.init_done.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_kernel;
    use core::sync::atomic::AtomicUsize;

    extern crate std;
    use std::sync::Arc as StdArc;

    #[test]
    fn test_raise_and_lower() {
        let kernel = test_kernel(64);

        assert_eq!(kernel.irql(), IrqLevel::Standard);

        let previous = kernel.raise_irql(IrqLevel::Driver);
        assert_eq!(previous, IrqLevel::Standard);
        assert_eq!(kernel.irql(), IrqLevel::Driver);

        // Raising to a level we're already above keeps the current level.
        let inner = kernel.raise_irql(IrqLevel::High);
        assert_eq!(inner, IrqLevel::Driver);

        kernel.lower_irql(inner);
        kernel.lower_irql(previous);
        assert_eq!(kernel.irql(), IrqLevel::Standard);
    }

    #[test]
    #[should_panic]
    fn test_raise_downward_panics() {
        let kernel = test_kernel(64);

        let _ = kernel.raise_irql(IrqLevel::Timer);
        let _ = kernel.raise_irql(IrqLevel::Scheduler);
    }

    #[test]
    #[should_panic]
    fn test_max_irql_assert_panics() {
        let kernel = test_kernel(64);

        let _ = kernel.raise_irql(IrqLevel::Timer);
        kernel.assert_max_irql(IrqLevel::Scheduler);
    }

    #[test]
    fn test_defer_at_same_level_runs_now() {
        let kernel = test_kernel(64);

        static RAN: AtomicUsize = AtomicUsize::new(0);
        fn bump(_kernel: &Kernel, amount: usize) {
            RAN.fetch_add(amount, Ordering::Relaxed);
        }

        let before = RAN.load(Ordering::Relaxed);
        kernel.defer_call(IrqLevel::Standard, bump, 3);
        assert_eq!(RAN.load(Ordering::Relaxed), before + 3);
    }

    #[test]
    fn test_defer_runs_exactly_once_before_lower_returns() {
        let kernel = test_kernel(64);

        let count = StdArc::new(AtomicUsize::new(0));

        let previous = kernel.raise_irql(IrqLevel::Driver);
        {
            let count = count.clone();
            kernel.defer(
                IrqLevel::Standard,
                DeferredWork::Boxed(alloc::boxed::Box::new(move |_kernel| {
                    count.fetch_add(1, Ordering::Relaxed);
                })),
            );
        }

        assert_eq!(count.load(Ordering::Relaxed), 0);
        kernel.lower_irql(previous);
        assert_eq!(count.load(Ordering::Relaxed), 1);

        // Nothing left to run on later transitions.
        let previous = kernel.raise_irql(IrqLevel::Driver);
        kernel.lower_irql(previous);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_queue_overflow_drops_silently() {
        let kernel = test_kernel(64);

        fn nothing(_kernel: &Kernel, _context: usize) {}

        let previous = kernel.raise_irql(IrqLevel::High);
        for _ in 0..(DEFER_QUEUE_CAPACITY + 16) {
            kernel.defer_call(IrqLevel::Standard, nothing, 0);
        }
        kernel.lower_irql(previous);
    }

    #[test]
    fn test_postponed_reschedule_latches() {
        let kernel = test_kernel(64);

        let previous = kernel.raise_irql(IrqLevel::Timer);
        kernel.postpone_reschedule();
        assert!(kernel.reschedule_is_postponed());

        // Lowering to Standard consumes the latch (the hosted scheduler is
        // prevented, so it re-latches rather than switching).
        kernel.lower_irql(previous);
    }
}
