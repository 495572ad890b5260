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

//! Processes.
//!
//! A process is an address space, a file descriptor table, a set of threads
//! and a set of children. The child-parent direction stores PIDs rather
//! than pointers, with the process table resolving them, so the ownership
//! graph stays acyclic. The zombie-children semaphore is what wait blocks
//! on: every child death releases it once.

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::irql::IrqLevel;
use crate::sched::thread::{
    FIXED_PRIORITY_KERNEL_HIGH, SchedulePolicy, Thread, ThreadEntry, ThreadState,
};
use crate::sync::semaphore::{DestroyMode, Semaphore};
use crate::vnode::FileHandle;
use crate::{Kernel, KernelError};

pub type Pid = usize;

/// The init process adopts every orphan.
pub const INIT_PID: Pid = 1;

/// More dead children than anyone will ever have.
const ZOMBIE_LIMIT: usize = 1 << 20;

pub struct Process {
    pub pid: Pid,
    pub name: String,
    parent: spin::Mutex<Pid>,
    vas: spin::RwLock<Arc<crate::vmm::Vas>>,
    children: spin::Mutex<Vec<Pid>>,
    threads: spin::Mutex<Vec<Arc<Thread>>>,
    /// Released once per dead child; wait() acquires it.
    zombie_children: Arc<Semaphore>,
    exit_status: spin::Mutex<i32>,
    terminated: AtomicBool,
    pgid: spin::Mutex<Pid>,
    fd_table: spin::Mutex<Vec<Option<Arc<FileHandle>>>>,
}

impl Process {
    pub fn vas(&self) -> Arc<crate::vmm::Vas> {
        self.vas.read().clone()
    }

    pub fn parent(&self) -> Pid {
        *self.parent.lock()
    }

    pub fn children(&self) -> Vec<Pid> {
        self.children.lock().clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Relaxed)
    }

    pub fn exit_status(&self) -> i32 {
        *self.exit_status.lock()
    }

    pub fn pgid(&self) -> Pid {
        *self.pgid.lock()
    }

    pub fn set_pgid(&self, pgid: Pid) {
        *self.pgid.lock() = pgid;
    }

    pub fn any_thread(&self) -> Option<Arc<Thread>> {
        self.threads.lock().first().cloned()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Install a file handle in the lowest free descriptor slot.
    pub fn fd_install(&self, handle: Arc<FileHandle>) -> usize {
        let mut table = self.fd_table.lock();

        for (fd, slot) in table.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(handle);
                return fd;
            }
        }

        table.push(Some(handle));
        table.len() - 1
    }

    pub fn fd_get(&self, fd: usize) -> Option<Arc<FileHandle>> {
        self.fd_table.lock().get(fd).cloned().flatten()
    }

    pub fn fd_close(&self, fd: usize) -> Result<(), KernelError> {
        let mut table = self.fd_table.lock();

        match table.get_mut(fd) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                Ok(())
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

pub struct ProcessTable {
    table: spin::RwLock<alloc::collections::BTreeMap<Pid, Arc<Process>>>,
    next_pid: AtomicUsize,
}

impl ProcessTable {
    pub(crate) const fn new() -> Self {
        Self {
            table: spin::RwLock::new(alloc::collections::BTreeMap::new()),
            next_pid: AtomicUsize::new(INIT_PID),
        }
    }
}

impl Kernel {
    /// Create a new process with an empty address space. A nonzero
    /// `parent_pid` links the child into its parent's child list.
    pub fn create_process(&self, parent_pid: Pid, name: &str) -> Arc<Process> {
        self.assert_exact_irql(IrqLevel::Standard);

        let pid = self.procs.next_pid.fetch_add(1, Ordering::Relaxed);

        let process = Arc::new(Process {
            pid,
            name: String::from(name),
            parent: spin::Mutex::new(parent_pid),
            vas: spin::RwLock::new(self.create_vas()),
            children: spin::Mutex::new(Vec::new()),
            threads: spin::Mutex::new(Vec::new()),
            zombie_children: Semaphore::new("zombie children", ZOMBIE_LIMIT, 0),
            exit_status: spin::Mutex::new(0),
            terminated: AtomicBool::new(false),
            pgid: spin::Mutex::new(pid),
            fd_table: spin::Mutex::new(Vec::new()),
        });

        loam::logln!("Spawn process '{}' (pid={})", name, pid);
        self.procs.table.write().insert(pid, process.clone());

        if parent_pid != 0 {
            let parent = self
                .process_from_pid(parent_pid)
                .expect("Creating a child of a process that doesn't exist");
            parent.children.lock().push(pid);
        }

        process
    }

    /// Create a process and its first thread in one go.
    pub fn create_process_with_entry(
        &self,
        parent_pid: Pid,
        name: &str,
        entry: ThreadEntry,
        argument: usize,
    ) -> Arc<Process> {
        let process = self.create_process(parent_pid, name);
        let vas = process.vas();
        self.create_thread_ex(
            entry,
            argument,
            &vas,
            name,
            Some(process.pid),
            SchedulePolicy::Fixed,
            crate::sched::thread::FIXED_PRIORITY_KERNEL_NORMAL,
            0,
        );
        process
    }

    pub fn process_from_pid(&self, pid: Pid) -> Option<Arc<Process>> {
        self.procs.table.read().get(&pid).cloned()
    }

    pub fn current_process(&self) -> Option<Arc<Process>> {
        self.current_process_id()
            .and_then(|pid| self.process_from_pid(pid))
    }

    pub fn current_process_id(&self) -> Option<Pid> {
        self.current_thread().and_then(|thr| thr.process())
    }

    pub(crate) fn add_thread_to_process(&self, pid: Pid, thr: &Arc<Thread>) {
        let process = self
            .process_from_pid(pid)
            .expect("Adding a thread to a process that doesn't exist");

        process.threads.lock().push(thr.clone());
        thr.sched.lock().process = Some(pid);
    }

    pub(crate) fn processes_with_pgid(&self, pgid: Pid) -> Vec<Arc<Process>> {
        self.procs
            .table
            .read()
            .values()
            .filter(|process| process.pgid() == pgid)
            .cloned()
            .collect()
    }

    pub(crate) fn record_process_signal_exit(&self, pid: Pid, sig_num: u32) {
        if let Some(process) = self.process_from_pid(pid) {
            *process.exit_status.lock() = sig_num as i32;
        }
    }

    /// Fork the current process: the child gets a copy-on-write duplicate of
    /// the address space and one thread parked at the fork return
    /// trampoline. Returns the child.
    pub fn fork_process(&self) -> Result<Arc<Process>, KernelError> {
        self.assert_max_irql(IrqLevel::PageFault);

        let parent = self.current_process().ok_or(KernelError::InvalidArgument)?;

        let child = self.create_process(parent.pid, &parent.name);

        // The empty space create_process made is replaced wholesale by the
        // copied one.
        let forked_vas = self.fork_vas(&parent.vas())?;
        let old = {
            let mut vas = child.vas.write();
            let old = vas.clone();
            *vas = forked_vas.clone();
            old
        };
        self.destroy_vas(&old);

        // Descriptors are shared between parent and child.
        {
            let parent_fds = parent.fd_table.lock().clone();
            *child.fd_table.lock() = parent_fds;
        }

        self.create_thread_ex(
            fork_return_trampoline,
            0,
            &forked_vas,
            "uforked",
            Some(child.pid),
            self.current_thread()
                .map(|thr| thr.sched.lock().policy)
                .unwrap_or(SchedulePolicy::Fixed),
            self.current_thread()
                .map(|thr| thr.sched.lock().priority)
                .unwrap_or(crate::sched::thread::FIXED_PRIORITY_KERNEL_NORMAL),
            0,
        );

        Ok(child)
    }

    /// Wait for a child to die and reap it. `pid` of -1 accepts any child.
    /// Returns the reaped child's PID and exit status.
    pub fn wait_process(&self, pid: isize, no_hang: bool) -> Result<(Pid, i32), KernelError> {
        self.assert_exact_irql(IrqLevel::Standard);

        let process = self.current_process().ok_or(KernelError::InvalidArgument)?;

        let mut failed_reaps = 0;
        let mut result = None;

        while result.is_none() {
            process
                .zombie_children
                .acquire(self, if no_hang { 0 } else { -1 })?;

            result = self.try_reap_child(&process, pid);

            if result.is_none() && pid != -1 {
                failed_reaps += 1;
            }
        }

        // Put back the units we consumed for children we weren't after, so
        // the next wait can reap them without re-waiting.
        if failed_reaps > 0 {
            process.zombie_children.release_many(self, failed_reaps);
        }

        Ok(result.unwrap())
    }

    fn try_reap_child(&self, parent: &Arc<Process>, target: isize) -> Option<(Pid, i32)> {
        let children = parent.children();

        for child_pid in children {
            let Some(child) = self.process_from_pid(child_pid) else {
                continue;
            };

            if child.is_terminated() && (target == -1 || target == child_pid as isize) {
                let status = child.exit_status();
                self.reap_process(&child);
                return Some((child_pid, status));
            }
        }

        None
    }

    /// Free the table slot and bookkeeping of an already-dead process.
    fn reap_process(&self, process: &Arc<Process>) {
        self.assert_exact_irql(IrqLevel::Standard);
        assert!(process.is_terminated());

        process
            .zombie_children
            .destroy(self, DestroyMode::DontCare);
        process.fd_table.lock().clear();

        self.procs.table.write().remove(&process.pid);

        let parent_pid = process.parent();
        if parent_pid != 0 {
            if let Some(parent) = self.process_from_pid(parent_pid) {
                parent.children.lock().retain(|&pid| pid != process.pid);
            }
        }
    }

    /// Kill the current process with `status`. All the teardown runs in a
    /// dedicated helper thread owning no process, so the process is never
    /// destroying the address space it is executing in. Never returns on a
    /// real port; returns the helper thread here so a hosted harness can
    /// drive it.
    pub fn kill_process(&self, status: i32) -> Arc<Thread> {
        self.assert_exact_irql(IrqLevel::Standard);

        let process = self
            .current_process()
            .expect("Killing a process with no current process");
        *process.exit_status.lock() = status;

        let helper = self.create_thread_ex(
            process_killer_entry,
            process.pid,
            &self.kernel_vas.clone(),
            "process killer",
            None,
            SchedulePolicy::Fixed,
            FIXED_PRIORITY_KERNEL_HIGH,
            0,
        );

        if let Some(current) = self.current_thread() {
            self.terminate_thread(&current);
        }

        helper
    }

    /// Exec teardown: wipe the user-range mappings of the current address
    /// space so a new image can be loaded. Kernel stacks and kernel-side
    /// thread state persist.
    pub fn exec_teardown(&self) -> Result<(), KernelError> {
        let process = self.current_process().ok_or(KernelError::InvalidArgument)?;
        self.wipe_user_mappings(&process.vas());
        Ok(())
    }

    pub fn process_count(&self) -> usize {
        self.procs.table.read().len()
    }
}

/// Where a forked process' first thread starts. On a real port the arch
/// layer has arranged the stack so this returns straight back to user mode
/// with a zero return value.
pub fn fork_return_trampoline(_kernel: &Kernel, _argument: usize) {}

/// The body of the process-killer helper thread: terminate every remaining
/// thread, hand children to init, destroy the address space, and tell the
/// parent (or reap immediately when there is none).
pub fn process_killer_entry(kernel: &Kernel, pid: usize) {
    let Some(process) = kernel.process_from_pid(pid) else {
        return;
    };

    loam::logln!("Kill process '{}' (pid={})", process.name, process.pid);

    assert!(
        kernel.current_process().is_none(),
        "The process killer must not belong to a process"
    );

    // Terminate any threads that are still running around.
    let threads = process.threads.lock().clone();
    for thr in threads {
        let state = thr.state();
        if state != ThreadState::Terminated && !thr.sched.lock().needs_termination {
            kernel.terminate_thread(&thr);
        }
    }
    process.threads.lock().clear();

    // Orphans go to init, which is told it has zombies to look at.
    let children = process.children();
    if let Some(init) = kernel.process_from_pid(INIT_PID) {
        for child_pid in children {
            if let Some(child) = kernel.process_from_pid(child_pid) {
                *child.parent.lock() = INIT_PID;
                init.children.lock().push(child_pid);
                init.zombie_children.release(kernel);
            }
        }
    }
    process.children.lock().clear();

    kernel.destroy_vas(&process.vas());
    process.terminated.store(true, Ordering::Relaxed);

    let parent_pid = process.parent();
    if parent_pid == 0 {
        kernel.reap_process(&process);
    } else if let Some(parent) = kernel.process_from_pid(parent_pid) {
        parent.zombie_children.release(kernel);
    }
}
