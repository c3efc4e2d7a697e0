//! # Process Manager
//!
//! Process lifecycle (`init_task`/`destroy_task`/`exit_task`/`wait_child`),
//! grounded on `examples/original_source/tasks/pm.h`'s `process_t` field list
//! and `pm_*` signatures (spec §4.4). `pm.c` itself is not present in
//! `original_source/`, so the bodies below follow the header's contract and
//! the sibling `thread.c` patterns (CAS-driven blocking, synchronous
//! scheduler enqueue on wake).

use alloc::sync::Arc;
use alloc::vec::Vec;

use kernel_alloc::vmm::{Context, Vmm};
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SpinLock;
use kernel_vmem::{FrameAlloc, PhysMapper};

use core::sync::atomic::{AtomicU64, Ordering};

use crate::Pid;
use crate::StreamHandle;
use crate::scheduler::Scheduler;
use crate::status::BlockReason;
use crate::thread::{Thread, ThreadEngine};

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("out of physical or virtual memory while setting up the process")]
    OutOfMemory,
    #[error(transparent)]
    Thread(#[from] crate::thread::ThreadError),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ProcessState {
    Running,
    Terminated(i32),
}

/// Children that have exited but not yet been reaped, plus the threads
/// currently parked in [`ProcessManager::wait_child`] for this process.
/// Keeping both in one lock is what makes "check for an already-terminated
/// child, else register as a waiter" atomic — a separate check-then-block
/// sequence would let an `exit_task` slip in between the check and the
/// registration and leave the waiter parked forever.
#[derive(Default)]
struct WaitState {
    terminated_children: Vec<(Pid, i32)>,
    waiters: Vec<crate::Tid>,
}

/// `{pid, context, threads, next_thread_stack_top, streams, parent}` (spec
/// §3's Process data model).
pub struct Process {
    pid: Pid,
    parent: Option<Pid>,
    context: Context,
    threads: SpinLock<Vec<Arc<Thread>>>,
    next_thread_stack_top: SpinLock<VirtualAddress>,
    streams: [StreamHandle; 3],
    state: SpinLock<ProcessState>,
    wait_state: SpinLock<WaitState>,
}

impl Process {
    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    #[must_use]
    pub fn streams(&self) -> [StreamHandle; 3] {
        self.streams
    }

    #[must_use]
    pub fn next_thread_stack_top(&self) -> VirtualAddress {
        self.next_thread_stack_top.with_lock(|top| *top)
    }

    pub fn set_next_thread_stack_top(&self, top: VirtualAddress) {
        self.next_thread_stack_top.with_lock(|t| *t = top);
    }

    pub fn with_threads<R>(&self, f: impl FnOnce(&mut Vec<Arc<Thread>>) -> R) -> R {
        self.threads.with_lock(f)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self.state.with_lock(|s| *s), ProcessState::Running)
    }

    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self.state.with_lock(|s| *s) {
            ProcessState::Terminated(code) => Some(code),
            ProcessState::Running => None,
        }
    }
}

/// Creates/destroys processes and threads together, and implements
/// `wait_child` (spec §4.4). Owns the global process table; generic over
/// [`Scheduler`] so it can drive the same [`ThreadEngine`] a test uses.
pub struct ProcessManager<S: Scheduler> {
    next_pid: AtomicU64,
    processes: SpinLock<Vec<Arc<Process>>>,
    _scheduler: core::marker::PhantomData<S>,
}

impl<S: Scheduler> Default for ProcessManager<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Scheduler> ProcessManager<S> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU64::new(1),
            processes: SpinLock::new(Vec::new()),
            _scheduler: core::marker::PhantomData,
        }
    }

    #[must_use]
    pub fn find(&self, pid: Pid) -> Option<Arc<Process>> {
        self.processes
            .with_lock(|p| p.iter().find(|proc| proc.pid == pid).cloned())
    }

    /// Create a new process with a fresh address-space context, register a
    /// main thread at `entry` with the given initial `data`, and unblock
    /// it so the scheduler can run it (spec §4.4 `pm_InitTask`).
    ///
    /// # Safety
    /// Same contract as [`ThreadEngine::create`]: must run at CPL0 with the
    /// kernel context active in CR3.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn init_task<M: PhysMapper, A: FrameAlloc>(
        &self,
        threads: &ThreadEngine<S>,
        vmm: &mut Vmm<'_, M, A>,
        kernel_ctx: &Context,
        parent: Option<Pid>,
        entry: VirtualAddress,
        data: &[u8],
        streams: [StreamHandle; 3],
    ) -> Result<Arc<Process>, ProcessError> {
        let context = vmm
            .create_context(kernel_ctx)
            .map_err(|_| ProcessError::OutOfMemory)?;

        let pid = Pid::from_raw(self.next_pid.fetch_add(1, Ordering::Relaxed));
        let process = Arc::new(Process {
            pid,
            parent,
            context,
            threads: SpinLock::new(Vec::new()),
            next_thread_stack_top: SpinLock::new(VirtualAddress::new(
                kernel_info::memory::USERSPACE_END,
            )),
            streams,
            state: SpinLock::new(ProcessState::Running),
            wait_state: SpinLock::new(WaitState::default()),
        });

        self.processes.with_lock(|p| p.push(process.clone()));

        let main = unsafe { threads.create(vmm, kernel_ctx, &process, entry, data, false) }?;
        threads.unblock(&main);

        Ok(process)
    }

    /// Tear down every thread, the address-space context, and the process
    /// table entry (spec §4.4 `pm_DestroyTask`).
    pub fn destroy_task<M: PhysMapper, A: FrameAlloc>(
        &self,
        threads: &ThreadEngine<S>,
        vmm: &mut Vmm<'_, M, A>,
        kernel_ctx: &Context,
        process: &Arc<Process>,
    ) {
        let owned = process.with_threads(core::mem::take);
        for thread in &owned {
            threads.destroy(vmm, kernel_ctx, process, thread);
        }
        vmm.delete_context(process.context);
        self.processes.with_lock(|p| p.retain(|x| x.pid != process.pid));
    }

    /// Mark `process` terminated, forcibly unblock every thread of its own
    /// still parked in `block_self` (so each notices the termination, runs
    /// its `bail`, and returns) and, if it has a parent, record the exit so
    /// a pending or future `wait_child` can observe it (spec §4.4
    /// `pm_ExitTask`).
    pub fn exit_task(&self, threads: &ThreadEngine<S>, process: &Process, exit_code: i32) {
        process.state.with_lock(|s| *s = ProcessState::Terminated(exit_code));

        let blocked = process.with_threads(|t| t.clone());
        for thread in &blocked {
            if thread.status.state() == crate::status::ThreadState::Blocked {
                threads.unblock(thread);
            }
        }

        let Some(parent_pid) = process.parent else {
            return;
        };
        let Some(parent) = self.find(parent_pid) else {
            return;
        };

        let waiters = parent.wait_state.with_lock(|w| {
            w.terminated_children.push((process.pid, exit_code));
            w.waiters.clone()
        });
        for tid in waiters {
            if let Some(t) = threads.find(tid) {
                threads.unblock(&t);
            }
        }
    }

    /// Block `calling_thread` (which must belong to `parent`) until the
    /// child identified by `child` (or, if `None`, any child) has
    /// terminated, then return its `(pid, exit_code)` (spec §4.4
    /// `pm_WaitChild`). The check against already-terminated children and
    /// the registration as a waiter happen under the same `wait_state`
    /// lock, so a child that exits concurrently can never be missed.
    pub fn wait_child(
        &self,
        threads: &ThreadEngine<S>,
        parent: &Process,
        calling_thread: &Thread,
        child: Option<Pid>,
    ) -> (Pid, i32) {
        loop {
            let found = parent.wait_state.with_lock(|w| {
                let idx = w
                    .terminated_children
                    .iter()
                    .position(|(pid, _)| child.is_none_or(|c| c == *pid));
                idx.map(|i| w.terminated_children.remove(i))
            });
            if let Some(result) = found {
                parent
                    .wait_state
                    .with_lock(|w| w.waiters.retain(|t| *t != calling_thread.tid));
                return result;
            }

            parent.wait_state.with_lock(|w| {
                if !w.waiters.contains(&calling_thread.tid) {
                    w.waiters.push(calling_thread.tid);
                }
            });

            threads.block_self(calling_thread, parent, BlockReason::WaitChild, || {
                parent
                    .wait_state
                    .with_lock(|w| w.waiters.retain(|t| *t != calling_thread.tid));
            });
        }
    }
}

impl Pid {
    pub(crate) const fn from_raw(v: u64) -> Self {
        Self(v)
    }
}

#[cfg(test)]
impl Process {
    /// Build a bare `Process` around a caller-supplied `Context`, without
    /// going through `ProcessManager::init_task` (which needs a real `Vmm`).
    /// Only valid for exercising `block_self`/`wait_child`/semaphore logic,
    /// none of which ever map through `context`.
    pub(crate) fn for_test(pid: Pid, parent: Option<Pid>, context: Context) -> Self {
        Self {
            pid,
            parent,
            context,
            threads: SpinLock::new(Vec::new()),
            next_thread_stack_top: SpinLock::new(VirtualAddress::new(
                kernel_info::memory::USERSPACE_END,
            )),
            streams: [StreamHandle(0), StreamHandle(1), StreamHandle(2)],
            state: SpinLock::new(ProcessState::Running),
            wait_state: SpinLock::new(WaitState::default()),
        }
    }

    pub(crate) fn terminate_for_test(&self, exit_code: i32) {
        self.state.with_lock(|s| *s = ProcessState::Terminated(exit_code));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tid;
    use crate::status::ThreadState;
    use crate::test_support::{TestScheduler, fake_context};
    use std::sync::Arc as StdArc;

    #[test]
    fn wait_child_returns_immediately_for_already_terminated_child() {
        let pm = ProcessManager::<TestScheduler>::new();
        let engine = ThreadEngine::new(TestScheduler::default());

        let parent = StdArc::new(Process::for_test(Pid::from_raw(1), None, fake_context(1)));
        pm.processes.with_lock(|p| p.push(parent.clone()));
        let waiting_thread = Thread::for_test(Tid::from_raw(1), parent.pid());

        parent
            .wait_state
            .with_lock(|w| w.terminated_children.push((Pid::from_raw(9), 42)));

        let (pid, code) = pm.wait_child(&engine, &parent, &waiting_thread, None);
        assert_eq!(pid, Pid::from_raw(9));
        assert_eq!(code, 42);
    }

    #[test]
    fn wait_child_filters_by_requested_pid() {
        let pm = ProcessManager::<TestScheduler>::new();
        let engine = ThreadEngine::new(TestScheduler::default());
        let parent = StdArc::new(Process::for_test(Pid::from_raw(1), None, fake_context(1)));
        pm.processes.with_lock(|p| p.push(parent.clone()));
        let waiting_thread = Thread::for_test(Tid::from_raw(1), parent.pid());

        parent.wait_state.with_lock(|w| {
            w.terminated_children.push((Pid::from_raw(3), 1));
            w.terminated_children.push((Pid::from_raw(4), 2));
        });

        let (pid, code) = pm.wait_child(&engine, &parent, &waiting_thread, Some(Pid::from_raw(4)));
        assert_eq!(pid, Pid::from_raw(4));
        assert_eq!(code, 2);
        assert_eq!(parent.wait_state.with_lock(|w| w.terminated_children.len()), 1);
    }

    #[test]
    fn exit_task_wakes_a_parent_blocked_in_wait_child() {
        let pm = StdArc::new(ProcessManager::<TestScheduler>::new());
        let engine = StdArc::new(ThreadEngine::new(TestScheduler::default()));

        let parent = StdArc::new(Process::for_test(Pid::from_raw(1), None, fake_context(1)));
        pm.processes.with_lock(|p| p.push(parent.clone()));
        let child = StdArc::new(Process::for_test(
            Pid::from_raw(2),
            Some(parent.pid()),
            fake_context(2),
        ));

        let waiting_thread = StdArc::new(Thread::for_test(Tid::from_raw(1), parent.pid()));
        waiting_thread
            .status
            .store(ThreadState::Running, BlockReason::NotBlocked);
        engine.with_threads(|t| t.push(waiting_thread.clone()));

        let (pm2, e2, parent2, t2) = (pm.clone(), engine.clone(), parent.clone(), waiting_thread.clone());
        let handle = std::thread::spawn(move || pm2.wait_child(&e2, &parent2, &t2, None));

        while waiting_thread.status.state() != ThreadState::Blocked {
            std::thread::yield_now();
        }
        pm.exit_task(&engine, &child, 7);

        let (pid, code) = handle.join().unwrap();
        assert_eq!(pid, child.pid());
        assert_eq!(code, 7);
    }
}
