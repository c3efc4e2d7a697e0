//! # Thread Engine
//!
//! Thread creation, stack setup, the block/unblock CAS protocol, and
//! destruction (spec §4.5). Grounded on `examples/original_source/tasks/thread.c`
//! for sequencing and exact CAS shapes, adapted to the
//! [`kernel_alloc::vmm::Vmm`] API this tree's VMM exposes instead of the
//! original's raw `vmm_*` C functions.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use kernel_alloc::vmm::{Context, Vmm};
use kernel_info::memory::{THREAD_KERNEL_STACK_PAGES, USER_STACK_GUARD_SIZE, USER_STACK_SIZE};
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SpinLock;
use kernel_vmem::{FrameAlloc, PageFlags, PhysMapper};

use crate::Pid;
use crate::Tid;
use crate::process::Process;
use crate::scheduler::Scheduler;
use crate::status::{BlockReason, ThreadState, ThreadStatus};

const PAGE_SIZE: u64 = 4096;

/// Kernel code/data selectors (ring 0). Matches the original's literal GDT
/// indices (`0x8`/`0x10`) for kernel threads and the main/bootstrap thread.
const KERNEL_CS: u16 = 0x08;
const KERNEL_SS: u16 = 0x10;
const KERNEL_DATA_SELECTOR: u16 = 0x10;

/// User code/data selectors (ring 3): GDT index `0x20`/`0x18` with RPL 3
/// ORed in, exactly as `thread_create`'s `new_state` does.
const USER_CS: u16 = 0x20 + 3;
const USER_SS: u16 = 0x18 + 3;

/// `rflags` for a freshly created thread: `IF` set (bit 9), reserved bit 1
/// always set. `0x202` matches the original's literal.
const INITIAL_RFLAGS: u64 = 0x202;

/// Interrupt vector used to mark "this saved frame was produced by the
/// scheduler, not a real interrupt" (spec §4.5: "a pre-set interrupt number
/// marking a scheduler entry").
const SCHEDULER_ENTRY_INTERRUPT: u8 = 32;

/// A thread's initial (or most recently saved) register frame.
///
/// Exact byte layout is an ABI concern of the interrupt-return path, which
/// is out of this crate's scope (spec §1: boot/interrupt bring-up is an
/// external collaborator); this models only the fields the spec and
/// `thread_create` actually assign.
#[derive(Debug, Copy, Clone)]
pub struct SavedCpuState {
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub interrupt: u8,
}

#[derive(Debug, thiserror::Error)]
pub enum ThreadError {
    #[error("initial data blob does not fit below the user stack top")]
    DataTooLarge,
    #[error("out of physical or virtual memory while setting up the thread's stacks")]
    OutOfMemory,
}

/// `{tid, process, status, saved_cpu_state, stacks, fpu_state, is_main}`
/// (spec §3's Thread data model).
pub struct Thread {
    pub tid: Tid,
    pub process: Pid,
    pub is_main: bool,
    pub status: ThreadStatus,
    pub saved_cpu_state: SpinLock<SavedCpuState>,
    pub kernel_stack_top: VirtualAddress,
    pub kernel_stack_bottom: VirtualAddress,
    pub user_stack_bottom: Option<VirtualAddress>,
    /// Lazily allocated FXSAVE-format FPU save area; `None` until the
    /// thread first touches the FPU/SSE state and a context switch needs to
    /// preserve it.
    pub fpu_state: SpinLock<Option<alloc::boxed::Box<[u8; 512]>>>,
}

impl PartialEq for Thread {
    fn eq(&self, other: &Self) -> bool {
        self.tid == other.tid
    }
}

impl Eq for Thread {}

/// Creates, blocks/unblocks, and destroys threads; owns the global thread
/// list (spec §3: "Register thread on process list and global thread
/// list"). Generic over a [`Scheduler`] so the block/unblock protocol can be
/// driven from a host-side test double.
pub struct ThreadEngine<S: Scheduler> {
    scheduler: S,
    next_tid: AtomicU64,
    threads: SpinLock<Vec<Arc<Thread>>>,
}

impl<S: Scheduler> ThreadEngine<S> {
    #[must_use]
    pub fn new(scheduler: S) -> Self {
        Self {
            scheduler,
            next_tid: AtomicU64::new(1),
            threads: SpinLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// All threads currently registered, across every process.
    pub fn with_threads<R>(&self, f: impl FnOnce(&mut Vec<Arc<Thread>>) -> R) -> R {
        self.threads.with_lock(f)
    }

    #[must_use]
    pub fn find(&self, tid: Tid) -> Option<Arc<Thread>> {
        self.threads
            .with_lock(|t| t.iter().find(|th| th.tid == tid).cloned())
    }

    /// Create a new thread in `process`, registering it on both the
    /// process's thread list and the global list, but leave it `BLOCKED`
    /// (spec: a fresh thread starts parked; the caller `unblock`s it once
    /// ready to run).
    ///
    /// For user threads (`kernel == false`), `data` is copied to the top of
    /// a fresh user stack which is then moved into `process`'s address
    /// space at `process.next_thread_stack_top() - USER_STACK_SIZE` via
    /// [`Vmm::remap`] — mirroring the original's `vmm_ReMap`, which only
    /// works against the currently active (here: kernel) context, so this
    /// must run with the kernel context active in CR3.
    ///
    /// # Safety
    /// Must run at CPL0 with the kernel context active in CR3 (see
    /// [`Vmm::remap`]'s safety contract).
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn create<M: PhysMapper, A: FrameAlloc>(
        &self,
        vmm: &mut Vmm<M, A>,
        kernel_ctx: &Context,
        process: &Process,
        entry: VirtualAddress,
        data: &[u8],
        kernel: bool,
    ) -> Result<Arc<Thread>, ThreadError> {
        if !kernel && data.len() as u64 >= USER_STACK_SIZE {
            return Err(ThreadError::DataTooLarge);
        }

        let tid = Tid::from_raw(self.next_tid.fetch_add(1, Ordering::Relaxed));
        let is_main = process.with_threads(|t| t.is_empty());

        // `sys_alloc` only reserves the range; back it immediately since
        // this thread's kernel stack is live the moment it's scheduled and
        // there's no page-fault handler in scope to back it on first touch.
        let kernel_stack_bottom = vmm
            .sys_alloc(kernel_ctx, THREAD_KERNEL_STACK_PAGES)
            .map_err(|_| ThreadError::OutOfMemory)?;
        vmm.use_pages(kernel_ctx, kernel_stack_bottom, THREAD_KERNEL_STACK_PAGES)
            .map_err(|_| ThreadError::OutOfMemory)?;
        let kernel_stack_top = VirtualAddress::new(
            kernel_stack_bottom.as_u64() + THREAD_KERNEL_STACK_PAGES * PAGE_SIZE,
        );

        let (cs, ss) = if kernel {
            (KERNEL_CS, KERNEL_SS)
        } else {
            (USER_CS, USER_SS)
        };

        let mut user_stack_bottom = None;
        let rsp = if kernel {
            kernel_stack_top.as_u64()
        } else {
            let stack_top = process.next_thread_stack_top();
            let n_pages = USER_STACK_SIZE / PAGE_SIZE;
            let scratch = vmm
                .sys_alloc(kernel_ctx, n_pages)
                .map_err(|_| ThreadError::OutOfMemory)?;
            // Backed immediately: `data` is copied into it below via a raw
            // pointer write, before `remap` ever runs.
            vmm.use_pages(kernel_ctx, scratch, n_pages)
                .map_err(|_| ThreadError::OutOfMemory)?;

            if !data.is_empty() {
                let dst = (scratch.as_u64() + USER_STACK_SIZE - data.len() as u64) as *mut u8;
                unsafe {
                    core::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
                }
            }

            let bottom = VirtualAddress::new(stack_top.as_u64() - USER_STACK_SIZE);
            for i in 0..n_pages {
                let src = VirtualAddress::new(scratch.as_u64() + i * PAGE_SIZE);
                let dst = VirtualAddress::new(bottom.as_u64() + i * PAGE_SIZE);
                unsafe { vmm.remap(src, process.context(), dst, PageFlags::user_data()) }
                    .map_err(|_| ThreadError::OutOfMemory)?;
            }

            process.set_next_thread_stack_top(VirtualAddress::new(
                stack_top.as_u64() - USER_STACK_SIZE - USER_STACK_GUARD_SIZE,
            ));
            user_stack_bottom = Some(bottom);
            stack_top.as_u64() - data.len() as u64
        };

        let saved = SavedCpuState {
            cs,
            ss,
            ds: KERNEL_DATA_SELECTOR,
            es: KERNEL_DATA_SELECTOR,
            fs: KERNEL_DATA_SELECTOR,
            gs: KERNEL_DATA_SELECTOR,
            rip: entry.as_u64(),
            rsp,
            rflags: INITIAL_RFLAGS,
            interrupt: SCHEDULER_ENTRY_INTERRUPT,
        };

        let thread = Arc::new(Thread {
            tid,
            process: process.pid(),
            is_main,
            status: ThreadStatus::new_blocked(),
            saved_cpu_state: SpinLock::new(saved),
            kernel_stack_top,
            kernel_stack_bottom,
            user_stack_bottom,
            fpu_state: SpinLock::new(None),
        });

        process.with_threads(|t| t.push(thread.clone()));
        self.threads.with_lock(|t| t.push(thread.clone()));

        Ok(thread)
    }

    /// Unmap and release the thread's stacks, then drop it from both thread
    /// lists (spec §4.5 "Destruction").
    pub fn destroy<M: PhysMapper, A: FrameAlloc>(
        &self,
        vmm: &mut Vmm<M, A>,
        kernel_ctx: &Context,
        process: &Process,
        thread: &Arc<Thread>,
    ) {
        process.with_threads(|t| t.retain(|x| x.tid != thread.tid));
        self.threads.with_lock(|t| t.retain(|x| x.tid != thread.tid));

        if let Some(bottom) = thread.user_stack_bottom {
            let n_pages = USER_STACK_SIZE / PAGE_SIZE;
            vmm.free(process.context(), bottom, n_pages);
        }
        vmm.free(kernel_ctx, thread.kernel_stack_bottom, THREAD_KERNEL_STACK_PAGES);
        thread.fpu_state.with_lock(|f| *f = None);
    }

    /// CAS `thread` from `{RUNNING, NOT_BLOCKED}` to `{BLOCKED, reason}`; on
    /// success remove it from the scheduler. Returns whether the CAS
    /// succeeded.
    pub fn block(&self, thread: &Thread, reason: BlockReason) -> bool {
        let expected = (ThreadState::Running, BlockReason::NotBlocked);
        if thread.status.compare_exchange(expected, (ThreadState::Blocked, reason)) {
            self.scheduler.scheduler_remove(thread.tid);
            true
        } else {
            false
        }
    }

    /// Block the calling thread (CAS, scheduler removal, spin-yield until
    /// woken), then check whether its owning process is still `RUNNING`.
    ///
    /// A process only ever moves `RUNNING -> TERMINATED` (there is no
    /// resumable-suspended state), so "not running" here is terminal: if the
    /// thread wakes to find its process gone, it calls `bail` to undo
    /// whatever partial acquisition it was waiting to complete and returns
    /// `false` immediately rather than spinning on a state that will never
    /// change back. `exit_task` is responsible for forcibly unblocking every
    /// thread still parked in a terminated process so none of them wait
    /// forever.
    pub fn block_self(
        &self,
        thread: &Thread,
        process: &Process,
        reason: BlockReason,
        bail: impl FnOnce(),
    ) -> bool {
        let expected = (ThreadState::Running, BlockReason::NotBlocked);
        if thread.status.compare_exchange(expected, (ThreadState::Blocked, reason)) {
            self.scheduler.scheduler_remove(thread.tid);
            while thread.status.state() == ThreadState::Blocked {
                self.scheduler.yield_now();
            }
        }

        if !process.is_running() {
            bail();
            return false;
        }
        true
    }

    /// CAS `thread` from `{BLOCKED, <its current reason>}` to
    /// `{RUNNING, NOT_BLOCKED}` and try a non-blocking scheduler enqueue. If
    /// the scheduler rejects it, the CAS is reverted and `false` is
    /// returned. A CAS that fails because a racing unblocker already moved
    /// the thread to `RUNNING` is treated as already-satisfied (`true`) —
    /// see `DESIGN.md` for why this doesn't introduce a new error path.
    pub fn try_unblock(&self, thread: &Thread) -> bool {
        let reason = thread.status.load().1;
        let expected = (ThreadState::Blocked, reason);
        let new = (ThreadState::Running, BlockReason::NotBlocked);
        if thread.status.compare_exchange(expected, new) {
            if self.scheduler.scheduler_try_add(thread.tid) {
                true
            } else {
                thread.status.store(ThreadState::Blocked, reason);
                false
            }
        } else {
            true
        }
    }

    /// CAS `thread` to `{RUNNING, NOT_BLOCKED}`, spinning until it
    /// succeeds, then synchronously enqueue it.
    pub fn unblock(&self, thread: &Thread) {
        loop {
            let reason = thread.status.load().1;
            let expected = (ThreadState::Blocked, reason);
            let new = (ThreadState::Running, BlockReason::NotBlocked);
            if thread.status.compare_exchange(expected, new) {
                break;
            }
            core::hint::spin_loop();
        }
        self.scheduler.scheduler_add(thread.tid);
    }
}

impl Tid {
    pub(crate) const fn from_raw(v: u64) -> Self {
        Self(v)
    }
}

#[cfg(test)]
impl Thread {
    /// A bare, unregistered thread for exercising the block/unblock state
    /// machine directly, without the stack setup `ThreadEngine::create`
    /// does (which needs a real `Vmm`).
    pub(crate) fn for_test(tid: Tid, process: Pid) -> Self {
        Self {
            tid,
            process,
            is_main: false,
            status: ThreadStatus::new_blocked(),
            saved_cpu_state: SpinLock::new(SavedCpuState {
                cs: KERNEL_CS,
                ss: KERNEL_SS,
                ds: KERNEL_DATA_SELECTOR,
                es: KERNEL_DATA_SELECTOR,
                fs: KERNEL_DATA_SELECTOR,
                gs: KERNEL_DATA_SELECTOR,
                rip: 0,
                rsp: 0,
                rflags: INITIAL_RFLAGS,
                interrupt: SCHEDULER_ENTRY_INTERRUPT,
            }),
            kernel_stack_top: VirtualAddress::zero(),
            kernel_stack_bottom: VirtualAddress::zero(),
            user_stack_bottom: None,
            fpu_state: SpinLock::new(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Process;
    use crate::test_support::{TestScheduler, fake_context};
    use std::sync::Arc as StdArc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn block_requires_running_not_blocked() {
        let engine = ThreadEngine::new(TestScheduler::default());
        let t = Thread::for_test(Tid::from_raw(1), Pid::from_raw(1));
        // Freshly created threads start BLOCKED, so `block` (which expects
        // RUNNING) must fail.
        assert!(!engine.block(&t, BlockReason::Semaphore));

        t.status.store(ThreadState::Running, BlockReason::NotBlocked);
        assert!(engine.block(&t, BlockReason::Semaphore));
        assert_eq!(t.status.load(), (ThreadState::Blocked, BlockReason::Semaphore));
    }

    #[test]
    fn try_unblock_fails_when_scheduler_rejects() {
        struct RejectingScheduler;
        impl Scheduler for RejectingScheduler {
            fn scheduler_add(&self, _tid: Tid) {}
            fn scheduler_try_add(&self, _tid: Tid) -> bool {
                false
            }
            fn scheduler_remove(&self, _tid: Tid) {}
            fn yield_now(&self) {}
        }

        let engine = ThreadEngine::new(RejectingScheduler);
        let t = Thread::for_test(Tid::from_raw(1), Pid::from_raw(1));
        t.status.store(ThreadState::Blocked, BlockReason::Semaphore);

        assert!(!engine.try_unblock(&t));
        // Reverted back to BLOCKED on rejection.
        assert_eq!(t.status.load(), (ThreadState::Blocked, BlockReason::Semaphore));
    }

    #[test]
    fn try_unblock_treats_racing_unblock_as_success() {
        let engine = ThreadEngine::new(TestScheduler::default());
        let t = Thread::for_test(Tid::from_raw(1), Pid::from_raw(1));
        // Already RUNNING: a concurrent unblocker got there first.
        t.status.store(ThreadState::Running, BlockReason::NotBlocked);
        assert!(engine.try_unblock(&t));
    }

    #[test]
    fn unblock_wakes_a_thread_parked_in_block_self() {
        let engine = StdArc::new(ThreadEngine::new(TestScheduler::default()));
        let process = StdArc::new(Process::for_test(Pid::from_raw(1), None, fake_context(1)));
        let thread = StdArc::new(Thread::for_test(Tid::from_raw(7), process.pid()));
        thread.status.store(ThreadState::Running, BlockReason::NotBlocked);

        let reached_block = StdArc::new(AtomicBool::new(false));

        let (e2, p2, t2, flag2) = (engine.clone(), process.clone(), thread.clone(), reached_block.clone());
        let handle = std::thread::spawn(move || {
            flag2.store(true, Ordering::Release);
            e2.block_self(&t2, &p2, BlockReason::Semaphore, || {})
        });

        while !reached_block.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        // Give the spawned thread a chance to actually park.
        while thread.status.state() != ThreadState::Blocked {
            std::thread::yield_now();
        }

        engine.unblock(&thread);
        assert!(handle.join().unwrap());
        assert_eq!(thread.status.load(), (ThreadState::Running, BlockReason::NotBlocked));
    }

    #[test]
    fn block_self_bails_when_process_terminates_while_parked() {
        // Mirrors `ProcessManager::exit_task`: terminate the process, then
        // forcibly unblock its threads so each notices and bails, rather
        // than spinning forever on a state that will never come back.
        let engine = StdArc::new(ThreadEngine::new(TestScheduler::default()));
        let process = StdArc::new(Process::for_test(Pid::from_raw(1), None, fake_context(1)));
        let thread = StdArc::new(Thread::for_test(Tid::from_raw(3), process.pid()));
        thread.status.store(ThreadState::Running, BlockReason::NotBlocked);

        let bailed = StdArc::new(AtomicBool::new(false));

        let (e2, p2, t2, bailed2) = (engine.clone(), process.clone(), thread.clone(), bailed.clone());
        let handle = std::thread::spawn(move || {
            e2.block_self(&t2, &p2, BlockReason::WaitChild, || {
                bailed2.store(true, Ordering::Release);
            })
        });

        while thread.status.state() != ThreadState::Blocked {
            std::thread::yield_now();
        }
        process.terminate_for_test(0);
        engine.unblock(&thread);

        assert!(!handle.join().unwrap());
        assert!(bailed.load(Ordering::Acquire));
    }

    #[test]
    fn create_and_destroy_kernel_thread() {
        use crate::test_support::{TestArena, arena_context};
        use kernel_alloc::vmm::Vmm;

        let mut arena = TestArena::new(64);
        let kernel_ctx = arena_context(&mut arena);
        let arena_ptr: *const TestArena = &arena;
        // SAFETY: `vmm` never outlives `arena`, and `arena` is only touched
        // through `vmm` after this point.
        let mut vmm = Vmm::new(unsafe { &*arena_ptr }, &mut arena);

        let engine = ThreadEngine::new(TestScheduler::default());
        let process = Process::for_test(Pid::from_raw(1), None, fake_context(1));

        let entry = VirtualAddress::new(0x1000);
        let thread = unsafe {
            engine
                .create(&mut vmm, &kernel_ctx, &process, entry, &[], true)
                .expect("kernel thread creation should not need remap or a real MMU")
        };

        assert_eq!(thread.saved_cpu_state.with_lock(|s| s.rsp), thread.kernel_stack_top.as_u64());
        assert_eq!(thread.saved_cpu_state.with_lock(|s| s.cs), KERNEL_CS);
        assert!(thread.user_stack_bottom.is_none());
        assert_eq!(engine.find(thread.tid).map(|t| t.tid), Some(thread.tid));
        assert_eq!(process.with_threads(|t| t.len()), 1);

        engine.destroy(&mut vmm, &kernel_ctx, &process, &thread);
        assert!(engine.find(thread.tid).is_none());
        assert_eq!(process.with_threads(|t| t.len()), 0);
    }
}
