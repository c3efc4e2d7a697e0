//! # Semaphore
//!
//! A counting semaphore with FIFO waiters, built directly on
//! [`ThreadEngine::block_self`]/[`ThreadEngine::unblock`] rather than its own
//! spinning (spec §4.6). Grounded on `examples/original_source/util/
//! semaphore.c`: `acquire` unconditionally decrements the count first and
//! only parks if that drove it negative; `release` increments the count and
//! wakes the oldest waiter, and doubles as the bail-out callback `acquire`
//! hands to [`ThreadEngine::block_self`] for a thread whose process
//! terminates while parked (`semaphore.c:31-45`'s `thread_bail_out_t`).

use alloc::collections::VecDeque;

use kernel_sync::SpinLock;

use crate::Tid;
use crate::process::Process;
use crate::scheduler::Scheduler;
use crate::status::BlockReason;
use crate::thread::{Thread, ThreadEngine};

struct SemState {
    count: i64,
    waiters: VecDeque<Tid>,
}

/// A counting semaphore. `count` goes negative once waiters are parked: a
/// blocked `acquire` has already taken its decrement, so `count + waiters`
/// always equals `initial + releases - acquires` (spec §3's data-model
/// invariant), with the magnitude of a negative `count` equal to the number
/// of threads currently parked.
pub struct Semaphore {
    state: SpinLock<SemState>,
}

impl Semaphore {
    #[must_use]
    pub fn new(initial: i64) -> Self {
        Self {
            state: SpinLock::new(SemState {
                count: initial,
                waiters: VecDeque::new(),
            }),
        }
    }

    #[must_use]
    pub fn count(&self) -> i64 {
        self.state.with_lock(|s| s.count)
    }

    /// Acquire one permit, blocking `calling_thread` if none are available.
    /// Decrements `count` unconditionally first (`semaphore_acquire`'s
    /// `__sync_fetch_and_add(&sem->count, -1)`) and only parks if that left
    /// it negative. Returns `false` if `calling_thread`'s process terminated
    /// while parked (mirroring [`ThreadEngine::block_self`]'s bail path) —
    /// the caller never got to run past the wakeup in that case.
    pub fn acquire<S: Scheduler>(
        &self,
        threads: &ThreadEngine<S>,
        process: &Process,
        calling_thread: &Thread,
    ) -> bool {
        let remaining = self.state.with_lock(|s| {
            s.count -= 1;
            if s.count < 0 {
                s.waiters.push_back(calling_thread.tid);
            }
            s.count
        });
        if remaining >= 0 {
            return true;
        }

        // The bail callback is `release` itself, not a dequeue-self no-op:
        // a thread that never gets to run after waking still owes the
        // permit it optimistically took above back to the semaphore.
        threads.block_self(calling_thread, process, BlockReason::Semaphore, || {
            self.release(threads);
        })
    }

    /// Release one permit: wake the oldest waiter if there is one, else
    /// make the permit available for the next `acquire`.
    pub fn release<S: Scheduler>(&self, threads: &ThreadEngine<S>) {
        let woken = self.state.with_lock(|s| {
            s.count += 1;
            s.waiters.pop_front()
        });
        if let Some(tid) = woken
            && let Some(thread) = threads.find(tid)
        {
            threads.unblock(&thread);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Pid;
    use crate::process::Process;
    use crate::status::ThreadState;
    use crate::test_support::{TestScheduler, fake_context};
    use std::sync::Arc as StdArc;
    use std::sync::Mutex;

    #[test]
    fn acquire_does_not_block_when_permits_available() {
        let engine = ThreadEngine::new(TestScheduler::default());
        let process = Process::for_test(Pid::from_raw(1), None, fake_context(1));
        let thread = Thread::for_test(Tid::from_raw(1), process.pid());
        thread.status.store(ThreadState::Running, BlockReason::NotBlocked);

        let sem = Semaphore::new(1);
        assert!(sem.acquire(&engine, &process, &thread));
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn release_wakes_waiters_in_fifo_order() {
        let engine = StdArc::new(ThreadEngine::new(TestScheduler::default()));
        let process = StdArc::new(Process::for_test(Pid::from_raw(1), None, fake_context(1)));
        let sem = StdArc::new(Semaphore::new(0));

        let t1 = StdArc::new(Thread::for_test(Tid::from_raw(10), process.pid()));
        let t2 = StdArc::new(Thread::for_test(Tid::from_raw(11), process.pid()));
        t1.status.store(ThreadState::Running, BlockReason::NotBlocked);
        t2.status.store(ThreadState::Running, BlockReason::NotBlocked);
        engine.with_threads(|t| {
            t.push(t1.clone());
            t.push(t2.clone());
        });

        let order = StdArc::new(Mutex::new(Vec::new()));

        let (e1, p1, s1, o1, th1) = (engine.clone(), process.clone(), sem.clone(), order.clone(), t1.clone());
        let h1 = std::thread::spawn(move || {
            assert!(s1.acquire(&e1, &p1, &th1));
            o1.lock().unwrap().push(th1.tid.as_u64());
        });
        while t1.status.state() != ThreadState::Blocked {
            std::thread::yield_now();
        }

        let (e2, p2, s2, o2, th2) = (engine.clone(), process.clone(), sem.clone(), order.clone(), t2.clone());
        let h2 = std::thread::spawn(move || {
            assert!(s2.acquire(&e2, &p2, &th2));
            o2.lock().unwrap().push(th2.tid.as_u64());
        });
        while t2.status.state() != ThreadState::Blocked {
            std::thread::yield_now();
        }

        sem.release(&engine);
        h1.join().unwrap();

        sem.release(&engine);
        h2.join().unwrap();

        assert_eq!(*order.lock().unwrap(), vec![10, 11]);
    }

    #[test]
    fn acquire_bails_and_its_release_hands_the_permit_to_the_next_waiter() {
        // Two waiters in different processes: `dying`'s process terminates
        // while it's parked, so its bail path runs `release` on its behalf
        // (semaphore.c:37's `thread_bail_out_t`) rather than just dropping
        // off the wait queue — that release is what actually wakes `other`.
        let engine = StdArc::new(ThreadEngine::new(TestScheduler::default()));
        let dying_process = StdArc::new(Process::for_test(Pid::from_raw(1), None, fake_context(1)));
        let other_process = StdArc::new(Process::for_test(Pid::from_raw(2), None, fake_context(2)));
        let dying_thread = StdArc::new(Thread::for_test(Tid::from_raw(5), dying_process.pid()));
        let other_thread = StdArc::new(Thread::for_test(Tid::from_raw(6), other_process.pid()));
        dying_thread.status.store(ThreadState::Running, BlockReason::NotBlocked);
        other_thread.status.store(ThreadState::Running, BlockReason::NotBlocked);
        engine.with_threads(|t| {
            t.push(dying_thread.clone());
            t.push(other_thread.clone());
        });
        let sem = StdArc::new(Semaphore::new(0));

        let (e1, p1, t1, s1) = (engine.clone(), other_process.clone(), other_thread.clone(), sem.clone());
        let h1 = std::thread::spawn(move || s1.acquire(&e1, &p1, &t1));
        while other_thread.status.state() != ThreadState::Blocked {
            std::thread::yield_now();
        }

        let (e2, p2, t2, s2) = (engine.clone(), dying_process.clone(), dying_thread.clone(), sem.clone());
        let h2 = std::thread::spawn(move || s2.acquire(&e2, &p2, &t2));
        while dying_thread.status.state() != ThreadState::Blocked {
            std::thread::yield_now();
        }

        dying_process.terminate_for_test(0);
        engine.unblock(&dying_thread);

        assert!(!h2.join().unwrap());
        assert!(h1.join().unwrap());
        assert_eq!(sem.count(), -1);
    }
}
