//! The scheduler as an external collaborator (spec §6).
//!
//! The ready-queue itself lives outside this crate; everything here reaches
//! it through this trait so the block/unblock state machine can be
//! exercised on a host with a trivial in-memory double, the same way
//! `kernel-alloc::vmm::Vmm` is generic over `PhysMapper`/`FrameAlloc`.

use crate::Tid;

/// Ready-queue operations the thread engine needs.
pub trait Scheduler {
    /// Blocking enqueue: must succeed (spec: "synchronous `scheduler_add`").
    fn scheduler_add(&self, tid: Tid);

    /// Non-blocking enqueue for a bounded ready queue; `false` if the queue
    /// is full and the caller must leave the thread blocked.
    fn scheduler_try_add(&self, tid: Tid) -> bool;

    /// Remove a thread from the ready set (called right after it transitions
    /// to `BLOCKED`).
    fn scheduler_remove(&self, tid: Tid);

    /// Voluntarily give up the CPU until rescheduled.
    fn yield_now(&self);
}
