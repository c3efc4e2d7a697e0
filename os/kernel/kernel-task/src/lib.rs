//! # Thread/Process Model with Cooperative Blocking
//!
//! This crate hosts the three pieces that sit directly on top of the VMM
//! ([`kernel_alloc::vmm`]) and give the kernel preemptible threads of
//! execution:
//!
//! - [`status`] — the packed, single-CAS thread status word.
//! - [`thread`] — [`thread::Thread`] and [`thread::ThreadEngine`]: stack
//!   setup, block/unblock, destruction.
//! - [`process`] — [`process::Process`] and [`process::ProcessManager`]:
//!   process lifecycle, `wait`/`exit`, the stream table.
//! - [`semaphore`] — [`semaphore::Semaphore`], a counting semaphore with
//!   FIFO waiters built on [`thread::ThreadEngine::block_self`].
//!
//! The scheduler itself is an external collaborator: every operation here
//! that needs to add/remove a thread from the ready set goes through the
//! [`scheduler::Scheduler`] trait, the same dependency-injection shape
//! `kernel-alloc::vmm::Vmm` uses for `PhysMapper`/`FrameAlloc`. This keeps
//! the block/unblock state machine testable on a host with a trivial
//! in-memory scheduler double.
//!
//! ## Concurrency model
//!
//! This crate assumes a single CPU (spec-scoped: SMP is out of scope).
//! Thread state transitions are serialized by a single-word compare-and-swap
//! on [`status::ThreadStatus`]; no lock is needed for `state`/`block_reason`
//! themselves. Everything else (process tables, wait queues, the heap of
//! `Thread`/`Process` descriptors) is protected by [`kernel_sync::SpinLock`],
//! matching the coarse-exclusion style the VMM uses around its own
//! mutations.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod process;
pub mod scheduler;
pub mod semaphore;
pub mod status;
#[cfg(test)]
mod test_support;
pub mod thread;

pub use scheduler::Scheduler;
pub use status::{BlockReason, ThreadState, ThreadStatus};

/// Thread identifier, handed out by [`thread::ThreadEngine`] from a
/// monotonic atomic counter starting at 1 (tid 0 is never issued, so it can
/// serve as a niche "no thread" sentinel where convenient).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Tid(u64);

impl Tid {
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Process identifier, handed out by [`process::ProcessManager`] from a
/// monotonic atomic counter starting at 1.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Pid(u64);

impl Pid {
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Opaque VFS stream descriptor. The VFS itself is an external collaborator
/// (spec §6); the process manager only stores the three handles a process
/// is constructed with and hands them back on request.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StreamHandle(pub u64);
