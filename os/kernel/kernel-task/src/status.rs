//! Packed thread status word.
//!
//! `state` and `block_reason` are two small fields that must transition
//! together under a single compare-and-swap (spec §4.5, §9): a thread must
//! never be observed `RUNNING` with a stale `block_reason`, or `BLOCKED`
//! with no reason at all. Packing both into one `AtomicU32` is what makes
//! `block`/`try_unblock`/`unblock` lock-free single-instruction operations
//! instead of a lock around two separate fields.

use core::sync::atomic::{AtomicU32, Ordering};

/// Whether a thread is runnable or parked waiting on something.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum ThreadState {
    Running = 0,
    Blocked = 1,
}

/// Which subsystem parked a `BLOCKED` thread. `NotBlocked` is the only
/// valid reason while `state == Running`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum BlockReason {
    NotBlocked = 0,
    UserIo = 1,
    Semaphore = 2,
    WaitChild = 3,
}

impl BlockReason {
    const fn from_bits(bits: u8) -> Self {
        match bits & 0b111 {
            1 => Self::UserIo,
            2 => Self::Semaphore,
            3 => Self::WaitChild,
            _ => Self::NotBlocked,
        }
    }
}

const REASON_SHIFT: u32 = 1;

const fn pack(state: ThreadState, reason: BlockReason) -> u32 {
    (state as u32) | ((reason as u32) << REASON_SHIFT)
}

const fn unpack(bits: u32) -> (ThreadState, BlockReason) {
    let state = if bits & 1 == 0 {
        ThreadState::Running
    } else {
        ThreadState::Blocked
    };
    let reason = BlockReason::from_bits((bits >> REASON_SHIFT) as u8);
    (state, reason)
}

/// A `{state, block_reason}` pair packed into one machine word, mutated
/// only through compare-and-swap.
#[derive(Debug)]
pub struct ThreadStatus(AtomicU32);

impl ThreadStatus {
    #[inline]
    #[must_use]
    pub const fn new(state: ThreadState, reason: BlockReason) -> Self {
        Self(AtomicU32::new(pack(state, reason)))
    }

    /// A freshly created thread starts `BLOCKED`/`NOT_BLOCKED` (spec §4.5:
    /// `thread_create` sets this before the thread is ever handed to the
    /// scheduler; the caller unblocks it once setup completes).
    #[inline]
    #[must_use]
    pub const fn new_blocked() -> Self {
        Self::new(ThreadState::Blocked, BlockReason::NotBlocked)
    }

    #[inline]
    #[must_use]
    pub fn load(&self) -> (ThreadState, BlockReason) {
        unpack(self.0.load(Ordering::Acquire))
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> ThreadState {
        self.load().0
    }

    /// Atomically move from `expected` to `new`. Returns whether the CAS
    /// succeeded.
    #[inline]
    #[must_use]
    pub fn compare_exchange(
        &self,
        expected: (ThreadState, BlockReason),
        new: (ThreadState, BlockReason),
    ) -> bool {
        self.0
            .compare_exchange(
                pack(expected.0, expected.1),
                pack(new.0, new.1),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Unconditional store, used only to revert a `try_unblock` whose
    /// scheduler enqueue was rejected (spec §4.5).
    #[inline]
    pub fn store(&self, state: ThreadState, reason: BlockReason) {
        self.0.store(pack(state, reason), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_reason() {
        for reason in [
            BlockReason::NotBlocked,
            BlockReason::UserIo,
            BlockReason::Semaphore,
            BlockReason::WaitChild,
        ] {
            let s = ThreadStatus::new(ThreadState::Blocked, reason);
            assert_eq!(s.load(), (ThreadState::Blocked, reason));
        }
    }

    #[test]
    fn compare_exchange_fails_on_mismatch() {
        let s = ThreadStatus::new(ThreadState::Running, BlockReason::NotBlocked);
        assert!(!s.compare_exchange(
            (ThreadState::Blocked, BlockReason::NotBlocked),
            (ThreadState::Running, BlockReason::NotBlocked)
        ));
        assert!(s.compare_exchange(
            (ThreadState::Running, BlockReason::NotBlocked),
            (ThreadState::Blocked, BlockReason::Semaphore)
        ));
        assert_eq!(s.load(), (ThreadState::Blocked, BlockReason::Semaphore));
    }
}
