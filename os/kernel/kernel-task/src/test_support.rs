//! Host-only test doubles shared by this crate's unit tests, in the same
//! spirit as `kernel-alloc`'s `TestArena` and `HostPagePool`: swap the real
//! collaborator (here, the scheduler and a hardware-resident VMM context)
//! for an in-memory stand-in so the block/unblock state machine can run as
//! an ordinary host test.
#![cfg(test)]

use std::boxed::Box;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::vec::Vec;

use kernel_alloc::vmm::Context;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_vmem::{FrameAlloc, PageTable, PhysMapper};

use crate::Tid;
use crate::scheduler::Scheduler;

const PAGE_SIZE: u64 = 4096;

/// A placeholder PML4 frame. Safe to hand to [`crate::process::Process::for_test`]
/// because none of the paths exercised in these tests (`block_self`,
/// `wait_child`, semaphore acquire/release) ever map through a process's
/// `context`.
pub(crate) fn fake_context(tag: u64) -> Context {
    Context::from_pml4(PhysicalPage::from_addr(PhysicalAddress::new(0x1000 * tag)))
}

/// Host-side stand-in for physical memory, mirroring `kernel-alloc`'s own
/// `TestArena`: a pool of zeroed 4 KiB frames addressed by index, so a real
/// [`kernel_alloc::vmm::Vmm`] can be driven without an MMU. Used for the
/// `kernel == true` thread-creation path, which never calls `Vmm::remap` (so
/// it never needs a real CR3-resident recursive mapping).
pub(crate) struct TestArena {
    frames: RefCell<Vec<Box<PageTable>>>,
    free: RefCell<Vec<u32>>,
}

impl TestArena {
    pub(crate) fn new(capacity: usize) -> Self {
        let mut frames = Vec::with_capacity(capacity);
        let mut free = Vec::with_capacity(capacity);
        for i in 0..capacity {
            frames.push(Box::new(PageTable::zeroed()));
            free.push(i as u32);
        }
        free.reverse();
        Self {
            frames: RefCell::new(frames),
            free: RefCell::new(free),
        }
    }

    fn phys_of(idx: u32) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(PhysicalAddress::new(u64::from(idx) * PAGE_SIZE))
    }

    fn idx_of(p: PhysicalPage<Size4K>) -> u32 {
        (p.base().as_u64() / PAGE_SIZE) as u32
    }
}

impl FrameAlloc for TestArena {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        let idx = self.free.get_mut().pop()?;
        Some(Self::phys_of(idx))
    }

    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        self.free.get_mut().push(Self::idx_of(frame));
    }
}

impl PhysMapper for TestArena {
    unsafe fn map_table(&self, page: PhysicalPage<Size4K>) -> *mut PageTable {
        let idx = Self::idx_of(page) as usize;
        core::ptr::addr_of_mut!(*self.frames.borrow_mut()[idx])
    }
}

/// A bare context backed by a single zeroed `TestArena` frame — enough for
/// `Vmm::sys_alloc`/`free` to walk and extend, without the self-referencing
/// PML4 slot `Vmm::create_context` sets up (unneeded for `sys_alloc`/`free`).
pub(crate) fn arena_context(arena: &mut TestArena) -> Context {
    let pml4 = FrameAlloc::alloc_4k(arena).expect("fresh arena has free frames");
    Context::from_pml4(pml4)
}

#[derive(Default)]
pub(crate) struct TestScheduler {
    ready: Mutex<VecDeque<Tid>>,
}

impl TestScheduler {
    pub(crate) fn ready_len(&self) -> usize {
        self.ready.lock().unwrap().len()
    }

    pub(crate) fn pop_ready(&self) -> Option<Tid> {
        self.ready.lock().unwrap().pop_front()
    }
}

impl Scheduler for TestScheduler {
    fn scheduler_add(&self, tid: Tid) {
        self.ready.lock().unwrap().push_back(tid);
    }

    fn scheduler_try_add(&self, tid: Tid) -> bool {
        self.ready.lock().unwrap().push_back(tid);
        true
    }

    fn scheduler_remove(&self, tid: Tid) {
        self.ready.lock().unwrap().retain(|t| *t != tid);
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }
}
