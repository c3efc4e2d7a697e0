//! # Memory Layout

/// End of userspace VA range after which Kernel space begins.
pub const LAST_USERSPACE_ADDRESS: u64 = 0xffff_0000_0000_0000;

/// End of userspace VA range after which Kernel space begins.
pub const USERSPACE_END: u64 = 0xffff_0000_0000_0000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Where the kernel executes (VMA), matches your linker script.
///
/// # Kernel Build
/// This information is sourced in the kernel's `build.rs` to configure
/// the linker.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Where you place the bytes in *physical* memory (LMA) before paging.
///
/// # Kernel Build
/// This information is sourced in the kernel's `build.rs` to configure
/// the linker.
pub const PHYS_LOAD: u64 = 0x0010_0000; // 1 MiB

/// Keep a tiny identity map so the paging switch code remains executable
/// right after CR3 reload (and to let you pass low pointers if you want).
pub const IDENTITY_LOW_BYTES: u64 = 0x20_0000; // 2 MiB

/// Start of the VA range the VMM hands out for ordinary user allocations
/// (`vmm_Alloc`); kept well clear of the low identity map and any fixed
/// loader addresses.
pub const USERSPACE_START: u64 = 0x0000_0001_0000_0000; // 4 GiB

/// Start of the VA range the VMM manages for kernel-only allocations
/// (`vmm_SysAlloc`, heap growth, DMA windows): everything from the HHDM
/// upward that isn't the fixed kernel image itself.
pub const KERNELSPACE_START: u64 = HHDM_BASE;

/// End (exclusive) of the kernel-allocatable VA range. Must stay below the
/// recursive self-mapping window a `kernel-vmem` `Context` reserves for
/// editing its own tables (PML4 slot 511, `RECURSIVE_PT_BASE` upward) — that
/// window is not a candidate for `vmm_SysAlloc`.
pub const KERNELSPACE_END: u64 = 0xffff_ff80_0000_0000;

/// Fixed size of every user thread's user-mode stack (`thread_create`'s
/// `vmm_ReMap` destination range).
pub const USER_STACK_SIZE: u64 = 16 * 4096;

/// Unmapped guard page placed below each user stack so a stack overflow
/// faults instead of silently corrupting the next thread's stack.
pub const USER_STACK_GUARD_SIZE: u64 = 4096;

/// Pages given to a user thread's kernel-mode stack (used while it is
/// executing a syscall or has been preempted).
pub const THREAD_KERNEL_STACK_PAGES: u64 = 1;

/// The size of the kernel stack in debug builds.
#[cfg(debug_assertions)]
pub const KERNEL_STACK_SIZE: usize = 32 * 1024;

/// The size of the kernel stack in release builds.
#[cfg(not(debug_assertions))]
pub const KERNEL_STACK_SIZE: usize = 32 * 1024;

const _: () = {
    assert!(KERNEL_STACK_SIZE.is_multiple_of(4096));
    assert!(HHDM_BASE >= LAST_USERSPACE_ADDRESS);
    assert!(KERNEL_BASE > HHDM_BASE);
    assert!(USERSPACE_START < LAST_USERSPACE_ADDRESS);
    assert!(KERNELSPACE_START < KERNELSPACE_END);
    assert!(KERNELSPACE_END <= KERNEL_BASE);
};
