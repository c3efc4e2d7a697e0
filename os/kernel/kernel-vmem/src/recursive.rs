//! # Recursive self-mapping
//!
//! The last PML4 slot (511) points back at the PML4 itself. Walking the
//! paging hierarchy through that slot yields fixed virtual addresses at
//! which the *current* CR3's PML4/PDP/PD/PT are directly accessible for
//! editing, without any extra temporary mapping (spec §4.2).
//!
//! For a context that is not currently active, the VMM instead temporarily
//! maps that context's tables into kernel space (see `kernel-alloc::vmm`);
//! the constants here only describe the recursive view of the *active*
//! context.

use crate::entry::{L1Index, L2Index, L3Index, L4Index};
use kernel_memory_addresses::VirtualAddress;

/// The self-referencing PML4 slot.
pub const PML4_SELF_REF_INDEX: u16 = 511;

/// Base virtual address of the recursively-mapped PT region: the PT that
/// backs (PML4 slot 0, PDP slot 0, PD slot 0) lives here; every other PT is
/// reachable at `RECURSIVE_PT_BASE + (l4 << 30 | l3 << 21 | l2 << 12)`.
pub const RECURSIVE_PT_BASE: u64 = 0xFFFF_FF80_0000_0000;

/// Base virtual address of the recursively-mapped PD region.
pub const RECURSIVE_PD_BASE: u64 = 0xFFFF_FFFF_C000_0000;

/// Base virtual address of the recursively-mapped PDP region.
pub const RECURSIVE_PDPT_BASE: u64 = 0xFFFF_FFFF_FFE0_0000;

/// Virtual address at which the active PML4 is directly accessible.
pub const RECURSIVE_PML4_BASE: u64 = 0xFFFF_FFFF_FFFF_F000;

/// Virtual address of the active context's PML4 table.
#[inline]
#[must_use]
pub const fn pml4_virt() -> VirtualAddress {
    VirtualAddress::new(RECURSIVE_PML4_BASE)
}

/// Virtual address of the active context's PDP table for PML4 slot `l4`.
#[inline]
#[must_use]
pub const fn pdpt_virt(l4: L4Index) -> VirtualAddress {
    VirtualAddress::new(RECURSIVE_PDPT_BASE + ((l4.as_u16() as u64) << 12))
}

/// Virtual address of the active context's PD table for (PML4 slot `l4`,
/// PDP slot `l3`).
#[inline]
#[must_use]
pub const fn pd_virt(l4: L4Index, l3: L3Index) -> VirtualAddress {
    VirtualAddress::new(RECURSIVE_PD_BASE + ((l4.as_u16() as u64) << 21) + ((l3.as_u16() as u64) << 12))
}

/// Virtual address of the active context's PT table for (PML4 slot `l4`,
/// PDP slot `l3`, PD slot `l2`).
#[inline]
#[must_use]
pub const fn pt_virt(l4: L4Index, l3: L3Index, l2: L2Index) -> VirtualAddress {
    VirtualAddress::new(
        RECURSIVE_PT_BASE
            + ((l4.as_u16() as u64) << 30)
            + ((l3.as_u16() as u64) << 21)
            + ((l2.as_u16() as u64) << 12),
    )
}

/// Invalidate the TLB entry for a single virtual page.
///
/// # Safety
/// Must only be called from kernel (ring 0) code; `vaddr` should name a page
/// whose mapping just changed.
#[cfg(target_arch = "x86_64")]
#[inline]
pub unsafe fn invalidate_tlb(vaddr: VirtualAddress) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) vaddr.as_u64(), options(nostack, preserves_flags));
    }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline]
pub unsafe fn invalidate_tlb(_vaddr: VirtualAddress) {}

/// Extract the PT index embedded in `l1`-position of a leaf lookup; exposed
/// so callers can keep referring to the four levels uniformly.
pub type LeafIndex = L1Index;
