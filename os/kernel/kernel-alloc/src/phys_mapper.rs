//! # Higher Half Direct Map physical mapper
//!
//! Implements [`kernel_vmem::PhysMapper`] by reading/writing table frames
//! through the HHDM rather than the recursive self-mapping trick. Every
//! physical frame is reachable this way regardless of which context is
//! currently loaded in CR3, which is what lets [`crate::vmm::Vmm`] edit a
//! context's tables while a different context is active.
//!
//! [`crate::vmm::Vmm`]'s `remap` deliberately does *not* go through this
//! mapper to resolve its source address: it walks the recursive view of
//! whichever context is currently loaded, which is the source of the
//! `remap` limitation documented there.

use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::{PhysicalPage, Size4K};
use kernel_vmem::{PageTable, PhysMapper};

/// Maps any physical frame at `HHDM_BASE + pa`.
#[derive(Debug, Default, Copy, Clone)]
pub struct HhdmPhysMapper;

impl PhysMapper for HhdmPhysMapper {
    unsafe fn map_table(&self, page: PhysicalPage<Size4K>) -> *mut PageTable {
        let va = HHDM_BASE + page.base().as_u64();
        va as *mut PageTable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PhysicalAddress;

    #[test]
    fn maps_frame_at_hhdm_offset() {
        let mapper = HhdmPhysMapper;
        let frame = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x0040_0000));
        let ptr = unsafe { mapper.map_table(frame) };
        assert_eq!(ptr as u64, HHDM_BASE + 0x0040_0000);
    }
}
