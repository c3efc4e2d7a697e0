//! # Unified page-table entry and table types
//!
//! This crate's paging model is deliberately uniform across all four levels
//! (PML4, PDP, PD, PT): there are no huge-page leaves, so a PML4E, PDPTE, PDE
//! and PTE all share the same layout — present/permission/caching bits, the
//! AVL software field, a 40-bit next-frame pointer, and NX. [`PageTableEntry`]
//! models that one shape; [`PageTable`] is the 512-entry, 4 KiB-aligned array
//! used at every level. Whether an entry's `phys_addr` names a child table or
//! a leaf frame is a property of which level it lives at, not of the entry
//! itself.

use crate::avl::AvlFlags;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// A single page-table entry, valid at any of the four paging levels.
///
/// Bit layout:
/// - 0 `present`, 1 `writable`, 2 `user`, 3 `write_through`, 4 `cache_disable`,
///   5 `accessed`, 6 `dirty`, 7 `pat`, 8 `global` — standard hardware bits.
/// - 9..11 — AVL low: `avl_kernelspace`, `avl_pointer_to_pml4`, `avl_page_full`.
/// - 12..51 — 4 KiB-aligned physical frame/table address.
/// - 52 — AVL high: `avl_unused_page`.
/// - 53..62 — reserved, always zero.
/// - 63 `no_execute`.
#[bitfield(u64)]
pub struct PageTableEntry {
    /// Present (bit 0): valid entry if set.
    pub present: bool,
    /// Writable (bit 1).
    pub writable: bool,
    /// User/Supervisor (bit 2).
    pub user: bool,
    /// Page Write-Through (bit 3).
    pub write_through: bool,
    /// Page Cache Disable (bit 4).
    pub cache_disable: bool,
    /// Accessed (bit 5): set by the CPU on first access.
    pub accessed: bool,
    /// Dirty (bit 6): set by the CPU on first write (leaf entries only).
    pub dirty: bool,
    /// PAT selector bit (bit 7, leaf entries only).
    pub pat: bool,
    /// Global (bit 8): TLB entry survives a CR3 reload (leaf entries only).
    pub global: bool,
    /// AVL: [`AvlFlags::kernelspace`].
    pub avl_kernelspace: bool,
    /// AVL: [`AvlFlags::pointer_to_pml4`].
    pub avl_pointer_to_pml4: bool,
    /// AVL: page-full cache bit, see [`AvlFlags`].
    pub avl_page_full: bool,
    /// Physical base of the next-level table, or of the mapped frame at a
    /// leaf (bits 12..51, 4 KiB-aligned).
    #[bits(40)]
    phys_addr_51_12: u64,
    /// AVL: range reserved but not yet backed by a frame.
    pub avl_unused_page: bool,
    /// Reserved, always zero.
    #[bits(10)]
    reserved: u16,
    /// No-Execute (bit 63).
    pub no_execute: bool,
}

impl PageTableEntry {
    /// A fully zeroed (non-present) entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    /// Read the AVL flags as a disjoint union.
    #[inline]
    #[must_use]
    pub const fn avl(self) -> AvlFlags {
        AvlFlags {
            kernelspace: self.avl_kernelspace(),
            pointer_to_pml4: self.avl_pointer_to_pml4(),
            page_full: self.avl_page_full(),
            unused_page: self.avl_unused_page(),
        }
    }

    /// Overwrite the AVL flags.
    #[inline]
    pub const fn set_avl(&mut self, flags: AvlFlags) {
        self.set_avl_kernelspace(flags.kernelspace);
        self.set_avl_pointer_to_pml4(flags.pointer_to_pml4);
        self.set_avl_page_full(flags.page_full);
        self.set_avl_unused_page(flags.unused_page);
    }

    /// Builder form of [`Self::set_avl`].
    #[inline]
    #[must_use]
    pub const fn with_avl(mut self, flags: AvlFlags) -> Self {
        self.set_avl(flags);
        self
    }

    /// Set the 4 KiB-aligned physical address (frame or next-level table).
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalPage<Size4K>) {
        self.set_phys_addr_51_12(phys.base().as_u64() >> 12);
    }

    /// Builder form of [`Self::set_physical_address`].
    #[inline]
    #[must_use]
    pub const fn with_physical_address(mut self, phys: PhysicalPage<Size4K>) -> Self {
        self.set_physical_address(phys);
        self
    }

    /// Read the 4 KiB-aligned physical address.
    #[inline]
    #[must_use]
    pub const fn physical_address(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(PhysicalAddress::new(self.phys_addr_51_12() << 12))
    }

    /// Whether, per spec's allocated invariant, this slot counts as
    /// allocated: `present` or carrying `avl_unused_page`.
    #[inline]
    #[must_use]
    pub const fn is_allocated(self) -> bool {
        self.present() || self.avl_unused_page()
    }

    /// Whether this slot is "live" for the purposes of the parent-reclaim
    /// check on `unmap`: present, kernel-owned, or reserved-but-unused.
    #[inline]
    #[must_use]
    pub const fn is_live(self) -> bool {
        self.present() || self.avl_kernelspace() || self.avl_unused_page()
    }
}

/// One paging-structure table: 512 entries, 4 KiB-aligned, used at every
/// level (PML4, PDP, PD, PT).
#[repr(C, align(4096))]
#[derive(Copy, Clone)]
pub struct PageTable {
    entries: [PageTableEntry; 512],
}

impl PageTable {
    /// A fully zeroed table (every entry non-present).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::zero(); 512],
        }
    }

    /// Read the entry at `i`. Plain load; implies no TLB synchronization.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: impl TableIndex) -> PageTableEntry {
        self.entries[i.as_usize()]
    }

    /// Write the entry at `i`. Caller handles any required TLB
    /// invalidation when mutating an active mapping.
    #[inline]
    pub const fn set(&mut self, i: impl TableIndex, e: PageTableEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// Iterate all 512 entries in index order.
    #[inline]
    pub fn iter(&self) -> core::slice::Iter<'_, PageTableEntry> {
        self.entries.iter()
    }

    /// True once every entry is [`PageTableEntry::is_allocated`] — the
    /// condition that makes `PAGE_FULL` legitimate on this table's parent.
    #[inline]
    #[must_use]
    pub fn is_fully_allocated(&self) -> bool {
        self.entries.iter().all(|e| e.is_allocated())
    }
}

/// Common behavior of the four level-index newtypes so [`PageTable::get`]/
/// [`PageTable::set`] can be written once.
pub trait TableIndex: Copy {
    fn as_usize(self) -> usize;
}

macro_rules! level_index {
    ($name:ident, $shift:expr, $doc:expr) => {
        #[doc = $doc]
        #[repr(transparent)]
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
        pub struct $name(u16);

        impl $name {
            /// Extract this level's 9-bit index from a virtual address.
            #[inline]
            #[must_use]
            pub const fn from(va: VirtualAddress) -> Self {
                Self::new(((va.as_u64() >> $shift) & 0x1FF) as u16)
            }

            /// Construct from a raw index. Debug-asserts `v < 512`.
            #[inline]
            #[must_use]
            pub const fn new(v: u16) -> Self {
                debug_assert!(v < 512);
                Self(v)
            }

            #[inline]
            #[must_use]
            pub const fn as_u16(self) -> u16 {
                self.0
            }
        }

        impl TableIndex for $name {
            #[inline]
            fn as_usize(self) -> usize {
                self.0 as usize
            }
        }
    };
}

level_index!(L4Index, 39, "Index into a PML4 (VA bits 47..39).");
level_index!(L3Index, 30, "Index into a PDP table (VA bits 38..30).");
level_index!(L2Index, 21, "Index into a PD table (VA bits 29..21).");
level_index!(L1Index, 12, "Index into a PT table (VA bits 20..12).");

/// Split a virtual address into its four level indices.
#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (L4Index, L3Index, L2Index, L1Index) {
    (
        L4Index::from(va),
        L3Index::from(va),
        L2Index::from(va),
        L1Index::from(va),
    )
}

/// Sign-extend bit 47 into bits 63..48, producing a canonical x86_64 address
/// from the 48 meaningful low bits.
#[inline]
#[must_use]
pub const fn canonicalize(addr: u64) -> u64 {
    let shifted = (addr << 16) as i64;
    (shifted >> 16) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trips_address_and_avl() {
        let frame = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x0012_3000));
        let e = PageTableEntry::zero()
            .with_present(true)
            .with_writable(true)
            .with_physical_address(frame)
            .with_avl(AvlFlags::unused_page());

        assert!(e.present());
        assert!(e.writable());
        assert_eq!(e.physical_address().base().as_u64(), 0x0012_3000);
        assert!(e.avl().unused_page);
        assert!(e.is_allocated());
    }

    #[test]
    fn avl_bits_do_not_alias_the_address_field() {
        let frame = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x0000_1000));
        let e = PageTableEntry::zero()
            .with_physical_address(frame)
            .with_avl(AvlFlags {
                kernelspace: true,
                pointer_to_pml4: true,
                page_full: true,
                unused_page: true,
            });
        assert_eq!(e.physical_address().base().as_u64(), 0x0000_1000);
        let avl = e.avl();
        assert!(avl.kernelspace && avl.pointer_to_pml4 && avl.page_full && avl.unused_page);
    }

    #[test]
    fn table_is_fully_allocated_when_every_entry_is() {
        let mut t = PageTable::zeroed();
        assert!(!t.is_fully_allocated());
        for i in 0u16..512 {
            t.set(
                L1Index::new(i),
                PageTableEntry::zero().with_avl(AvlFlags::unused_page()),
            );
        }
        assert!(t.is_fully_allocated());
    }

    #[test]
    fn split_indices_extracts_all_four_levels() {
        let va = VirtualAddress::new(canonicalize(0x0000_8888_0123_4567));
        let (i4, i3, i2, i1) = split_indices(va);
        assert!(i4.as_u16() < 512);
        assert!(i3.as_u16() < 512);
        assert!(i2.as_u16() < 512);
        assert!(i1.as_u16() < 512);
    }

    #[test]
    fn canonicalize_sign_extends_bit_47() {
        assert_eq!(canonicalize(0x0000_8000_0000_0000), 0xFFFF_8000_0000_0000);
        assert_eq!(canonicalize(0x0000_7FFF_FFFF_FFFF), 0x0000_7FFF_FFFF_FFFF);
    }
}
