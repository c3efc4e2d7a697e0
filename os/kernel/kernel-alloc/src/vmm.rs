//! # Virtual Memory Manager
//!
//! Owns the per-context paging hierarchy: creating and tearing down address
//! spaces, mapping and unmapping pages, finding free virtual ranges by
//! walking past `PAGE_FULL` subtrees, and the VA-space reservation
//! (`use_pages`/`unuse_pages`) that backs lazily-committed regions.
//!
//! Every table is reached through the [`PhysMapper`] (the HHDM in
//! [`crate::phys_mapper`]), so a [`Context`] can be edited whether or not it
//! is the one currently loaded in CR3 — with one exception, see
//! [`Vmm::remap`].

use kernel_info::memory::{KERNELSPACE_END, KERNELSPACE_START, LAST_USERSPACE_ADDRESS};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_registers::StoreRegisterUnsafe;
use kernel_registers::cr3::Cr3;
use kernel_vmem::{
    AvlFlags, DmaFrameAlloc, FrameAlloc, L1Index, L2Index, L3Index, L4Index, PML4_SELF_REF_INDEX,
    PageFlags, PageTable, PageTableEntry, PhysMapper, TableIndex, invalidate_tlb, pd_virt,
    pdpt_virt, pml4_virt, pt_virt, read_cr3_phys, split_indices,
};

const PAGE_SIZE: u64 = 4096;
const L4_STEP: u64 = 1 << 39;
const L3_STEP: u64 = 1 << 30;
const L2_STEP: u64 = 1 << 21;

/// A single virtual address space: just its PML4 frame. Everything else is
/// reachable by walking from there.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Context {
    pml4: PhysicalPage<Size4K>,
}

impl Context {
    #[inline]
    #[must_use]
    pub const fn pml4_phys(&self) -> PhysicalPage<Size4K> {
        self.pml4
    }

    /// Wrap an already-built PML4 frame as a context. Most callers obtain a
    /// `Context` from [`Vmm::current_context`] or [`Vmm::create_context`];
    /// this is for callers hand it a bare PML4 frame some other way (a
    /// loader protocol, a saved-off value from a previous boot stage, a
    /// host-side test double with its own frame arena).
    #[inline]
    #[must_use]
    pub const fn from_pml4(pml4: PhysicalPage<Size4K>) -> Self {
        Self { pml4 }
    }
}

/// Whether a virtual page is backed, reserved-but-unbacked, or free, per the
/// "allocated" invariant (`P=1 OR AVL & UNUSED_PAGE`).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageStatus {
    Free,
    Allocated,
}

#[derive(Debug, thiserror::Error)]
pub enum VmmError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("no free virtual range of the requested size")]
    OutOfVirtualSpace,
    #[error("address is not page-aligned")]
    Unaligned,
    #[error("address is already mapped")]
    AlreadyMapped,
    #[error("address is not mapped")]
    NotMapped,
}

/// Virtual memory manager: mediates every paging-structure edit through a
/// [`PhysMapper`] and a [`FrameAlloc`].
pub struct Vmm<'m, M: PhysMapper, A: FrameAlloc> {
    mapper: &'m M,
    alloc: &'m mut A,
}

impl<'m, M: PhysMapper, A: FrameAlloc> Vmm<'m, M, A> {
    #[must_use]
    pub fn new(mapper: &'m M, alloc: &'m mut A) -> Self {
        Self { mapper, alloc }
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn table(&self, page: PhysicalPage<Size4K>) -> &mut PageTable {
        // SAFETY: every frame reached here was allocated by `self.alloc` and
        // formatted as a `PageTable` before being linked into a hierarchy.
        unsafe { &mut *self.mapper.map_table(page) }
    }

    /// Wrap whatever PML4 is currently loaded in CR3 as a [`Context`]. Used
    /// once at boot to adopt the context the loader handed off.
    ///
    /// # Safety
    /// Must run at CPL0 with paging already enabled.
    #[must_use]
    pub unsafe fn current_context() -> Context {
        Context {
            pml4: PhysicalPage::from_addr(read_cr3_phys()),
        }
    }

    /// Load `ctx` into CR3.
    ///
    /// # Safety
    /// Must run at CPL0; replaces the live paging context for this CPU.
    pub unsafe fn activate(ctx: &Context) {
        let cr3 = Cr3::from_pml4_phys(ctx.pml4.base(), false, false);
        unsafe {
            cr3.store_unsafe();
        }
    }

    /// Create a new context sharing the kernel half (PML4 slots 256..510)
    /// with `kernel`, plus its own self-referencing slot 511.
    pub fn create_context(&mut self, kernel: &Context) -> Result<Context, VmmError> {
        let frame = self.alloc.alloc_4k().ok_or(VmmError::OutOfMemory)?;
        *self.table(frame) = PageTable::zeroed();

        let kernel_pml4 = self.table(kernel.pml4);
        let mut copied = [PageTableEntry::zero(); 256];
        for (i, slot) in copied.iter_mut().enumerate() {
            *slot = kernel_pml4.get(L4Index::new(256 + i as u16));
        }

        let table = self.table(frame);
        for (i, e) in copied.into_iter().enumerate() {
            table.set(L4Index::new(256 + i as u16), e);
        }

        let self_ref = PageTableEntry::zero()
            .with_present(true)
            .with_writable(true)
            .with_physical_address(frame)
            .with_avl(AvlFlags::kernelspace().union(AvlFlags::pointer_to_pml4()));
        table.set(L4Index::new(PML4_SELF_REF_INDEX), self_ref);

        Ok(Context { pml4: frame })
    }

    /// Tear down a context's user half (slots 0..256) and its own PML4
    /// frame. The kernel half is shared, never owned by this context, and is
    /// left untouched.
    pub fn delete_context(&mut self, ctx: Context) {
        let pml4 = self.table(ctx.pml4);
        let mut user_tables = [PageTableEntry::zero(); 256];
        for (i, slot) in user_tables.iter_mut().enumerate() {
            *slot = pml4.get(L4Index::new(i as u16));
        }
        for e in user_tables {
            if e.present() {
                self.free_pdpt(e.physical_address());
            }
        }
        self.alloc.free_4k(ctx.pml4);
    }

    fn free_pdpt(&mut self, pdpt: PhysicalPage<Size4K>) {
        let t = self.table(pdpt);
        for i in 0u16..512 {
            let e = t.get(L3Index::new(i));
            if e.present() {
                self.free_pd(e.physical_address());
            }
        }
        self.alloc.free_4k(pdpt);
    }

    fn free_pd(&mut self, pd: PhysicalPage<Size4K>) {
        let t = self.table(pd);
        for i in 0u16..512 {
            let e = t.get(L2Index::new(i));
            if e.present() {
                self.free_pt(e.physical_address());
            }
        }
        self.alloc.free_4k(pd);
    }

    fn free_pt(&mut self, pt: PhysicalPage<Size4K>) {
        let t = self.table(pt);
        for i in 0u16..512 {
            let e = t.get(L1Index::new(i));
            if e.present() {
                self.alloc.free_4k(e.physical_address());
            }
        }
        self.alloc.free_4k(pt);
    }

    fn ensure_child<I: TableIndex + Copy>(
        &mut self,
        parent: &mut PageTable,
        idx: I,
        kernelspace: bool,
    ) -> Result<PhysicalPage<Size4K>, VmmError> {
        let existing = parent.get(idx);
        if existing.present() {
            return Ok(existing.physical_address());
        }
        let frame = self.alloc.alloc_4k().ok_or(VmmError::OutOfMemory)?;
        *self.table(frame) = PageTable::zeroed();

        let avl = if kernelspace {
            AvlFlags::kernelspace()
        } else {
            AvlFlags::NONE
        };
        let entry = PageTableEntry::zero()
            .with_present(true)
            .with_writable(true)
            .with_user(!kernelspace)
            .with_physical_address(frame)
            .with_avl(avl);
        parent.set(idx, entry);
        Ok(frame)
    }

    /// Map `vaddr`, allocating any missing intermediate tables. `paddr` of
    /// `None` installs an [`AvlFlags::unused_page`] reservation instead of a
    /// real mapping (the `use_pages` case).
    fn install(
        &mut self,
        ctx: &Context,
        vaddr: VirtualAddress,
        paddr: Option<PhysicalAddress>,
        flags: PageFlags,
        avl: AvlFlags,
    ) -> Result<(), VmmError> {
        if !vaddr.as_u64().is_multiple_of(PAGE_SIZE) {
            return Err(VmmError::Unaligned);
        }
        let kernelspace = vaddr.as_u64() >= KERNELSPACE_START;
        let (i4, i3, i2, i1) = split_indices(vaddr);

        let pml4 = self.table(ctx.pml4);
        let pdpt_phys = self.ensure_child(pml4, i4, kernelspace)?;
        let pdpt = self.table(pdpt_phys);
        let pd_phys = self.ensure_child(pdpt, i3, kernelspace)?;
        let pd = self.table(pd_phys);
        let pt_phys = self.ensure_child(pd, i2, kernelspace)?;
        let pt = self.table(pt_phys);

        if pt.get(i1).is_allocated() {
            return Err(VmmError::AlreadyMapped);
        }

        // Permission/caching bits are set regardless of whether `paddr` is
        // given: an unbacked (`None`) reservation still carries the flags
        // it'll be backed with later, matching `vmm_Alloc`/`vmm_SysAlloc`
        // (`examples/original_source/mm/vmm.c:154,218`), which call
        // `vmm_Map(addr, 0, <real flags>, VMM_UNUSED_PAGE)` rather than
        // leaving the entry's permission bits zeroed.
        let mut entry = flags.into_entry_bits(PageTableEntry::zero());
        if let Some(pa) = paddr {
            entry = entry.with_present(true).with_physical_address(PhysicalPage::from_addr(pa));
        }
        entry = entry.with_avl(avl);
        pt.set(i1, entry);

        unsafe {
            invalidate_tlb(vaddr);
        }

        let pt_full = pt.is_fully_allocated();
        let pd = self.table(pd_phys);
        let mut e2 = pd.get(i2);
        e2.set_avl_page_full(pt_full);
        pd.set(i2, e2);

        let pd_full = (0u16..512).all(|i| {
            let e = pd.get(L2Index::new(i));
            e.present() && e.avl().page_full
        });
        let pdpt = self.table(pdpt_phys);
        let mut e3 = pdpt.get(i3);
        e3.set_avl_page_full(pd_full);
        pdpt.set(i3, e3);

        let pdpt_full = (0u16..512).all(|i| {
            let e = pdpt.get(L3Index::new(i));
            e.present() && e.avl().page_full
        });
        let pml4 = self.table(ctx.pml4);
        let mut e4 = pml4.get(i4);
        e4.set_avl_page_full(pdpt_full);
        pml4.set(i4, e4);

        Ok(())
    }

    /// Map a single page at `vaddr` to `paddr` with `flags`.
    pub fn map(
        &mut self,
        ctx: &Context,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), VmmError> {
        self.install(ctx, vaddr, Some(paddr), flags, AvlFlags::NONE)
    }

    /// Replace the physical target and/or permissions of an existing
    /// mapping, preserving its AVL flags.
    pub fn change_map(
        &mut self,
        ctx: &Context,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), VmmError> {
        if !vaddr.as_u64().is_multiple_of(PAGE_SIZE) {
            return Err(VmmError::Unaligned);
        }
        let (i4, i3, i2, i1) = split_indices(vaddr);
        let pml4 = self.table(ctx.pml4);
        let e4 = pml4.get(i4);
        if !e4.present() {
            return Err(VmmError::NotMapped);
        }
        let pdpt = self.table(e4.physical_address());
        let e3 = pdpt.get(i3);
        if !e3.present() {
            return Err(VmmError::NotMapped);
        }
        let pd = self.table(e3.physical_address());
        let e2 = pd.get(i2);
        if !e2.present() {
            return Err(VmmError::NotMapped);
        }
        let pt = self.table(e2.physical_address());
        let old = pt.get(i1);
        if !old.present() {
            return Err(VmmError::NotMapped);
        }

        let entry = flags
            .into_entry_bits(PageTableEntry::zero())
            .with_present(true)
            .with_physical_address(PhysicalPage::from_addr(paddr))
            .with_avl(old.avl());
        pt.set(i1, entry);
        unsafe {
            invalidate_tlb(vaddr);
        }
        Ok(())
    }

    /// Unmap `vaddr`, freeing its frame (if any) and reclaiming now-empty
    /// parent tables up the hierarchy.
    pub fn unmap(&mut self, ctx: &Context, vaddr: VirtualAddress) -> Result<(), VmmError> {
        self.clear_leaf(ctx, vaddr, true)
    }

    /// Shared implementation behind [`Self::unmap`] and [`Self::remap`]:
    /// clear the leaf PTE and cascade the empty-subtree cleanup up through
    /// PT/PD/PDP/PML4, exactly as `unmap` does. `free_leaf` controls whether
    /// the leaf's own frame (if present) is returned to the allocator —
    /// `remap` passes `false` because ownership of that frame is moving to
    /// the destination mapping, not being released.
    fn clear_leaf(
        &mut self,
        ctx: &Context,
        vaddr: VirtualAddress,
        free_leaf: bool,
    ) -> Result<(), VmmError> {
        if !vaddr.as_u64().is_multiple_of(PAGE_SIZE) {
            return Err(VmmError::Unaligned);
        }
        let (i4, i3, i2, i1) = split_indices(vaddr);
        let pml4 = self.table(ctx.pml4);
        let e4 = pml4.get(i4);
        if !e4.present() {
            return Err(VmmError::NotMapped);
        }
        let pdpt_phys = e4.physical_address();
        let pdpt = self.table(pdpt_phys);
        let e3 = pdpt.get(i3);
        if !e3.present() {
            return Err(VmmError::NotMapped);
        }
        let pd_phys = e3.physical_address();
        let pd = self.table(pd_phys);
        let e2 = pd.get(i2);
        if !e2.present() {
            return Err(VmmError::NotMapped);
        }
        let pt_phys = e2.physical_address();
        let pt = self.table(pt_phys);
        let e1 = pt.get(i1);
        if !e1.is_allocated() {
            return Err(VmmError::NotMapped);
        }

        if free_leaf && e1.present() {
            self.alloc.free_4k(e1.physical_address());
        }
        pt.set(i1, PageTableEntry::zero());
        unsafe {
            invalidate_tlb(vaddr);
        }

        if pt.iter().any(|e| e.is_live()) {
            let mut e2m = pd.get(i2);
            e2m.set_avl_page_full(false);
            pd.set(i2, e2m);
        } else {
            self.alloc.free_4k(pt_phys);
            pd.set(i2, PageTableEntry::zero());
        }

        if pd.iter().any(|e| e.is_live()) {
            let mut e3m = pdpt.get(i3);
            e3m.set_avl_page_full(false);
            pdpt.set(i3, e3m);
        } else {
            self.alloc.free_4k(pd_phys);
            pdpt.set(i3, PageTableEntry::zero());
        }

        if pdpt.iter().any(|e| e.is_live()) {
            let mut e4m = pml4.get(i4);
            e4m.set_avl_page_full(false);
            pml4.set(i4, e4m);
        } else {
            self.alloc.free_4k(pdpt_phys);
            pml4.set(i4, PageTableEntry::zero());
        }

        Ok(())
    }

    fn walk(&self, ctx: &Context, vaddr: VirtualAddress) -> Option<PageTableEntry> {
        let (i4, i3, i2, i1) = split_indices(vaddr);
        let pml4 = self.table(ctx.pml4);
        let e4 = pml4.get(i4);
        if !e4.present() {
            return None;
        }
        let pdpt = self.table(e4.physical_address());
        let e3 = pdpt.get(i3);
        if !e3.present() {
            return None;
        }
        let pd = self.table(e3.physical_address());
        let e2 = pd.get(i2);
        if !e2.present() {
            return None;
        }
        let pt = self.table(e2.physical_address());
        Some(pt.get(i1))
    }

    /// Whether `vaddr` is allocated (mapped, or reserved via `use_pages`) in
    /// `ctx`. Safe to call regardless of which context is currently active.
    #[must_use]
    pub fn get_page_status(&self, ctx: &Context, vaddr: VirtualAddress) -> PageStatus {
        match self.walk(ctx, vaddr) {
            Some(e) if e.is_allocated() => PageStatus::Allocated,
            _ => PageStatus::Free,
        }
    }

    /// Resolve `vaddr` to a physical address in `ctx`, regardless of which
    /// context is active. This is the correct translation primitive; compare
    /// [`Self::remap`].
    #[must_use]
    pub fn get_phys_address(&self, ctx: &Context, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
        let e = self.walk(ctx, vaddr)?;
        if !e.present() {
            return None;
        }
        let offset = vaddr.as_u64() & (PAGE_SIZE - 1);
        Some(PhysicalAddress::new(e.physical_address().base().as_u64() + offset))
    }

    /// Look up the leaf PTE for `vaddr` through the recursive self-mapping of
    /// whichever context is *currently active in CR3*, irrespective of any
    /// `Context` value the caller holds. `None` means an ancestor table is
    /// missing (genuinely unmapped); `Some` is returned even when the leaf
    /// itself isn't `present` so callers can tell a real translation apart
    /// from an `UNUSED_PAGE` reservation. Used only by [`Self::remap`]; see
    /// its `# Limitations`.
    ///
    /// # Safety
    /// Must run at CPL0 with paging enabled; reads through the recursive
    /// mapping of the active context, which must have a self-referencing
    /// PML4 slot installed (true of every [`Context`] this module creates).
    unsafe fn get_leaf_entry_of_active(vaddr: VirtualAddress) -> Option<PageTableEntry> {
        let (i4, i3, i2, i1) = split_indices(vaddr);
        let pml4 = unsafe { &*(pml4_virt().as_u64() as *const PageTable) };
        let e4 = pml4.get(i4);
        if !e4.present() {
            return None;
        }
        let pdpt = unsafe { &*(pdpt_virt(i4).as_u64() as *const PageTable) };
        let e3 = pdpt.get(i3);
        if !e3.present() {
            return None;
        }
        let pd = unsafe { &*(pd_virt(i4, i3).as_u64() as *const PageTable) };
        let e2 = pd.get(i2);
        if !e2.present() {
            return None;
        }
        let pt = unsafe { &*(pt_virt(i4, i3, i2).as_u64() as *const PageTable) };
        Some(pt.get(i1))
    }

    /// Copy the mapping at `(src_va)` in the *currently active* context to
    /// `dst_va` in `dst_ctx`, then clear `src_va` in the active context
    /// without freeing its frame — ownership of the frame moves to the
    /// destination mapping. If `src_va` is an `UNUSED_PAGE` reservation with
    /// no frame yet, a fresh frame is allocated for the destination instead.
    ///
    /// # Limitations
    /// The source translation is resolved via the recursive self-mapping of
    /// whichever context is loaded in CR3 at call time, not necessarily the
    /// context the caller intends as the source: calling this while a
    /// context other than the true source is active silently remaps the
    /// wrong page. Callers must activate the source context first. This
    /// mirrors the original implementation's behavior rather than fixing it.
    ///
    /// # Safety
    /// Must run at CPL0 with the intended source context active in CR3.
    pub unsafe fn remap(
        &mut self,
        src_va: VirtualAddress,
        dst_ctx: &Context,
        dst_va: VirtualAddress,
        flags: PageFlags,
    ) -> Result<(), VmmError> {
        let entry = unsafe { Self::get_leaf_entry_of_active(src_va) }.ok_or(VmmError::NotMapped)?;
        if entry.present() {
            let pa = entry.physical_address().base();
            self.install(dst_ctx, dst_va, Some(pa), flags, AvlFlags::NONE)?;
        } else if entry.is_allocated() {
            let frame = self.alloc.alloc_4k().ok_or(VmmError::OutOfMemory)?;
            if let Err(err) = self.install(dst_ctx, dst_va, Some(frame.base()), flags, AvlFlags::NONE) {
                self.alloc.free_4k(frame);
                return Err(err);
            }
        } else {
            return Err(VmmError::NotMapped);
        }
        let active = unsafe { Self::current_context() };
        self.clear_leaf(&active, src_va, false)
    }

    /// Search `[start, end)` for `n_pages` contiguous free pages, skipping
    /// whole subtrees marked `PAGE_FULL` without descending into them.
    #[must_use]
    pub fn find_free_range(
        &self,
        ctx: &Context,
        start: VirtualAddress,
        end: VirtualAddress,
        n_pages: u64,
    ) -> Option<VirtualAddress> {
        let want_bytes = n_pages.checked_mul(PAGE_SIZE)?;
        let limit = end.as_u64();
        let mut va = start.as_u64() & !(PAGE_SIZE - 1);
        let mut run_start = va;
        let mut run_len: u64 = 0;

        while va < limit {
            let pml4 = self.table(ctx.pml4);
            let i4 = L4Index::from(VirtualAddress::new(va));
            let e4 = pml4.get(i4);
            if !e4.present() || e4.avl().page_full {
                let next = (va & !(L4_STEP - 1)).checked_add(L4_STEP)?;
                if !e4.present() {
                    run_len += (next - va).min(limit.saturating_sub(va));
                    if run_len >= want_bytes {
                        return Some(VirtualAddress::new(run_start));
                    }
                } else {
                    run_start = next;
                    run_len = 0;
                }
                va = next;
                continue;
            }

            let pdpt = self.table(e4.physical_address());
            let i3 = L3Index::from(VirtualAddress::new(va));
            let e3 = pdpt.get(i3);
            if !e3.present() || e3.avl().page_full {
                let next = (va & !(L3_STEP - 1)).checked_add(L3_STEP)?;
                if !e3.present() {
                    run_len += (next - va).min(limit.saturating_sub(va));
                    if run_len >= want_bytes {
                        return Some(VirtualAddress::new(run_start));
                    }
                } else {
                    run_start = next;
                    run_len = 0;
                }
                va = next;
                continue;
            }

            let pd = self.table(e3.physical_address());
            let i2 = L2Index::from(VirtualAddress::new(va));
            let e2 = pd.get(i2);
            if !e2.present() || e2.avl().page_full {
                let next = (va & !(L2_STEP - 1)).checked_add(L2_STEP)?;
                if !e2.present() {
                    run_len += (next - va).min(limit.saturating_sub(va));
                    if run_len >= want_bytes {
                        return Some(VirtualAddress::new(run_start));
                    }
                } else {
                    run_start = next;
                    run_len = 0;
                }
                va = next;
                continue;
            }

            let pt = self.table(e2.physical_address());
            let i1 = L1Index::from(VirtualAddress::new(va));
            if pt.get(i1).is_allocated() {
                va += PAGE_SIZE;
                run_start = va;
                run_len = 0;
                continue;
            }

            run_len += PAGE_SIZE;
            if run_len >= want_bytes {
                return Some(VirtualAddress::new(run_start));
            }
            va += PAGE_SIZE;
        }
        None
    }

    /// Reserve `n_pages` of VA space, tagged [`AvlFlags::unused_page`] and
    /// never backed by a real frame here — `vmm_Alloc`/`vmm_SysAlloc` map
    /// `paddr=0` with the caller's intended permission bits already set, and
    /// let a later [`Self::use_pages`] call supply the frame (spec §4.2:
    /// allocation reserves VA lazily).
    fn alloc_in_range(
        &mut self,
        ctx: &Context,
        start: VirtualAddress,
        end: VirtualAddress,
        n_pages: u64,
        flags: PageFlags,
        avl: AvlFlags,
    ) -> Result<VirtualAddress, VmmError> {
        let base = self
            .find_free_range(ctx, start, end, n_pages)
            .ok_or(VmmError::OutOfVirtualSpace)?;
        for i in 0..n_pages {
            let va = VirtualAddress::new(base.as_u64() + i * PAGE_SIZE);
            if let Err(err) = self.install(ctx, va, None, flags, avl) {
                self.free(ctx, base, i);
                return Err(err);
            }
        }
        Ok(base)
    }

    /// Reserve `n_pages` anywhere in the userspace VA range, unbacked.
    pub fn alloc(&mut self, ctx: &Context, n_pages: u64) -> Result<VirtualAddress, VmmError> {
        self.alloc_in_range(
            ctx,
            VirtualAddress::new(0),
            VirtualAddress::new(LAST_USERSPACE_ADDRESS),
            n_pages,
            PageFlags::user_data(),
            AvlFlags::unused_page(),
        )
    }

    /// Reserve `n_pages` anywhere in the kernel-managed VA range, unbacked.
    pub fn sys_alloc(&mut self, ctx: &Context, n_pages: u64) -> Result<VirtualAddress, VmmError> {
        self.alloc_in_range(
            ctx,
            VirtualAddress::new(KERNELSPACE_START),
            VirtualAddress::new(KERNELSPACE_END),
            n_pages,
            PageFlags::kernel_data(),
            AvlFlags::kernelspace().union(AvlFlags::unused_page()),
        )
    }

    /// Unmap and free `n_pages` starting at `vaddr`. Unmapped pages in the
    /// range are skipped rather than treated as an error.
    pub fn free(&mut self, ctx: &Context, vaddr: VirtualAddress, n_pages: u64) {
        for i in 0..n_pages {
            let va = VirtualAddress::new(vaddr.as_u64() + i * PAGE_SIZE);
            let _ = self.unmap(ctx, va);
        }
    }

    /// Back `n_pages` of an existing [`Self::alloc`]/[`Self::sys_alloc`]
    /// reservation with real frames, clearing `unused_page` on each —
    /// `vmm_usePages` (`examples/original_source/mm/vmm.c:1306-1331`), which
    /// zero-fills the newly-backed frame before handing it out. Unlike the
    /// original, which overwrites whatever was there unconditionally, this
    /// errors `AlreadyMapped` on a page that already has a frame rather than
    /// silently leaking it (see DESIGN.md).
    pub fn use_pages(
        &mut self,
        ctx: &Context,
        vaddr: VirtualAddress,
        n_pages: u64,
    ) -> Result<(), VmmError> {
        for i in 0..n_pages {
            let va = VirtualAddress::new(vaddr.as_u64() + i * PAGE_SIZE);
            if let Err(err) = self.use_page(ctx, va) {
                self.unuse_pages(ctx, vaddr, i);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Back a single `unused_page` reservation with a fresh, zeroed frame.
    fn use_page(&mut self, ctx: &Context, vaddr: VirtualAddress) -> Result<(), VmmError> {
        if !vaddr.as_u64().is_multiple_of(PAGE_SIZE) {
            return Err(VmmError::Unaligned);
        }
        let (i4, i3, i2, i1) = split_indices(vaddr);
        let pml4 = self.table(ctx.pml4);
        let e4 = pml4.get(i4);
        if !e4.present() {
            return Err(VmmError::NotMapped);
        }
        let pdpt = self.table(e4.physical_address());
        let e3 = pdpt.get(i3);
        if !e3.present() {
            return Err(VmmError::NotMapped);
        }
        let pd = self.table(e3.physical_address());
        let e2 = pd.get(i2);
        if !e2.present() {
            return Err(VmmError::NotMapped);
        }
        let pt = self.table(e2.physical_address());
        let old = pt.get(i1);
        if old.present() {
            return Err(VmmError::AlreadyMapped);
        }
        if !old.avl().unused_page {
            return Err(VmmError::NotMapped);
        }

        let frame = self.alloc.alloc_4k().ok_or(VmmError::OutOfMemory)?;
        *self.table(frame) = PageTable::zeroed();

        let entry = old
            .with_present(true)
            .with_physical_address(frame)
            .with_avl(old.avl().with_unused_page(false));
        pt.set(i1, entry);
        unsafe {
            invalidate_tlb(vaddr);
        }
        Ok(())
    }

    /// Free the backing frame of `n_pages` starting at `vaddr`, re-tagging
    /// each as `unused_page` without touching the PTE otherwise —
    /// `vmm_unusePages` (`examples/original_source/mm/vmm.c:1280-1304`). The
    /// range stays [`PageStatus::Allocated`]; pages that are already free or
    /// already an `unused_page` reservation are left untouched, matching the
    /// original's guard. Never unmaps: use [`Self::free`] to release the VA
    /// range entirely.
    pub fn unuse_pages(&mut self, ctx: &Context, vaddr: VirtualAddress, n_pages: u64) {
        for i in 0..n_pages {
            let va = VirtualAddress::new(vaddr.as_u64() + i * PAGE_SIZE);
            self.unuse_page(ctx, va);
        }
    }

    /// Free a single page's backing frame and mark it `unused_page`. A
    /// no-op if `vaddr` isn't currently `present` (free, or already a
    /// reservation).
    fn unuse_page(&mut self, ctx: &Context, vaddr: VirtualAddress) {
        if !vaddr.as_u64().is_multiple_of(PAGE_SIZE) {
            return;
        }
        let (i4, i3, i2, i1) = split_indices(vaddr);
        let pml4 = self.table(ctx.pml4);
        let e4 = pml4.get(i4);
        if !e4.present() {
            return;
        }
        let pdpt = self.table(e4.physical_address());
        let e3 = pdpt.get(i3);
        if !e3.present() {
            return;
        }
        let pd = self.table(e3.physical_address());
        let e2 = pd.get(i2);
        if !e2.present() {
            return;
        }
        let pt = self.table(e2.physical_address());
        let old = pt.get(i1);
        if !old.present() {
            return;
        }

        self.alloc.free_4k(old.physical_address());
        let entry = old.with_present(false).with_avl(old.avl().with_unused_page(true));
        pt.set(i1, entry);
        unsafe {
            invalidate_tlb(vaddr);
        }
    }

    /// Visit every live table frame belonging to `ctx` (its PML4 and every
    /// present PDP/PD/PT beneath it). Diagnostic only, not load-bearing.
    pub fn context_tables(&self, ctx: &Context, mut visit: impl FnMut(PhysicalPage<Size4K>)) {
        visit(ctx.pml4);
        let pml4 = self.table(ctx.pml4);
        for i in 0u16..512 {
            let e4 = pml4.get(L4Index::new(i));
            if !e4.present() {
                continue;
            }
            let pdpt_phys = e4.physical_address();
            visit(pdpt_phys);
            let pdpt = self.table(pdpt_phys);
            for j in 0u16..512 {
                let e3 = pdpt.get(L3Index::new(j));
                if !e3.present() {
                    continue;
                }
                let pd_phys = e3.physical_address();
                visit(pd_phys);
                let pd = self.table(pd_phys);
                for k in 0u16..512 {
                    let e2 = pd.get(L2Index::new(k));
                    if e2.present() {
                        visit(e2.physical_address());
                    }
                }
            }
        }
    }
}

impl<'m, M: PhysMapper, A: DmaFrameAlloc> Vmm<'m, M, A> {
    /// Allocate `n_pages` of physically-contiguous memory below `max_phys`
    /// and map it into the kernel VA range.
    pub fn alloc_dma(
        &mut self,
        ctx: &Context,
        max_phys: PhysicalAddress,
        n_pages: usize,
    ) -> Result<(VirtualAddress, PhysicalAddress), VmmError> {
        let phys = self
            .alloc
            .alloc_dma(max_phys, n_pages)
            .ok_or(VmmError::OutOfMemory)?;
        let va = self
            .find_free_range(
                ctx,
                VirtualAddress::new(KERNELSPACE_START),
                VirtualAddress::new(KERNELSPACE_END),
                n_pages as u64,
            )
            .ok_or(VmmError::OutOfVirtualSpace)?;
        for i in 0..n_pages as u64 {
            let v = VirtualAddress::new(va.as_u64() + i * PAGE_SIZE);
            let p = PhysicalAddress::new(phys.as_u64() + i * PAGE_SIZE);
            if let Err(err) = self.install(ctx, v, Some(p), PageFlags::kernel_data(), AvlFlags::NONE) {
                self.free(ctx, va, i);
                return Err(err);
            }
        }
        Ok((va, phys))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;
    use kernel_memory_addresses::PageSize;
    use std::vec::Vec;

    /// Host-side stand-in for physical memory: a pool of zeroed 4 KiB frames
    /// addressed by index, so `PhysMapper`/`FrameAlloc` can be exercised
    /// without a real MMU.
    struct TestArena {
        frames: RefCell<Vec<Box<PageTable>>>,
        free: RefCell<Vec<u32>>,
    }

    impl TestArena {
        fn new(capacity: usize) -> Self {
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

    fn new_ctx(arena: &mut TestArena) -> Context {
        let pml4 = FrameAlloc::alloc_4k(arena).unwrap();
        let mapper: &TestArena = arena;
        *unsafe { &mut *mapper.map_table(pml4) } = PageTable::zeroed();
        let self_ref = PageTableEntry::zero()
            .with_present(true)
            .with_writable(true)
            .with_physical_address(pml4)
            .with_avl(AvlFlags::kernelspace().union(AvlFlags::pointer_to_pml4()));
        unsafe { &mut *mapper.map_table(pml4) }.set(L4Index::new(PML4_SELF_REF_INDEX), self_ref);
        Context { pml4 }
    }

    #[test]
    fn map_then_get_phys_address_round_trips() {
        let mut arena = TestArena::new(64);
        let ctx = new_ctx(&mut arena);
        let mapper_ptr: *const TestArena = &arena;
        let mut vmm = Vmm::new(unsafe { &*mapper_ptr }, &mut arena);

        let va = VirtualAddress::new(0x0000_0000_0010_0000);
        let pa = PhysicalAddress::new(0x0000_0000_0030_0000);
        vmm.map(&ctx, va, pa, PageFlags::user_data()).unwrap();

        assert_eq!(vmm.get_phys_address(&ctx, va), Some(pa));
        assert_eq!(vmm.get_page_status(&ctx, va), PageStatus::Allocated);
    }

    #[test]
    fn unmap_frees_frame_and_reports_not_mapped() {
        let mut arena = TestArena::new(64);
        let ctx = new_ctx(&mut arena);
        let mapper_ptr: *const TestArena = &arena;
        let mut vmm = Vmm::new(unsafe { &*mapper_ptr }, &mut arena);

        let va = VirtualAddress::new(0x0000_0000_0020_0000);
        let pa = PhysicalAddress::new(0x0000_0000_0040_0000);
        vmm.map(&ctx, va, pa, PageFlags::user_data()).unwrap();
        vmm.unmap(&ctx, va).unwrap();

        assert_eq!(vmm.get_page_status(&ctx, va), PageStatus::Free);
        assert!(matches!(vmm.unmap(&ctx, va), Err(VmmError::NotMapped)));
    }

    #[test]
    fn mapping_twice_without_unmap_fails() {
        let mut arena = TestArena::new(64);
        let ctx = new_ctx(&mut arena);
        let mapper_ptr: *const TestArena = &arena;
        let mut vmm = Vmm::new(unsafe { &*mapper_ptr }, &mut arena);

        let va = VirtualAddress::new(0x0000_0000_0050_0000);
        vmm.map(&ctx, va, PhysicalAddress::new(0x1000), PageFlags::user_data())
            .unwrap();
        assert!(matches!(
            vmm.map(&ctx, va, PhysicalAddress::new(0x2000), PageFlags::user_data()),
            Err(VmmError::AlreadyMapped)
        ));
    }

    #[test]
    fn alloc_reserves_without_a_frame() {
        let mut arena = TestArena::new(64);
        let ctx = new_ctx(&mut arena);
        let mapper_ptr: *const TestArena = &arena;
        let mut vmm = Vmm::new(unsafe { &*mapper_ptr }, &mut arena);

        let va = vmm.alloc(&ctx, 1).unwrap();
        assert_eq!(vmm.get_page_status(&ctx, va), PageStatus::Allocated);
        assert_eq!(vmm.get_phys_address(&ctx, va), None);
    }

    #[test]
    fn use_pages_backs_a_reservation_with_a_frame() {
        let mut arena = TestArena::new(64);
        let ctx = new_ctx(&mut arena);
        let mapper_ptr: *const TestArena = &arena;
        let mut vmm = Vmm::new(unsafe { &*mapper_ptr }, &mut arena);

        let va = vmm.alloc(&ctx, 1).unwrap();
        vmm.use_pages(&ctx, va, 1).unwrap();

        assert_eq!(vmm.get_page_status(&ctx, va), PageStatus::Allocated);
        assert!(vmm.get_phys_address(&ctx, va).is_some());
    }

    #[test]
    fn use_pages_on_an_already_backed_page_fails() {
        let mut arena = TestArena::new(64);
        let ctx = new_ctx(&mut arena);
        let mapper_ptr: *const TestArena = &arena;
        let mut vmm = Vmm::new(unsafe { &*mapper_ptr }, &mut arena);

        let va = vmm.alloc(&ctx, 1).unwrap();
        vmm.use_pages(&ctx, va, 1).unwrap();
        assert!(matches!(vmm.use_pages(&ctx, va, 1), Err(VmmError::AlreadyMapped)));
    }

    #[test]
    fn unuse_pages_frees_the_frame_but_keeps_the_reservation() {
        let mut arena = TestArena::new(64);
        let ctx = new_ctx(&mut arena);
        let mapper_ptr: *const TestArena = &arena;
        let mut vmm = Vmm::new(unsafe { &*mapper_ptr }, &mut arena);

        let va = vmm.alloc(&ctx, 1).unwrap();
        vmm.use_pages(&ctx, va, 1).unwrap();
        assert!(vmm.get_phys_address(&ctx, va).is_some());

        vmm.unuse_pages(&ctx, va, 1);
        assert_eq!(vmm.get_page_status(&ctx, va), PageStatus::Allocated);
        assert_eq!(vmm.get_phys_address(&ctx, va), None);

        // still a reservation, not an unmapped hole: can be backed again.
        vmm.use_pages(&ctx, va, 1).unwrap();
        assert!(vmm.get_phys_address(&ctx, va).is_some());
    }

    #[test]
    fn find_free_range_skips_an_allocated_page() {
        let mut arena = TestArena::new(64);
        let ctx = new_ctx(&mut arena);
        let mapper_ptr: *const TestArena = &arena;
        let mut vmm = Vmm::new(unsafe { &*mapper_ptr }, &mut arena);

        let busy = VirtualAddress::new(0x0000_0000_0070_0000);
        vmm.map(&ctx, busy, PhysicalAddress::new(0x3000), PageFlags::user_data())
            .unwrap();

        let found = vmm
            .find_free_range(
                &ctx,
                busy,
                VirtualAddress::new(busy.as_u64() + 16 * PAGE_SIZE),
                1,
            )
            .unwrap();
        assert_ne!(found, busy);
    }
}
