//! Software-reserved (AVL) flags carried in page-table entries.
//!
//! Hardware never interprets these bits; the VMM uses them to record
//! engine-private metadata directly in the entry it would otherwise have to
//! track out of band. [`AvlFlags`] is a disjoint-union view over that field,
//! per the discipline demanded of AVL bits: never reuse one for an unrelated
//! purpose.

/// A disjoint union of the kernel-defined AVL flags.
///
/// `kernelspace`, `pointer_to_pml4`, `page_full`, and `unused_page` are
/// independent bits; any combination may legally be set on a single entry
/// (e.g. a kernel-half PML4 slot is both `kernelspace` and, at slot 511,
/// `pointer_to_pml4`).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct AvlFlags {
    /// Entry (and its subtree) belongs to the kernel half of the address
    /// space; copied verbatim when a new context is created.
    pub kernelspace: bool,
    /// Marks the self-referencing last PML4 slot used for recursive
    /// table editing.
    pub pointer_to_pml4: bool,
    /// Set on an internal node once every one of its 512 children is
    /// allocated-or-unused; lets range search skip the whole subtree.
    pub page_full: bool,
    /// The range is reserved but has no physical frame yet; the entry
    /// still counts as "allocated" for status queries.
    pub unused_page: bool,
}

impl AvlFlags {
    /// No AVL flags set.
    pub const NONE: Self = Self {
        kernelspace: false,
        pointer_to_pml4: false,
        page_full: false,
        unused_page: false,
    };

    #[inline]
    #[must_use]
    pub const fn kernelspace() -> Self {
        Self {
            kernelspace: true,
            ..Self::NONE
        }
    }

    #[inline]
    #[must_use]
    pub const fn pointer_to_pml4() -> Self {
        Self {
            pointer_to_pml4: true,
            ..Self::NONE
        }
    }

    #[inline]
    #[must_use]
    pub const fn unused_page() -> Self {
        Self {
            unused_page: true,
            ..Self::NONE
        }
    }

    /// Combine two flag sets (bitwise OR over each named flag).
    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self {
            kernelspace: self.kernelspace || other.kernelspace,
            pointer_to_pml4: self.pointer_to_pml4 || other.pointer_to_pml4,
            page_full: self.page_full || other.page_full,
            unused_page: self.unused_page || other.unused_page,
        }
    }

    #[inline]
    #[must_use]
    pub const fn with_page_full(mut self, page_full: bool) -> Self {
        self.page_full = page_full;
        self
    }

    #[inline]
    #[must_use]
    pub const fn with_unused_page(mut self, unused_page: bool) -> Self {
        self.unused_page = unused_page;
        self
    }

    /// True if the page these flags describe must be considered allocated
    /// even though it may carry no physical frame (spec's allocated
    /// invariant: `P=1 OR AVL & UNUSED_PAGE`).
    #[inline]
    #[must_use]
    pub const fn counts_as_allocated_without_frame(self) -> bool {
        self.unused_page
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_is_a_disjoint_bitwise_or() {
        let a = AvlFlags::kernelspace();
        let b = AvlFlags::unused_page();
        let c = a.union(b);
        assert!(c.kernelspace);
        assert!(c.unused_page);
        assert!(!c.pointer_to_pml4);
        assert!(!c.page_full);
    }

    #[test]
    fn default_is_none() {
        assert_eq!(AvlFlags::default(), AvlFlags::NONE);
    }
}
