//! Views and the view registry
//!
//! A view is one tracked, non-overlapping address range: its base and size
//! (page multiples), its flags, an optional owned reference to the backing
//! mapping, the protection it was created with, a per-page protection array,
//! and an optional fault hook. The registry is the address-ordered sequence
//! of every view in the space; it is the sole owner of the views it holds and
//! is only ever mutated under the registry lock.
//!
//! Lookup is a linear scan over the ordered sequence. Host syscall latency
//! dominates every operation that reaches the registry, not registry size.

use std::ops::Range;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::VmError;
use crate::fault::FaultHook;
use crate::protect::{GuestProt, PageProt};
use crate::{trunc_page, PAGE_SIZE};

bitflags! {
    /// Per-view flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ViewFlags: u32 {
        /// Created by the subsystem itself (image mappings, internal areas)
        const SYSTEM = 0x1;
        /// Created by an explicit guest allocation request
        const ALLOCATED = 0x2;
    }
}

/// What a view's backing mapping refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingKind {
    /// An executable image mapped by the image mapper
    Image,
    /// A mapped file. No operation here creates these; the descriptor
    /// resolver that turns guest file references into host descriptors
    /// attaches them from outside, and queries classify them.
    Mapped,
}

/// Owned reference to a backing mapping.
///
/// Holds a duplicated descriptor so the mapping outlives the caller's own
/// handle; the view is one owner and the descriptor closes when the last
/// owner drops.
#[derive(Debug)]
pub struct Backing {
    fd: OwnedFd,
    kind: BackingKind,
}

impl Backing {
    pub fn new(fd: OwnedFd, kind: BackingKind) -> Arc<Self> {
        Arc::new(Self { fd, kind })
    }

    pub fn kind(&self) -> BackingKind {
        self.kind
    }
}

/// Registered fault hook: callback plus the sub-range it covers.
pub struct HookEntry {
    range: Range<usize>,
    hook: FaultHook,
}

// ============================================================================
// View
// ============================================================================

/// One tracked address range.
pub struct View {
    base: usize,
    size: usize,
    flags: ViewFlags,
    backing: Option<Arc<Backing>>,
    initial_prot: GuestProt,
    pages: Vec<PageProt>,
    hook: Option<HookEntry>,
}

impl View {
    /// Create a view with every page in the reserved (uncommitted) state.
    ///
    /// `base` and `size` must be page-aligned; the per-page array length is
    /// the page count.
    pub fn new(base: usize, size: usize, prot: GuestProt, flags: ViewFlags) -> Self {
        debug_assert_eq!(base % PAGE_SIZE, 0);
        debug_assert_eq!(size % PAGE_SIZE, 0);
        debug_assert!(size > 0);
        Self {
            base,
            size,
            flags,
            backing: None,
            initial_prot: prot,
            pages: vec![prot.to_page(); size / PAGE_SIZE],
            hook: None,
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> usize {
        self.base + self.size
    }

    pub fn flags(&self) -> ViewFlags {
        self.flags
    }

    pub fn initial_prot(&self) -> GuestProt {
        self.initial_prot
    }

    pub fn backing(&self) -> Option<&Arc<Backing>> {
        self.backing.as_ref()
    }

    pub(crate) fn set_backing(&mut self, backing: Arc<Backing>) {
        self.backing = Some(backing);
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        self.base < end && start < self.end()
    }

    fn page_index(&self, addr: usize) -> usize {
        debug_assert!(self.contains(addr));
        (trunc_page(addr) - self.base) / PAGE_SIZE
    }

    /// Protection bits of the page containing `addr`.
    pub fn page_at(&self, addr: usize) -> PageProt {
        self.pages[self.page_index(addr)]
    }

    /// Set the bits of the single page containing `addr`.
    pub(crate) fn set_page(&mut self, addr: usize, prot: PageProt) {
        let index = self.page_index(addr);
        self.pages[index] = prot;
    }

    /// Set every page in `[addr, addr + size)` to `prot`.
    pub(crate) fn set_range(&mut self, addr: usize, size: usize, prot: PageProt) {
        let first = self.page_index(addr);
        let count = size / PAGE_SIZE;
        for page in &mut self.pages[first..first + count] {
            *page = prot;
        }
    }

    /// Apply `f` to every page in `[addr, addr + size)`.
    pub(crate) fn update_range(&mut self, addr: usize, size: usize, f: impl Fn(PageProt) -> PageProt) {
        let first = self.page_index(addr);
        let count = size / PAGE_SIZE;
        for page in &mut self.pages[first..first + count] {
            *page = f(*page);
        }
    }

    /// Whether every page in the range carries the committed bit.
    pub fn all_committed(&self, addr: usize, size: usize) -> bool {
        let first = self.page_index(addr);
        let count = size / PAGE_SIZE;
        self.pages[first..first + count]
            .iter()
            .all(|p| p.contains(PageProt::COMMITTED))
    }

    /// Contiguous run of pages sharing the protection of the page at `addr`,
    /// as (run base, run size).
    pub fn prot_run(&self, addr: usize) -> (usize, usize) {
        let index = self.page_index(addr);
        let prot = self.pages[index];
        let mut first = index;
        while first > 0 && self.pages[first - 1] == prot {
            first -= 1;
        }
        let mut last = index;
        while last + 1 < self.pages.len() && self.pages[last + 1] == prot {
            last += 1;
        }
        (
            self.base + first * PAGE_SIZE,
            (last - first + 1) * PAGE_SIZE,
        )
    }

    /// Register a fault hook over `range`. One hook per view; a second
    /// registration or a range outside the view is refused.
    pub(crate) fn set_hook(&mut self, range: Range<usize>, hook: FaultHook) -> bool {
        if self.hook.is_some() || range.start < self.base || range.end > self.end() {
            return false;
        }
        self.hook = Some(HookEntry { range, hook });
        true
    }

    /// Hook callback if `addr` falls inside the registered sub-range.
    pub(crate) fn hook_for(&self, addr: usize) -> Option<FaultHook> {
        self.hook
            .as_ref()
            .filter(|entry| entry.range.contains(&addr))
            .map(|entry| Arc::clone(&entry.hook))
    }
}

// ============================================================================
// View registry
// ============================================================================

/// Address-ordered collection of non-overlapping views.
pub struct ViewList {
    views: Vec<View>,
}

impl ViewList {
    pub fn new() -> Self {
        Self { views: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &View> {
        self.views.iter()
    }

    /// View containing `addr`, if any.
    pub fn find(&self, addr: usize) -> Option<&View> {
        self.views.iter().find(|v| v.contains(addr))
    }

    pub fn find_mut(&mut self, addr: usize) -> Option<&mut View> {
        self.views.iter_mut().find(|v| v.contains(addr))
    }

    /// Base of the first view above `addr`, for free-run sizing.
    pub fn next_base_above(&self, addr: usize) -> Option<usize> {
        self.views.iter().map(View::base).find(|&b| b > addr)
    }

    /// Index at which a view with this base keeps the sequence ordered.
    pub fn insertion_point(&self, base: usize) -> usize {
        self.views
            .iter()
            .position(|v| v.base() > base)
            .unwrap_or(self.views.len())
    }

    /// Insert a view, refusing any overlap with an existing one.
    pub fn insert(&mut self, view: View) -> Result<(), VmError> {
        if self.views.iter().any(|v| v.overlaps(view.base(), view.end())) {
            return Err(VmError::ConflictingAddresses);
        }
        let at = self.insertion_point(view.base());
        self.views.insert(at, view);
        Ok(())
    }

    /// Insert at a gap the allocator has already proven free.
    pub fn insert_at_gap(&mut self, index: usize, view: View) {
        debug_assert!(index == 0 || self.views[index - 1].end() <= view.base());
        debug_assert!(index == self.views.len() || view.end() <= self.views[index].base());
        self.views.insert(index, view);
    }

    /// Remove and return the view whose base is exactly `base`.
    pub fn remove(&mut self, base: usize) -> Option<View> {
        let at = self.views.iter().position(|v| v.base() == base)?;
        Some(self.views.remove(at))
    }
}

impl Default for ViewList {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
