//! Region operations
//!
//! The guest-facing lifecycle for an address range:
//!
//! ```text
//! Free --reserve--> Reserved --commit--> Committed
//!                      ^                     |
//!                      +------decommit-------+
//! Free <--release-- Reserved/Committed (exact view bounds only)
//! ```
//!
//! A reservation claims the range from the host with a no-access anonymous
//! mapping, so nothing else in the process can land there even though the
//! guest considers it merely reserved. Commit grants host access matching the
//! guest protection; decommit remaps to fresh zero-filled no-access memory.
//! Every registry change happens under the registry lock, paired with its
//! host request, so a failed operation leaves the space exactly as it was.

use std::sync::Arc;

use log::{debug, warn};

use crate::alloc::{place_exact, place_search};
use crate::error::VmError;
use crate::host::HostError;
use crate::protect::{GuestProt, PageProt, PageState};
use crate::space::AddressSpace;
use crate::view::{Backing, BackingKind, View, ViewFlags};
use crate::{trunc_page, PAGE_SIZE};

/// Classification of the mapping backing a queried region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// No view covers the address
    Free,
    /// Anonymous guest allocation
    Private,
    /// Mapped file
    Mapped,
    /// Executable image
    Image,
}

/// Result of [`AddressSpace::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryInfo {
    /// Start of the contiguous run sharing the queried page's protection
    pub base: usize,
    /// Length of that run
    pub size: usize,
    /// Lifecycle state of the queried page
    pub state: PageState,
    /// Current protection of the run (no access while merely reserved)
    pub prot: GuestProt,
    /// Base of the owning view, zero when free
    pub alloc_base: usize,
    /// Protection the view was created with
    pub alloc_prot: GuestProt,
    /// Backing classification
    pub kind: RegionKind,
}

fn host_err(err: HostError) -> VmError {
    match err {
        HostError::Occupied => VmError::ConflictingAddresses,
        HostError::Exhausted => VmError::NoMemory,
    }
}

/// Page-aligned `[base, end)` for a request, rejecting zero size and
/// address-space wraparound before anything else runs.
fn extent(addr: usize, size: usize) -> Result<(usize, usize), VmError> {
    if size == 0 {
        return Err(VmError::InvalidParameter);
    }
    let base = trunc_page(addr);
    let end = addr
        .checked_add(size)
        .and_then(|e| e.checked_add(PAGE_SIZE - 1))
        .ok_or(VmError::InvalidParameter)?
        & !(PAGE_SIZE - 1);
    Ok((base, end))
}

impl AddressSpace {
    /// Reserve a range of the guest address space.
    ///
    /// Runs the allocator (hint first, then free-gap search), claims the
    /// chosen range from the host as no-access anonymous memory, and enters
    /// a view with every page in the reserved state.
    ///
    /// # Arguments
    /// * `hint` - preferred base, dropped if unusable
    /// * `size` - request size in bytes, rounded up to a page multiple
    /// * `prot` - protection the pages take on commit
    /// * `flags` - view flags recorded for the lifetime of the view
    ///
    /// # Returns
    /// The granularity-aligned base of the reservation.
    pub fn reserve(
        &self,
        hint: Option<usize>,
        size: usize,
        prot: GuestProt,
        flags: ViewFlags,
    ) -> Result<usize, VmError> {
        let (_, end) = extent(0, size)?;
        let size = end;
        let mut views = self.lock_views();
        let (base, index) =
            place_search(&views, self.boot(), self.floor(), self.ceiling(), hint, size)?;
        self.host().reserve(base, size).map_err(host_err)?;
        views.insert_at_gap(index, View::new(base, size, prot, flags));
        debug!("reserve base={base:#x} size={size:#x} prot={prot:?}");
        Ok(base)
    }

    /// Reserve at exactly `base`, reporting occupancy instead of failing.
    ///
    /// The image mapper's preferred-base attempt: `Ok(None)` means the range
    /// is taken and the caller should place elsewhere and relocate. A host
    /// mapping already occupying the range, outside the registry's
    /// knowledge, reports the same way.
    pub(crate) fn reserve_preferred(
        &self,
        base: usize,
        size: usize,
        prot: GuestProt,
        flags: ViewFlags,
    ) -> Result<Option<usize>, VmError> {
        let (_, end) = extent(0, size)?;
        let size = end;
        let mut views = self.lock_views();
        let index =
            match place_exact(&views, self.boot(), self.floor(), self.ceiling(), base, size)? {
                Some(index) => index,
                None => return Ok(None),
            };
        match self.host().reserve(base, size) {
            Ok(()) => {}
            Err(HostError::Occupied) => return Ok(None),
            Err(err) => return Err(host_err(err)),
        }
        views.insert_at_gap(index, View::new(base, size, prot, flags));
        debug!("reserve base={base:#x} size={size:#x} prot={prot:?} (exact)");
        Ok(Some(base))
    }

    /// Commit pages, reserving first when no view covers the range.
    ///
    /// With an existing reservation the range must lie inside one view; its
    /// pages transition to committed and the host grants matching access.
    /// With no reservation this is the one-step allocation path: reserve at
    /// exactly `addr` (anywhere for `addr == 0`), then commit the whole
    /// range.
    ///
    /// # Returns
    /// The base of the committed range.
    pub fn commit(&self, addr: usize, size: usize, prot: GuestProt) -> Result<usize, VmError> {
        let (base, end) = extent(addr, size)?;
        let bits = prot.to_page() | PageProt::COMMITTED;
        let mut views = self.lock_views();

        if let Some(view) = views.find_mut(base) {
            if end > view.end() {
                return Err(VmError::ConflictingAddresses);
            }
            if let Err(err) = self.host().set_access(base, end - base, bits.to_host()) {
                // The host may have changed a prefix of the range before
                // failing; put the recorded access back so a failed commit
                // leaves the space exactly as it was.
                warn!("commit restore base={base:#x} size={:#x}", end - base);
                let mut at = base;
                while at < end {
                    let (run_base, run_size) = view.prot_run(at);
                    let run_end = (run_base + run_size).min(end);
                    let _ = self
                        .host()
                        .set_access(at, run_end - at, view.page_at(at).to_host());
                    at = run_end;
                }
                return Err(host_err(err));
            }
            view.set_range(base, end - base, bits);
            debug!("commit base={base:#x} size={:#x} prot={prot:?}", end - base);
            return Ok(base);
        }

        // Implicit reserve + commit. A named base is exact; zero means
        // anywhere.
        let size = end - base;
        let (base, index) = if addr == 0 {
            place_search(&views, self.boot(), self.floor(), self.ceiling(), None, size)?
        } else {
            match place_exact(&views, self.boot(), self.floor(), self.ceiling(), base, size)? {
                Some(index) => (base, index),
                None => return Err(VmError::ConflictingAddresses),
            }
        };
        self.host().reserve(base, size).map_err(host_err)?;
        if let Err(err) = self.host().set_access(base, size, bits.to_host()) {
            // Roll back the mapping made for this one operation.
            warn!("commit rollback base={base:#x} size={size:#x}");
            let _ = self.host().unmap(base, size);
            return Err(host_err(err));
        }
        let mut view = View::new(base, size, prot, ViewFlags::ALLOCATED);
        view.set_range(base, size, bits);
        views.insert_at_gap(index, view);
        debug!("commit base={base:#x} size={size:#x} prot={prot:?} (implicit reserve)");
        Ok(base)
    }

    /// Return committed pages to the reserved state.
    ///
    /// The range is remapped to fresh zero-filled no-access memory and the
    /// committed bits are cleared. `size == 0` with `addr` equal to the
    /// view's base decommits the whole view.
    pub fn decommit(&self, addr: usize, size: usize) -> Result<(), VmError> {
        let mut views = self.lock_views();
        let view = views.find_mut(addr).ok_or(VmError::NotReserved)?;
        let (base, end) = if size == 0 {
            if addr != view.base() {
                // Compatibility quirk, preserved exactly: a zero-size
                // decommit whose base is not the view's base succeeds
                // without touching anything. Not to be generalized.
                warn!("decommit no-op addr={addr:#x} (zero size, non-matching base)");
                return Ok(());
            }
            (view.base(), view.end())
        } else {
            let end = addr
                .checked_add(size)
                .and_then(|e| e.checked_add(PAGE_SIZE - 1))
                .ok_or(VmError::InvalidParameter)?
                & !(PAGE_SIZE - 1);
            if end > view.end() {
                return Err(VmError::ConflictingAddresses);
            }
            (trunc_page(addr), end)
        };
        self.host().zero(base, end - base).map_err(host_err)?;
        view.update_range(base, end - base, |p| p - PageProt::COMMITTED);
        debug!("decommit base={base:#x} size={:#x}", end - base);
        Ok(())
    }

    /// Destroy a view and unmap its range.
    ///
    /// `addr` must be the view's own base and `size` zero or the view's
    /// exact size; a sub-range release fails and changes nothing.
    pub fn release(&self, addr: usize, size: usize) -> Result<(), VmError> {
        let mut views = self.lock_views();
        let view = views.find(addr).ok_or(VmError::NotReserved)?;
        if addr != view.base() {
            return Err(VmError::InvalidParameter);
        }
        if size != 0 && extent(0, size)?.1 != view.size() {
            return Err(VmError::InvalidParameter);
        }
        let (base, vsize) = (view.base(), view.size());
        self.host().unmap(base, vsize).map_err(host_err)?;
        views.remove(base);
        debug!("release base={base:#x} size={vsize:#x}");
        Ok(())
    }

    /// Change the protection of committed pages.
    ///
    /// Every page in the range must be committed. The host request covers
    /// the whole range in one call; if the host fails partway through a
    /// multi-page range, some host pages may already carry the new access
    /// while the registry still records the old one. Atomicity here is
    /// best-effort, bounded by the host primitive.
    ///
    /// # Returns
    /// The prior protection of the first page in the range.
    pub fn protect(
        &self,
        addr: usize,
        size: usize,
        prot: GuestProt,
    ) -> Result<GuestProt, VmError> {
        let (base, end) = extent(addr, size)?;
        let mut views = self.lock_views();
        let view = views.find_mut(base).ok_or(VmError::NotReserved)?;
        if end > view.end() {
            return Err(VmError::ConflictingAddresses);
        }
        if !view.all_committed(base, end - base) {
            return Err(VmError::NotCommitted);
        }
        let (prior, _) = view.page_at(base).to_guest();
        let bits = prot.to_page() | PageProt::COMMITTED;
        self.host()
            .set_access(base, end - base, bits.to_host())
            .map_err(host_err)?;
        view.set_range(base, end - base, bits);
        debug!("protect base={base:#x} size={:#x} prot={prot:?}", end - base);
        Ok(prior)
    }

    /// Describe the region containing `addr`.
    ///
    /// Resolves the owning view (or reports free space up to the next view)
    /// and returns the contiguous run sharing the queried page's protection,
    /// the view's original base and requested protection, and the backing
    /// classification.
    pub fn query(&self, addr: usize) -> QueryInfo {
        let views = self.lock_views();
        let base = trunc_page(addr);
        match views.find(addr) {
            None => {
                let next = views
                    .next_base_above(addr)
                    .unwrap_or_else(|| self.ceiling().max(base + PAGE_SIZE));
                QueryInfo {
                    base,
                    size: next - base,
                    state: PageState::Free,
                    prot: GuestProt::NOACCESS,
                    alloc_base: 0,
                    alloc_prot: GuestProt::NOACCESS,
                    kind: RegionKind::Free,
                }
            }
            Some(view) => {
                let (prot, state) = view.page_at(addr).to_guest();
                let (run_base, run_size) = view.prot_run(addr);
                let kind = match view.backing().map(|b| b.kind()) {
                    Some(BackingKind::Image) => RegionKind::Image,
                    Some(BackingKind::Mapped) => RegionKind::Mapped,
                    None => RegionKind::Private,
                };
                QueryInfo {
                    base: run_base,
                    size: run_size,
                    state,
                    prot,
                    alloc_base: view.base(),
                    alloc_prot: view.initial_prot(),
                    kind,
                }
            }
        }
    }

    /// Attach a backing reference to the view at `base` (image mapper path).
    pub(crate) fn attach_backing(&self, base: usize, backing: Arc<Backing>) {
        let mut views = self.lock_views();
        if let Some(view) = views.find_mut(base) {
            view.set_backing(backing);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
