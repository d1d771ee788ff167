//! Address-space placement
//!
//! Chooses a base for a new view. Two entry points cover the three
//! placement strategies:
//!
//! 1. [`place_exact`]: exact page-aligned base, or an occupancy report. The
//!    caller decides what occupancy means: commit at a named base treats it
//!    as a conflict, the image mapper treats it as the signal to pick
//!    another base and relocate.
//! 2. [`place_search`]: caller hint first (if any), then a first-fit scan of
//!    the gaps between views, upward from the permanently off-limits floor,
//!    with bases rounded to the allocation granularity. The gap after the
//!    last view is bounded only by the ceiling.
//!
//! Every candidate is checked against the bootstrap-reservation oracle: a
//! `Reserved` answer skips the candidate, a partial `Overlaps` answer is a
//! hard failure. Zero-sized requests and wraparound are rejected by the
//! region operations before the allocator runs.

use crate::error::VmError;
use crate::space::{BootReservations, ReservationStatus};
use crate::view::ViewList;
use crate::{round_granule, PAGE_SIZE};

/// Probe `base` for a `size`-byte view at exactly that address.
///
/// # Returns
/// The registry index at which to insert the view, or `None` when the base
/// is unusable: misaligned, outside the limits, inside a bootstrap
/// reservation, or overlapping an existing view. A partial bootstrap overlap
/// is an error, not an occupancy report.
pub(crate) fn place_exact(
    views: &ViewList,
    boot: &dyn BootReservations,
    floor: usize,
    ceiling: usize,
    base: usize,
    size: usize,
) -> Result<Option<usize>, VmError> {
    debug_assert!(size > 0 && size % PAGE_SIZE == 0);
    if base % PAGE_SIZE != 0
        || base < floor
        || base.checked_add(size).map_or(true, |end| end > ceiling)
    {
        return Ok(None);
    }
    match boot.is_reserved(base, size) {
        ReservationStatus::Overlaps => Err(VmError::ConflictingAddresses),
        ReservationStatus::Reserved => Ok(None),
        ReservationStatus::Free => {
            if views.iter().any(|v| v.overlaps(base, base + size)) {
                Ok(None)
            } else {
                Ok(Some(views.insertion_point(base)))
            }
        }
    }
}

/// Choose a base for a `size`-byte view: hint first, then first-fit.
///
/// `size` is page-rounded and non-zero by the time it gets here. Address
/// exhaustion reports [`VmError::NoSpace`], distinct from the host's
/// out-of-memory.
///
/// # Returns
/// The chosen base plus the registry index at which to insert the view.
pub(crate) fn place_search(
    views: &ViewList,
    boot: &dyn BootReservations,
    floor: usize,
    ceiling: usize,
    hint: Option<usize>,
    size: usize,
) -> Result<(usize, usize), VmError> {
    debug_assert!(size > 0 && size % PAGE_SIZE == 0);

    // A usable hint is tried as an exact placement, then forgotten.
    if let Some(hint) = hint {
        let base = round_granule(hint);
        if let Some(index) = place_exact(views, boot, floor, ceiling, base, size)? {
            return Ok((base, index));
        }
    }

    // First-fit over the gaps between views.
    let mut cursor = round_granule(floor);
    for (index, view) in views.iter().enumerate() {
        if view.end() <= cursor {
            continue;
        }
        if view.base() > cursor {
            if let Some(base) = probe_gap(boot, cursor, view.base().min(ceiling), size)? {
                return Ok((base, index));
            }
        }
        cursor = cursor.max(round_granule(view.end()));
        if cursor >= ceiling {
            return Err(VmError::NoSpace);
        }
    }

    // The gap after the last view, bounded only by the ceiling.
    if let Some(base) = probe_gap(boot, cursor, ceiling, size)? {
        return Ok((base, views.len()));
    }
    Err(VmError::NoSpace)
}

/// First granularity-aligned candidate inside `[cursor, gap_end)` the oracle
/// leaves free. `Reserved` candidates are stepped over; `Overlaps` is a hard
/// failure.
fn probe_gap(
    boot: &dyn BootReservations,
    mut cursor: usize,
    gap_end: usize,
    size: usize,
) -> Result<Option<usize>, VmError> {
    while let Some(end) = cursor.checked_add(size) {
        if end > gap_end {
            return Ok(None);
        }
        match boot.is_reserved(cursor, size) {
            ReservationStatus::Free => return Ok(Some(cursor)),
            ReservationStatus::Reserved => cursor += crate::GRANULARITY,
            ReservationStatus::Overlaps => return Err(VmError::ConflictingAddresses),
        }
    }
    Ok(None)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protect::GuestProt;
    use crate::space::{NoReservations, StaticReservations};
    use crate::view::{View, ViewFlags};
    use crate::GRANULARITY;

    const FLOOR: usize = 0x110000;
    const CEILING: usize = 0x400000;

    fn list(ranges: &[(usize, usize)]) -> ViewList {
        let mut views = ViewList::new();
        for &(base, size) in ranges {
            views
                .insert(View::new(base, size, GuestProt::READWRITE, ViewFlags::ALLOCATED))
                .unwrap();
        }
        views
    }

    fn search(views: &ViewList, boot: &dyn BootReservations, size: usize) -> Result<(usize, usize), VmError> {
        place_search(views, boot, FLOOR, CEILING, None, size)
    }

    #[test]
    fn empty_space_places_at_floor() {
        let views = list(&[]);
        assert_eq!(search(&views, &NoReservations, 0x2000), Ok((FLOOR, 0)));
    }

    #[test]
    fn search_skips_views_and_aligns_to_granularity() {
        // First view sits right at the floor; next candidate must round its
        // end up to the granularity.
        let views = list(&[(FLOOR, 0x1000)]);
        assert_eq!(
            search(&views, &NoReservations, 0x2000),
            Ok((FLOOR + GRANULARITY, 1))
        );
    }

    #[test]
    fn search_uses_first_sufficient_gap() {
        let views = list(&[(FLOOR, 0x10000), (FLOOR + 0x20000, 0x10000)]);
        // 0x10000 gap between the views fits exactly.
        assert_eq!(
            search(&views, &NoReservations, 0x10000),
            Ok((FLOOR + 0x10000, 1))
        );
        // A bigger request must go past both.
        assert_eq!(
            search(&views, &NoReservations, 0x20000),
            Ok((FLOOR + 0x30000, 2))
        );
    }

    #[test]
    fn hint_is_honored_when_free_and_dropped_when_occupied() {
        let views = list(&[(0x200000, 0x10000)]);
        assert_eq!(
            place_search(&views, &NoReservations, FLOOR, CEILING, Some(0x300000), 0x1000),
            Ok((0x300000, 1))
        );
        assert_eq!(
            place_search(&views, &NoReservations, FLOOR, CEILING, Some(0x200000), 0x1000),
            Ok((FLOOR, 0))
        );
    }

    #[test]
    fn exact_placement_reports_occupancy() {
        let views = list(&[(0x200000, 0x10000)]);
        assert_eq!(
            place_exact(&views, &NoReservations, FLOOR, CEILING, 0x208000, 0x1000),
            Ok(None)
        );
        assert_eq!(
            place_exact(&views, &NoReservations, FLOOR, CEILING, 0x300000, 0x1000),
            Ok(Some(1))
        );
    }

    #[test]
    fn exact_placement_accepts_page_aligned_bases() {
        // Exact bases are page-granular, not allocation-granular: a preferred
        // image base one page above the floor must be honored, not rounded.
        let views = list(&[]);
        assert_eq!(
            place_exact(&views, &NoReservations, FLOOR, CEILING, FLOOR + 0x1000, 0x2000),
            Ok(Some(0))
        );
        assert_eq!(
            place_exact(&views, &NoReservations, FLOOR, CEILING, FLOOR + 0x800, 0x2000),
            Ok(None)
        );
    }

    #[test]
    fn exact_placement_respects_limits() {
        let views = list(&[]);
        assert_eq!(
            place_exact(&views, &NoReservations, FLOOR, CEILING, FLOOR - 0x1000, 0x1000),
            Ok(None)
        );
        assert_eq!(
            place_exact(&views, &NoReservations, FLOOR, CEILING, CEILING - 0x1000, 0x2000),
            Ok(None)
        );
    }

    #[test]
    fn bootstrap_reserved_gaps_are_skipped() {
        let boot = StaticReservations::new(vec![FLOOR..FLOOR + GRANULARITY]);
        let views = list(&[]);
        assert_eq!(
            place_search(&views, &boot, FLOOR, CEILING, None, GRANULARITY),
            Ok((FLOOR + GRANULARITY, 0))
        );
        assert_eq!(
            place_exact(&views, &boot, FLOOR, CEILING, FLOOR, GRANULARITY),
            Ok(None)
        );
    }

    #[test]
    fn partial_bootstrap_overlap_is_a_hard_failure() {
        let boot = StaticReservations::new(vec![FLOOR + 0x8000..FLOOR + 0x9000]);
        let views = list(&[]);
        assert_eq!(
            search(&views, &boot, GRANULARITY),
            Err(VmError::ConflictingAddresses)
        );
        assert_eq!(
            place_exact(&views, &boot, FLOOR, CEILING, FLOOR, GRANULARITY),
            Err(VmError::ConflictingAddresses)
        );
    }

    #[test]
    fn exhaustion_is_distinct_from_conflict() {
        let views = list(&[]);
        assert_eq!(
            search(&views, &NoReservations, CEILING),
            Err(VmError::NoSpace)
        );
    }
}
