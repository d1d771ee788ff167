//! The process-scoped address-space context
//!
//! The guest memory model is process-wide, so everything hangs off one
//! explicit context object rather than a global: the view registry behind the
//! single registry lock, the host mapping backend, the bootstrap-reservation
//! oracle, the usable address limits, and the registered stack-guard band.
//! Independent contexts coexist freely, which is how the tests run several
//! spaces side by side.
//!
//! ## The registry lock
//!
//! One `spin::Mutex` serializes every registry mutation and every operation
//! that reads view state and then writes it. Read-only lookups take it too;
//! there is no reader/writer split because host mapping syscalls dominate
//! cost, not lock contention. The lock is held around a registry structural
//! change paired with its matching host request, so the registry never
//! reflects a state the host has not reached. It is never held across file
//! I/O, and the fault dispatcher may take it on the faulting thread because
//! no caller holds it across an instruction stream that can fault.

use std::ops::Range;

use spin::{Mutex, MutexGuard};

use crate::host::HostMem;
use crate::view::ViewList;
use crate::{SPACE_CEILING, SPACE_FLOOR};

/// Answer from the bootstrap reservation oracle for a candidate range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationStatus {
    /// The range does not intersect any bootstrap reservation
    Free,
    /// The range lies entirely inside a bootstrap reservation
    Reserved,
    /// The range partially intersects a bootstrap reservation
    Overlaps,
}

/// Oracle over the address ranges the process bootstrap carved out before
/// this subsystem initialized. The allocator never places a free-gap result
/// inside a `Reserved` range and treats `Overlaps` as a hard failure.
pub trait BootReservations: Send + Sync {
    fn is_reserved(&self, addr: usize, size: usize) -> ReservationStatus;
}

/// Oracle for a process with no bootstrap reservations.
pub struct NoReservations;

impl BootReservations for NoReservations {
    fn is_reserved(&self, _addr: usize, _size: usize) -> ReservationStatus {
        ReservationStatus::Free
    }
}

/// Oracle backed by a fixed list of reserved ranges.
pub struct StaticReservations {
    ranges: Vec<Range<usize>>,
}

impl StaticReservations {
    pub fn new(ranges: Vec<Range<usize>>) -> Self {
        Self { ranges }
    }
}

impl BootReservations for StaticReservations {
    fn is_reserved(&self, addr: usize, size: usize) -> ReservationStatus {
        let end = addr + size;
        for range in &self.ranges {
            if addr >= range.start && end <= range.end {
                return ReservationStatus::Reserved;
            }
            if addr < range.end && range.start < end {
                return ReservationStatus::Overlaps;
            }
        }
        ReservationStatus::Free
    }
}

// ============================================================================
// Address space
// ============================================================================

/// One guest address space: registry, host backend, limits, stack band.
///
/// Created at subsystem init, torn down at process exit. All region
/// operations, the image mapper, and the fault dispatcher are methods on
/// this type.
pub struct AddressSpace {
    views: Mutex<ViewList>,
    host: Box<dyn HostMem>,
    boot: Box<dyn BootReservations>,
    floor: usize,
    ceiling: usize,
    stack_guard: Mutex<Option<Range<usize>>>,
}

impl AddressSpace {
    /// Context over the default usable guest range.
    pub fn new(host: Box<dyn HostMem>, boot: Box<dyn BootReservations>) -> Self {
        Self::with_limits(host, boot, SPACE_FLOOR, SPACE_CEILING)
    }

    /// Context over an explicit usable range. The floor is permanently
    /// off-limits below; the ceiling bounds every placement.
    pub fn with_limits(
        host: Box<dyn HostMem>,
        boot: Box<dyn BootReservations>,
        floor: usize,
        ceiling: usize,
    ) -> Self {
        debug_assert!(floor < ceiling);
        Self {
            views: Mutex::new(ViewList::new()),
            host,
            boot,
            floor,
            ceiling,
            stack_guard: Mutex::new(None),
        }
    }

    pub fn floor(&self) -> usize {
        self.floor
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Register the stack-guard band the fault dispatcher classifies as
    /// stack overflow.
    pub fn set_stack_guard(&self, band: Range<usize>) {
        *self.stack_guard.lock() = Some(band);
    }

    pub(crate) fn stack_guard(&self) -> Option<Range<usize>> {
        self.stack_guard.lock().clone()
    }

    pub(crate) fn lock_views(&self) -> MutexGuard<'_, ViewList> {
        self.views.lock()
    }

    pub(crate) fn host(&self) -> &dyn HostMem {
        &*self.host
    }

    pub(crate) fn boot(&self) -> &dyn BootReservations {
        &*self.boot
    }

    /// Snapshot of (base, size) per view, for invariant checks in tests.
    #[cfg(test)]
    pub(crate) fn view_ranges(&self) -> Vec<(usize, usize)> {
        self.lock_views()
            .iter()
            .map(|v| (v.base(), v.size()))
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
