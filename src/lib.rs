//! Guest virtual-memory subsystem for a flat 32-bit address space hosted
//! inside an ordinary user process.
//!
//! Provides the guest memory model on top of host mapping primitives:
//! - view registry: address-ordered, non-overlapping tracked ranges
//! - protection translation: guest constants <-> per-page bits <-> host bits
//! - placement: hint, exact, or free-gap search over bootstrap reservations
//! - region operations: reserve/commit/decommit/release/protect/query
//! - image mapper: relocatable executable images with lazy-write sections
//! - fault dispatcher: hooks, guard pages, stack-overflow classification
//! - delegate: region operations forwarded to another process's subsystem
//!
//! Everything hangs off an explicit [`AddressSpace`] context, so independent
//! spaces coexist in one process.

pub mod alloc;
pub mod delegate;
pub mod error;
pub mod fault;
pub mod host;
pub mod image;
pub mod protect;
pub mod region;
pub mod space;
pub mod view;

pub use delegate::{serve, ControlChannel, Delegate, RemoteOp, RemoteReply, RemoteRequest};
pub use error::{ImageError, VmError};
pub use fault::{AccessKind, FaultDisposition, FaultHook};
pub use host::{HostError, HostMem, PosixMem};
pub use image::SharedStore;
pub use protect::{GuestProt, HostProt, PageProt, PageState};
pub use region::{QueryInfo, RegionKind};
pub use space::{
    AddressSpace, BootReservations, NoReservations, ReservationStatus, StaticReservations,
};
pub use view::{Backing, BackingKind, View, ViewFlags, ViewList};

/// Host page size the subsystem is built for.
pub const PAGE_SIZE: usize = 0x1000;

/// Placement granularity: every view base is aligned to this.
pub const GRANULARITY: usize = 0x10000;

/// Default lowest placeable address; everything below stays off-limits.
pub const SPACE_FLOOR: usize = 0x0011_0000;

/// Default exclusive upper bound of the usable guest range.
pub const SPACE_CEILING: usize = 0x7fff_0000;

#[inline]
pub const fn trunc_page(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

#[inline]
pub const fn round_page(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[inline]
pub const fn trunc_granule(addr: usize) -> usize {
    addr & !(GRANULARITY - 1)
}

#[inline]
pub const fn round_granule(addr: usize) -> usize {
    (addr + GRANULARITY - 1) & !(GRANULARITY - 1)
}
