//! Error types for the guest VM subsystem
//!
//! One taxonomy for every caller-visible failure:
//! - invalid request: rejected before registry or host state is touched
//! - address conflict: a fixed range collides with a view or a bootstrap
//!   reservation; nothing is left partially mapped
//! - address-space exhaustion vs host memory exhaustion, kept distinct
//! - corrupt image: one error, nothing of the image left mapped

use thiserror::Error;

/// Errors produced by region operations, the image mapper, and the delegate.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Malformed size, alignment, or flags; rejected up front
    #[error("invalid parameter")]
    InvalidParameter,
    /// Requested fixed range overlaps a view or a bootstrap reservation
    #[error("conflicting addresses")]
    ConflictingAddresses,
    /// Free-gap search exhausted the usable address range
    #[error("out of address space")]
    NoSpace,
    /// The host refused a mapping or protection request
    #[error("host mapping failure")]
    NoMemory,
    /// The operation requires every page in range to be committed
    #[error("range is not committed")]
    NotCommitted,
    /// No view covers the requested range
    #[error("range is not reserved")]
    NotReserved,
    /// The image headers failed validation
    #[error("corrupt image: {0}")]
    BadImage(#[from] ImageError),
    /// A delegated call could not be transported
    #[error("remote call failed: {0}")]
    Remote(&'static str),
}

/// Validation failures while parsing an executable image.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ImageError {
    /// Stub or image magic did not match
    #[error("bad magic")]
    BadMagic,
    /// A header field lies outside the supplied header bytes
    #[error("truncated header")]
    Truncated,
    /// Section table does not fit inside the header region
    #[error("section table out of bounds")]
    SectionTableOutOfBounds,
    /// Image targets a different instruction set than the host
    #[error("unsupported machine {0:#06x}")]
    WrongMachine(u16),
    /// Section or relocation data could not be read from the file
    #[error("section read failed")]
    SectionRead,
    /// A section or relocation block lies outside the image bounds
    #[error("section out of image bounds")]
    SectionOutOfBounds,
}
