//! Host mapping primitives
//!
//! The registry asks the host for exactly four things: an anonymous
//! no-access mapping at an exact placement (reserve), an access change over
//! an owned range, a fresh zero-filled no-access mapping over an owned range
//! (decommit), and removal of a mapping (release). The image mapper adds
//! file-backed mappings and positioned reads.
//!
//! The trait exists so the registry logic is testable without touching the
//! process's real address space: `PosixMem` is the production backend,
//! `MockMem` records a page map for deterministic tests.

use std::os::fd::RawFd;

use thiserror::Error;

use crate::protect::HostProt;
#[cfg(test)]
use crate::PAGE_SIZE;

/// Failure of a host mapping request.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    /// The exact placement is already occupied by another mapping
    #[error("placement occupied")]
    Occupied,
    /// The host could not satisfy the request
    #[error("host resources exhausted")]
    Exhausted,
}

/// Host anonymous-mapping and protection primitive.
///
/// All ranges are page-aligned; callers round before asking.
pub trait HostMem: Send + Sync {
    /// Anonymous no-access mapping over exactly `[addr, addr + size)`.
    ///
    /// Reports [`HostError::Occupied`] when something else already lives in
    /// the range, distinct from resource exhaustion, so the allocator can
    /// pick another base.
    fn reserve(&self, addr: usize, size: usize) -> Result<(), HostError>;

    /// Change access on a range this subsystem already owns.
    fn set_access(&self, addr: usize, size: usize, prot: HostProt) -> Result<(), HostError>;

    /// Replace an owned range with fresh zero-filled no-access memory.
    fn zero(&self, addr: usize, size: usize) -> Result<(), HostError>;

    /// File-backed mapping at an exact placement inside an owned range.
    fn map_file(
        &self,
        addr: usize,
        size: usize,
        fd: RawFd,
        offset: u64,
        prot: HostProt,
        shared: bool,
    ) -> Result<(), HostError>;

    /// Remove a mapping this subsystem owns.
    fn unmap(&self, addr: usize, size: usize) -> Result<(), HostError>;

    /// Positioned read from a descriptor, filling as much of `buf` as the
    /// file provides.
    fn read_at(&self, fd: RawFd, buf: &mut [u8], offset: u64) -> Result<usize, HostError>;
}

// ============================================================================
// POSIX backend
// ============================================================================

/// The production backend: `mmap`/`mprotect`/`munmap`/`pread`.
pub struct PosixMem;

#[cfg(target_os = "linux")]
const MAP_NOREPLACE: libc::c_int = libc::MAP_FIXED_NOREPLACE;
#[cfg(not(target_os = "linux"))]
const MAP_NOREPLACE: libc::c_int = 0;

fn prot_bits(prot: HostProt) -> libc::c_int {
    let mut bits = libc::PROT_NONE;
    if prot.contains(HostProt::READ) {
        bits |= libc::PROT_READ;
    }
    if prot.contains(HostProt::WRITE) {
        bits |= libc::PROT_WRITE;
    }
    if prot.contains(HostProt::EXEC) {
        bits |= libc::PROT_EXEC;
    }
    bits
}

fn last_errno() -> libc::c_int {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl HostMem for PosixMem {
    fn reserve(&self, addr: usize, size: usize) -> Result<(), HostError> {
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | MAP_NOREPLACE;
        let ptr = unsafe {
            libc::mmap(addr as *mut libc::c_void, size, libc::PROT_NONE, flags, -1, 0)
        };
        if ptr == libc::MAP_FAILED {
            return Err(if last_errno() == libc::EEXIST {
                HostError::Occupied
            } else {
                HostError::Exhausted
            });
        }
        // Kernels that don't know MAP_FIXED_NOREPLACE ignore it and map
        // elsewhere; that still means the placement was not honored.
        if ptr as usize != addr {
            unsafe { libc::munmap(ptr, size) };
            return Err(HostError::Occupied);
        }
        Ok(())
    }

    fn set_access(&self, addr: usize, size: usize, prot: HostProt) -> Result<(), HostError> {
        let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, size, prot_bits(prot)) };
        if rc != 0 {
            return Err(HostError::Exhausted);
        }
        Ok(())
    }

    fn zero(&self, addr: usize, size: usize) -> Result<(), HostError> {
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED;
        let ptr = unsafe {
            libc::mmap(addr as *mut libc::c_void, size, libc::PROT_NONE, flags, -1, 0)
        };
        if ptr == libc::MAP_FAILED {
            return Err(HostError::Exhausted);
        }
        Ok(())
    }

    fn map_file(
        &self,
        addr: usize,
        size: usize,
        fd: RawFd,
        offset: u64,
        prot: HostProt,
        shared: bool,
    ) -> Result<(), HostError> {
        let visibility = if shared { libc::MAP_SHARED } else { libc::MAP_PRIVATE };
        let flags = visibility | libc::MAP_FIXED;
        let ptr = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                size,
                prot_bits(prot),
                flags,
                fd,
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(HostError::Exhausted);
        }
        Ok(())
    }

    fn unmap(&self, addr: usize, size: usize) -> Result<(), HostError> {
        let rc = unsafe { libc::munmap(addr as *mut libc::c_void, size) };
        if rc != 0 {
            return Err(HostError::Exhausted);
        }
        Ok(())
    }

    fn read_at(&self, fd: RawFd, buf: &mut [u8], offset: u64) -> Result<usize, HostError> {
        let n = unsafe {
            libc::pread(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };
        if n < 0 {
            return Err(HostError::Exhausted);
        }
        Ok(n as usize)
    }
}

// ============================================================================
// Mock backend
// ============================================================================

/// Recording backend for registry tests: tracks a page -> access map and
/// never touches real memory. Reads yield zeroes.
#[cfg(test)]
pub(crate) struct MockMem {
    pages: spin::Mutex<std::collections::BTreeMap<usize, HostProt>>,
}

#[cfg(test)]
impl MockMem {
    pub(crate) fn new() -> Self {
        Self {
            pages: spin::Mutex::new(std::collections::BTreeMap::new()),
        }
    }

    /// Recorded access for the page containing `addr`, `None` if unmapped.
    pub(crate) fn prot_at(&self, addr: usize) -> Option<HostProt> {
        self.pages.lock().get(&crate::trunc_page(addr)).copied()
    }

    fn each_page(addr: usize, size: usize) -> impl Iterator<Item = usize> {
        (addr..addr + size).step_by(PAGE_SIZE)
    }
}

#[cfg(test)]
impl HostMem for MockMem {
    fn reserve(&self, addr: usize, size: usize) -> Result<(), HostError> {
        let mut pages = self.pages.lock();
        if Self::each_page(addr, size).any(|p| pages.contains_key(&p)) {
            return Err(HostError::Occupied);
        }
        for page in Self::each_page(addr, size) {
            pages.insert(page, HostProt::empty());
        }
        Ok(())
    }

    fn set_access(&self, addr: usize, size: usize, prot: HostProt) -> Result<(), HostError> {
        let mut pages = self.pages.lock();
        if Self::each_page(addr, size).any(|p| !pages.contains_key(&p)) {
            return Err(HostError::Exhausted);
        }
        for page in Self::each_page(addr, size) {
            pages.insert(page, prot);
        }
        Ok(())
    }

    fn zero(&self, addr: usize, size: usize) -> Result<(), HostError> {
        self.set_access(addr, size, HostProt::empty())
    }

    fn map_file(
        &self,
        addr: usize,
        size: usize,
        _fd: RawFd,
        _offset: u64,
        prot: HostProt,
        _shared: bool,
    ) -> Result<(), HostError> {
        let mut pages = self.pages.lock();
        for page in Self::each_page(addr, size) {
            pages.insert(page, prot);
        }
        Ok(())
    }

    fn unmap(&self, addr: usize, size: usize) -> Result<(), HostError> {
        let mut pages = self.pages.lock();
        for page in Self::each_page(addr, size) {
            pages.remove(&page);
        }
        Ok(())
    }

    fn read_at(&self, _fd: RawFd, buf: &mut [u8], _offset: u64) -> Result<usize, HostError> {
        buf.fill(0);
        Ok(buf.len())
    }
}

// Lets a test hold on to the mock for assertions while the space owns a
// boxed clone.
#[cfg(test)]
impl HostMem for std::sync::Arc<MockMem> {
    fn reserve(&self, addr: usize, size: usize) -> Result<(), HostError> {
        (**self).reserve(addr, size)
    }

    fn set_access(&self, addr: usize, size: usize, prot: HostProt) -> Result<(), HostError> {
        (**self).set_access(addr, size, prot)
    }

    fn zero(&self, addr: usize, size: usize) -> Result<(), HostError> {
        (**self).zero(addr, size)
    }

    fn map_file(
        &self,
        addr: usize,
        size: usize,
        fd: RawFd,
        offset: u64,
        prot: HostProt,
        shared: bool,
    ) -> Result<(), HostError> {
        (**self).map_file(addr, size, fd, offset, prot, shared)
    }

    fn unmap(&self, addr: usize, size: usize) -> Result<(), HostError> {
        (**self).unmap(addr, size)
    }

    fn read_at(&self, fd: RawFd, buf: &mut [u8], offset: u64) -> Result<usize, HostError> {
        (**self).read_at(fd, buf, offset)
    }
}

// ============================================================================
// Tests
// ============================================================================
