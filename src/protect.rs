//! Protection translation
//!
//! Pure mapping between the guest's page protection constants and the host's
//! access bits. The guest model distinguishes eight base accessibilities plus
//! the guard and no-cache modifiers; the host only knows read/write/execute.
//! The committed bit is tracked per page alongside the protection: a
//! reservation has no host access at all until it is committed, and a guard
//! page is host no-access even when logically committed so that the first
//! touch traps into the fault dispatcher.

use bitflags::bitflags;

bitflags! {
    /// Guest-visible page protection constants.
    ///
    /// Exactly one base accessibility is meaningful at a time; GUARD and
    /// NOCACHE are independent modifiers. The eight bases with and without
    /// GUARD give the sixteen canonical combinations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GuestProt: u32 {
        /// No access
        const NOACCESS = 0x01;
        /// Read-only
        const READONLY = 0x02;
        /// Read and write
        const READWRITE = 0x04;
        /// Readable, writable with copy-on-write
        const WRITECOPY = 0x08;
        /// Execute-only
        const EXECUTE = 0x10;
        /// Execute and read
        const EXECUTE_READ = 0x20;
        /// Execute, read, and write
        const EXECUTE_READWRITE = 0x40;
        /// Execute, readable, writable with copy-on-write
        const EXECUTE_WRITECOPY = 0x80;
        /// Trap on first access, then revert to the base accessibility
        const GUARD = 0x100;
        /// Uncached access
        const NOCACHE = 0x200;
    }
}

bitflags! {
    /// Per-page protection state held in a view's page array, one byte per
    /// page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageProt: u8 {
        /// Page is readable
        const READ = 0x01;
        /// Page is writable
        const WRITE = 0x02;
        /// Page is executable
        const EXEC = 0x04;
        /// Page is writable via copy-on-write
        const WRITECOPY = 0x08;
        /// First touch traps, then the bit is cleared
        const GUARD = 0x10;
        /// Uncached access
        const NOCACHE = 0x20;
        /// Page has been committed; clear means merely reserved
        const COMMITTED = 0x40;
    }
}

bitflags! {
    /// Host access bits, the subset a POSIX protection request understands.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostProt: u32 {
        /// Host read permission
        const READ = 0x1;
        /// Host write permission
        const WRITE = 0x2;
        /// Host execute permission
        const EXEC = 0x4;
    }
}

/// Lifecycle state of a page, derived from its view and committed bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// No view covers the page
    Free,
    /// A view covers the page but it is not committed
    Reserved,
    /// The page is committed and carries host access per its protection
    Committed,
}

impl GuestProt {
    /// Translate a guest protection value to per-page bits.
    ///
    /// Total: an unknown or empty base accessibility falls back to no
    /// access. The caller is expected to log that fallback; the translation
    /// itself has no error path. The committed bit is never set here.
    pub fn to_page(self) -> PageProt {
        let mut prot = if self.contains(GuestProt::READONLY) {
            PageProt::READ
        } else if self.contains(GuestProt::READWRITE) {
            PageProt::READ | PageProt::WRITE
        } else if self.contains(GuestProt::WRITECOPY) {
            PageProt::READ | PageProt::WRITECOPY
        } else if self.contains(GuestProt::EXECUTE) {
            PageProt::EXEC
        } else if self.contains(GuestProt::EXECUTE_READ) {
            PageProt::READ | PageProt::EXEC
        } else if self.contains(GuestProt::EXECUTE_READWRITE) {
            PageProt::READ | PageProt::WRITE | PageProt::EXEC
        } else if self.contains(GuestProt::EXECUTE_WRITECOPY) {
            PageProt::READ | PageProt::WRITECOPY | PageProt::EXEC
        } else {
            // NOACCESS, or a value outside the known table
            PageProt::empty()
        };
        if self.contains(GuestProt::GUARD) {
            prot |= PageProt::GUARD;
        }
        if self.contains(GuestProt::NOCACHE) {
            prot |= PageProt::NOCACHE;
        }
        prot
    }
}

impl PageProt {
    /// Host access for a page in this state.
    ///
    /// A page carries host permissions only if it is committed and not
    /// guarded. A copy-on-write page gets host write permission; the private
    /// host mapping supplies the copy semantics.
    pub fn to_host(self) -> HostProt {
        if !self.contains(PageProt::COMMITTED) || self.contains(PageProt::GUARD) {
            return HostProt::empty();
        }
        let mut host = HostProt::empty();
        if self.contains(PageProt::READ) {
            host |= HostProt::READ;
        }
        if self.intersects(PageProt::WRITE | PageProt::WRITECOPY) {
            host |= HostProt::WRITE;
        }
        if self.contains(PageProt::EXEC) {
            host |= HostProt::EXEC;
        }
        host
    }

    /// Guest-visible protection and state for this page.
    ///
    /// Inverse of [`GuestProt::to_page`] plus the committed bit. A reserved
    /// page reports no access regardless of the protection it will take on
    /// commit.
    pub fn to_guest(self) -> (GuestProt, PageState) {
        if !self.contains(PageProt::COMMITTED) {
            return (GuestProt::NOACCESS, PageState::Reserved);
        }
        let exec = self.contains(PageProt::EXEC);
        let base = if self.contains(PageProt::WRITECOPY) {
            if exec {
                GuestProt::EXECUTE_WRITECOPY
            } else {
                GuestProt::WRITECOPY
            }
        } else if self.contains(PageProt::WRITE) {
            if exec {
                GuestProt::EXECUTE_READWRITE
            } else {
                GuestProt::READWRITE
            }
        } else if self.contains(PageProt::READ) {
            if exec {
                GuestProt::EXECUTE_READ
            } else {
                GuestProt::READONLY
            }
        } else if exec {
            GuestProt::EXECUTE
        } else {
            GuestProt::NOACCESS
        };
        let mut prot = base;
        if self.contains(PageProt::GUARD) {
            prot |= GuestProt::GUARD;
        }
        if self.contains(PageProt::NOCACHE) {
            prot |= GuestProt::NOCACHE;
        }
        (prot, PageState::Committed)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const BASES: [GuestProt; 8] = [
        GuestProt::NOACCESS,
        GuestProt::READONLY,
        GuestProt::READWRITE,
        GuestProt::WRITECOPY,
        GuestProt::EXECUTE,
        GuestProt::EXECUTE_READ,
        GuestProt::EXECUTE_READWRITE,
        GuestProt::EXECUTE_WRITECOPY,
    ];

    #[test]
    fn guest_page_round_trip_all_combinations() {
        for base in BASES {
            for modifier in [GuestProt::empty(), GuestProt::GUARD] {
                let prot = base | modifier;
                let page = prot.to_page() | PageProt::COMMITTED;
                let (back, state) = page.to_guest();
                assert_eq!(back, prot, "round trip of {prot:?}");
                assert_eq!(state, PageState::Committed);
            }
        }
    }

    #[test]
    fn reserved_pages_report_no_access() {
        let page = GuestProt::READWRITE.to_page();
        assert!(!page.contains(PageProt::COMMITTED));
        let (prot, state) = page.to_guest();
        assert_eq!(prot, GuestProt::NOACCESS);
        assert_eq!(state, PageState::Reserved);
    }

    #[test]
    fn uncommitted_pages_have_no_host_access() {
        let page = GuestProt::EXECUTE_READWRITE.to_page();
        assert_eq!(page.to_host(), HostProt::empty());
    }

    #[test]
    fn guard_pages_are_host_no_access_even_when_committed() {
        let page = (GuestProt::READWRITE | GuestProt::GUARD).to_page() | PageProt::COMMITTED;
        assert_eq!(page.to_host(), HostProt::empty());
        let plain = page - PageProt::GUARD;
        assert_eq!(plain.to_host(), HostProt::READ | HostProt::WRITE);
    }

    #[test]
    fn writecopy_gets_host_write() {
        let page = GuestProt::WRITECOPY.to_page() | PageProt::COMMITTED;
        assert_eq!(page.to_host(), HostProt::READ | HostProt::WRITE);
    }

    #[test]
    fn unknown_values_fall_back_to_no_access() {
        let bogus = GuestProt::from_bits_retain(0x1000);
        assert_eq!(bogus.to_page(), PageProt::empty());
    }
}
