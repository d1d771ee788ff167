//! Fault dispatch
//!
//! Resolves a faulting address synchronously on the faulting thread, called
//! by the process's top-level fault handler. Resolution order: a registered
//! hook whose sub-range covers the address, then a guard page (lifted
//! one-shot), then the registered stack-guard band, then an unhandled
//! violation.
//!
//! The dispatcher runs in a restricted context, so it confines itself to the
//! narrow mutation path: one page's protection bits under the registry lock.
//! A user hook is invoked only after the lock is released and re-enters
//! through [`AddressSpace::promote_lazy_page`].

use std::ops::Range;
use std::sync::Arc;

use log::debug;

use crate::protect::PageProt;
use crate::space::AddressSpace;
use crate::{trunc_page, PAGE_SIZE};

/// Fault hook callback: argument state is captured by the closure. Returns
/// `true` when the fault is handled and the instruction should retry.
pub type FaultHook = Arc<dyn Fn(&AddressSpace, usize) -> bool + Send + Sync>;

/// The access that faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

/// Outcome of fault dispatch, reported to the top-level fault handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDisposition {
    /// A hook handled the fault; retry the instruction
    Handled,
    /// A guard page was touched for the first time and is now plain
    GuardHit,
    /// The address lies in the registered stack-guard band
    StackOverflow,
    /// Nothing claims the fault; report it up
    Unhandled,
}

impl AddressSpace {
    /// Register a fault hook on the view whose base is `base`.
    ///
    /// One hook per view; returns `false` if the view does not exist,
    /// already has a hook, or `range` falls outside it.
    pub fn install_fault_hook(&self, base: usize, range: Range<usize>, hook: FaultHook) -> bool {
        let mut views = self.lock_views();
        match views.find_mut(base) {
            Some(view) => view.set_hook(range, hook),
            None => false,
        }
    }

    /// Resolve a fault at `addr`.
    ///
    /// # Arguments
    /// * `addr` - the faulting address
    /// * `access` - the access kind from the execution context
    pub fn dispatch_fault(&self, addr: usize, access: AccessKind) -> FaultDisposition {
        // Hook lookup happens under the lock; the callback runs after it is
        // released, because hooks re-enter through promote_lazy_page.
        let hook = {
            let views = self.lock_views();
            match views.find(addr) {
                None => {
                    debug!("fault miss addr={addr:#x} access={access:?}");
                    return FaultDisposition::Unhandled;
                }
                Some(view) => view.hook_for(addr),
            }
        };
        if let Some(hook) = hook {
            if hook(self, addr) {
                return FaultDisposition::Handled;
            }
        }

        // Guard lift: the one-shot narrow mutation path.
        {
            let mut views = self.lock_views();
            match views.find_mut(addr) {
                None => return FaultDisposition::Unhandled,
                Some(view) => {
                    let page = view.page_at(addr);
                    if page.contains(PageProt::GUARD) {
                        let plain = page - PageProt::GUARD;
                        if self
                            .host()
                            .set_access(trunc_page(addr), PAGE_SIZE, plain.to_host())
                            .is_ok()
                        {
                            view.set_page(addr, plain);
                            debug!("guard hit addr={addr:#x}");
                            return FaultDisposition::GuardHit;
                        }
                    }
                }
            }
        }

        if let Some(band) = self.stack_guard() {
            if band.contains(&addr) {
                return FaultDisposition::StackOverflow;
            }
        }
        debug!("unhandled fault addr={addr:#x} access={access:?}");
        FaultDisposition::Unhandled
    }

    /// Grant write access to the single committed page containing `addr`.
    ///
    /// The re-entry point for lazy-write hooks: deliberately narrower than
    /// `protect`, touching one page and nothing else. Returns `false` if the
    /// page is not committed or is already writable.
    pub fn promote_lazy_page(&self, addr: usize) -> bool {
        let mut views = self.lock_views();
        let view = match views.find_mut(addr) {
            Some(view) => view,
            None => return false,
        };
        let page = view.page_at(addr);
        if !page.contains(PageProt::COMMITTED) || page.contains(PageProt::WRITE) {
            return false;
        }
        let promoted = (page - PageProt::WRITECOPY) | PageProt::WRITE;
        if self
            .host()
            .set_access(trunc_page(addr), PAGE_SIZE, promoted.to_host())
            .is_err()
        {
            return false;
        }
        view.set_page(addr, promoted);
        debug!("lazy page promoted addr={addr:#x}");
        true
    }
}

// ============================================================================
// Tests
// ============================================================================
