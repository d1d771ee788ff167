//! Cross-process delegation
//!
//! Region operations targeting another process are forwarded as a fixed-size
//! typed request over a control channel and applied there by [`serve`]
//! against the remote process's own [`AddressSpace`], which stays the single
//! source of truth for the outcome. The wrapper is synchronous: one
//! outstanding call per caller, no timeout or cancellation, the transport
//! belongs to the channel implementation.

use crate::error::VmError;
use crate::protect::GuestProt;
use crate::space::AddressSpace;
use crate::view::ViewFlags;

/// Operation selector carried in a [`RemoteRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOp {
    Reserve,
    Commit,
    Release,
}

/// Marshalled parameters of one remote region operation. `base` of zero on
/// a reserve means no placement hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteRequest {
    pub op: RemoteOp,
    pub base: usize,
    pub size: usize,
    pub prot: GuestProt,
}

/// Completion record written back by the target's region operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteReply {
    pub status: Result<(), VmError>,
    pub base: usize,
}

impl RemoteReply {
    fn ok(base: usize) -> Self {
        Self {
            status: Ok(()),
            base,
        }
    }

    fn err(err: VmError) -> Self {
        Self {
            status: Err(err),
            base: 0,
        }
    }

    pub fn into_result(self) -> Result<usize, VmError> {
        self.status.map(|()| self.base)
    }
}

/// Request/reply transport to one remote process.
///
/// An implementation delivers the request, blocks until the remote side's
/// [`serve`] has run, and returns the reply it wrote back. Transport failures
/// surface as [`VmError::Remote`].
pub trait ControlChannel {
    fn call(&self, request: RemoteRequest) -> Result<RemoteReply, VmError>;
}

/// Apply one marshalled request to this process's own address space.
///
/// Runs on the target side of the channel. Every outcome, including errors,
/// is reported back in the reply rather than surfaced locally.
pub fn serve(space: &AddressSpace, request: RemoteRequest) -> RemoteReply {
    let outcome = match request.op {
        RemoteOp::Reserve => {
            let hint = (request.base != 0).then_some(request.base);
            space.reserve(hint, request.size, request.prot, ViewFlags::ALLOCATED)
        }
        RemoteOp::Commit => space.commit(request.base, request.size, request.prot),
        RemoteOp::Release => space
            .release(request.base, request.size)
            .map(|()| request.base),
    };
    match outcome {
        Ok(base) => RemoteReply::ok(base),
        Err(err) => RemoteReply::err(err),
    }
}

/// Caller-side wrapper: region operations in another process's space.
pub struct Delegate<C: ControlChannel> {
    channel: C,
}

impl<C: ControlChannel> Delegate<C> {
    pub fn new(channel: C) -> Self {
        Self { channel }
    }

    /// Reserve in the remote space; returns the remote base.
    pub fn reserve(
        &self,
        hint: Option<usize>,
        size: usize,
        prot: GuestProt,
    ) -> Result<usize, VmError> {
        self.channel
            .call(RemoteRequest {
                op: RemoteOp::Reserve,
                base: hint.unwrap_or(0),
                size,
                prot,
            })?
            .into_result()
    }

    /// Commit in the remote space; returns the remote base.
    pub fn commit(&self, base: usize, size: usize, prot: GuestProt) -> Result<usize, VmError> {
        self.channel
            .call(RemoteRequest {
                op: RemoteOp::Commit,
                base,
                size,
                prot,
            })?
            .into_result()
    }

    /// Release in the remote space.
    pub fn release(&self, base: usize, size: usize) -> Result<(), VmError> {
        self.channel
            .call(RemoteRequest {
                op: RemoteOp::Release,
                base,
                size,
                prot: GuestProt::NOACCESS,
            })?
            .into_result()
            .map(|_| ())
    }
}

// ============================================================================
// Tests
// ============================================================================
