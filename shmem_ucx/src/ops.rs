//! One-sided operations on a [`Transport`].
//!
//! Callers name remote memory by the *local* symmetric address of the same
//! object. The address is located in the data or heap segment, and the
//! peer's key for that segment plus the translated remote address are
//! handed to the fabric.

use crate::context::{ContextOptions, TransportContext};
use crate::error::{Result, TransportError};
use crate::fabric::{
    Amo, AtomicOp, AtomicWidth, Callback, Fabric, complete_op, issue_error, release_op,
};
use crate::peer::PeerRecord;
use crate::rendezvous::Rendezvous;
use crate::segment::SegmentKind;
use crate::transport::Transport;

/// A resolved remote target.
struct Target<'a, F: Fabric> {
    peer: &'a PeerRecord<F>,
    kind: SegmentKind,
    remote_addr: u64,
}

impl<F: Fabric, R: Rendezvous> Transport<F, R> {
    fn resolve(&self, pe: usize, addr: *const u8, len: usize) -> Result<Target<'_, F>> {
        let peers = self.peers.as_ref().ok_or(TransportError::NotStarted)?;
        let peer = peers.get(pe).ok_or(TransportError::InvalidPe {
            pe,
            world_size: self.world_size(),
        })?;
        let addr = addr as usize;
        let (kind, offset) = self
            .segments()
            .locate(addr, len)
            .ok_or(TransportError::InvalidAddress { addr, len })?;
        Ok(Target {
            peer,
            kind,
            remote_addr: peer.remote_addr(kind, offset, addr),
        })
    }

    fn check_store(ctx: &TransportContext, op: &'static str) -> Result<()> {
        if ctx.options().contains(ContextOptions::NOSTORE) {
            tracing::warn!(ctx = ctx.id(), op, "store on a NOSTORE context");
            return Err(TransportError::Unsupported("store on a NOSTORE context"));
        }
        Ok(())
    }

    /// Write `src` to `dest` on `pe` and wait for completion.
    pub fn put(
        &self,
        ctx: &TransportContext,
        dest: *const u8,
        src: &[u8],
        pe: usize,
    ) -> Result<()> {
        Self::check_store(ctx, "put")?;
        let t = self.resolve(pe, dest, src.len())?;
        ctx.record_issue();
        let submitted = unsafe {
            self.fabric().put(
                t.peer.endpoint(),
                src.as_ptr(),
                src.len(),
                t.remote_addr,
                t.peer.rkey(t.kind),
                Callback::Complete,
            )
        }
        .map_err(issue_error("put", pe))?;
        complete_op(self.fabric(), submitted);
        Ok(())
    }

    /// Start writing `src` to `dest` on `pe`; completed by [`Transport::quiet`].
    ///
    /// # Safety
    /// `src` must not be modified or freed until `ctx` has been quieted.
    pub unsafe fn put_nbi(
        &self,
        ctx: &TransportContext,
        dest: *const u8,
        src: &[u8],
        pe: usize,
    ) -> Result<()> {
        Self::check_store(ctx, "put_nbi")?;
        let t = self.resolve(pe, dest, src.len())?;
        ctx.record_issue();
        let submitted = unsafe {
            self.fabric().put(
                t.peer.endpoint(),
                src.as_ptr(),
                src.len(),
                t.remote_addr,
                t.peer.rkey(t.kind),
                Callback::Nop,
            )
        }
        .map_err(issue_error("put_nbi", pe))?;
        release_op(self.fabric(), submitted);
        Ok(())
    }

    /// Read `dst.len()` bytes from `source` on `pe` and wait for them.
    pub fn get(
        &self,
        ctx: &TransportContext,
        dst: &mut [u8],
        source: *const u8,
        pe: usize,
    ) -> Result<()> {
        let t = self.resolve(pe, source, dst.len())?;
        ctx.record_issue();
        let submitted = unsafe {
            self.fabric().get(
                t.peer.endpoint(),
                dst.as_mut_ptr(),
                dst.len(),
                t.remote_addr,
                t.peer.rkey(t.kind),
                Callback::Complete,
            )
        }
        .map_err(issue_error("get", pe))?;
        complete_op(self.fabric(), submitted);
        Ok(())
    }

    /// Start reading from `source` on `pe` into `dst`; completed by
    /// [`Transport::quiet`].
    ///
    /// # Safety
    /// `dst` must not be read, moved or freed until `ctx` has been quieted.
    pub unsafe fn get_nbi(
        &self,
        ctx: &TransportContext,
        dst: &mut [u8],
        source: *const u8,
        pe: usize,
    ) -> Result<()> {
        let t = self.resolve(pe, source, dst.len())?;
        ctx.record_issue();
        let submitted = unsafe {
            self.fabric().get(
                t.peer.endpoint(),
                dst.as_mut_ptr(),
                dst.len(),
                t.remote_addr,
                t.peer.rkey(t.kind),
                Callback::Nop,
            )
        }
        .map_err(issue_error("get_nbi", pe))?;
        release_op(self.fabric(), submitted);
        Ok(())
    }

    // ========================================================================
    // Atomics
    // ========================================================================

    /// Apply `op` with `value` at `dest` on `pe`; completed by quiet.
    pub fn atomic_post(
        &self,
        ctx: &TransportContext,
        op: AtomicOp,
        width: AtomicWidth,
        dest: *const u8,
        value: u64,
        pe: usize,
    ) -> Result<()> {
        Self::check_store(ctx, "atomic_post")?;
        let t = self.resolve(pe, dest, width.bytes())?;
        ctx.record_issue();
        let submitted = unsafe {
            self.fabric().atomic(
                t.peer.endpoint(),
                Amo::Post { op, value },
                width,
                t.remote_addr,
                t.peer.rkey(t.kind),
                std::ptr::null_mut(),
                Callback::Nop,
            )
        }
        .map_err(issue_error("atomic_post", pe))?;
        release_op(self.fabric(), submitted);
        Ok(())
    }

    /// Apply `op` with `value` at `dest` on `pe`; returns the previous value.
    pub fn atomic_fetch(
        &self,
        ctx: &TransportContext,
        op: AtomicOp,
        width: AtomicWidth,
        dest: *const u8,
        value: u64,
        pe: usize,
    ) -> Result<u64> {
        self.fetching_atomic(ctx, "atomic_fetch", Amo::Fetch { op, value }, width, dest, pe)
    }

    pub fn atomic_swap(
        &self,
        ctx: &TransportContext,
        width: AtomicWidth,
        dest: *const u8,
        value: u64,
        pe: usize,
    ) -> Result<u64> {
        self.fetching_atomic(ctx, "atomic_swap", Amo::Swap { value }, width, dest, pe)
    }

    /// Store `value` at `dest` on `pe` if it holds `compare`. Returns the
    /// previous value either way.
    #[allow(clippy::too_many_arguments)]
    pub fn atomic_compare_swap(
        &self,
        ctx: &TransportContext,
        width: AtomicWidth,
        dest: *const u8,
        compare: u64,
        value: u64,
        pe: usize,
    ) -> Result<u64> {
        self.fetching_atomic(
            ctx,
            "atomic_compare_swap",
            Amo::CompareSwap { compare, value },
            width,
            dest,
            pe,
        )
    }

    fn fetching_atomic(
        &self,
        ctx: &TransportContext,
        name: &'static str,
        amo: Amo,
        width: AtomicWidth,
        dest: *const u8,
        pe: usize,
    ) -> Result<u64> {
        Self::check_store(ctx, name)?;
        let t = self.resolve(pe, dest, width.bytes())?;
        ctx.record_issue();
        let mut result = 0u64;
        let submitted = unsafe {
            self.fabric().atomic(
                t.peer.endpoint(),
                amo,
                width,
                t.remote_addr,
                t.peer.rkey(t.kind),
                &mut result,
                Callback::Complete,
            )
        }
        .map_err(issue_error(name, pe))?;
        complete_op(self.fabric(), submitted);

        // The fabric writes `width` bytes at the start of `result`.
        Ok(match width {
            AtomicWidth::U64 => result,
            AtomicWidth::U32 => {
                let b = result.to_ne_bytes();
                u32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as u64
            }
        })
    }
}
