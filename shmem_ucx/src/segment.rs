//! Symmetric segments and their registration with the fabric.
//!
//! Every PE exposes exactly two regions: the static `data` segment and the
//! dynamically managed `heap` segment. Both are registered at init, their
//! packed keys published through the rendezvous store, and they stay
//! registered until teardown.

use std::fmt;

use crate::error::{Result, TransportError};
use crate::fabric::Fabric;
use crate::rendezvous::{self, Rendezvous, keys};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    Data,
    Heap,
}

impl SegmentKind {
    pub const ALL: [SegmentKind; 2] = [SegmentKind::Data, SegmentKind::Heap];

    pub(crate) fn rkey_len_key(self) -> &'static str {
        match self {
            SegmentKind::Data => keys::DATA_RKEY_LEN,
            SegmentKind::Heap => keys::HEAP_RKEY_LEN,
        }
    }

    pub(crate) fn rkey_key(self) -> &'static str {
        match self {
            SegmentKind::Data => keys::DATA_RKEY,
            SegmentKind::Heap => keys::HEAP_RKEY,
        }
    }

    pub(crate) fn base_key(self) -> &'static str {
        match self {
            SegmentKind::Data => keys::DATA_BASE,
            SegmentKind::Heap => keys::HEAP_BASE,
        }
    }
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentKind::Data => write!(f, "data"),
            SegmentKind::Heap => write!(f, "heap"),
        }
    }
}

/// Base and length of one region, before registration.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    base: *mut u8,
    len: usize,
}

// A region is plain address bookkeeping; the memory itself is owned by the
// caller of `SegmentLayout::new`.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of `[addr, addr + len)` inside the region, if fully contained.
    pub fn offset_of(&self, addr: usize, len: usize) -> Option<usize> {
        let base = self.base as usize;
        let end = addr.checked_add(len)?;
        (addr >= base && end <= base + self.len).then(|| addr - base)
    }
}

/// Where the data and heap segments live in this process.
#[derive(Debug, Clone, Copy)]
pub struct SegmentLayout {
    pub data: Region,
    pub heap: Region,
}

impl SegmentLayout {
    /// # Safety
    /// Both ranges must be valid for reads and writes, must not overlap, and
    /// must outlive the transport they are registered with. Remote PEs
    /// write into them at arbitrary times between startup and teardown.
    pub unsafe fn new(data: (*mut u8, usize), heap: (*mut u8, usize)) -> Self {
        Self {
            data: Region {
                base: data.0,
                len: data.1,
            },
            heap: Region {
                base: heap.0,
                len: heap.1,
            },
        }
    }

    pub fn region(&self, kind: SegmentKind) -> Region {
        match kind {
            SegmentKind::Data => self.data,
            SegmentKind::Heap => self.heap,
        }
    }
}

/// A segment registered with the fabric.
pub struct MemorySegment<M> {
    kind: SegmentKind,
    region: Region,
    handle: M,
}

impl<M> MemorySegment<M> {
    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    pub fn base(&self) -> *mut u8 {
        self.region.base
    }

    pub fn len(&self) -> usize {
        self.region.len
    }

    pub fn is_empty(&self) -> bool {
        self.region.len == 0
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub(crate) fn into_handle(self) -> M {
        self.handle
    }
}

impl<M> fmt::Debug for MemorySegment<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySegment")
            .field("kind", &self.kind)
            .field("base", &self.region.base)
            .field("len", &self.region.len)
            .finish()
    }
}

/// The registered data and heap segments.
pub struct Segments<M> {
    pub data: MemorySegment<M>,
    pub heap: MemorySegment<M>,
}

impl<M> Segments<M> {
    pub fn get(&self, kind: SegmentKind) -> &MemorySegment<M> {
        match kind {
            SegmentKind::Data => &self.data,
            SegmentKind::Heap => &self.heap,
        }
    }

    /// Find the segment containing `[addr, addr + len)` and the offset of
    /// `addr` inside it.
    pub fn locate(&self, addr: usize, len: usize) -> Option<(SegmentKind, usize)> {
        SegmentKind::ALL.into_iter().find_map(|kind| {
            self.get(kind)
                .region
                .offset_of(addr, len)
                .map(|offset| (kind, offset))
        })
    }
}

/// Publish this PE's worker address.
pub(crate) fn publish_address<F: Fabric, R: Rendezvous + ?Sized>(
    fabric: &F,
    rdv: &R,
) -> Result<()> {
    let addr = fabric
        .worker_address()
        .map_err(|source| TransportError::FabricInit {
            op: "worker_get_address",
            source,
        })?;
    let bytes = addr.as_ref();

    rendezvous::put_usize(rdv, keys::ADDR_LEN, bytes.len()).map_err(|source| {
        TransportError::Publish {
            key: keys::ADDR_LEN,
            source,
        }
    })?;
    rdv.put(keys::ADDR, bytes)
        .map_err(|source| TransportError::Publish {
            key: keys::ADDR,
            source,
        })?;

    tracing::debug!(len = bytes.len(), "published worker address");
    Ok(())
}

/// Register one region and publish its packed key (and base address when
/// remote virtual addressing is off).
fn register_one<F: Fabric, R: Rendezvous + ?Sized>(
    fabric: &F,
    rdv: &R,
    kind: SegmentKind,
    region: Region,
    rva: bool,
) -> Result<MemorySegment<F::MemHandle>> {
    let handle = unsafe { fabric.mem_map(region.base, region.len) }.map_err(|source| {
        TransportError::FabricInit {
            op: "mem_map",
            source,
        }
    })?;
    let segment = MemorySegment {
        kind,
        region,
        handle,
    };

    if let Err(e) = publish_key(fabric, rdv, &segment, rva) {
        if let Err(unmap) = fabric.mem_unmap(segment.into_handle()) {
            tracing::warn!(segment = %kind, error = %unmap, "unmap after failed publish");
        }
        return Err(e);
    }

    tracing::debug!(
        segment = %kind,
        base = ?region.base,
        len = region.len,
        "registered symmetric segment"
    );
    Ok(segment)
}

fn publish_key<F: Fabric, R: Rendezvous + ?Sized>(
    fabric: &F,
    rdv: &R,
    segment: &MemorySegment<F::MemHandle>,
    rva: bool,
) -> Result<()> {
    let kind = segment.kind;
    let packed = fabric
        .rkey_pack(&segment.handle)
        .map_err(|source| TransportError::FabricInit {
            op: "rkey_pack",
            source,
        })?;
    let bytes = packed.as_ref();

    rendezvous::put_usize(rdv, kind.rkey_len_key(), bytes.len()).map_err(|source| {
        TransportError::Publish {
            key: kind.rkey_len_key(),
            source,
        }
    })?;
    rdv.put(kind.rkey_key(), bytes)
        .map_err(|source| TransportError::Publish {
            key: kind.rkey_key(),
            source,
        })?;
    drop(packed);

    if !rva {
        rendezvous::put_u64(rdv, kind.base_key(), segment.region.base as u64).map_err(
            |source| TransportError::Publish {
                key: kind.base_key(),
                source,
            },
        )?;
    }
    Ok(())
}

/// Register the data and heap segments and publish everything peers need
/// to reach them.
pub(crate) fn register_segments<F: Fabric, R: Rendezvous + ?Sized>(
    fabric: &F,
    rdv: &R,
    layout: &SegmentLayout,
    rva: bool,
) -> Result<Segments<F::MemHandle>> {
    let data = register_one(fabric, rdv, SegmentKind::Data, layout.data, rva)?;
    let heap = match register_one(fabric, rdv, SegmentKind::Heap, layout.heap, rva) {
        Ok(heap) => heap,
        Err(e) => {
            if let Err(unmap) = fabric.mem_unmap(data.into_handle()) {
                tracing::warn!(error = %unmap, "unmap of data segment after failed heap registration");
            }
            return Err(e);
        }
    };
    Ok(Segments { data, heap })
}
