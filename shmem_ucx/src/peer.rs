//! Per-PE connection state: endpoint, unpacked remote keys and (without
//! remote virtual addressing) the remote segment bases.

use std::fmt;

use crate::error::{Result, TransportError};
use crate::fabric::{Fabric, complete_op};
use crate::rendezvous::{self, Rendezvous, keys};
use crate::segment::SegmentKind;

/// Remote segment bases, exchanged only when the fabric cannot address
/// remote memory by symmetric virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteBases {
    pub data: u64,
    pub heap: u64,
}

impl RemoteBases {
    pub fn get(&self, kind: SegmentKind) -> u64 {
        match kind {
            SegmentKind::Data => self.data,
            SegmentKind::Heap => self.heap,
        }
    }
}

pub struct PeerRecord<F: Fabric> {
    ep: F::Endpoint,
    data_rkey: F::RemoteKey,
    heap_rkey: F::RemoteKey,
    bases: Option<RemoteBases>,
    /// Exchanged worker address, retained for diagnostics.
    addr: Vec<u8>,
}

impl<F: Fabric> PeerRecord<F> {
    pub fn endpoint(&self) -> &F::Endpoint {
        &self.ep
    }

    pub fn rkey(&self, kind: SegmentKind) -> &F::RemoteKey {
        match kind {
            SegmentKind::Data => &self.data_rkey,
            SegmentKind::Heap => &self.heap_rkey,
        }
    }

    pub fn bases(&self) -> Option<RemoteBases> {
        self.bases
    }

    pub fn address(&self) -> &[u8] {
        &self.addr
    }

    /// Remote address of `offset` bytes into the peer's `kind` segment.
    /// `local_addr` is the same location in this PE's segment.
    pub fn remote_addr(&self, kind: SegmentKind, offset: usize, local_addr: usize) -> u64 {
        match self.bases {
            Some(bases) => bases.get(kind) + offset as u64,
            None => local_addr as u64,
        }
    }
}

impl<F: Fabric> fmt::Debug for PeerRecord<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRecord")
            .field("addr_len", &self.addr.len())
            .field("bases", &self.bases)
            .finish_non_exhaustive()
    }
}

/// Connection table indexed by PE, read-only after startup.
pub struct PeerTable<F: Fabric> {
    peers: Vec<PeerRecord<F>>,
}

impl<F: Fabric> PeerTable<F> {
    /// Connect to every PE, self included, in increasing rank order.
    ///
    /// Every PE's address and keys must already be visible in `rdv`.
    pub fn connect_all<R: Rendezvous + ?Sized>(
        fabric: &F,
        rdv: &R,
        world_size: usize,
        rva: bool,
    ) -> Result<Self> {
        let mut peers = Vec::new();
        peers
            .try_reserve_exact(world_size)
            .map_err(|e| TransportError::Allocation {
                what: "peer table",
                source: std::io::Error::new(std::io::ErrorKind::OutOfMemory, e),
            })?;

        let mut table = PeerTable { peers };
        for pe in 0..world_size {
            match connect_one(fabric, rdv, pe, rva) {
                Ok(record) => table.peers.push(record),
                Err(e) => {
                    // Release what was built so far before reporting.
                    let failures = table.close_all(fabric);
                    for failure in failures {
                        tracing::warn!(error = %failure, "cleanup after failed connect");
                    }
                    return Err(e);
                }
            }
        }

        tracing::info!(world_size, rva, "connected to all PEs");
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, pe: usize) -> Option<&PeerRecord<F>> {
        self.peers.get(pe)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord<F>> {
        self.peers.iter()
    }

    /// Destroy keys and close every endpoint in flush mode.
    ///
    /// Never stops early: every peer is visited and every failure returned.
    pub fn close_all(self, fabric: &F) -> Vec<TransportError> {
        let mut failures = Vec::new();
        for (pe, peer) in self.peers.into_iter().enumerate() {
            fabric.rkey_destroy(peer.data_rkey);
            fabric.rkey_destroy(peer.heap_rkey);
            match fabric.ep_close(peer.ep) {
                Ok(submitted) => complete_op(fabric, submitted),
                Err(source) => {
                    tracing::error!(pe, error = %source, "endpoint close failed");
                    failures.push(TransportError::Endpoint { pe, source });
                }
            }
            drop(peer.addr);
        }
        failures
    }
}

fn rendezvous_error(
    pe: usize,
    key: &'static str,
) -> impl FnOnce(crate::error::RendezvousError) -> TransportError {
    move |source| TransportError::Rendezvous { pe, key, source }
}

fn connect_one<F: Fabric, R: Rendezvous + ?Sized>(
    fabric: &F,
    rdv: &R,
    pe: usize,
    rva: bool,
) -> Result<PeerRecord<F>> {
    let addr_len =
        rendezvous::get_usize(rdv, pe, keys::ADDR_LEN).map_err(rendezvous_error(pe, keys::ADDR_LEN))?;
    let mut addr = vec![0u8; addr_len];
    rdv.get(pe, keys::ADDR, &mut addr)
        .map_err(rendezvous_error(pe, keys::ADDR))?;

    let ep = fabric
        .ep_create(&addr)
        .map_err(|source| TransportError::Endpoint { pe, source })?;

    let data_rkey = match unpack_key(fabric, rdv, &ep, pe, SegmentKind::Data) {
        Ok(rkey) => rkey,
        Err(e) => {
            abandon(fabric, ep, []);
            return Err(e);
        }
    };
    let heap_rkey = match unpack_key(fabric, rdv, &ep, pe, SegmentKind::Heap) {
        Ok(rkey) => rkey,
        Err(e) => {
            abandon(fabric, ep, [data_rkey]);
            return Err(e);
        }
    };

    let bases = if rva {
        None
    } else {
        let fetched = rendezvous::get_u64(rdv, pe, keys::DATA_BASE)
            .map_err(rendezvous_error(pe, keys::DATA_BASE))
            .and_then(|data| {
                rendezvous::get_u64(rdv, pe, keys::HEAP_BASE)
                    .map_err(rendezvous_error(pe, keys::HEAP_BASE))
                    .map(|heap| RemoteBases { data, heap })
            });
        match fetched {
            Ok(bases) => Some(bases),
            Err(e) => {
                abandon(fabric, ep, [data_rkey, heap_rkey]);
                return Err(e);
            }
        }
    };

    tracing::debug!(pe, addr_len, ?bases, "connected to PE");
    Ok(PeerRecord {
        ep,
        data_rkey,
        heap_rkey,
        bases,
        addr,
    })
}

fn unpack_key<F: Fabric, R: Rendezvous + ?Sized>(
    fabric: &F,
    rdv: &R,
    ep: &F::Endpoint,
    pe: usize,
    kind: SegmentKind,
) -> Result<F::RemoteKey> {
    let packed = rendezvous::get_blob(rdv, pe, kind.rkey_len_key(), kind.rkey_key())
        .map_err(rendezvous_error(pe, kind.rkey_key()))?;
    fabric
        .rkey_unpack(ep, &packed)
        .map_err(|source| TransportError::KeyUnpack {
            pe,
            segment: kind,
            source,
        })
}

/// Tear down a half-built record.
fn abandon<F: Fabric, const N: usize>(fabric: &F, ep: F::Endpoint, rkeys: [F::RemoteKey; N]) {
    for rkey in rkeys {
        fabric.rkey_destroy(rkey);
    }
    match fabric.ep_close(ep) {
        Ok(submitted) => complete_op(fabric, submitted),
        Err(e) => tracing::warn!(error = %e, "endpoint close after failed connect"),
    }
}
