//! Out-of-band key-value exchange used to publish worker addresses, packed
//! keys and segment bases before peer connections exist.
//!
//! Keys are namespaced by the publishing rank: `put` writes under the
//! caller's rank, `get` names the rank to read from.

use std::collections::HashMap;
use std::sync::{Arc, Barrier, RwLock};

use crate::error::RendezvousError;

/// Well-known keys published by every PE.
pub mod keys {
    pub const ADDR_LEN: &str = "addr_len";
    pub const ADDR: &str = "addr";
    pub const DATA_RKEY_LEN: &str = "data_rkey_len";
    pub const DATA_RKEY: &str = "data_rkey";
    pub const HEAP_RKEY_LEN: &str = "heap_rkey_len";
    pub const HEAP_RKEY: &str = "heap_rkey";
    pub const DATA_BASE: &str = "data_base";
    pub const HEAP_BASE: &str = "heap_base";
}

/// Rendezvous key-value store.
pub trait Rendezvous: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Publish `value` under `key` for the calling rank.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), RendezvousError>;

    /// Read exactly `buf.len()` bytes published by `rank` under `key`.
    fn get(&self, rank: usize, key: &str, buf: &mut [u8]) -> Result<(), RendezvousError>;

    /// Collective barrier after which every rank's puts are visible to
    /// every rank's gets.
    fn fence(&self) -> Result<(), RendezvousError>;
}

/// Publish a `size_t`-style value.
pub fn put_usize<R: Rendezvous + ?Sized>(
    rdv: &R,
    key: &str,
    value: usize,
) -> Result<(), RendezvousError> {
    rdv.put(key, &value.to_ne_bytes())
}

pub fn get_usize<R: Rendezvous + ?Sized>(
    rdv: &R,
    rank: usize,
    key: &str,
) -> Result<usize, RendezvousError> {
    let mut buf = [0u8; size_of::<usize>()];
    rdv.get(rank, key, &mut buf)?;
    Ok(usize::from_ne_bytes(buf))
}

/// Publish an address-sized value.
pub fn put_u64<R: Rendezvous + ?Sized>(
    rdv: &R,
    key: &str,
    value: u64,
) -> Result<(), RendezvousError> {
    rdv.put(key, &value.to_ne_bytes())
}

pub fn get_u64<R: Rendezvous + ?Sized>(
    rdv: &R,
    rank: usize,
    key: &str,
) -> Result<u64, RendezvousError> {
    let mut buf = [0u8; 8];
    rdv.get(rank, key, &mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

/// Read a length-prefixed blob: `len_key` holds the size of `key`.
pub fn get_blob<R: Rendezvous + ?Sized>(
    rdv: &R,
    rank: usize,
    len_key: &str,
    key: &str,
) -> Result<Vec<u8>, RendezvousError> {
    let len = get_usize(rdv, rank, len_key)?;
    let mut buf = vec![0u8; len];
    rdv.get(rank, key, &mut buf)?;
    Ok(buf)
}

impl<R: Rendezvous + ?Sized> Rendezvous for Arc<R> {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), RendezvousError> {
        (**self).put(key, value)
    }

    fn get(&self, rank: usize, key: &str, buf: &mut [u8]) -> Result<(), RendezvousError> {
        (**self).get(rank, key, buf)
    }

    fn fence(&self) -> Result<(), RendezvousError> {
        (**self).fence()
    }
}

fn copy_exact(
    rank: usize,
    key: &str,
    stored: &[u8],
    buf: &mut [u8],
) -> Result<(), RendezvousError> {
    if stored.len() != buf.len() {
        return Err(RendezvousError::LengthMismatch {
            rank,
            key: key.to_string(),
            stored: stored.len(),
            expected: buf.len(),
        });
    }
    buf.copy_from_slice(stored);
    Ok(())
}

// =============================================================================
// In-process store
// =============================================================================

struct SharedStore {
    table: RwLock<HashMap<(usize, String), Vec<u8>>>,
    barrier: Barrier,
    size: usize,
}

/// Rendezvous shared by PEs running as threads of one process.
///
/// Puts are visible immediately; `fence` is a real barrier so the
/// collective protocol is still exercised.
#[derive(Clone)]
pub struct InMemoryRendezvous {
    rank: usize,
    store: Arc<SharedStore>,
}

impl InMemoryRendezvous {
    /// One handle per rank, all backed by the same table.
    pub fn group(size: usize) -> Vec<Self> {
        let store = Arc::new(SharedStore {
            table: RwLock::new(HashMap::new()),
            barrier: Barrier::new(size),
            size,
        });
        (0..size)
            .map(|rank| Self {
                rank,
                store: store.clone(),
            })
            .collect()
    }

    /// Keys published by `rank`, sorted.
    pub fn published_by(&self, rank: usize) -> Vec<String> {
        let table = self.store.table.read().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = table
            .keys()
            .filter(|(r, _)| *r == rank)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

impl Rendezvous for InMemoryRendezvous {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.store.size
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), RendezvousError> {
        let mut table = self
            .store
            .table
            .write()
            .map_err(|_| RendezvousError::Backend("store lock poisoned".into()))?;
        table.insert((self.rank, key.to_string()), value.to_vec());
        Ok(())
    }

    fn get(&self, rank: usize, key: &str, buf: &mut [u8]) -> Result<(), RendezvousError> {
        let table = self
            .store
            .table
            .read()
            .map_err(|_| RendezvousError::Backend("store lock poisoned".into()))?;
        let stored = table
            .get(&(rank, key.to_string()))
            .ok_or_else(|| RendezvousError::Missing {
                rank,
                key: key.to_string(),
            })?;
        copy_exact(rank, key, stored, buf)
    }

    fn fence(&self) -> Result<(), RendezvousError> {
        self.store.barrier.wait();
        Ok(())
    }
}

// =============================================================================
// Table encoding (MPI all-gather payload)
// =============================================================================

/// `[u32 count] ([u32 klen][key][u32 vlen][value])*`, little endian.
#[cfg_attr(not(feature = "mpi"), allow(dead_code))]
fn encode_table(entries: &HashMap<String, Vec<u8>>) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    let mut sorted: Vec<_> = entries.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    for (key, value) in sorted {
        out.extend_from_slice(&(key.len() as u32).to_le_bytes());
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        out.extend_from_slice(value);
    }
    out
}

#[cfg_attr(not(feature = "mpi"), allow(dead_code))]
fn decode_table(mut bytes: &[u8]) -> Result<HashMap<String, Vec<u8>>, RendezvousError> {
    fn take<'a>(bytes: &mut &'a [u8], n: usize) -> Result<&'a [u8], RendezvousError> {
        if bytes.len() < n {
            return Err(RendezvousError::Encoding(format!(
                "truncated: need {n} bytes, {} left",
                bytes.len()
            )));
        }
        let (head, tail) = bytes.split_at(n);
        *bytes = tail;
        Ok(head)
    }
    fn take_u32(bytes: &mut &[u8]) -> Result<usize, RendezvousError> {
        let raw = take(bytes, 4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize)
    }

    let count = take_u32(&mut bytes)?;
    let mut table = HashMap::with_capacity(count);
    for _ in 0..count {
        let klen = take_u32(&mut bytes)?;
        let key = std::str::from_utf8(take(&mut bytes, klen)?)
            .map_err(|e| RendezvousError::Encoding(e.to_string()))?
            .to_string();
        let vlen = take_u32(&mut bytes)?;
        let value = take(&mut bytes, vlen)?.to_vec();
        table.insert(key, value);
    }
    if !bytes.is_empty() {
        return Err(RendezvousError::Encoding(format!(
            "{} trailing bytes",
            bytes.len()
        )));
    }
    Ok(table)
}

// =============================================================================
// MPI-backed store
// =============================================================================

#[cfg(feature = "mpi")]
pub use self::mpi_store::MpiRendezvous;

#[cfg(feature = "mpi")]
mod mpi_store {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use mpi::collective::CommunicatorCollectives;
    use mpi::datatype::PartitionMut;
    use mpi::topology::{Communicator, SimpleCommunicator};
    use mpi::Count;

    use super::{Rendezvous, copy_exact, decode_table, encode_table};
    use crate::error::RendezvousError;

    /// Rendezvous over an MPI communicator.
    ///
    /// Puts are buffered locally; `fence` all-gathers every rank's table.
    pub struct MpiRendezvous {
        world: SimpleCommunicator,
        local: Mutex<HashMap<String, Vec<u8>>>,
        remote: Mutex<Vec<HashMap<String, Vec<u8>>>>,
    }

    // The communicator is only used from `fence`, which the caller runs
    // collectively from one thread per rank.
    unsafe impl Send for MpiRendezvous {}
    unsafe impl Sync for MpiRendezvous {}

    impl MpiRendezvous {
        pub fn new(world: SimpleCommunicator) -> Self {
            Self {
                world,
                local: Mutex::new(HashMap::new()),
                remote: Mutex::new(Vec::new()),
            }
        }
    }

    impl Rendezvous for MpiRendezvous {
        fn rank(&self) -> usize {
            self.world.rank() as usize
        }

        fn size(&self) -> usize {
            self.world.size() as usize
        }

        fn put(&self, key: &str, value: &[u8]) -> Result<(), RendezvousError> {
            let mut local = self
                .local
                .lock()
                .map_err(|_| RendezvousError::Backend("local table poisoned".into()))?;
            local.insert(key.to_string(), value.to_vec());
            Ok(())
        }

        fn get(&self, rank: usize, key: &str, buf: &mut [u8]) -> Result<(), RendezvousError> {
            let remote = self
                .remote
                .lock()
                .map_err(|_| RendezvousError::Backend("remote table poisoned".into()))?;
            let stored = remote
                .get(rank)
                .and_then(|table| table.get(key))
                .ok_or_else(|| RendezvousError::Missing {
                    rank,
                    key: key.to_string(),
                })?;
            copy_exact(rank, key, stored, buf)
        }

        fn fence(&self) -> Result<(), RendezvousError> {
            let encoded = {
                let local = self
                    .local
                    .lock()
                    .map_err(|_| RendezvousError::Backend("local table poisoned".into()))?;
                encode_table(&local)
            };

            let size = self.size();
            let local_len = encoded.len() as Count;
            let mut counts: Vec<Count> = vec![0; size];
            self.world.all_gather_into(&local_len, &mut counts[..]);

            let displs: Vec<Count> = counts
                .iter()
                .scan(0, |acc, &c| {
                    let d = *acc;
                    *acc += c;
                    Some(d)
                })
                .collect();
            let total: Count = counts.iter().sum();

            let mut all = vec![0u8; total as usize];
            {
                let mut partition = PartitionMut::new(&mut all[..], &counts[..], &displs[..]);
                self.world
                    .all_gather_varcount_into(&encoded[..], &mut partition);
            }

            let mut tables = Vec::with_capacity(size);
            for rank in 0..size {
                let start = displs[rank] as usize;
                let end = start + counts[rank] as usize;
                tables.push(decode_table(&all[start..end])?);
            }

            *self
                .remote
                .lock()
                .map_err(|_| RendezvousError::Backend("remote table poisoned".into()))? = tables;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_across_ranks() {
        let group = InMemoryRendezvous::group(2);
        group[0].put("addr", b"hello").unwrap();
        put_usize(&group[0], "addr_len", 5).unwrap();

        let blob = get_blob(&group[1], 0, "addr_len", "addr").unwrap();
        assert_eq!(blob, b"hello");
    }

    #[test]
    fn keys_are_namespaced_by_rank() {
        let group = InMemoryRendezvous::group(2);
        put_u64(&group[0], "data_base", 0x1000).unwrap();
        put_u64(&group[1], "data_base", 0x2000).unwrap();

        assert_eq!(get_u64(&group[0], 1, "data_base").unwrap(), 0x2000);
        assert_eq!(get_u64(&group[1], 0, "data_base").unwrap(), 0x1000);
    }

    #[test]
    fn missing_key_is_reported() {
        let group = InMemoryRendezvous::group(2);
        let err = get_usize(&group[0], 1, "addr_len").unwrap_err();
        assert!(matches!(err, RendezvousError::Missing { rank: 1, .. }));
    }

    #[test]
    fn length_mismatch_is_reported() {
        let group = InMemoryRendezvous::group(1);
        group[0].put("addr", b"abc").unwrap();
        let mut buf = [0u8; 4];
        let err = group[0].get(0, "addr", &mut buf).unwrap_err();
        assert!(matches!(
            err,
            RendezvousError::LengthMismatch {
                stored: 3,
                expected: 4,
                ..
            }
        ));
    }

    #[test]
    fn fence_synchronizes_threads() {
        let group = InMemoryRendezvous::group(4);
        let handles: Vec<_> = group
            .into_iter()
            .map(|rdv| {
                std::thread::spawn(move || {
                    put_usize(&rdv, "rank", rdv.rank()).unwrap();
                    rdv.fence().unwrap();
                    (0..rdv.size())
                        .map(|r| get_usize(&rdv, r, "rank").unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), vec![0, 1, 2, 3]);
        }
    }

    #[test]
    fn table_encoding() {
        let mut table = HashMap::new();
        table.insert("addr".to_string(), vec![1, 2, 3]);
        table.insert("data_rkey".to_string(), vec![]);
        let bytes = encode_table(&table);
        assert_eq!(decode_table(&bytes).unwrap(), table);

        assert!(matches!(
            decode_table(&bytes[..bytes.len() - 1]),
            Err(RendezvousError::Encoding(_))
        ));
    }
}
