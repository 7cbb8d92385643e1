//! In-process fabric.
//!
//! Each [`LoopbackFabric`] is one worker on a shared [`LoopbackNetwork`];
//! PEs run as threads of a single process. Operations are checked at issue
//! time, queued on the issuing worker, and carried out only by
//! [`Fabric::progress`], so completion follows the same callback path as a
//! real network: a callback may run on the progress thread before the
//! issuer has returned from the submit call.
//!
//! Wire formats (all integers little-endian):
//!
//! ```text
//! address:  "LBW1" | worker:u64
//! rkey:     "LBK1" | worker:u64 | slot:u64 | base:u64 | len:u64
//! ```

use std::collections::{HashMap, VecDeque};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, TryLockError};

use slab::Slab;

use crate::error::FabricError;
use crate::fabric::{
    Amo, AtomicOp, AtomicWidth, Callback, Capabilities, Fabric, FabricProvider, Submitted,
    ThreadMode, WorkerParams,
};
use crate::request::CompletionSlot;

const ADDR_MAGIC: &[u8; 4] = b"LBW1";
const KEY_MAGIC: &[u8; 4] = b"LBK1";
const ADDR_LEN: usize = 12;
const KEY_LEN: usize = 36;

// ============================================================================
// Network
// ============================================================================

/// A set of loopback workers that can reach each other.
#[derive(Clone)]
pub struct LoopbackNetwork {
    shared: Arc<NetworkShared>,
    rva: bool,
}

struct NetworkShared {
    workers: RwLock<HashMap<u64, Arc<WorkerShared>>>,
    /// Final counters of workers that have been finalized or dropped.
    retired: Mutex<Vec<(u64, LoopbackStats)>>,
    next_id: AtomicU64,
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(NetworkShared {
                workers: RwLock::new(HashMap::new()),
                retired: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
            rva: false,
        }
    }

    /// Advertise remote virtual addressing to workers opened from this
    /// handle. Off by default, which makes peers exchange segment bases.
    pub fn with_remote_virtual_addressing(mut self, enable: bool) -> Self {
        self.rva = enable;
        self
    }

    /// Number of workers currently open.
    pub fn workers(&self) -> usize {
        self.shared
            .workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Final counters of every worker that has left the network, in the
    /// order they left.
    pub fn retired(&self) -> Vec<(u64, LoopbackStats)> {
        self.shared
            .retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lookup(&self, id: u64) -> Option<Arc<WorkerShared>> {
        self.shared
            .workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }
}

impl FabricProvider for LoopbackNetwork {
    type Fabric = LoopbackFabric;

    fn open(self, params: &WorkerParams) -> Result<LoopbackFabric, FabricError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let worker = Arc::new(WorkerShared::new(id));
        self.shared
            .workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, worker.clone());

        tracing::debug!(worker = id, mode = ?params.thread_mode, rva = self.rva, "loopback worker opened");
        Ok(LoopbackFabric {
            network: self,
            worker,
            thread_mode: params.thread_mode,
        })
    }
}

// ============================================================================
// Worker state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Registration {
    base: u64,
    len: usize,
}

#[derive(Default)]
struct Counters {
    puts: AtomicU64,
    gets: AtomicU64,
    atomics: AtomicU64,
    flushes: AtomicU64,
    events: AtomicU64,
}

struct WorkerShared {
    id: u64,
    registrations: RwLock<Slab<Registration>>,
    queue: Mutex<VecDeque<Op>>,
    /// Held for a whole progress step so queued operations run in order.
    progress_lock: Mutex<()>,
    /// Issued but not yet executed.
    outstanding: AtomicUsize,
    endpoints: AtomicUsize,
    rkeys: AtomicUsize,
    counters: Counters,
    fail_unmaps: AtomicUsize,
    fail_finalize: AtomicBool,
    fail_flush: AtomicBool,
}

impl WorkerShared {
    fn new(id: u64) -> Self {
        Self {
            id,
            registrations: RwLock::new(Slab::new()),
            queue: Mutex::new(VecDeque::new()),
            progress_lock: Mutex::new(()),
            outstanding: AtomicUsize::new(0),
            endpoints: AtomicUsize::new(0),
            rkeys: AtomicUsize::new(0),
            counters: Counters::default(),
            fail_unmaps: AtomicUsize::new(0),
            fail_finalize: AtomicBool::new(false),
            fail_flush: AtomicBool::new(false),
        }
    }

    fn registration(&self, slot: usize) -> Option<Registration> {
        self.registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(slot)
            .copied()
    }
}

enum OpKind {
    Copy {
        src: *const u8,
        dst: *mut u8,
        len: usize,
    },
    Atomic {
        amo: Amo,
        width: AtomicWidth,
        target: *mut u8,
        result: *mut u64,
    },
    Flush,
    Close {
        _target: Arc<WorkerShared>,
    },
}

struct Op {
    name: &'static str,
    kind: OpKind,
    /// `None` for operations issued with [`Callback::Nop`].
    slot: Option<Arc<CompletionSlot>>,
}

// The raw pointers are the caller's buffers and remote segment memory; the
// issue contract keeps them valid until the operation has executed.
unsafe impl Send for Op {}

// ============================================================================
// Fabric handles
// ============================================================================

/// Counters for one loopback worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub puts: u64,
    pub gets: u64,
    pub atomics: u64,
    pub flushes: u64,
    /// Operations executed by `progress`.
    pub events: u64,
    /// Memory regions currently registered.
    pub registrations: usize,
    /// Endpoints created and not yet closed.
    pub endpoints: usize,
    /// Remote keys unpacked and not yet destroyed.
    pub rkeys: usize,
    /// Operations queued or executing.
    pub outstanding: usize,
}

pub struct LoopbackMem {
    slot: usize,
    base: u64,
    len: usize,
}

pub struct LoopbackEndpoint {
    target: Arc<WorkerShared>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackRkey {
    worker: u64,
    slot: usize,
    base: u64,
    len: usize,
}

pub struct LoopbackRequest(Arc<CompletionSlot>);

/// One worker of a [`LoopbackNetwork`].
pub struct LoopbackFabric {
    network: LoopbackNetwork,
    worker: Arc<WorkerShared>,
    thread_mode: ThreadMode,
}

impl LoopbackFabric {
    pub fn id(&self) -> u64 {
        self.worker.id
    }

    pub fn stats(&self) -> LoopbackStats {
        let c = &self.worker.counters;
        LoopbackStats {
            puts: c.puts.load(Ordering::Relaxed),
            gets: c.gets.load(Ordering::Relaxed),
            atomics: c.atomics.load(Ordering::Relaxed),
            flushes: c.flushes.load(Ordering::Relaxed),
            events: c.events.load(Ordering::Relaxed),
            registrations: self
                .worker
                .registrations
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            endpoints: self.worker.endpoints.load(Ordering::Acquire),
            rkeys: self.worker.rkeys.load(Ordering::Acquire),
            outstanding: self.worker.outstanding.load(Ordering::Acquire),
        }
    }

    /// Make the next `n` calls to `mem_unmap` fail. The regions stay
    /// registered.
    pub fn fail_next_unmaps(&self, n: usize) {
        self.worker.fail_unmaps.store(n, Ordering::Release);
    }

    /// Make `finalize` report a failure. The worker is still removed.
    pub fn fail_finalize(&self) {
        self.worker.fail_finalize.store(true, Ordering::Release);
    }

    /// Make the next `flush` report an I/O error, as a worker whose
    /// released operations failed would.
    pub fn fail_next_flush(&self) {
        self.worker.fail_flush.store(true, Ordering::Release);
    }

    fn submit(&self, name: &'static str, kind: OpKind, cb: Callback) -> Submitted<LoopbackRequest> {
        let slot = Arc::new(CompletionSlot::new());
        let op = Op {
            name,
            kind,
            slot: (cb == Callback::Complete).then(|| slot.clone()),
        };
        self.worker.outstanding.fetch_add(1, Ordering::AcqRel);
        self.worker
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(op);
        Submitted::Pending(LoopbackRequest(slot))
    }

    /// Resolve `[remote_addr, remote_addr + len)` against `rkey`.
    fn target(
        &self,
        ep: &LoopbackEndpoint,
        rkey: &LoopbackRkey,
        remote_addr: u64,
        len: usize,
    ) -> Result<*mut u8, FabricError> {
        if rkey.worker != ep.target.id {
            return Err(FabricError::new(
                FabricError::INVALID_PARAM,
                format!(
                    "rkey of worker {} used on endpoint to worker {}",
                    rkey.worker, ep.target.id
                ),
            ));
        }
        if ep.target.registration(rkey.slot)
            != Some(Registration {
                base: rkey.base,
                len: rkey.len,
            })
        {
            return Err(FabricError::new(
                FabricError::INVALID_ADDR,
                "remote region is no longer registered",
            ));
        }
        let in_bounds = remote_addr
            .checked_add(len as u64)
            .is_some_and(|end| remote_addr >= rkey.base && end <= rkey.base + rkey.len as u64);
        if !in_bounds {
            return Err(FabricError::new(
                FabricError::INVALID_ADDR,
                format!(
                    "remote range {remote_addr:#x}+{len} outside region {:#x}+{}",
                    rkey.base, rkey.len
                ),
            ));
        }
        Ok(remote_addr as usize as *mut u8)
    }

    fn execute(&self, op: Op) {
        match op.kind {
            // Self-targeted puts may overlap.
            OpKind::Copy { src, dst, len } => unsafe { ptr::copy(src, dst, len) },
            OpKind::Atomic {
                amo,
                width,
                target,
                result,
            } => {
                let prev = unsafe { apply_amo(amo, width, target) };
                if amo.fetches() {
                    unsafe { write_result(result, width, prev) };
                }
            }
            OpKind::Flush => {}
            OpKind::Close { _target } => {
                self.worker.endpoints.fetch_sub(1, Ordering::AcqRel);
            }
        }

        if let Some(slot) = op.slot
            && let Err(e) = slot.complete(op.name, Ok(()))
        {
            e.raise();
        }
        self.worker.counters.events.fetch_add(1, Ordering::Relaxed);
        self.worker.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for LoopbackFabric {
    fn drop(&mut self) {
        let stats = self.stats();
        self.network
            .shared
            .retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((self.worker.id, stats));
        self.network
            .shared
            .workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.worker.id);
    }
}

macro_rules! apply_amo_as {
    ($atomic:ty, $int:ty, $amo:expr, $target:expr) => {{
        let a = unsafe { <$atomic>::from_ptr($target as *mut $int) };
        let ord = Ordering::SeqCst;
        let prev = match $amo {
            Amo::Post { op, value } | Amo::Fetch { op, value } => match op {
                AtomicOp::And => a.fetch_and(value as $int, ord),
                AtomicOp::Or => a.fetch_or(value as $int, ord),
                AtomicOp::Xor => a.fetch_xor(value as $int, ord),
                AtomicOp::Add => a.fetch_add(value as $int, ord),
            },
            Amo::Swap { value } => a.swap(value as $int, ord),
            Amo::CompareSwap { compare, value } => {
                match a.compare_exchange(compare as $int, value as $int, ord, ord) {
                    Ok(prev) | Err(prev) => prev,
                }
            }
        };
        prev as u64
    }};
}

/// # Safety
/// `target` must be valid and aligned for `width`.
unsafe fn apply_amo(amo: Amo, width: AtomicWidth, target: *mut u8) -> u64 {
    match width {
        AtomicWidth::U32 => apply_amo_as!(AtomicU32, u32, amo, target),
        AtomicWidth::U64 => apply_amo_as!(AtomicU64, u64, amo, target),
    }
}

/// Store `prev`, `width` bytes wide, at `result`.
unsafe fn write_result(result: *mut u64, width: AtomicWidth, prev: u64) {
    match width {
        AtomicWidth::U32 => unsafe { (result as *mut u32).write(prev as u32) },
        AtomicWidth::U64 => unsafe { result.write(prev) },
    }
}

// ============================================================================
// Wire formats
// ============================================================================

fn encode_address(worker: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ADDR_LEN);
    buf.extend_from_slice(ADDR_MAGIC);
    buf.extend_from_slice(&worker.to_le_bytes());
    buf
}

fn decode_address(bytes: &[u8]) -> Result<u64, FabricError> {
    if bytes.len() != ADDR_LEN || &bytes[..4] != ADDR_MAGIC {
        return Err(FabricError::new(
            FabricError::INVALID_PARAM,
            format!("malformed worker address ({} bytes)", bytes.len()),
        ));
    }
    Ok(read_u64(&bytes[4..12]))
}

fn encode_key(worker: u64, mem: &LoopbackMem) -> Vec<u8> {
    let mut buf = Vec::with_capacity(KEY_LEN);
    buf.extend_from_slice(KEY_MAGIC);
    buf.extend_from_slice(&worker.to_le_bytes());
    buf.extend_from_slice(&(mem.slot as u64).to_le_bytes());
    buf.extend_from_slice(&mem.base.to_le_bytes());
    buf.extend_from_slice(&(mem.len as u64).to_le_bytes());
    buf
}

fn decode_key(bytes: &[u8]) -> Result<LoopbackRkey, FabricError> {
    if bytes.len() != KEY_LEN || &bytes[..4] != KEY_MAGIC {
        return Err(FabricError::new(
            FabricError::INVALID_PARAM,
            format!("malformed packed key ({} bytes)", bytes.len()),
        ));
    }
    Ok(LoopbackRkey {
        worker: read_u64(&bytes[4..12]),
        slot: read_u64(&bytes[12..20]) as usize,
        base: read_u64(&bytes[20..28]),
        len: read_u64(&bytes[28..36]) as usize,
    })
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

// ============================================================================
// Fabric
// ============================================================================

impl Fabric for LoopbackFabric {
    type MemHandle = LoopbackMem;
    type Endpoint = LoopbackEndpoint;
    type RemoteKey = LoopbackRkey;
    type PackedKey = Vec<u8>;
    type Address = Vec<u8>;
    type Request = LoopbackRequest;

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            remote_virtual_addressing: self.network.rva,
        }
    }

    fn thread_mode(&self) -> ThreadMode {
        self.thread_mode
    }

    fn worker_address(&self) -> Result<Vec<u8>, FabricError> {
        Ok(encode_address(self.worker.id))
    }

    unsafe fn mem_map(&self, base: *mut u8, len: usize) -> Result<LoopbackMem, FabricError> {
        if base.is_null() && len > 0 {
            return Err(FabricError::new(FabricError::INVALID_PARAM, "null region"));
        }
        let base = base as u64;
        let slot = self
            .worker
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(Registration { base, len });
        Ok(LoopbackMem { slot, base, len })
    }

    fn mem_unmap(&self, mem: LoopbackMem) -> Result<(), FabricError> {
        let injected = self
            .worker
            .fail_unmaps
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(FabricError::new(
                FabricError::IO_ERROR,
                "injected unmap failure",
            ));
        }
        self.worker
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .try_remove(mem.slot)
            .map(|_| ())
            .ok_or_else(|| FabricError::new(FabricError::INVALID_PARAM, "region not registered"))
    }

    fn rkey_pack(&self, mem: &LoopbackMem) -> Result<Vec<u8>, FabricError> {
        Ok(encode_key(self.worker.id, mem))
    }

    fn ep_create(&self, address: &[u8]) -> Result<LoopbackEndpoint, FabricError> {
        let id = decode_address(address)?;
        let target = self.network.lookup(id).ok_or_else(|| {
            FabricError::new(FabricError::UNREACHABLE, format!("no worker {id}"))
        })?;
        self.worker.endpoints.fetch_add(1, Ordering::AcqRel);
        Ok(LoopbackEndpoint { target })
    }

    fn ep_close(&self, ep: LoopbackEndpoint) -> Result<Submitted<LoopbackRequest>, FabricError> {
        Ok(self.submit(
            "ep_close",
            OpKind::Close { _target: ep.target },
            Callback::Complete,
        ))
    }

    fn rkey_unpack(
        &self,
        ep: &LoopbackEndpoint,
        packed: &[u8],
    ) -> Result<LoopbackRkey, FabricError> {
        let rkey = decode_key(packed)?;
        if rkey.worker != ep.target.id {
            return Err(FabricError::new(
                FabricError::INVALID_PARAM,
                format!(
                    "key of worker {} does not belong to endpoint worker {}",
                    rkey.worker, ep.target.id
                ),
            ));
        }
        let live = ep.target.registration(rkey.slot);
        if live
            != Some(Registration {
                base: rkey.base,
                len: rkey.len,
            })
        {
            return Err(FabricError::new(
                FabricError::INVALID_PARAM,
                format!("key names unknown region slot {}", rkey.slot),
            ));
        }
        self.worker.rkeys.fetch_add(1, Ordering::AcqRel);
        Ok(rkey)
    }

    fn rkey_destroy(&self, _rkey: LoopbackRkey) {
        self.worker.rkeys.fetch_sub(1, Ordering::AcqRel);
    }

    unsafe fn put(
        &self,
        ep: &LoopbackEndpoint,
        src: *const u8,
        len: usize,
        remote_addr: u64,
        rkey: &LoopbackRkey,
        cb: Callback,
    ) -> Result<Submitted<LoopbackRequest>, FabricError> {
        let dst = self.target(ep, rkey, remote_addr, len)?;
        self.worker.counters.puts.fetch_add(1, Ordering::Relaxed);
        Ok(self.submit("put", OpKind::Copy { src, dst, len }, cb))
    }

    unsafe fn get(
        &self,
        ep: &LoopbackEndpoint,
        dst: *mut u8,
        len: usize,
        remote_addr: u64,
        rkey: &LoopbackRkey,
        cb: Callback,
    ) -> Result<Submitted<LoopbackRequest>, FabricError> {
        let src = self.target(ep, rkey, remote_addr, len)?;
        self.worker.counters.gets.fetch_add(1, Ordering::Relaxed);
        Ok(self.submit("get", OpKind::Copy { src, dst, len }, cb))
    }

    unsafe fn atomic(
        &self,
        ep: &LoopbackEndpoint,
        amo: Amo,
        width: AtomicWidth,
        remote_addr: u64,
        rkey: &LoopbackRkey,
        result: *mut u64,
        cb: Callback,
    ) -> Result<Submitted<LoopbackRequest>, FabricError> {
        if remote_addr % width.bytes() as u64 != 0 {
            return Err(FabricError::new(
                FabricError::INVALID_PARAM,
                format!("atomic target {remote_addr:#x} not {}-byte aligned", width.bytes()),
            ));
        }
        if amo.fetches() && result.is_null() {
            return Err(FabricError::new(
                FabricError::INVALID_PARAM,
                "fetching atomic without a result buffer",
            ));
        }
        let target = self.target(ep, rkey, remote_addr, width.bytes())?;
        self.worker.counters.atomics.fetch_add(1, Ordering::Relaxed);
        Ok(self.submit(
            "atomic",
            OpKind::Atomic {
                amo,
                width,
                target,
                result,
            },
            cb,
        ))
    }

    fn flush(&self) -> Result<Submitted<LoopbackRequest>, FabricError> {
        self.worker.counters.flushes.fetch_add(1, Ordering::Relaxed);
        if self.worker.fail_flush.swap(false, Ordering::AcqRel) {
            return Err(FabricError::new(FabricError::IO_ERROR, "injected flush failure"));
        }
        if self.worker.outstanding.load(Ordering::Acquire) == 0 {
            return Ok(Submitted::Complete);
        }
        Ok(self.submit("flush", OpKind::Flush, Callback::Complete))
    }

    fn progress(&self) -> u32 {
        let _guard = match self.worker.progress_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => return 0,
        };
        let batch: Vec<Op> = self
            .worker
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        let n = batch.len() as u32;
        for op in batch {
            self.execute(op);
        }
        n
    }

    fn request_slot<'a>(&self, req: &'a LoopbackRequest) -> &'a CompletionSlot {
        &req.0
    }

    fn request_release(&self, req: LoopbackRequest) {
        drop(req);
    }

    fn finalize(self) -> Result<(), FabricError> {
        let pending = self.worker.outstanding.load(Ordering::Acquire);
        if pending > 0 {
            tracing::warn!(worker = self.worker.id, pending, "finalizing with queued operations");
        }
        let injected = self.worker.fail_finalize.swap(false, Ordering::AcqRel);
        tracing::debug!(worker = self.worker.id, "loopback worker finalized");
        drop(self);
        if injected {
            return Err(FabricError::new(
                FabricError::IO_ERROR,
                "injected finalize failure",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::complete_op;

    fn open(network: &LoopbackNetwork) -> LoopbackFabric {
        network
            .clone()
            .open(&WorkerParams {
                thread_mode: ThreadMode::Serialized,
            })
            .unwrap()
    }

    struct Pair {
        a: LoopbackFabric,
        b: LoopbackFabric,
        ep: LoopbackEndpoint,
        rkey: LoopbackRkey,
        mem: LoopbackMem,
    }

    fn pair(target: &mut [u64]) -> Pair {
        let network = LoopbackNetwork::new();
        let a = open(&network);
        let b = open(&network);
        let mem = unsafe { b.mem_map(target.as_mut_ptr() as *mut u8, target.len() * 8) }.unwrap();
        let packed = b.rkey_pack(&mem).unwrap();
        let ep = a.ep_create(&b.worker_address().unwrap()).unwrap();
        let rkey = a.rkey_unpack(&ep, &packed).unwrap();
        Pair {
            a,
            b,
            ep,
            rkey,
            mem,
        }
    }

    #[test]
    fn put_executes_only_on_progress() {
        let mut target = vec![0u64; 4];
        let p = pair(&mut target);
        let src = 0xdead_beef_u64.to_ne_bytes();
        let remote = p.rkey.base + 8;

        let sub = unsafe { p.a.put(&p.ep, src.as_ptr(), 8, remote, &p.rkey, Callback::Nop) }.unwrap();
        crate::fabric::release_op(&p.a, sub);
        assert_eq!(unsafe { ptr::read_volatile(&target[1]) }, 0);
        assert_eq!(p.a.stats().outstanding, 1);

        let flush = p.a.flush().unwrap();
        complete_op(&p.a, flush);
        assert_eq!(target[1], 0xdead_beef);
        assert_eq!(p.a.stats().outstanding, 0);
        assert!(matches!(p.a.flush().unwrap(), Submitted::Complete));
    }

    #[test]
    fn atomics_return_previous_value() {
        let mut target = vec![5u64, 0];
        let p = pair(&mut target);
        let mut result = 0u64;

        let sub = unsafe {
            p.a.atomic(
                &p.ep,
                Amo::Fetch {
                    op: AtomicOp::Add,
                    value: 3,
                },
                AtomicWidth::U64,
                p.rkey.base,
                &p.rkey,
                &mut result,
                Callback::Complete,
            )
        }
        .unwrap();
        complete_op(&p.a, sub);
        assert_eq!(result, 5);

        let sub = unsafe {
            p.a.atomic(
                &p.ep,
                Amo::CompareSwap {
                    compare: 7,
                    value: 1,
                },
                AtomicWidth::U64,
                p.rkey.base,
                &p.rkey,
                &mut result,
                Callback::Complete,
            )
        }
        .unwrap();
        complete_op(&p.a, sub);
        assert_eq!(result, 8);
        assert_eq!(target[0], 8);
    }

    #[test]
    fn out_of_bounds_and_misaligned_targets_are_rejected() {
        let mut target = vec![0u64; 2];
        let p = pair(&mut target);
        let src = [0u8; 16];

        let err = unsafe {
            p.a.put(&p.ep, src.as_ptr(), 16, p.rkey.base + 8, &p.rkey, Callback::Nop)
        }
        .err()
        .unwrap();
        assert_eq!(err.code, FabricError::INVALID_ADDR);

        let err = unsafe {
            p.a.atomic(
                &p.ep,
                Amo::Post {
                    op: AtomicOp::Or,
                    value: 1,
                },
                AtomicWidth::U64,
                p.rkey.base + 4,
                &p.rkey,
                ptr::null_mut(),
                Callback::Nop,
            )
        }
        .err()
        .unwrap();
        assert_eq!(err.code, FabricError::INVALID_PARAM);
        assert_eq!(p.a.stats().outstanding, 0);
    }

    #[test]
    fn unpack_rejects_malformed_and_foreign_keys() {
        let mut target = vec![0u64; 2];
        let p = pair(&mut target);

        let packed = p.b.rkey_pack(&p.mem).unwrap();
        let mut truncated = packed.clone();
        truncated.pop();
        assert!(p.a.rkey_unpack(&p.ep, &truncated).is_err());

        let mut bad_magic = packed.clone();
        bad_magic[0] = b'X';
        assert!(p.a.rkey_unpack(&p.ep, &bad_magic).is_err());

        // A key packed by `a` names a region of `a`, not of the endpoint's worker.
        let foreign = encode_key(p.a.id(), &p.mem);
        let err = p.a.rkey_unpack(&p.ep, &foreign).unwrap_err();
        assert_eq!(err.code, FabricError::INVALID_PARAM);
    }

    #[test]
    fn unknown_address_is_unreachable() {
        let network = LoopbackNetwork::new();
        let a = open(&network);
        let err = a.ep_create(&encode_address(99)).err().unwrap();
        assert_eq!(err.code, FabricError::UNREACHABLE);
        assert!(a.ep_create(b"garbage").is_err());
    }

    #[test]
    fn fault_injection() {
        let network = LoopbackNetwork::new();
        let a = open(&network);
        let mut buf = [0u8; 8];
        let mem = unsafe { a.mem_map(buf.as_mut_ptr(), buf.len()) }.unwrap();
        let again = LoopbackMem {
            slot: mem.slot,
            base: mem.base,
            len: mem.len,
        };

        a.fail_next_unmaps(1);
        assert_eq!(a.mem_unmap(mem).unwrap_err().code, FabricError::IO_ERROR);
        assert_eq!(a.stats().registrations, 1);
        a.mem_unmap(again).unwrap();
        assert_eq!(a.stats().registrations, 0);

        assert_eq!(network.workers(), 1);
        let id = a.id();
        a.fail_finalize();
        assert!(a.finalize().is_err());
        assert_eq!(network.workers(), 0);
        let retired = network.retired();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].0, id);
        assert_eq!(retired[0].1.registrations, 0);
    }
}
