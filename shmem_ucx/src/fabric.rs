//! Fabric abstraction: the RMA/AMO networking library the transport drives.
//!
//! The transport core only talks to this trait. [`crate::loopback`] runs
//! PEs as threads in one process; the `ucx` feature adds a UCX worker
//! backend.

use crate::error::{FabricError, TransportError};
use crate::request::{CompletionFlag, CompletionSlot};

/// Worker thread-safety mode requested from the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadMode {
    /// Only one thread ever touches the worker.
    Single,
    /// Several threads, never concurrently.
    Serialized,
    /// Fully concurrent access.
    Multi,
}

/// Parameters handed to [`FabricProvider::open`].
#[derive(Debug, Clone, Copy)]
pub struct WorkerParams {
    pub thread_mode: ThreadMode,
}

/// Capabilities decided by the fabric at runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Remote memory is addressed by the raw symmetric virtual address.
    /// When false, peers exchange segment bases and remote addresses are
    /// computed as `base + offset`.
    pub remote_virtual_addressing: bool,
}

/// What completion should do once an operation finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callback {
    /// Nothing; completion is observed through [`Fabric::flush`].
    Nop,
    /// Run the [`CompletionSlot`] handshake.
    Complete,
}

/// Outcome of a non-blocking submit.
#[must_use]
pub enum Submitted<R> {
    /// Finished inline; no callback will run.
    Complete,
    /// In flight; the callback runs later on whichever thread progresses.
    Pending(R),
}

/// Remote atomic opcodes with a post and a fetching form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    And,
    Or,
    Xor,
    Add,
}

/// Operand width of a remote atomic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicWidth {
    U32,
    U64,
}

impl AtomicWidth {
    pub const fn bytes(self) -> usize {
        match self {
            AtomicWidth::U32 => 4,
            AtomicWidth::U64 => 8,
        }
    }
}

/// Full description of one remote atomic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Amo {
    /// Apply `op` with `value`; no result.
    Post { op: AtomicOp, value: u64 },
    /// Apply `op` with `value`; return the previous value.
    Fetch { op: AtomicOp, value: u64 },
    /// Store `value`; return the previous value.
    Swap { value: u64 },
    /// Store `value` if the target equals `compare`; return the previous value.
    CompareSwap { compare: u64, value: u64 },
}

impl Amo {
    pub fn fetches(&self) -> bool {
        !matches!(self, Amo::Post { .. })
    }
}

/// Networking library surface used by the transport.
///
/// Implementations must be callable from the progress thread and the
/// application threads at once when opened in [`ThreadMode::Multi`].
pub trait Fabric: Send + Sync + Sized + 'static {
    type MemHandle: Send + Sync;
    type Endpoint: Send + Sync;
    type RemoteKey: Send + Sync;
    /// Packed key bytes; released when dropped.
    type PackedKey: AsRef<[u8]>;
    /// Worker address bytes; released when dropped.
    type Address: AsRef<[u8]>;
    type Request: Send;

    fn capabilities(&self) -> Capabilities;

    fn thread_mode(&self) -> ThreadMode;

    fn worker_address(&self) -> std::result::Result<Self::Address, FabricError>;

    /// Register `len` bytes at `base` for remote access.
    ///
    /// # Safety
    /// The range must stay valid until it is passed to [`Fabric::mem_unmap`].
    unsafe fn mem_map(
        &self,
        base: *mut u8,
        len: usize,
    ) -> std::result::Result<Self::MemHandle, FabricError>;

    fn mem_unmap(&self, mem: Self::MemHandle) -> std::result::Result<(), FabricError>;

    fn rkey_pack(&self, mem: &Self::MemHandle)
    -> std::result::Result<Self::PackedKey, FabricError>;

    fn ep_create(&self, address: &[u8]) -> std::result::Result<Self::Endpoint, FabricError>;

    /// Close an endpoint after its outstanding operations have drained.
    fn ep_close(
        &self,
        ep: Self::Endpoint,
    ) -> std::result::Result<Submitted<Self::Request>, FabricError>;

    fn rkey_unpack(
        &self,
        ep: &Self::Endpoint,
        packed: &[u8],
    ) -> std::result::Result<Self::RemoteKey, FabricError>;

    fn rkey_destroy(&self, rkey: Self::RemoteKey);

    /// Write `len` bytes from `src` to `remote_addr`.
    ///
    /// # Safety
    /// `src` must stay readable until the operation completes.
    unsafe fn put(
        &self,
        ep: &Self::Endpoint,
        src: *const u8,
        len: usize,
        remote_addr: u64,
        rkey: &Self::RemoteKey,
        cb: Callback,
    ) -> std::result::Result<Submitted<Self::Request>, FabricError>;

    /// Read `len` bytes from `remote_addr` into `dst`.
    ///
    /// # Safety
    /// `dst` must stay writable and unaliased until the operation completes.
    unsafe fn get(
        &self,
        ep: &Self::Endpoint,
        dst: *mut u8,
        len: usize,
        remote_addr: u64,
        rkey: &Self::RemoteKey,
        cb: Callback,
    ) -> std::result::Result<Submitted<Self::Request>, FabricError>;

    /// Issue a remote atomic. Fetching forms write the previous value,
    /// `width` bytes wide, to `result`.
    ///
    /// # Safety
    /// For fetching forms `result` must stay writable until completion.
    #[allow(clippy::too_many_arguments)]
    unsafe fn atomic(
        &self,
        ep: &Self::Endpoint,
        amo: Amo,
        width: AtomicWidth,
        remote_addr: u64,
        rkey: &Self::RemoteKey,
        result: *mut u64,
        cb: Callback,
    ) -> std::result::Result<Submitted<Self::Request>, FabricError>;

    /// Completes once everything issued on the worker before it has completed.
    fn flush(&self) -> std::result::Result<Submitted<Self::Request>, FabricError>;

    /// One non-blocking progress step. Returns the number of events handled.
    fn progress(&self) -> u32;

    fn request_slot<'a>(&self, req: &'a Self::Request) -> &'a CompletionSlot;

    /// Hand a request back to the fabric. A request released before it
    /// completes gets no notification; [`Fabric::flush`] still covers it.
    fn request_release(&self, req: Self::Request);

    /// Destroy the worker, the fabric context and any retained configuration.
    fn finalize(self) -> std::result::Result<(), FabricError>;
}

/// Builds a [`Fabric`] with the thread mode the transport selected.
pub trait FabricProvider {
    type Fabric: Fabric;

    fn open(self, params: &WorkerParams) -> std::result::Result<Self::Fabric, FabricError>;
}

/// Wait for a submitted operation using the completion-slot handshake.
///
/// Drives `fabric.progress()` on the calling thread until the flag is set;
/// the background progress thread, if any, may complete it first.
pub fn complete_op<F: Fabric>(fabric: &F, submitted: Submitted<F::Request>) {
    let req = match submitted {
        Submitted::Complete => return,
        Submitted::Pending(req) => req,
    };

    let flag = CompletionFlag::new();
    let slot = fabric.request_slot(&req);
    slot.publish(&flag);

    while !flag.is_complete() {
        fabric.progress();
    }

    slot.reset();
    fabric.request_release(req);
}

/// Release a request issued with [`Callback::Nop`]; completion is left to
/// a later flush.
pub fn release_op<F: Fabric>(fabric: &F, submitted: Submitted<F::Request>) {
    if let Submitted::Pending(req) = submitted {
        fabric.request_release(req);
    }
}

/// Map an issue-time fabric error onto the transport taxonomy.
pub(crate) fn issue_error(op: &'static str, pe: usize) -> impl FnOnce(FabricError) -> TransportError {
    move |source| TransportError::Operation { op, pe, source }
}
