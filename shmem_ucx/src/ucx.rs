//! UCX backend: a single UCP worker driven through RMA and AMO calls.
//!
//! Requests are UCP requests whose private area is a [`CompletionSlot`]:
//! the context is created with `request_size = size_of::<CompletionSlot>()`
//! and a `request_init` that resets it, so a request pointer returned by an
//! `*_nbx` call can be reinterpreted as the slot.
//!
//! Non-blocking operations are released at issue and get no callback; a
//! later worker flush completes them and reports their failures.

use std::ffi::{CStr, c_void};
use std::mem::{self, MaybeUninit};
use std::ptr::{self, NonNull};

use ucx_sys::{
    ucp_address_t, ucp_config_t, ucp_context_h, ucp_ep_h, ucp_ep_params_t, ucp_mem_h,
    ucp_mem_map_params_t, ucp_params_t, ucp_request_param_t, ucp_rkey_h,
    ucp_send_nbx_callback_t, ucp_worker_h, ucp_worker_params_t, ucs_status_ptr_t, ucs_status_t,
};

use crate::error::FabricError;
use crate::fabric::{
    Amo, AtomicOp, AtomicWidth, Callback, Capabilities, Fabric, FabricProvider, Submitted,
    ThreadMode, WorkerParams,
};
use crate::request::CompletionSlot;
use crate::ucs::{self, ParkedOperands, StatusPtr, operand_bits};

const UCS_OK: ucs_status_t = ucx_sys::ucs_status_t_UCS_OK as ucs_status_t;
const UCP_API_MAJOR: u32 = ucx_sys::UCP_API_MAJOR;
const UCP_API_MINOR: u32 = ucx_sys::UCP_API_MINOR;

const UCP_FEATURES: u64 = (ucx_sys::ucp_feature_UCP_FEATURE_RMA
    | ucx_sys::ucp_feature_UCP_FEATURE_AMO32
    | ucx_sys::ucp_feature_UCP_FEATURE_AMO64) as u64;
const UCP_PARAM_FIELDS: u64 = (ucx_sys::ucp_params_field_UCP_PARAM_FIELD_FEATURES
    | ucx_sys::ucp_params_field_UCP_PARAM_FIELD_REQUEST_SIZE
    | ucx_sys::ucp_params_field_UCP_PARAM_FIELD_REQUEST_INIT) as u64;
const UCP_WORKER_PARAM_FIELD_THREAD_MODE: u64 =
    ucx_sys::ucp_worker_params_field_UCP_WORKER_PARAM_FIELD_THREAD_MODE as u64;
const UCP_EP_PARAM_FIELD_REMOTE_ADDRESS: u64 =
    ucx_sys::ucp_ep_params_field_UCP_EP_PARAM_FIELD_REMOTE_ADDRESS as u64;
const UCP_MEM_MAP_PARAM_FIELDS: u64 =
    (ucx_sys::ucp_mem_map_params_field_UCP_MEM_MAP_PARAM_FIELD_ADDRESS
        | ucx_sys::ucp_mem_map_params_field_UCP_MEM_MAP_PARAM_FIELD_LENGTH) as u64;
const UCP_OP_ATTR_CALLBACK_AND_DATA: u32 = (ucx_sys::ucp_op_attr_t_UCP_OP_ATTR_FIELD_CALLBACK
    | ucx_sys::ucp_op_attr_t_UCP_OP_ATTR_FIELD_USER_DATA) as u32;
const UCP_OP_ATTR_FIELD_DATATYPE: u32 = ucx_sys::ucp_op_attr_t_UCP_OP_ATTR_FIELD_DATATYPE as u32;
const UCP_OP_ATTR_FIELD_REPLY_BUFFER: u32 =
    ucx_sys::ucp_op_attr_t_UCP_OP_ATTR_FIELD_REPLY_BUFFER as u32;
const UCP_OP_ATTR_FIELD_FLAGS: u32 = ucx_sys::ucp_op_attr_t_UCP_OP_ATTR_FIELD_FLAGS as u32;

// `ucp_dt_make_contig` is a macro.
const UCP_DATATYPE_CONTIG: u64 = 0;
const UCP_DATATYPE_SHIFT: u64 = 3;

fn status_to_result(status: ucs_status_t) -> Result<(), FabricError> {
    if status == UCS_OK {
        return Ok(());
    }
    let msg = unsafe {
        let ptr = ucx_sys::ucs_status_string(status);
        if ptr.is_null() {
            format!("UCX error {status}")
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    };
    Err(FabricError::new(status as i32, msg))
}

/// Decode the status pointer returned by an `*_nbx` call.
fn submitted(ptr: ucs_status_ptr_t) -> Result<Submitted<UcxRequest>, FabricError> {
    match ucs::decode(ptr) {
        StatusPtr::Done => Ok(Submitted::Complete),
        StatusPtr::Failed(status) => {
            status_to_result(status as ucs_status_t).map(|()| Submitted::Complete)
        }
        StatusPtr::Request(req) => Ok(Submitted::Pending(UcxRequest(req))),
    }
}

const _: () = assert!(ucx_sys::ucs_status_t_UCS_ERR_LAST as i32 == ucs::UCS_ERR_LAST);

// ============================================================================
// Callbacks
// ============================================================================
//
// Only requests waited on through a `CompletionSlot` carry a callback.
// Requests issued with `Callback::Nop` are released right away, and UCX
// runs no callback for a released request: their failures surface through
// the next worker flush.

unsafe extern "C" fn request_init(request: *mut c_void) {
    unsafe { ptr::write(request as *mut CompletionSlot, CompletionSlot::new()) };
}

unsafe fn on_complete(op: &'static str, request: *mut c_void, status: ucs_status_t) {
    let slot = unsafe { &*(request as *const CompletionSlot) };
    if let Err(e) = slot.complete(op, status_to_result(status)) {
        e.raise();
    }
}

macro_rules! callbacks {
    ($($op:literal => $complete:ident;)*) => {$(
        unsafe extern "C" fn $complete(request: *mut c_void, status: ucs_status_t, _user_data: *mut c_void) {
            unsafe { on_complete($op, request, status) }
        }
    )*};
}

callbacks! {
    "put" => put_complete;
    "get" => get_complete;
    "ep_close" => close_complete;
}

/// `user_data` is the boxed operand.
unsafe extern "C" fn atomic_complete(request: *mut c_void, status: ucs_status_t, user_data: *mut c_void) {
    drop(unsafe { Box::from_raw(user_data as *mut u64) });
    unsafe { on_complete("atomic", request, status) }
}

/// `user_data` is the batch of parked operands this flush covers, or null.
unsafe extern "C" fn flush_complete(request: *mut c_void, status: ucs_status_t, user_data: *mut c_void) {
    unsafe { free_batch(user_data) };
    unsafe { on_complete("flush", request, status) }
}

unsafe fn free_batch(batch: *mut c_void) {
    if !batch.is_null() {
        drop(unsafe { Box::from_raw(batch as *mut Vec<Box<u64>>) });
    }
}

fn request_param(cb: ucp_send_nbx_callback_t, user_data: *mut c_void) -> ucp_request_param_t {
    let mut param: ucp_request_param_t = unsafe { mem::zeroed() };
    if cb.is_some() {
        param.op_attr_mask = UCP_OP_ATTR_CALLBACK_AND_DATA;
        param.cb.send = cb;
        param.user_data = user_data;
    }
    param
}

fn pick(cb: Callback, complete: ucp_send_nbx_callback_t) -> ucp_send_nbx_callback_t {
    match cb {
        Callback::Complete => complete,
        Callback::Nop => None,
    }
}

// ============================================================================
// Handles
// ============================================================================

pub struct UcxMem(ucp_mem_h);

pub struct UcxEndpoint(ucp_ep_h);

pub struct UcxRkey(ucp_rkey_h);

pub struct UcxRequest(NonNull<c_void>);

// UCP handles are plain pointers; the worker's thread mode decides which
// threads may use them concurrently.
unsafe impl Send for UcxMem {}
unsafe impl Sync for UcxMem {}
unsafe impl Send for UcxEndpoint {}
unsafe impl Sync for UcxEndpoint {}
unsafe impl Send for UcxRkey {}
unsafe impl Sync for UcxRkey {}
unsafe impl Send for UcxRequest {}

/// Packed remote key, released with `ucp_rkey_buffer_release` on drop.
pub struct UcxPackedKey {
    ptr: *mut c_void,
    len: usize,
}

impl AsRef<[u8]> for UcxPackedKey {
    fn as_ref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for UcxPackedKey {
    fn drop(&mut self) {
        unsafe { ucx_sys::ucp_rkey_buffer_release(self.ptr) };
    }
}

/// Worker address, released with `ucp_worker_release_address` on drop.
pub struct UcxAddress {
    worker: ucp_worker_h,
    ptr: *mut ucp_address_t,
    len: usize,
}

impl AsRef<[u8]> for UcxAddress {
    fn as_ref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for UcxAddress {
    fn drop(&mut self) {
        unsafe { ucx_sys::ucp_worker_release_address(self.worker, self.ptr) };
    }
}

// ============================================================================
// Provider
// ============================================================================

/// Opens a [`UcxFabric`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UcxProvider {
    remote_virtual_addressing: bool,
}

impl UcxProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// UCX does not report whether the transports it selected can address
    /// remote memory by raw virtual address; the deployment says so here.
    pub fn with_remote_virtual_addressing(mut self, enable: bool) -> Self {
        self.remote_virtual_addressing = enable;
        self
    }
}

impl FabricProvider for UcxProvider {
    type Fabric = UcxFabric;

    fn open(self, params: &WorkerParams) -> Result<UcxFabric, FabricError> {
        let mut config: *mut ucp_config_t = ptr::null_mut();
        status_to_result(unsafe { ucx_sys::ucp_config_read(ptr::null(), ptr::null(), &mut config) })?;

        let ucp_params = ucp_params_t {
            field_mask: UCP_PARAM_FIELDS,
            features: UCP_FEATURES,
            request_size: mem::size_of::<CompletionSlot>(),
            request_init: Some(request_init),
            ..unsafe { mem::zeroed() }
        };
        let mut context: MaybeUninit<ucp_context_h> = MaybeUninit::uninit();
        let status = unsafe {
            ucx_sys::ucp_init_version(
                UCP_API_MAJOR,
                UCP_API_MINOR,
                &ucp_params,
                config,
                context.as_mut_ptr(),
            )
        };
        if let Err(e) = status_to_result(status) {
            unsafe { ucx_sys::ucp_config_release(config) };
            return Err(e);
        }
        let context = unsafe { context.assume_init() };

        let worker_params = ucp_worker_params_t {
            field_mask: UCP_WORKER_PARAM_FIELD_THREAD_MODE,
            thread_mode: match params.thread_mode {
                ThreadMode::Single => ucx_sys::ucs_thread_mode_t_UCS_THREAD_MODE_SINGLE,
                ThreadMode::Serialized => ucx_sys::ucs_thread_mode_t_UCS_THREAD_MODE_SERIALIZED,
                ThreadMode::Multi => ucx_sys::ucs_thread_mode_t_UCS_THREAD_MODE_MULTI,
            },
            ..unsafe { mem::zeroed() }
        };
        let mut worker: MaybeUninit<ucp_worker_h> = MaybeUninit::uninit();
        let status =
            unsafe { ucx_sys::ucp_worker_create(context, &worker_params, worker.as_mut_ptr()) };
        if let Err(e) = status_to_result(status) {
            unsafe {
                ucx_sys::ucp_cleanup(context);
                ucx_sys::ucp_config_release(config);
            }
            return Err(e);
        }

        tracing::debug!(mode = ?params.thread_mode, rva = self.remote_virtual_addressing, "UCP worker created");
        Ok(UcxFabric {
            config,
            context,
            worker: unsafe { worker.assume_init() },
            thread_mode: params.thread_mode,
            rva: self.remote_virtual_addressing,
            parked: ParkedOperands::default(),
        })
    }
}

// ============================================================================
// Fabric
// ============================================================================

/// UCP context, worker and the configuration they were read from.
pub struct UcxFabric {
    config: *mut ucp_config_t,
    context: ucp_context_h,
    worker: ucp_worker_h,
    thread_mode: ThreadMode,
    rva: bool,
    /// Dropped after the worker is destroyed.
    parked: ParkedOperands,
}

// The worker is created with the thread mode the transport needs; the
// context and config are only touched at init and teardown.
unsafe impl Send for UcxFabric {}
unsafe impl Sync for UcxFabric {}

impl Drop for UcxFabric {
    fn drop(&mut self) {
        unsafe {
            ucx_sys::ucp_worker_destroy(self.worker);
            ucx_sys::ucp_cleanup(self.context);
            ucx_sys::ucp_config_release(self.config);
        }
    }
}

impl Fabric for UcxFabric {
    type MemHandle = UcxMem;
    type Endpoint = UcxEndpoint;
    type RemoteKey = UcxRkey;
    type PackedKey = UcxPackedKey;
    type Address = UcxAddress;
    type Request = UcxRequest;

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            remote_virtual_addressing: self.rva,
        }
    }

    fn thread_mode(&self) -> ThreadMode {
        self.thread_mode
    }

    fn worker_address(&self) -> Result<UcxAddress, FabricError> {
        let mut ptr: *mut ucp_address_t = ptr::null_mut();
        let mut len = 0usize;
        status_to_result(unsafe { ucx_sys::ucp_worker_get_address(self.worker, &mut ptr, &mut len) })?;
        Ok(UcxAddress {
            worker: self.worker,
            ptr,
            len,
        })
    }

    unsafe fn mem_map(&self, base: *mut u8, len: usize) -> Result<UcxMem, FabricError> {
        let params = ucp_mem_map_params_t {
            field_mask: UCP_MEM_MAP_PARAM_FIELDS,
            address: base as *mut c_void,
            length: len,
            ..unsafe { mem::zeroed() }
        };
        let mut memh: MaybeUninit<ucp_mem_h> = MaybeUninit::uninit();
        status_to_result(unsafe { ucx_sys::ucp_mem_map(self.context, &params, memh.as_mut_ptr()) })?;
        Ok(UcxMem(unsafe { memh.assume_init() }))
    }

    fn mem_unmap(&self, mem: UcxMem) -> Result<(), FabricError> {
        status_to_result(unsafe { ucx_sys::ucp_mem_unmap(self.context, mem.0) })
    }

    fn rkey_pack(&self, mem: &UcxMem) -> Result<UcxPackedKey, FabricError> {
        let mut ptr: *mut c_void = ptr::null_mut();
        let mut len = 0usize;
        status_to_result(unsafe { ucx_sys::ucp_rkey_pack(self.context, mem.0, &mut ptr, &mut len) })?;
        Ok(UcxPackedKey { ptr, len })
    }

    fn ep_create(&self, address: &[u8]) -> Result<UcxEndpoint, FabricError> {
        let params = ucp_ep_params_t {
            field_mask: UCP_EP_PARAM_FIELD_REMOTE_ADDRESS,
            address: address.as_ptr() as *const ucp_address_t,
            ..unsafe { mem::zeroed() }
        };
        let mut ep: MaybeUninit<ucp_ep_h> = MaybeUninit::uninit();
        status_to_result(unsafe { ucx_sys::ucp_ep_create(self.worker, &params, ep.as_mut_ptr()) })?;
        Ok(UcxEndpoint(unsafe { ep.assume_init() }))
    }

    fn ep_close(&self, ep: UcxEndpoint) -> Result<Submitted<UcxRequest>, FabricError> {
        // Flags 0 selects flush mode: outstanding operations drain first.
        let mut param = request_param(Some(close_complete), ptr::null_mut());
        param.op_attr_mask |= UCP_OP_ATTR_FIELD_FLAGS;
        param.flags = 0;
        submitted(unsafe { ucx_sys::ucp_ep_close_nbx(ep.0, &param) })
    }

    fn rkey_unpack(&self, ep: &UcxEndpoint, packed: &[u8]) -> Result<UcxRkey, FabricError> {
        let mut rkey: MaybeUninit<ucp_rkey_h> = MaybeUninit::uninit();
        status_to_result(unsafe {
            ucx_sys::ucp_ep_rkey_unpack(ep.0, packed.as_ptr() as *const c_void, rkey.as_mut_ptr())
        })?;
        Ok(UcxRkey(unsafe { rkey.assume_init() }))
    }

    fn rkey_destroy(&self, rkey: UcxRkey) {
        unsafe { ucx_sys::ucp_rkey_destroy(rkey.0) };
    }

    unsafe fn put(
        &self,
        ep: &UcxEndpoint,
        src: *const u8,
        len: usize,
        remote_addr: u64,
        rkey: &UcxRkey,
        cb: Callback,
    ) -> Result<Submitted<UcxRequest>, FabricError> {
        let param = request_param(pick(cb, Some(put_complete)), ptr::null_mut());
        submitted(unsafe {
            ucx_sys::ucp_put_nbx(ep.0, src as *const c_void, len, remote_addr, rkey.0, &param)
        })
    }

    unsafe fn get(
        &self,
        ep: &UcxEndpoint,
        dst: *mut u8,
        len: usize,
        remote_addr: u64,
        rkey: &UcxRkey,
        cb: Callback,
    ) -> Result<Submitted<UcxRequest>, FabricError> {
        let param = request_param(pick(cb, Some(get_complete)), ptr::null_mut());
        submitted(unsafe {
            ucx_sys::ucp_get_nbx(ep.0, dst as *mut c_void, len, remote_addr, rkey.0, &param)
        })
    }

    unsafe fn atomic(
        &self,
        ep: &UcxEndpoint,
        amo: Amo,
        width: AtomicWidth,
        remote_addr: u64,
        rkey: &UcxRkey,
        result: *mut u64,
        cb: Callback,
    ) -> Result<Submitted<UcxRequest>, FabricError> {
        let (opcode, operand) = match amo {
            Amo::Post { op, value } | Amo::Fetch { op, value } => {
                let opcode = match op {
                    AtomicOp::And => ucx_sys::ucp_atomic_op_t_UCP_ATOMIC_OP_AND,
                    AtomicOp::Or => ucx_sys::ucp_atomic_op_t_UCP_ATOMIC_OP_OR,
                    AtomicOp::Xor => ucx_sys::ucp_atomic_op_t_UCP_ATOMIC_OP_XOR,
                    AtomicOp::Add => ucx_sys::ucp_atomic_op_t_UCP_ATOMIC_OP_ADD,
                };
                (opcode, value)
            }
            Amo::Swap { value } => (ucx_sys::ucp_atomic_op_t_UCP_ATOMIC_OP_SWAP, value),
            // CSWAP compares against the operand and swaps in the value
            // preloaded into the reply buffer.
            Amo::CompareSwap { compare, value } => {
                unsafe { result.write(operand_bits(value, width)) };
                (ucx_sys::ucp_atomic_op_t_UCP_ATOMIC_OP_CSWAP, compare)
            }
        };

        // UCX may read the operand until the request completes. A waited-on
        // request frees it in its callback; a released one parks it until
        // the next flush.
        let operand = Box::into_raw(Box::new(operand_bits(operand, width)));
        let mut param = request_param(pick(cb, Some(atomic_complete)), operand as *mut c_void);
        param.op_attr_mask |= UCP_OP_ATTR_FIELD_DATATYPE;
        param.datatype = ((width.bytes() as u64) << UCP_DATATYPE_SHIFT) | UCP_DATATYPE_CONTIG;
        if amo.fetches() {
            param.op_attr_mask |= UCP_OP_ATTR_FIELD_REPLY_BUFFER;
            param.reply_buffer = result as *mut c_void;
        }

        let outcome = submitted(unsafe {
            ucx_sys::ucp_atomic_op_nbx(
                ep.0,
                opcode,
                operand as *const c_void,
                1,
                remote_addr,
                rkey.0,
                &param,
            )
        });
        match (&outcome, cb) {
            // Freed by `atomic_complete`.
            (Ok(Submitted::Pending(_)), Callback::Complete) => {}
            (Ok(Submitted::Pending(_)), Callback::Nop) => {
                self.parked.park(unsafe { Box::from_raw(operand) })
            }
            _ => drop(unsafe { Box::from_raw(operand) }),
        }
        outcome
    }

    fn flush(&self) -> Result<Submitted<UcxRequest>, FabricError> {
        let batch = self.parked.take();
        let user_data = if batch.is_empty() {
            ptr::null_mut()
        } else {
            Box::into_raw(Box::new(batch)) as *mut c_void
        };
        let param = request_param(Some(flush_complete), user_data);
        let outcome = submitted(unsafe { ucx_sys::ucp_worker_flush_nbx(self.worker, &param) });
        match &outcome {
            Ok(Submitted::Pending(_)) => {}
            Ok(Submitted::Complete) => unsafe { free_batch(user_data) },
            // Operations the batch belongs to may still be in flight.
            Err(_) if !user_data.is_null() => {
                let batch = unsafe { Box::from_raw(user_data as *mut Vec<Box<u64>>) };
                self.parked.restore(*batch);
            }
            Err(_) => {}
        }
        outcome
    }

    fn progress(&self) -> u32 {
        unsafe { ucx_sys::ucp_worker_progress(self.worker) }
    }

    fn request_slot<'a>(&self, req: &'a UcxRequest) -> &'a CompletionSlot {
        unsafe { &*(req.0.as_ptr() as *const CompletionSlot) }
    }

    fn request_release(&self, req: UcxRequest) {
        unsafe { ucx_sys::ucp_request_free(req.0.as_ptr()) };
    }

    fn finalize(self) -> Result<(), FabricError> {
        tracing::debug!("UCP worker finalized");
        drop(self);
        Ok(())
    }
}
