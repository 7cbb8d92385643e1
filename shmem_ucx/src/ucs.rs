//! UCS encodings the UCX backend relies on: status pointers returned by
//! `*_nbx` calls, atomic operand layout, and operands parked for requests
//! released before completion. Free of the UCX bindings so it is built and
//! tested without UCX installed.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Mutex;

use crate::fabric::AtomicWidth;

/// `UCS_ERR_LAST` from `ucs/type/status.h`. Error statuses lie in
/// `[UCS_ERR_LAST, 0)`.
pub const UCS_ERR_LAST: i32 = -100;

/// Decoded return value of an `*_nbx` call.
#[derive(Debug, PartialEq, Eq)]
pub enum StatusPtr {
    /// Completed inline.
    Done,
    /// Failed at issue with this status.
    Failed(i32),
    /// A live request.
    Request(NonNull<c_void>),
}

/// `UCS_PTR_IS_ERR`: statuses are encoded in the topmost addresses.
pub fn is_err(ptr: *const c_void) -> bool {
    ptr as usize >= UCS_ERR_LAST as isize as usize
}

pub fn decode(ptr: *mut c_void) -> StatusPtr {
    match NonNull::new(ptr) {
        None => StatusPtr::Done,
        Some(_) if is_err(ptr) => StatusPtr::Failed(ptr as isize as i32),
        Some(req) => StatusPtr::Request(req),
    }
}

/// Operand bits for a `width`-wide atomic, laid out as UCX reads them.
pub fn operand_bits(value: u64, width: AtomicWidth) -> u64 {
    match width {
        AtomicWidth::U64 => value,
        AtomicWidth::U32 => {
            let mut b = [0u8; 8];
            b[..4].copy_from_slice(&(value as u32).to_ne_bytes());
            u64::from_ne_bytes(b)
        }
    }
}

/// Operands of atomics whose request was released while still pending.
///
/// A released request runs no callback, so its operand is kept here until
/// a worker flush issued after it completes.
#[derive(Debug, Default)]
pub struct ParkedOperands {
    parked: Mutex<Vec<Box<u64>>>,
}

impl ParkedOperands {
    pub fn park(&self, operand: Box<u64>) {
        self.parked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(operand);
    }

    /// Everything parked so far; a flush issued after this call covers it.
    pub fn take(&self) -> Vec<Box<u64>> {
        std::mem::take(&mut *self.parked.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Return a batch whose flush failed to issue.
    pub fn restore(&self, batch: Vec<Box<u64>>) {
        self.parked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(batch);
    }

    pub fn len(&self) -> usize {
        self.parked.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
