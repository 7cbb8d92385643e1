//! Completion slots: the bridge between fabric completion callbacks and
//! the flag the issuing thread waits on.
//!
//! The fabric allocates one [`CompletionSlot`] per outstanding request and
//! may run the completion callback before the issuer has returned from the
//! submit call. The handshake is:
//!
//! ```text
//!  issuer                               completion (any thread)
//!  ------                               -----------------------
//!  slot.reset()     valid=0 (Release)
//!  submit op  ─────────────────────────▶  op finishes
//!  slot.publish(&flag)                    slot.complete(status)
//!    flag ptr store                         spin: valid (Acquire) == 0
//!    valid=1 (Release) ───────────────▶     flag ptr load
//!  wait: flag (Acquire) == 0  ◀──────────   flag=1 (Release)
//! ```
//!
//! The Release/Acquire pair on `valid` is what makes the flag pointer
//! visible to the completion side; weakening either end lets the callback
//! write through a stale pointer.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};

use crate::error::{FabricError, Result, TransportError};

/// Application-visible completion flag. Set to 1 exactly once.
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct CompletionFlag(AtomicU64);

impl CompletionFlag {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }

    /// Raw value, for checking that a flag was written exactly once.
    #[inline]
    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    fn set(&self) {
        self.0.store(1, Ordering::Release);
    }
}

/// Per-request state shared between the issuer and the completion callback.
///
/// `#[repr(C)]` so the UCX backend can size its request memory with
/// `size_of::<CompletionSlot>()` and reinterpret the request pointer.
#[derive(Debug)]
#[repr(C)]
pub struct CompletionSlot {
    flag: AtomicPtr<CompletionFlag>,
    valid: AtomicBool,
}

impl Default for CompletionSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionSlot {
    pub const fn new() -> Self {
        Self {
            flag: AtomicPtr::new(ptr::null_mut()),
            valid: AtomicBool::new(false),
        }
    }

    /// Return the slot to the unpublished state.
    ///
    /// Must run before the slot becomes visible to the fabric, and again
    /// before a finished request is handed back for reuse.
    #[inline]
    pub fn reset(&self) {
        self.flag.store(ptr::null_mut(), Ordering::Relaxed);
        self.valid.store(false, Ordering::Release);
    }

    /// Publish the flag the completion side must set.
    ///
    /// The flag must stay alive until it reads as complete.
    #[inline]
    pub fn publish(&self, flag: &CompletionFlag) {
        self.flag
            .store(flag as *const CompletionFlag as *mut CompletionFlag, Ordering::Relaxed);
        self.valid.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_published(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Completion-side half of the handshake.
    ///
    /// A failed status is returned without touching the flag; the callers
    /// (fabric callbacks) escalate it through [`TransportError::raise`].
    /// Otherwise spins until the issuer has published, then sets the flag.
    pub fn complete(
        &self,
        op: &'static str,
        status: std::result::Result<(), FabricError>,
    ) -> Result<()> {
        status.map_err(|source| TransportError::Completion { op, source })?;

        while !self.valid.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }

        let flag = self.flag.load(Ordering::Relaxed);
        // valid == true means `flag` was stored by `publish` from a live
        // reference the issuer keeps until the flag is set.
        unsafe { (*flag).set() };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn completion_before_publish_waits_for_flag() {
        let slot = Arc::new(CompletionSlot::new());
        slot.reset();
        let flag = CompletionFlag::new();

        let completer = {
            let slot = slot.clone();
            thread::spawn(move || slot.complete("put", Ok(())))
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!completer.is_finished(), "callback must spin until published");
        assert!(!flag.is_complete());

        slot.publish(&flag);
        completer.join().unwrap().unwrap();
        assert_eq!(flag.value(), 1);
    }

    #[test]
    fn publish_before_completion() {
        let slot = CompletionSlot::new();
        let flag = CompletionFlag::new();
        slot.publish(&flag);
        slot.complete("get", Ok(())).unwrap();
        assert!(flag.is_complete());
    }

    #[test]
    fn racing_publish_and_complete_sets_flag_once() {
        for _ in 0..500 {
            let slot = Arc::new(CompletionSlot::new());
            slot.reset();
            let flag = CompletionFlag::new();

            let completer = {
                let slot = slot.clone();
                thread::spawn(move || slot.complete("amo", Ok(())))
            };
            thread::yield_now();
            slot.publish(&flag);
            completer.join().unwrap().unwrap();

            assert_eq!(flag.value(), 1);
        }
    }

    #[test]
    fn failed_status_does_not_touch_flag() {
        let slot = CompletionSlot::new();
        let err = slot
            .complete("put", Err(FabricError::new(FabricError::IO_ERROR, "link down")))
            .unwrap_err();
        assert!(matches!(err, TransportError::Completion { op: "put", .. }));
        assert!(!slot.is_published());
    }

    #[test]
    fn reset_clears_publication() {
        let slot = CompletionSlot::new();
        let flag = CompletionFlag::new();
        slot.publish(&flag);
        assert!(slot.is_published());
        slot.reset();
        assert!(!slot.is_published());
    }
}
