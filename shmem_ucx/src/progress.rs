//! Background progress thread.
//!
//! Drives [`Fabric::progress`] at a fixed interval so operations complete
//! even while no application thread is inside the transport. State moves
//! `Stopped -> Running -> Stopping -> Stopped`; cancellation latency is at
//! most one interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Result, TransportError};
use crate::fabric::Fabric;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Running,
    Stopping,
}

/// Handle to the progress thread. Stops and joins on drop.
pub struct ProgressEngine {
    enabled: Arc<AtomicBool>,
    handle: Option<JoinHandle<u64>>,
    interval: Duration,
}

impl ProgressEngine {
    /// Spawn the progress thread, optionally pinned to `cpu`.
    pub fn start<F: Fabric>(
        fabric: Arc<F>,
        interval: Duration,
        cpu: Option<usize>,
    ) -> Result<Self> {
        let enabled = Arc::new(AtomicBool::new(true));
        let flag = enabled.clone();

        let handle = thread::Builder::new()
            .name("shmem-progress".into())
            .spawn(move || {
                if let Some(id) = cpu
                    && !core_affinity::set_for_current(core_affinity::CoreId { id })
                {
                    tracing::warn!(cpu = id, "failed to pin progress thread");
                }
                let mut iterations = 0u64;
                while flag.load(Ordering::Acquire) {
                    fabric.progress();
                    iterations += 1;
                    thread::sleep(interval);
                }
                iterations
            })
            .map_err(|source| TransportError::Allocation {
                what: "progress thread",
                source,
            })?;

        tracing::info!(interval_us = interval.as_micros() as u64, ?cpu, "progress thread started");
        Ok(Self {
            enabled,
            handle: Some(handle),
            interval,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> EngineState {
        match &self.handle {
            None => EngineState::Stopped,
            Some(_) if self.enabled.load(Ordering::Acquire) => EngineState::Running,
            Some(_) => EngineState::Stopping,
        }
    }

    /// Clear the enable flag and join the thread. Returns the number of
    /// progress iterations it ran. Idempotent.
    pub fn stop(&mut self) -> u64 {
        let Some(handle) = self.handle.take() else {
            return 0;
        };
        self.enabled.store(false, Ordering::Release);
        match handle.join() {
            Ok(iterations) => {
                tracing::info!(iterations, "progress thread stopped");
                iterations
            }
            Err(_) => {
                tracing::error!("progress thread panicked");
                0
            }
        }
    }
}

impl Drop for ProgressEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
