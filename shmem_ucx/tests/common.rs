//! Common helpers for transport integration tests: PEs as threads over a
//! loopback network.

#![allow(dead_code)]

use std::thread;
use std::time::{Duration, Instant};

pub use shmem_ucx::test_utils::SymmetricHeap;
use shmem_ucx::{
    InMemoryRendezvous, LoopbackFabric, LoopbackNetwork, Rendezvous, Transport, TransportConfig,
};

pub type Shmem = Transport<LoopbackFabric, InMemoryRendezvous>;

pub const DATA_LEN: usize = 4096;
pub const HEAP_LEN: usize = 8192;

/// Run `body` on `n` bootstrapped PEs, each owning its transport.
pub fn run_pes_owned<T, B>(n: usize, network: &LoopbackNetwork, config: &TransportConfig, body: B) -> Vec<T>
where
    T: Send,
    B: Fn(Shmem, &SymmetricHeap) -> T + Sync,
{
    thread::scope(|s| {
        let handles: Vec<_> = InMemoryRendezvous::group(n)
            .into_iter()
            .map(|rdv| {
                let network = network.clone();
                let config = config.clone();
                let body = &body;
                s.spawn(move || {
                    let heap = SymmetricHeap::new(DATA_LEN, HEAP_LEN).unwrap();
                    let shmem = Transport::bootstrap(config, rdv, heap.layout(), network).unwrap();
                    body(shmem, &heap)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

/// Run `body` on `n` bootstrapped PEs, then fence and finalize each.
pub fn run_pes<T, B>(n: usize, network: &LoopbackNetwork, config: &TransportConfig, body: B) -> Vec<T>
where
    T: Send,
    B: Fn(&Shmem, &SymmetricHeap) -> T + Sync,
{
    run_pes_owned(n, network, config, |shmem, heap| {
        let out = body(&shmem, heap);
        fence(&shmem);
        shmem.finalize().unwrap();
        out
    })
}

pub fn fence(shmem: &Shmem) {
    shmem.rendezvous().fence().unwrap();
}

/// Poll `cond` until it holds or `timeout` expires.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_micros(100));
    }
    cond()
}
