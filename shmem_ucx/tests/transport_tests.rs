//! Transport integration tests over the loopback fabric.

mod common;

use std::time::Duration;

use common::{Shmem, SymmetricHeap, fence, run_pes, run_pes_owned, wait_until};
use shmem_ucx::rendezvous::{self, keys};
use shmem_ucx::{
    AtomicOp, AtomicWidth, ContextOptions, EngineState, FabricError, InMemoryRendezvous,
    LoopbackNetwork, Rendezvous, RendezvousError, SegmentKind, ThreadMode, Transport,
    TransportConfig, TransportError,
};

fn no_rva() -> TransportConfig {
    TransportConfig::new().with_remote_virtual_addressing(false)
}

// ============================================================================
// Startup
// ============================================================================

#[test]
fn bootstrap_connects_every_pe() {
    let network = LoopbackNetwork::new();
    let n = 4;
    run_pes(n, &network, &no_rva(), |shmem, heap| {
        assert!(shmem.is_started());
        assert_eq!(shmem.world_size(), n);
        assert!(!shmem.remote_virtual_addressing());

        for pe in 0..n {
            let peer = shmem.peer(pe).expect("peer record");
            assert_ne!(peer.rkey(SegmentKind::Data), peer.rkey(SegmentKind::Heap));
            assert!(!peer.address().is_empty());
            assert!(peer.bases().is_some());
        }
        assert!(shmem.peer(n).is_none());

        let own = shmem.peer(shmem.rank()).unwrap().bases().unwrap();
        assert_eq!(own.data, heap.data.addr());
        assert_eq!(own.heap, heap.heap.addr());

        let stats = shmem.fabric().stats();
        assert_eq!(stats.endpoints, n);
        assert_eq!(stats.rkeys, 2 * n);
        assert_eq!(stats.registrations, 2);
    });
    assert_eq!(network.workers(), 0);
}

#[test]
fn world_size_one_connects_to_self() {
    let network = LoopbackNetwork::new();
    run_pes(1, &network, &no_rva(), |shmem, heap| {
        assert!(shmem.peer(0).is_some());
        assert_eq!(shmem.fabric().stats().endpoints, 1);

        let ctx = shmem.default_context();
        let dest = heap.heap.at(256);
        shmem.put(ctx, dest, b"self", 0).unwrap();
        let mut back = [0u8; 4];
        shmem.get(ctx, &mut back, dest, 0).unwrap();
        assert_eq!(&back, b"self");
    });
}

#[test]
fn rva_mode_publishes_no_bases() {
    let network = LoopbackNetwork::new().with_remote_virtual_addressing(true);
    let results = run_pes(2, &network, &TransportConfig::new(), |shmem, heap| {
        assert!(shmem.remote_virtual_addressing());
        let published = shmem.rendezvous().published_by(shmem.rank());
        assert!(!published.iter().any(|k| k == keys::DATA_BASE || k == keys::HEAP_BASE));
        assert!(published.iter().any(|k| k == keys::DATA_RKEY));
        assert!(shmem.peer(0).unwrap().bases().is_none());

        // Raw symmetric addresses only resolve on self: thread PEs do not
        // share segment addresses.
        let ctx = shmem.default_context();
        shmem.put(ctx, heap.data.as_ptr(), b"ok", shmem.rank()).unwrap();
        let other = (shmem.rank() + 1) % 2;
        shmem.put(ctx, heap.data.as_ptr(), b"no", other).unwrap_err()
    });
    for err in results {
        match err {
            TransportError::Operation { op: "put", source, .. } => {
                assert_eq!(source.code, FabricError::INVALID_ADDR)
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

#[test]
fn rva_disabled_by_config_exchanges_bases() {
    let network = LoopbackNetwork::new().with_remote_virtual_addressing(true);
    let config = TransportConfig::new().with_remote_virtual_addressing(false);
    run_pes(2, &network, &config, |shmem, _| {
        assert!(!shmem.remote_virtual_addressing());
        let published = shmem.rendezvous().published_by(shmem.rank());
        assert!(published.iter().any(|k| k == keys::HEAP_BASE));
        assert!(shmem.peer(1 - shmem.rank()).unwrap().bases().is_some());
    });
}

#[test]
fn missing_peer_reports_rendezvous_error() {
    let network = LoopbackNetwork::new();
    let mut group = InMemoryRendezvous::group(2);
    let rdv = group.remove(0);
    let heap = SymmetricHeap::new(4096, 4096).unwrap();

    // PE 1 never initializes.
    let mut shmem: Shmem =
        Transport::init(no_rva(), rdv, heap.layout(), network.clone()).unwrap();
    match shmem.startup().unwrap_err() {
        TransportError::Rendezvous {
            pe: 1,
            key,
            source: RendezvousError::Missing { rank: 1, .. },
        } => assert_eq!(key, keys::ADDR_LEN),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!shmem.is_started());
    assert_eq!(shmem.fabric().stats().endpoints, 0);
    assert_eq!(shmem.fabric().stats().rkeys, 0);

    shmem.finalize().unwrap();
}

#[test]
fn malformed_key_reports_key_unpack() {
    let network = LoopbackNetwork::new();
    let rdv = InMemoryRendezvous::group(1).remove(0);
    let heap = SymmetricHeap::new(4096, 4096).unwrap();
    let mut shmem: Shmem = Transport::init(no_rva(), rdv, heap.layout(), network).unwrap();

    let len = rendezvous::get_usize(shmem.rendezvous(), 0, keys::HEAP_RKEY_LEN).unwrap();
    shmem
        .rendezvous()
        .put(keys::HEAP_RKEY, &vec![0xffu8; len])
        .unwrap();

    match shmem.startup().unwrap_err() {
        TransportError::KeyUnpack {
            pe: 0,
            segment: SegmentKind::Heap,
            source,
        } => assert_eq!(source.code, FabricError::INVALID_PARAM),
        other => panic!("unexpected error: {other}"),
    }
    // The endpoint and the data key unpacked before the failure are released.
    let stats = shmem.fabric().stats();
    assert_eq!(stats.endpoints, 0);
    assert_eq!(stats.rkeys, 0);

    shmem.finalize().unwrap();
}

#[test]
fn operations_before_startup_fail() {
    let network = LoopbackNetwork::new();
    let rdv = InMemoryRendezvous::group(1).remove(0);
    let heap = SymmetricHeap::new(4096, 4096).unwrap();
    let shmem: Shmem = Transport::init(no_rva(), rdv, heap.layout(), network).unwrap();

    let err = shmem
        .put(shmem.default_context(), heap.data.as_ptr(), b"x", 0)
        .unwrap_err();
    assert!(matches!(err, TransportError::NotStarted));
    shmem.finalize().unwrap();
}

// ============================================================================
// Data movement
// ============================================================================

#[test]
fn put_quiet_then_get_from_third_pe() {
    let network = LoopbackNetwork::new();
    let pattern: Vec<u8> = (0..64u8).collect();
    run_pes(3, &network, &no_rva(), |shmem, heap| {
        let ctx = shmem.default_context();
        let dest = heap.data.at(128);

        if shmem.rank() == 0 {
            unsafe { shmem.put_nbi(ctx, dest, &pattern, 1).unwrap() };
            shmem.quiet(ctx).unwrap();
        }
        fence(shmem);

        if shmem.rank() == 1 {
            assert_eq!(heap.data.read_bytes(128, 64), pattern);
        }
        if shmem.rank() == 2 {
            let mut buf = vec![0u8; 64];
            shmem.get(ctx, &mut buf, dest, 1).unwrap();
            assert_eq!(buf, pattern);
        }
    });
}

#[test]
fn heap_segment_is_addressable() {
    let network = LoopbackNetwork::new();
    run_pes(2, &network, &no_rva(), |shmem, heap| {
        let ctx = shmem.create_context(ContextOptions::PRIVATE);
        let peer = 1 - shmem.rank();
        let offset = 8 * shmem.rank();
        let dest = heap.heap.at(HEAP_TAIL + offset);

        shmem
            .put(&ctx, dest, &(shmem.rank() as u64 + 10).to_ne_bytes(), peer)
            .unwrap();
        shmem.destroy_context(ctx).unwrap();
        fence(shmem);

        let from_peer = heap.heap.read_u64(HEAP_TAIL + 8 * peer);
        assert_eq!(from_peer, peer as u64 + 10);
        assert_eq!(shmem.live_contexts(), 0);
    });
}

const HEAP_TAIL: usize = common::HEAP_LEN - 16;

#[test]
fn get_nbi_completes_on_quiet() {
    let network = LoopbackNetwork::new();
    run_pes(2, &network, &no_rva(), |shmem, heap| {
        heap.data.write_u64(0, 0x1000 + shmem.rank() as u64);
        fence(shmem);

        let ctx = shmem.default_context();
        let peer = 1 - shmem.rank();
        let mut buf = [0u8; 8];
        unsafe { shmem.get_nbi(ctx, &mut buf, heap.data.as_ptr(), peer).unwrap() };
        shmem.quiet(ctx).unwrap();
        assert_eq!(u64::from_ne_bytes(buf), 0x1000 + peer as u64);
    });
}

#[test]
fn quiet_is_idempotent() {
    let network = LoopbackNetwork::new();
    run_pes(2, &network, &no_rva(), |shmem, heap| {
        let ctx = shmem.default_context();
        let src = [7u8; 32];
        for i in 0..8 {
            unsafe { shmem.put_nbi(ctx, heap.data.at(i * 32), &src, 1 - shmem.rank()).unwrap() };
        }
        assert!(shmem.fabric().stats().outstanding > 0);

        shmem.quiet(ctx).unwrap();
        assert_eq!(shmem.fabric().stats().outstanding, 0);

        let events = shmem.fabric().stats().events;
        shmem.quiet(ctx).unwrap();
        shmem.quiet(ctx).unwrap();
        let stats = shmem.fabric().stats();
        assert_eq!(stats.events, events);
        assert_eq!(stats.outstanding, 0);
    });
}

#[test]
fn failed_flush_is_a_completion_error() {
    let network = LoopbackNetwork::new();
    run_pes(2, &network, &no_rva(), |shmem, heap| {
        let ctx = shmem.default_context();
        let peer = 1 - shmem.rank();
        let src = [3u8; 16];
        unsafe { shmem.put_nbi(ctx, heap.data.at(512), &src, peer).unwrap() };

        shmem.fabric().fail_next_flush();
        match shmem.quiet(ctx).unwrap_err() {
            TransportError::Completion { op: "flush", source } => {
                assert_eq!(source.code, FabricError::IO_ERROR)
            }
            other => panic!("unexpected error: {other}"),
        }
        // The put is still queued and the next quiet drains it.
        assert_eq!(shmem.fabric().stats().outstanding, 1);
        shmem.quiet(ctx).unwrap();
        assert_eq!(shmem.fabric().stats().outstanding, 0);
    });
}

#[test]
fn invalid_targets_are_rejected() {
    let network = LoopbackNetwork::new();
    run_pes(2, &network, &no_rva(), |shmem, heap| {
        let ctx = shmem.default_context();

        let err = shmem.put(ctx, heap.data.as_ptr(), b"x", 2).unwrap_err();
        assert!(matches!(err, TransportError::InvalidPe { pe: 2, world_size: 2 }));

        let local = [0u8; 8];
        let err = shmem.put(ctx, local.as_ptr(), b"x", 0).unwrap_err();
        assert!(matches!(err, TransportError::InvalidAddress { len: 1, .. }));

        // Straddles the end of the data segment.
        let tail = heap.data.at(heap.data.size() - 4);
        let err = shmem.put(ctx, tail, &[0u8; 8], 0).unwrap_err();
        assert!(matches!(err, TransportError::InvalidAddress { len: 8, .. }));
    });
}

#[test]
fn nostore_context_rejects_puts() {
    let network = LoopbackNetwork::new();
    run_pes(1, &network, &no_rva(), |shmem, heap| {
        let ctx = shmem.create_context(ContextOptions::NOSTORE);
        let err = shmem.put(&ctx, heap.data.as_ptr(), b"x", 0).unwrap_err();
        assert!(matches!(err, TransportError::Unsupported(_)));

        let mut buf = [0u8; 1];
        shmem.get(&ctx, &mut buf, heap.data.as_ptr(), 0).unwrap();
        assert_eq!(ctx.issued(), 1);
        shmem.destroy_context(ctx).unwrap();
    });
}

// ============================================================================
// Atomics
// ============================================================================

#[test]
fn fetch_add_from_every_pe() {
    let network = LoopbackNetwork::new();
    let n = 4;
    let rounds = 50;
    let fetched = run_pes(n, &network, &no_rva(), |shmem, heap| {
        let ctx = shmem.default_context();
        let counter = heap.data.as_ptr();
        let mut seen = Vec::with_capacity(rounds);
        for _ in 0..rounds {
            seen.push(
                shmem
                    .atomic_fetch(ctx, AtomicOp::Add, AtomicWidth::U64, counter, 1, 0)
                    .unwrap(),
            );
        }
        shmem
            .atomic_post(ctx, AtomicOp::Add, AtomicWidth::U64, counter, 1000, 0)
            .unwrap();
        shmem.quiet(ctx).unwrap();
        fence(shmem);

        if shmem.rank() == 0 {
            assert_eq!(heap.data.read_u64(0), (n * rounds + 1000 * n) as u64);
        }
        seen
    });

    // The counter only grows, so every fetched value is distinct.
    let mut all: Vec<u64> = fetched.into_iter().flatten().collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), n * rounds);
}

#[test]
fn swap_and_compare_swap() {
    let network = LoopbackNetwork::new();
    run_pes(2, &network, &no_rva(), |shmem, heap| {
        let ctx = shmem.default_context();
        let word = heap.data.at(64);
        if shmem.rank() == 1 {
            let prev = shmem
                .atomic_swap(ctx, AtomicWidth::U32, word, 0xdead_beef, 0)
                .unwrap();
            assert_eq!(prev, 0);

            let miss = shmem
                .atomic_compare_swap(ctx, AtomicWidth::U32, word, 1, 2, 0)
                .unwrap();
            assert_eq!(miss, 0xdead_beef);

            let hit = shmem
                .atomic_compare_swap(ctx, AtomicWidth::U32, word, 0xdead_beef, 7, 0)
                .unwrap();
            assert_eq!(hit, 0xdead_beef);

            let xor = shmem
                .atomic_fetch(ctx, AtomicOp::Xor, AtomicWidth::U32, word, 0b101, 0)
                .unwrap();
            assert_eq!(xor, 7);
        }
        fence(shmem);
        if shmem.rank() == 0 {
            assert_eq!(heap.data.read_u32(64), 7 ^ 0b101);
            // The neighbouring word is untouched by 32-bit atomics.
            assert_eq!(heap.data.read_u32(68), 0);
        }
    });
}

#[test]
fn misaligned_atomic_is_rejected() {
    let network = LoopbackNetwork::new();
    run_pes(1, &network, &no_rva(), |shmem, heap| {
        let err = shmem
            .atomic_fetch(
                shmem.default_context(),
                AtomicOp::And,
                AtomicWidth::U64,
                heap.data.at(4),
                0,
                0,
            )
            .unwrap_err();
        match err {
            TransportError::Operation { op: "atomic_fetch", pe: 0, source } => {
                assert_eq!(source.code, FabricError::INVALID_PARAM)
            }
            other => panic!("unexpected error: {other}"),
        }
    });
}

// ============================================================================
// Progress engine
// ============================================================================

#[test]
fn progress_thread_completes_nbi_operations() {
    let network = LoopbackNetwork::new();
    let config = TransportConfig::new().with_progress_interval(Duration::from_micros(50));
    run_pes(2, &network, &config, |shmem, heap| {
        assert_eq!(shmem.thread_mode(), ThreadMode::Multi);
        assert_eq!(shmem.progress_state(), EngineState::Running);

        let src = (shmem.rank() as u64 + 1).to_ne_bytes();
        let peer = 1 - shmem.rank();
        unsafe {
            shmem
                .put_nbi(shmem.default_context(), heap.data.at(8 * shmem.rank()), &src, peer)
                .unwrap()
        };

        // No quiet: only the background thread can run the put.
        assert!(wait_until(Duration::from_secs(5), || {
            shmem.fabric().stats().outstanding == 0
        }));
        fence(shmem);
        assert_eq!(heap.data.read_u64(8 * peer), peer as u64 + 1);
    });
}

#[test]
fn no_progress_thread_without_interval() {
    let network = LoopbackNetwork::new();
    run_pes(1, &network, &no_rva(), |shmem, _| {
        assert_eq!(shmem.progress_state(), EngineState::Stopped);
        assert_eq!(shmem.thread_mode(), ThreadMode::Single);
    });
}

// ============================================================================
// Teardown
// ============================================================================

#[test]
fn teardown_is_total_under_unmap_failure() {
    let network = LoopbackNetwork::new();
    let outcomes = run_pes_owned(3, &network, &no_rva(), |shmem, _heap| {
        fence(&shmem);
        let id = shmem.fabric().id();
        let rank = shmem.rank();
        if rank == 0 {
            shmem.fabric().fail_next_unmaps(1);
        }
        (rank, id, shmem.finalize())
    });

    let retired = network.retired();
    assert_eq!(retired.len(), 3);
    for (rank, id, result) in outcomes {
        let stats = retired
            .iter()
            .find(|(worker, _)| *worker == id)
            .map(|(_, stats)| *stats)
            .unwrap();
        assert_eq!(stats.endpoints, 0, "PE {rank} left endpoints open");
        assert_eq!(stats.rkeys, 0, "PE {rank} left keys unpacked");

        if rank == 0 {
            let TransportError::Teardown(failures) = result.unwrap_err() else {
                panic!("expected aggregated teardown failure");
            };
            assert_eq!(failures.len(), 1);
            assert!(matches!(
                failures[0],
                TransportError::Shutdown { op: "mem_unmap", .. }
            ));
            // The data unmap failed; the heap unmap still ran.
            assert_eq!(stats.registrations, 1);
        } else {
            result.unwrap();
            assert_eq!(stats.registrations, 0);
        }
    }
    assert_eq!(network.workers(), 0);
}

#[test]
fn finalize_failure_is_reported_after_cleanup() {
    let network = LoopbackNetwork::new();
    let results = run_pes_owned(1, &network, &no_rva(), |shmem, _heap| {
        shmem.fabric().fail_finalize();
        shmem.finalize()
    });
    let TransportError::Teardown(failures) = results.into_iter().next().unwrap().unwrap_err()
    else {
        panic!("expected aggregated teardown failure");
    };
    assert!(matches!(
        failures.as_slice(),
        [TransportError::Shutdown { op: "finalize", .. }]
    ));
    assert_eq!(network.workers(), 0);
    assert_eq!(network.retired()[0].1.registrations, 0);
}
