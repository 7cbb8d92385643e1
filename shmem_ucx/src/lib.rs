//! One-sided RMA/AMO transport for an OpenSHMEM-style library.
//!
//! The transport registers two symmetric segments (static `data` and
//! dynamic `heap`) with a fabric, exchanges worker addresses and remote
//! keys through a rendezvous store, connects to every PE, and issues
//! put/get/atomic operations whose completion is tracked through a
//! callback handshake. An optional background thread drives fabric
//! progress.
//!
//! # Example
//!
//! ```no_run
//! use shmem_ucx::{InMemoryRendezvous, LoopbackNetwork, Rendezvous, Transport, TransportConfig};
//! use shmem_ucx::test_utils::SymmetricHeap;
//!
//! let network = LoopbackNetwork::new();
//! let handles: Vec<_> = InMemoryRendezvous::group(2)
//!     .into_iter()
//!     .map(|rdv| {
//!         let network = network.clone();
//!         std::thread::spawn(move || {
//!             let heap = SymmetricHeap::new(4096, 4096)?;
//!             let shmem = Transport::bootstrap(TransportConfig::new(), rdv, heap.layout(), network)?;
//!             let ctx = shmem.default_context();
//!             let peer = (shmem.rank() + 1) % shmem.world_size();
//!             shmem.put(ctx, heap.data.as_ptr(), b"hello", peer)?;
//!             shmem.quiet(ctx)?;
//!             shmem.rendezvous().fence().ok();
//!             shmem.finalize()
//!         })
//!     })
//!     .collect();
//! for h in handles {
//!     h.join().unwrap()?;
//! }
//! # Ok::<(), shmem_ucx::TransportError>(())
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod fabric;
pub mod loopback;
mod ops;
pub mod peer;
pub mod progress;
pub mod rendezvous;
pub mod request;
pub mod segment;
pub mod test_utils;
pub mod transport;
#[cfg_attr(not(feature = "ucx"), allow(dead_code))]
mod ucs;
#[cfg(feature = "ucx")]
pub mod ucx;

pub use config::{ThreadLevel, TransportConfig};
pub use context::{ContextOptions, Team, TransportContext};
pub use error::{FabricError, RendezvousError, Result, TransportError};
pub use fabric::{AtomicOp, AtomicWidth, Fabric, FabricProvider, ThreadMode};
pub use loopback::{LoopbackFabric, LoopbackNetwork, LoopbackStats};
pub use progress::EngineState;
pub use rendezvous::{InMemoryRendezvous, Rendezvous};
#[cfg(feature = "mpi")]
pub use rendezvous::MpiRendezvous;
pub use segment::{SegmentKind, SegmentLayout};
pub use transport::Transport;
#[cfg(feature = "ucx")]
pub use ucx::{UcxFabric, UcxProvider};
