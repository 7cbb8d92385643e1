//! Error types for the transport.

use crate::segment::SegmentKind;

/// Status reported by the fabric for a failed call or a failed operation.
///
/// `code` is the native status value (UCX `ucs_status_t` for the UCX
/// backend; the loopback fabric uses the same numbering).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (status {code})")]
pub struct FabricError {
    pub code: i32,
    pub message: String,
}

impl FabricError {
    pub const NO_RESOURCE: i32 = -2;
    pub const IO_ERROR: i32 = -3;
    pub const NO_MEMORY: i32 = -4;
    pub const INVALID_PARAM: i32 = -5;
    pub const UNREACHABLE: i32 = -6;
    pub const INVALID_ADDR: i32 = -7;
    pub const UNSUPPORTED: i32 = -22;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Failure of the out-of-band key-value exchange.
#[derive(Debug, thiserror::Error)]
pub enum RendezvousError {
    /// Nothing was published under this key by that rank.
    #[error("key `{key}` not published by rank {rank}")]
    Missing { rank: usize, key: String },
    /// The stored value is not the size the reader expected.
    #[error("key `{key}` from rank {rank} holds {stored} bytes, expected {expected}")]
    LengthMismatch {
        rank: usize,
        key: String,
        stored: usize,
        expected: usize,
    },
    /// The exchanged table could not be decoded.
    #[error("malformed rendezvous table: {0}")]
    Encoding(String),
    /// The backing store itself failed.
    #[error("rendezvous backend failure: {0}")]
    Backend(String),
}

/// Transport errors.
///
/// Every variant except `Operation`, `InvalidPe` and `InvalidAddress` is
/// fatal for a collective program; see [`TransportError::raise`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Fabric context, worker, or memory-map creation failed.
    #[error("fabric initialization failed in {op}: {source}")]
    FabricInit {
        op: &'static str,
        #[source]
        source: FabricError,
    },
    /// Publishing addressing or key material failed.
    #[error("rendezvous put of `{key}` failed: {source}")]
    Publish {
        key: &'static str,
        #[source]
        source: RendezvousError,
    },
    /// Retrieving a peer's addressing or key material failed.
    #[error("rendezvous get of `{key}` from PE {pe} failed: {source}")]
    Rendezvous {
        pe: usize,
        key: &'static str,
        #[source]
        source: RendezvousError,
    },
    /// A peer's packed key is malformed or belongs to another endpoint.
    #[error("unpacking {segment} segment key from PE {pe} failed: {source}")]
    KeyUnpack {
        pe: usize,
        segment: SegmentKind,
        #[source]
        source: FabricError,
    },
    /// Endpoint creation towards a peer failed.
    #[error("endpoint creation to PE {pe} failed: {source}")]
    Endpoint {
        pe: usize,
        #[source]
        source: FabricError,
    },
    /// The fabric reported a non-OK status for an in-flight operation.
    #[error("{op} completed with error: {source}")]
    Completion {
        op: &'static str,
        #[source]
        source: FabricError,
    },
    /// The fabric rejected an operation at issue time.
    #[error("{op} to PE {pe} failed: {source}")]
    Operation {
        op: &'static str,
        pe: usize,
        #[source]
        source: FabricError,
    },
    /// Unregistering memory or destroying the worker failed during teardown.
    #[error("fabric teardown failed in {op}: {source}")]
    Shutdown {
        op: &'static str,
        #[source]
        source: FabricError,
    },
    /// Local resource exhaustion.
    #[error("allocation of {what} failed: {source}")]
    Allocation {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("PE {pe} out of range for world of size {world_size}")]
    InvalidPe { pe: usize, world_size: usize },
    /// The address range is not inside either symmetric segment.
    #[error("address {addr:#x} (+{len}) is not in a symmetric segment")]
    InvalidAddress { addr: usize, len: usize },
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Peer connections are not established yet.
    #[error("transport has not been started")]
    NotStarted,
    /// Teardown ran to the end but some steps failed.
    #[error("teardown finished with {} failure(s)", .0.len())]
    Teardown(Vec<TransportError>),
}

impl TransportError {
    /// Report the error on stderr and terminate the process.
    ///
    /// This is the abort-style global error path: a one-sided transport
    /// in a collective job has no degraded-but-live state, so the caller
    /// never sees this return. Coordinated shutdown of the other PEs is
    /// left to the job launcher.
    pub fn raise(self) -> ! {
        tracing::error!(error = %self, "fatal transport error");
        eprintln!("ERROR: {self}");
        let mut source = std::error::Error::source(&self);
        while let Some(cause) = source {
            eprintln!("  caused by: {cause}");
            source = cause.source();
        }
        std::process::abort()
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
