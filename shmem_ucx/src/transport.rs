//! The transport: one owning structure for the fabric worker, the
//! registered segments, the peer table, the progress engine and the
//! default context.
//!
//! Lifecycle:
//!
//! ```text
//! init ──▶ (rendezvous fence) ──▶ startup ──▶ operations / quiet ──▶ finalize
//! ```
//!
//! `init` opens the fabric, registers both segments and publishes the
//! worker address and keys. `startup` connects to every PE and starts the
//! progress engine when a non-zero interval is configured. `finalize`
//! tears everything down best-effort and reports every failure.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::config::TransportConfig;
use crate::context::{ContextOptions, Team, TransportContext};
use crate::error::{FabricError, Result, TransportError};
use crate::fabric::{Fabric, FabricProvider, ThreadMode, WorkerParams, complete_op};
use crate::peer::{PeerRecord, PeerTable};
use crate::progress::{EngineState, ProgressEngine};
use crate::rendezvous::Rendezvous;
use crate::segment::{self, SegmentLayout, Segments};

pub struct Transport<F: Fabric, R: Rendezvous> {
    config: TransportConfig,
    fabric: Arc<F>,
    rdv: R,
    rank: usize,
    world_size: usize,
    thread_mode: ThreadMode,
    rva: bool,
    segments: Segments<F::MemHandle>,
    pub(crate) peers: Option<PeerTable<F>>,
    engine: Option<ProgressEngine>,
    world: Arc<Team>,
    default_ctx: TransportContext,
    next_ctx: AtomicU64,
    live_contexts: AtomicUsize,
}

impl<F: Fabric, R: Rendezvous> Transport<F, R> {
    /// Open the fabric, register the segments in `layout` and publish this
    /// PE's address and keys.
    ///
    /// Peers are not connected yet; run a rendezvous fence on every PE and
    /// then [`Transport::startup`].
    pub fn init<P>(
        config: TransportConfig,
        rdv: R,
        layout: SegmentLayout,
        provider: P,
    ) -> Result<Self>
    where
        P: FabricProvider<Fabric = F>,
    {
        let rank = rdv.rank();
        let world_size = rdv.size();
        let thread_mode = config.thread_mode();

        let fabric = provider
            .open(&WorkerParams { thread_mode })
            .map_err(|source| TransportError::FabricInit {
                op: "worker_create",
                source,
            })?;
        let rva = fabric.capabilities().remote_virtual_addressing && config.remote_virtual_addressing;

        segment::publish_address(&fabric, &rdv)?;
        let segments = segment::register_segments(&fabric, &rdv, &layout, rva)?;

        tracing::info!(rank, world_size, ?thread_mode, rva, "transport initialized");

        let world = Arc::new(Team::world(world_size));
        Ok(Self {
            config,
            fabric: Arc::new(fabric),
            rdv,
            rank,
            world_size,
            thread_mode,
            rva,
            segments,
            peers: None,
            engine: None,
            default_ctx: TransportContext::new(0, ContextOptions::empty(), world.clone()),
            world,
            next_ctx: AtomicU64::new(1),
            live_contexts: AtomicUsize::new(0),
        })
    }

    /// Connect to every PE and start the progress engine if configured.
    ///
    /// Every PE must have finished [`Transport::init`] and the rendezvous
    /// store must make their puts visible before this runs.
    pub fn startup(&mut self) -> Result<()> {
        if self.peers.is_some() {
            return Err(TransportError::Unsupported("startup called twice"));
        }

        let peers = PeerTable::connect_all(&*self.fabric, &self.rdv, self.world_size, self.rva)?;
        self.peers = Some(peers);

        if !self.config.progress_interval.is_zero() {
            let engine = ProgressEngine::start(
                self.fabric.clone(),
                self.config.progress_interval,
                self.config.progress_cpu,
            )?;
            self.engine = Some(engine);
        }
        Ok(())
    }

    /// `init`, a rendezvous fence, then `startup`. Collective: every PE in
    /// the rendezvous group must call it.
    pub fn bootstrap<P>(
        config: TransportConfig,
        rdv: R,
        layout: SegmentLayout,
        provider: P,
    ) -> Result<Self>
    where
        P: FabricProvider<Fabric = F>,
    {
        let mut transport = Self::init(config, rdv, layout, provider)?;
        transport
            .rdv
            .fence()
            .map_err(|source| TransportError::Rendezvous {
                pe: transport.rank,
                key: "fence",
                source,
            })?;
        transport.startup()?;
        Ok(transport)
    }

    // ========================================================================
    // Contexts
    // ========================================================================

    pub fn default_context(&self) -> &TransportContext {
        &self.default_ctx
    }

    /// Create a context scoped to the world team.
    pub fn create_context(&self, options: ContextOptions) -> TransportContext {
        let id = self.next_ctx.fetch_add(1, Ordering::Relaxed);
        self.live_contexts.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(ctx = id, ?options, "context created");
        TransportContext::new(id, options, self.world.clone())
    }

    /// Quiet `ctx`, then release it.
    pub fn destroy_context(&self, ctx: TransportContext) -> Result<()> {
        self.quiet(&ctx)?;
        self.live_contexts.fetch_sub(1, Ordering::Relaxed);
        tracing::debug!(ctx = ctx.id(), issued = ctx.issued(), "context destroyed");
        Ok(())
    }

    /// Contexts created and not yet destroyed, excluding the default one.
    pub fn live_contexts(&self) -> usize {
        self.live_contexts.load(Ordering::Relaxed)
    }

    /// Block until every operation issued on `ctx` has completed.
    ///
    /// All contexts share the worker, so this drains the worker: a superset
    /// of `ctx`'s operations. Progress is driven on the calling thread.
    ///
    /// A failed flush means an operation issued earlier failed; it is
    /// reported as [`TransportError::Completion`].
    pub fn quiet(&self, ctx: &TransportContext) -> Result<()> {
        let submitted = self
            .fabric
            .flush()
            .map_err(|source| TransportError::Completion { op: "flush", source })?;
        complete_op(&*self.fabric, submitted);
        tracing::trace!(ctx = ctx.id(), "quiet");
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn fabric(&self) -> &F {
        &self.fabric
    }

    pub fn rendezvous(&self) -> &R {
        &self.rdv
    }

    pub fn thread_mode(&self) -> ThreadMode {
        self.thread_mode
    }

    /// Whether remote addresses are raw symmetric addresses. Decided once
    /// at init from the fabric capability and the configuration.
    pub fn remote_virtual_addressing(&self) -> bool {
        self.rva
    }

    pub fn segments(&self) -> &Segments<F::MemHandle> {
        &self.segments
    }

    pub fn is_started(&self) -> bool {
        self.peers.is_some()
    }

    pub fn peer(&self, pe: usize) -> Option<&PeerRecord<F>> {
        self.peers.as_ref()?.get(pe)
    }

    pub fn progress_state(&self) -> EngineState {
        self.engine
            .as_ref()
            .map_or(EngineState::Stopped, ProgressEngine::state)
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Tear down in order: progress engine, default-context quiet, peers,
    /// segments, fabric. Every step runs even if an earlier one failed;
    /// failures are returned together.
    pub fn finalize(self) -> Result<()> {
        let Transport {
            fabric,
            rank,
            segments,
            peers,
            engine,
            live_contexts,
            ..
        } = self;
        let mut failures = Vec::new();

        if let Some(mut engine) = engine {
            engine.stop();
        }

        let leaked = live_contexts.load(Ordering::Relaxed);
        if leaked > 0 {
            tracing::warn!(contexts = leaked, "finalizing with undestroyed contexts");
        }

        match fabric.flush() {
            Ok(submitted) => complete_op(&*fabric, submitted),
            Err(source) => {
                tracing::error!(error = %source, "quiet before teardown failed");
                failures.push(TransportError::Completion { op: "flush", source });
            }
        }

        if let Some(peers) = peers {
            failures.extend(peers.close_all(&fabric));
        }

        for segment in [segments.data, segments.heap] {
            let kind = segment.kind();
            if let Err(source) = fabric.mem_unmap(segment.into_handle()) {
                tracing::error!(segment = %kind, error = %source, "unmap failed");
                failures.push(TransportError::Shutdown {
                    op: "mem_unmap",
                    source,
                });
            }
        }

        match Arc::try_unwrap(fabric) {
            Ok(fabric) => {
                if let Err(source) = fabric.finalize() {
                    tracing::error!(error = %source, "fabric finalize failed");
                    failures.push(TransportError::Shutdown {
                        op: "finalize",
                        source,
                    });
                }
            }
            Err(_) => {
                failures.push(TransportError::Shutdown {
                    op: "finalize",
                    source: FabricError::new(FabricError::NO_RESOURCE, "fabric still referenced"),
                });
            }
        }

        if failures.is_empty() {
            tracing::info!(rank, "transport finalized");
            Ok(())
        } else {
            tracing::warn!(rank, failures = failures.len(), "transport finalized with failures");
            Err(TransportError::Teardown(failures))
        }
    }
}
