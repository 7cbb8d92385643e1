//! Communication contexts: ordering and completion scopes for one-sided
//! operations.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Context creation options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ContextOptions: u32 {
        /// Operations on the context are issued by one thread at a time.
        const SERIALIZED = 1 << 0;

        /// Only the creating thread uses the context.
        const PRIVATE = 1 << 1;

        /// No store operations (put, non-fetching atomics) will be issued.
        const NOSTORE = 1 << 2;
    }
}

/// Process group a context is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Team {
    name: String,
    size: usize,
}

impl Team {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    pub fn world(size: usize) -> Self {
        Self::new("world", size)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Handle for a stream of one-sided operations.
///
/// Must be quieted before it is destroyed; `Transport::destroy_context`
/// does so itself.
#[derive(Debug)]
pub struct TransportContext {
    id: u64,
    options: ContextOptions,
    team: Arc<Team>,
    issued: AtomicU64,
}

impl TransportContext {
    pub(crate) fn new(id: u64, options: ContextOptions, team: Arc<Team>) -> Self {
        Self {
            id,
            options,
            team,
            issued: AtomicU64::new(0),
        }
    }

    /// 0 for the default context.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_default(&self) -> bool {
        self.id == 0
    }

    pub fn options(&self) -> ContextOptions {
        self.options
    }

    pub fn team(&self) -> &Team {
        &self.team
    }

    /// Operations issued on this context so far.
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    pub(crate) fn record_issue(&self) {
        self.issued.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_context_shape() {
        let ctx = TransportContext::new(0, ContextOptions::empty(), Arc::new(Team::world(4)));
        assert!(ctx.is_default());
        assert_eq!(ctx.team().name(), "world");
        assert_eq!(ctx.team().size(), 4);
        ctx.record_issue();
        ctx.record_issue();
        assert_eq!(ctx.issued(), 2);
    }

    #[test]
    fn options_combine() {
        let opts = ContextOptions::PRIVATE | ContextOptions::NOSTORE;
        assert!(opts.contains(ContextOptions::NOSTORE));
        assert!(!opts.contains(ContextOptions::SERIALIZED));
        assert_eq!(ContextOptions::default(), ContextOptions::empty());
    }
}
