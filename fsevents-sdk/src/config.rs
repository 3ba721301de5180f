use crate::{CreateFlags, EventId};
use std::time::Duration;

/// Creation parameters shared by [`EventStream`](crate::EventStream),
/// [`EventSequence`](crate::EventSequence) and [`Watchers`](crate::Watchers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Where to start: [`EventId::SINCE_NOW`] for live events only, or a
    /// previously observed ID to replay history from.
    pub since: EventId,
    /// How long the service coalesces events before delivering a batch.
    pub latency: Duration,
    pub flags: CreateFlags,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            since: EventId::SINCE_NOW,
            latency: Duration::ZERO,
            flags: CreateFlags::empty(),
        }
    }
}

impl StreamConfig {
    pub fn with_since(mut self, since: EventId) -> Self {
        self.since = since;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_flags(mut self, flags: CreateFlags) -> Self {
        self.flags = flags;
        self
    }
}
