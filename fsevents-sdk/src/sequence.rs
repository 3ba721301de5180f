//! Pull-based consumption of an event stream.

use crate::{Backend, CreateFlags, Event, EventId, EventStream, Queue, StreamConfig};
use futures::{
    executor::block_on,
    future::{self, Either},
    pin_mut, Stream,
};
use parking_lot::Mutex;
use std::{
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Events buffered between the delivery thread and the consumer.
pub const DEFAULT_CAPACITY: usize = 1024;

/// A lazily started, cancellable sequence of events.
///
/// The underlying stream is created, scheduled and started on the first poll.
/// If any of that fails the sequence ends without yielding anything; the
/// failure is logged, not returned.
///
/// Cancelling (explicitly, through a [`CancelHandle`], or by dropping the
/// sequence) stops and invalidates the stream exactly once. Events that race
/// with cancellation are discarded.
pub struct EventSequence {
    setup: Option<Setup>,
    events: Option<mpsc::Receiver<Event>>,
    shared: Arc<Shared>,
}

struct Setup {
    paths: Vec<PathBuf>,
    config: StreamConfig,
    queue: Queue,
    backend: Backend,
    capacity: usize,
    exclusions: Vec<PathBuf>,
}

#[derive(Default)]
struct Shared {
    token: CancellationToken,
    stream: Mutex<Option<EventStream>>,
}

impl Shared {
    fn cancel(&self) {
        self.token.cancel();
        let stream = self.stream.lock().take();
        if let Some(mut stream) = stream {
            stream.stop();
            stream.invalidate();
            debug!("event sequence cancelled");
        }
    }
}

/// Cancels an [`EventSequence`] from anywhere.
#[derive(Clone)]
pub struct CancelHandle(Arc<Shared>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.token.is_cancelled()
    }
}

impl EventSequence {
    pub fn new<P: AsRef<Path>>(paths: impl IntoIterator<Item = P>) -> Self {
        Self {
            setup: Some(Setup {
                paths: paths
                    .into_iter()
                    .map(|path| path.as_ref().to_path_buf())
                    .collect(),
                config: StreamConfig::default(),
                queue: Queue::default(),
                backend: Backend::default(),
                capacity: DEFAULT_CAPACITY,
                exclusions: Vec::new(),
            }),
            events: None,
            shared: Arc::default(),
        }
    }

    fn configure(mut self, f: impl FnOnce(&mut Setup)) -> Self {
        if let Some(setup) = &mut self.setup {
            f(setup);
        }
        self
    }

    pub fn since(self, since: EventId) -> Self {
        self.configure(|setup| setup.config.since = since)
    }

    pub fn latency(self, latency: Duration) -> Self {
        self.configure(|setup| setup.config.latency = latency)
    }

    pub fn flags(self, flags: CreateFlags) -> Self {
        self.configure(|setup| setup.config.flags = flags)
    }

    pub fn config(self, config: StreamConfig) -> Self {
        self.configure(|setup| setup.config = config)
    }

    /// Queue the stream delivers on; the background global queue by default.
    pub fn queue(self, queue: Queue) -> Self {
        self.configure(|setup| setup.queue = queue)
    }

    pub fn backend(self, backend: impl Into<Backend>) -> Self {
        let backend = backend.into();
        self.configure(|setup| setup.backend = backend)
    }

    /// How many events may wait for the consumer before delivery blocks.
    pub fn capacity(self, capacity: usize) -> Self {
        self.configure(|setup| setup.capacity = capacity.max(1))
    }

    /// Subtrees to leave out, see [`EventStream::set_exclusion_paths`].
    pub fn exclude<P: AsRef<Path>>(self, paths: impl IntoIterator<Item = P>) -> Self {
        let paths: Vec<PathBuf> = paths
            .into_iter()
            .map(|path| path.as_ref().to_path_buf())
            .collect();
        self.configure(|setup| setup.exclusions = paths)
    }

    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.shared.clone())
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    fn launch(&self, setup: Setup) -> Option<mpsc::Receiver<Event>> {
        if self.shared.token.is_cancelled() {
            return None;
        }
        let (tx, rx) = mpsc::channel(setup.capacity);
        let token = self.shared.token.clone();
        let handler = move |event: Event| {
            if token.is_cancelled() {
                return;
            }
            let send = tx.send(event);
            let cancelled = token.cancelled();
            pin_mut!(send, cancelled);
            if let Either::Right(_) = block_on(future::select(send, cancelled)) {
                trace!("event discarded by a cancelled sequence");
            }
        };
        let mut stream =
            match EventStream::create_with(&setup.backend, &setup.paths, &setup.config, handler) {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("event sequence ends before it began: {err}");
                    return None;
                }
            };
        if !setup.exclusions.is_empty() && !stream.set_exclusion_paths(&setup.exclusions) {
            warn!(exclusions = ?setup.exclusions, "exclusion paths were refused");
        }
        stream.schedule(&setup.queue);
        if let Err(err) = stream.start() {
            warn!("event sequence ends before it began: {err}");
            return None;
        }

        let mut slot = self.shared.stream.lock();
        if self.shared.token.is_cancelled() {
            drop(slot);
            stream.stop();
            stream.invalidate();
            return None;
        }
        *slot = Some(stream);
        Some(rx)
    }
}

impl Stream for EventSequence {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        let this = self.get_mut();
        if let Some(setup) = this.setup.take() {
            this.events = this.launch(setup);
        }
        if this.shared.token.is_cancelled() {
            this.events = None;
        }
        match &mut this.events {
            Some(events) => events.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}

impl Drop for EventSequence {
    fn drop(&mut self) {
        self.shared.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Loopback;
    use futures::StreamExt;

    #[tokio::test]
    async fn cancelled_before_first_poll_never_creates() {
        let loopback = Loopback::new();
        let dir = tempfile::tempdir().unwrap();
        let mut events = EventSequence::new([dir.path()]).backend(&loopback);
        events.cancel_handle().cancel();
        assert!(events.next().await.is_none());
        assert_eq!(loopback.stats().created, 0);
    }

    #[tokio::test]
    async fn creation_failure_ends_the_sequence() {
        let loopback = Loopback::new();
        let dir = tempfile::tempdir().unwrap();
        let mut events = EventSequence::new([dir.path().join("missing")]).backend(&loopback);
        assert!(events.next().await.is_none());
        assert!(!events.is_cancelled());
        assert_eq!(loopback.stats().created, 0);
    }
}
