use crate::{
    bridge::stream_callback,
    context::{self, ContextToken, StreamContext},
    error::{Error, Result},
    sys::{Backend, CreateRequest, NativeStream, MAX_EXCLUSION_PATHS},
    Event, EventId, Queue, StreamConfig,
};
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, warn};

/// Where a stream is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Allocated, not bound to a queue.
    Created,
    /// Bound to a queue, not delivering.
    Scheduled,
    /// Delivering.
    Started,
    /// No longer delivering; still scheduled and can be started again.
    Stopped,
}

/// Exclusive owner of one native event stream.
///
/// The handler runs on whatever thread the native layer delivers on, one
/// batch at a time, in delivery order.
///
/// Teardown happens exactly once: either through [`EventStream::invalidate`],
/// or when the handle is dropped. Both stop the stream if it is running,
/// invalidate it if it was ever scheduled, and release the native resource.
pub struct EventStream {
    native: Option<Box<dyn NativeStream>>,
    token: ContextToken,
    state: StreamState,
    backend: &'static str,
}

impl EventStream {
    /// Creates a stream on the system service.
    pub fn create<P, F>(
        paths: impl IntoIterator<Item = P>,
        config: &StreamConfig,
        handler: F,
    ) -> Result<Self>
    where
        P: AsRef<Path>,
        F: Fn(Event) + Send + Sync + 'static,
    {
        Self::create_with(&Backend::default(), paths, config, handler)
    }

    pub fn create_with<P, F>(
        backend: &Backend,
        paths: impl IntoIterator<Item = P>,
        config: &StreamConfig,
        handler: F,
    ) -> Result<Self>
    where
        P: AsRef<Path>,
        F: Fn(Event) + Send + Sync + 'static,
    {
        let paths: Vec<PathBuf> = paths
            .into_iter()
            .map(|path| path.as_ref().to_path_buf())
            .collect();
        if paths.is_empty() {
            return Err(Error::create("no paths to watch"));
        }
        for path in &paths {
            if let Err(err) = path.symlink_metadata() {
                return Err(Error::create(format!("{}: {err}", path.display())));
            }
        }

        let native = backend.native();
        let token = context::register(StreamContext {
            handler: Arc::new(handler),
            decode_paths: native.path_decoder(),
        });
        let request = CreateRequest {
            paths: &paths,
            since: config.since,
            latency: config.latency,
            flags: config.flags,
            callback: stream_callback,
            context: token.native(),
        };
        match native.create(request) {
            Ok(stream) => {
                debug!(
                    backend = native.name(),
                    ?paths,
                    since = %config.since,
                    flags = %config.flags,
                    "event stream created"
                );
                Ok(Self {
                    native: Some(stream),
                    token,
                    state: StreamState::Created,
                    backend: native.name(),
                })
            }
            Err(reason) => {
                context::forget(token);
                Err(Error::create(reason))
            }
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Binds the stream to the queue its callbacks run on. Ignored while the
    /// stream is started.
    pub fn schedule(&mut self, queue: &Queue) {
        if self.state == StreamState::Started {
            warn!(%queue, "cannot reschedule a started event stream");
            return;
        }
        if let Some(native) = &mut self.native {
            native.schedule(queue);
            if self.state == StreamState::Created {
                self.state = StreamState::Scheduled;
            }
            debug!(%queue, "event stream scheduled");
        }
    }

    /// Detaches the stream from its queue. Ignored while the stream is started.
    pub fn unschedule(&mut self) {
        if self.state == StreamState::Started {
            warn!("cannot unschedule a started event stream");
            return;
        }
        if let Some(native) = &mut self.native {
            native.unschedule();
            self.state = StreamState::Created;
        }
    }

    /// Starts delivery, from the creation cursor the first time and from the
    /// last delivered event after a [`stop`](Self::stop).
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            StreamState::Started => return Ok(()),
            StreamState::Created => return Err(Error::start("stream is not scheduled")),
            StreamState::Scheduled | StreamState::Stopped => {}
        }
        let native = self
            .native
            .as_mut()
            .ok_or_else(|| Error::start("stream is invalidated"))?;
        if !native.start() {
            return Err(Error::start("the native layer refused to start"));
        }
        self.state = StreamState::Started;
        debug!("event stream started");
        Ok(())
    }

    /// Asks for buffered events to be delivered now, without waiting. Returns
    /// the highest ID ever queued for this stream, zero if none.
    pub fn flush_async(&mut self) -> EventId {
        self.native
            .as_mut()
            .map_or(EventId::BEGINNING, |native| native.flush_async())
    }

    /// Blocks until every event pending at call time has been handed to the
    /// handler. Returns at once when called from the handler itself.
    pub fn flush_sync(&mut self) {
        if let Some(native) = &mut self.native {
            native.flush_sync();
        }
    }

    pub fn stop(&mut self) {
        if self.state != StreamState::Started {
            return;
        }
        if let Some(native) = &mut self.native {
            native.stop();
            self.state = StreamState::Stopped;
            debug!("event stream stopped");
        }
    }

    /// Stops, unschedules and releases the stream.
    pub fn invalidate(mut self) {
        self.teardown();
    }

    /// ID of the last event handed to the handler, or the creation cursor if
    /// nothing was delivered yet.
    pub fn latest_event_id(&self) -> EventId {
        self.native
            .as_ref()
            .map_or(EventId::SINCE_NOW, |native| native.latest_event_id())
    }

    /// The watched paths as the native layer resolved them.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.native
            .as_ref()
            .map(|native| native.paths_being_watched())
            .unwrap_or_default()
    }

    /// Excludes subtrees from delivery. Must be called before the stream is
    /// started; at most [`MAX_EXCLUSION_PATHS`] entries are accepted.
    pub fn set_exclusion_paths<P: AsRef<Path>>(&mut self, paths: &[P]) -> bool {
        if paths.len() > MAX_EXCLUSION_PATHS {
            warn!(
                count = paths.len(),
                "at most {MAX_EXCLUSION_PATHS} exclusion paths are supported"
            );
            return false;
        }
        if matches!(self.state, StreamState::Started | StreamState::Stopped) {
            warn!("exclusion paths must be set before the stream starts");
            return false;
        }
        let paths: Vec<PathBuf> = paths.iter().map(|p| p.as_ref().to_path_buf()).collect();
        self.native
            .as_mut()
            .is_some_and(|native| native.set_exclusion_paths(&paths))
    }

    /// The native layer's own description, for debugging only.
    pub fn description(&self) -> String {
        self.native
            .as_ref()
            .map_or_else(|| "invalidated".to_string(), |native| native.description())
    }

    fn teardown(&mut self) {
        let Some(mut native) = self.native.take() else {
            return;
        };
        if self.state == StreamState::Started {
            native.stop();
        }
        if self.state != StreamState::Created {
            native.invalidate();
        }
        drop(native);
        context::forget(self.token);
        debug!(backend = self.backend, "event stream released");
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("backend", &self.backend)
            .field("state", &self.state)
            .field("description", &self.description())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sys::Loopback, EventFlags};
    use std::sync::mpsc;

    fn watch(loopback: &Loopback, dir: &Path) -> (EventStream, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        let tx = parking_lot::Mutex::new(tx);
        let stream = EventStream::create_with(
            &loopback.into(),
            [dir],
            &StreamConfig::default().with_flags(crate::CreateFlags::FILE_EVENTS),
            move |event| {
                let _ = tx.lock().send(event);
            },
        )
        .unwrap();
        (stream, rx)
    }

    #[test]
    fn start_requires_a_queue() {
        let loopback = Loopback::new();
        let dir = tempfile::tempdir().unwrap();
        let (mut stream, _rx) = watch(&loopback, dir.path());
        assert!(matches!(
            stream.start(),
            Err(Error::CannotStartStream { .. })
        ));
        assert_eq!(stream.state(), StreamState::Created);

        stream.schedule(&Queue::serial("test"));
        stream.start().unwrap();
        assert_eq!(stream.state(), StreamState::Started);
        // Rescheduling a running stream is ignored.
        stream.schedule(&Queue::background());
        assert_eq!(stream.state(), StreamState::Started);
    }

    #[test]
    fn token_is_forgotten_on_teardown() {
        let loopback = Loopback::new();
        let dir = tempfile::tempdir().unwrap();
        let (mut stream, rx) = watch(&loopback, dir.path());
        let token = stream.token;
        stream.schedule(&Queue::background());
        stream.start().unwrap();
        loopback.post(dir.path().join("f"), EventFlags::ITEM_CREATED);
        stream.flush_sync();
        assert_eq!(rx.try_iter().count(), 1);

        assert!(context::is_registered(token));
        stream.invalidate();
        assert!(!context::is_registered(token));
    }

    #[test]
    fn creation_needs_existing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let err = EventStream::create_with(
            &Loopback::new().into(),
            [&missing],
            &StreamConfig::default(),
            |_| {},
        )
        .unwrap_err();
        assert!(matches!(err, Error::CannotCreateStream { .. }));

        let empty: [&Path; 0] = [];
        let err = EventStream::create_with(
            &Loopback::new().into(),
            empty,
            &StreamConfig::default(),
            |_| {},
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "cannot create event stream: no paths to watch");
    }
}
