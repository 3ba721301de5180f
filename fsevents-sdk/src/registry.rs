use crate::{Backend, Event, EventStream, Queue, Result, StreamConfig};
use parking_lot::Mutex;
use std::{collections::HashMap, hash::Hash, path::Path};
use tracing::debug;

/// Running streams addressed by a caller-chosen key.
pub struct Watchers<K> {
    backend: Backend,
    queue: Queue,
    streams: Mutex<HashMap<K, EventStream>>,
}

impl<K: Eq + Hash> Watchers<K> {
    /// Streams on the system service, delivering on the background queue.
    pub fn new() -> Self {
        Self::with_backend(Backend::default(), Queue::default())
    }

    pub fn with_backend(backend: Backend, queue: Queue) -> Self {
        Self {
            backend,
            queue,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Creates, schedules and starts a stream under `key`. A stream already
    /// registered under `key` is torn down and replaced.
    pub fn start_watching<P, F>(
        &self,
        paths: impl IntoIterator<Item = P>,
        key: K,
        config: &StreamConfig,
        handler: F,
    ) -> Result<()>
    where
        P: AsRef<Path>,
        F: Fn(Event) + Send + Sync + 'static,
    {
        let mut stream = EventStream::create_with(&self.backend, paths, config, handler)?;
        stream.schedule(&self.queue);
        stream.start()?;
        let replaced = self.streams.lock().insert(key, stream);
        if let Some(replaced) = replaced {
            debug!("replacing an existing watch");
            replaced.invalidate();
        }
        Ok(())
    }

    /// Tears down the stream under `key`. Returns whether there was one.
    pub fn stop_watching(&self, key: &K) -> bool {
        let stream = self.streams.lock().remove(key);
        match stream {
            Some(stream) => {
                stream.invalidate();
                true
            }
            None => false,
        }
    }

    pub fn is_watching(&self, key: &K) -> bool {
        self.streams.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.lock().is_empty()
    }
}

impl<K: Eq + Hash> Default for Watchers<K> {
    fn default() -> Self {
        Self::new()
    }
}
