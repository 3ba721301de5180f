//! In-process stand-in for the native notification service.
//!
//! Events posted to a [`Loopback`] get a journal entry and a fresh ID, and are
//! routed to every started stream watching an ancestor of their path. Each
//! started stream has one worker thread that coalesces pending events for the
//! stream's latency and then invokes the stream's C callback with raw parallel
//! arrays, the way the real service does.

use super::{
    is_under_any, CreateRequest, Native, NativeStream, PathDecoder, RawCallback,
    MAX_EXCLUSION_PATHS,
};
use crate::{context::NativeContext, CreateFlags, EventFlags, EventId, Queue};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{
    collections::VecDeque,
    ffi::{c_char, c_void, CStr, CString, OsStr},
    mem,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    ptr, slice,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, trace, warn};

/// Records kept for replay unless configured otherwise.
pub const DEFAULT_JOURNAL_CAPACITY: usize = 65_536;

/// Marks a payload as a [`PathList`] ("loopbck" in ASCII).
const PATH_LIST_TAG: u64 = 0x006c_6f6f_7062_636b;

/// Path payload of loopback callbacks.
#[repr(C)]
pub(crate) struct PathList {
    tag: u64,
    len: usize,
    paths: *const *const c_char,
}

impl PathList {
    pub(crate) fn new(paths: &[*const c_char]) -> Self {
        Self {
            tag: PATH_LIST_TAG,
            len: paths.len(),
            paths: paths.as_ptr(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_tag(mut self, tag: u64) -> Self {
        self.tag = tag;
        self
    }
}

/// # Safety
///
/// `payload` must be null or point to memory readable as a [`PathList`]; a
/// correctly tagged list must point to `len` readable entries.
pub(crate) unsafe fn decode_path_list(payload: *mut c_void) -> Result<Vec<PathBuf>, String> {
    if payload.is_null() {
        return Err("path payload is null".to_string());
    }
    // SAFETY: readable as a PathList per the contract above.
    let list = unsafe { &*(payload as *const PathList) };
    if list.tag != PATH_LIST_TAG {
        return Err(format!("payload tag {:#x} is not a path list", list.tag));
    }
    if list.len == 0 {
        return Ok(Vec::new());
    }
    if list.paths.is_null() {
        return Err(format!("path list of {} entries has no storage", list.len));
    }
    // SAFETY: a tagged list owns `len` entries.
    let entries = unsafe { slice::from_raw_parts(list.paths, list.len) };
    entries
        .iter()
        .enumerate()
        .map(|(index, &entry)| {
            if entry.is_null() {
                return Err(format!("path list entry {index} is null"));
            }
            // SAFETY: non-null entries are NUL-terminated strings.
            let bytes = unsafe { CStr::from_ptr(entry) }.to_bytes();
            Ok(PathBuf::from(OsStr::from_bytes(bytes)))
        })
        .collect()
}

/// Snapshot of the native calls a [`Loopback`] has served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopbackStats {
    pub created: usize,
    pub started: usize,
    pub stopped: usize,
    pub invalidated: usize,
    pub released: usize,
    pub batches: usize,
}

#[derive(Default)]
struct Counters {
    created: AtomicUsize,
    started: AtomicUsize,
    stopped: AtomicUsize,
    invalidated: AtomicUsize,
    released: AtomicUsize,
    batches: AtomicUsize,
}

struct Hub {
    state: Mutex<HubState>,
    counters: Counters,
}

struct HubState {
    last_id: u64,
    journal: VecDeque<Record>,
    journal_capacity: usize,
    /// Highest ID pushed out of the journal, zero if none.
    evicted_through: u64,
    channels: Vec<Weak<Channel>>,
}

impl Hub {
    fn new(journal_capacity: usize) -> Self {
        Self {
            state: Mutex::new(HubState {
                last_id: 0,
                journal: VecDeque::new(),
                journal_capacity: journal_capacity.max(1),
                evicted_through: 0,
                channels: Vec::new(),
            }),
            counters: Counters::default(),
        }
    }
}

#[derive(Debug, Clone)]
struct Record {
    id: u64,
    path: PathBuf,
    flags: u32,
    own: bool,
}

/// An in-process notification service.
///
/// Cloning yields another handle to the same service. The journal keeps the
/// most recent [`DEFAULT_JOURNAL_CAPACITY`] events; a stream replaying from
/// before the oldest kept event first gets a `MUST_SCAN_SUB_DIRS |
/// USER_DROPPED` event for its root, as if the service had lost them.
#[derive(Clone)]
pub struct Loopback {
    hub: Arc<Hub>,
}

impl Default for Loopback {
    fn default() -> Self {
        Self::with_journal_capacity(DEFAULT_JOURNAL_CAPACITY)
    }
}

impl Loopback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal_capacity(capacity: usize) -> Self {
        Self {
            hub: Arc::new(Hub::new(capacity)),
        }
    }

    /// Posts an event caused by some other process.
    ///
    /// A path containing a NUL byte cannot exist and is not posted; the
    /// latest ID already issued is returned instead.
    pub fn post(&self, path: impl AsRef<Path>, flags: EventFlags) -> EventId {
        self.post_record(path.as_ref(), flags, false)
    }

    /// Posts an event caused by the watching process itself, subject to
    /// `IGNORE_SELF` and `MARK_SELF`.
    pub fn post_own(&self, path: impl AsRef<Path>, flags: EventFlags) -> EventId {
        self.post_record(path.as_ref(), flags, true)
    }

    pub fn stats(&self) -> LoopbackStats {
        let counters = &self.hub.counters;
        LoopbackStats {
            created: counters.created.load(Ordering::SeqCst),
            started: counters.started.load(Ordering::SeqCst),
            stopped: counters.stopped.load(Ordering::SeqCst),
            invalidated: counters.invalidated.load(Ordering::SeqCst),
            released: counters.released.load(Ordering::SeqCst),
            batches: counters.batches.load(Ordering::SeqCst),
        }
    }

    /// Streams created and not yet released.
    pub fn live_streams(&self) -> usize {
        let stats = self.stats();
        stats.created - stats.released
    }

    fn post_record(&self, path: &Path, flags: EventFlags, own: bool) -> EventId {
        let mut hub = self.hub.state.lock();
        if path.as_os_str().as_bytes().contains(&0) {
            warn!(path = %path.display(), "path with a NUL byte not posted");
            return EventId(hub.last_id);
        }
        hub.last_id += 1;
        let record = Record {
            id: hub.last_id,
            path: normalize(path),
            flags: flags.bits(),
            own,
        };
        trace!(id = record.id, path = %record.path.display(), "loopback event posted");
        hub.channels.retain(|channel| channel.strong_count() > 0);
        for channel in hub.channels.iter().filter_map(Weak::upgrade) {
            channel.offer(&record);
        }
        if hub.journal.len() == hub.journal_capacity {
            if let Some(evicted) = hub.journal.pop_front() {
                hub.evicted_through = evicted.id;
            }
        }
        hub.journal.push_back(record);
        EventId(hub.last_id)
    }
}

impl Native for Loopback {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn create(&self, request: CreateRequest<'_>) -> Result<Box<dyn NativeStream>, String> {
        let roots = request
            .paths
            .iter()
            .map(|path| {
                path.canonicalize()
                    .map_err(|err| format!("{}: {err}", path.display()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let since = request.since.raw();
        let channel = Arc::new(Channel {
            callback: request.callback,
            context: ContextPtr(request.context),
            roots,
            flags: request.flags,
            latency: request.latency,
            state: Mutex::new(ChannelState {
                cursor: since,
                latest: since,
                history_pending: !request.since.is_since_now(),
                ..Default::default()
            }),
            wake: Condvar::new(),
        });
        self.hub.state.lock().channels.push(Arc::downgrade(&channel));
        self.hub.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LoopStream {
            hub: self.hub.clone(),
            channel,
            queue: None,
            worker: None,
        }))
    }

    fn path_decoder(&self) -> PathDecoder {
        decode_path_list
    }

    fn current_event_id(&self) -> EventId {
        EventId(self.hub.state.lock().last_id)
    }
}

/// Context handed over at creation.
struct ContextPtr(NativeContext);

// SAFETY: `info` is an opaque token that is never dereferenced, only passed
// back to the callback and to `release`.
unsafe impl Send for ContextPtr {}
unsafe impl Sync for ContextPtr {}

struct Channel {
    callback: RawCallback,
    context: ContextPtr,
    roots: Vec<PathBuf>,
    flags: CreateFlags,
    latency: Duration,
    state: Mutex<ChannelState>,
    wake: Condvar,
}

#[derive(Default)]
struct ChannelState {
    running: bool,
    /// Resume point for replay; `u64::MAX` means "since now".
    cursor: u64,
    latest: u64,
    queued_max: u64,
    pending: VecDeque<Record>,
    enqueued: u64,
    delivered: u64,
    first_pending_at: Option<Instant>,
    last_delivery: Option<Instant>,
    flush: bool,
    exclusions: Vec<PathBuf>,
    history_pending: bool,
}

impl ChannelState {
    fn push(&mut self, record: Record) {
        self.queued_max = self.queued_max.max(record.id);
        self.enqueued += 1;
        self.first_pending_at.get_or_insert_with(Instant::now);
        self.pending.push_back(record);
    }
}

impl Channel {
    fn offer(&self, record: &Record) {
        let mut state = self.state.lock();
        if !state.running {
            return;
        }
        if let Some(routed) = self.route(record, &state.exclusions) {
            state.push(routed);
            self.wake.notify_all();
        }
    }

    /// The event as this stream would see it, if at all.
    fn route(&self, record: &Record, exclusions: &[PathBuf]) -> Option<Record> {
        if !is_under_any(&record.path, &self.roots) || is_under_any(&record.path, exclusions) {
            return None;
        }
        if record.own && self.flags.contains(CreateFlags::IGNORE_SELF) {
            return None;
        }
        let mut flags = EventFlags::from_raw(record.flags);
        if record.own && self.flags.contains(CreateFlags::MARK_SELF) {
            flags |= EventFlags::OWN_EVENT;
        }
        let mut path = record.path.clone();
        if !self.flags.contains(CreateFlags::FILE_EVENTS) {
            flags &= EventFlags::DIRECTORY_LEVEL;
            if !self.roots.contains(&path) {
                if let Some(parent) = path.parent() {
                    path = parent.to_path_buf();
                }
            }
        }
        Some(Record {
            id: record.id,
            path,
            flags: flags.bits(),
            own: record.own,
        })
    }

    fn due_at(&self, state: &ChannelState) -> Instant {
        let now = Instant::now();
        if self.flags.contains(CreateFlags::NO_DEFER) {
            match state.last_delivery {
                Some(last) if now.duration_since(last) < self.latency => last + self.latency,
                _ => now,
            }
        } else {
            state
                .first_pending_at
                .map_or(now, |first| first + self.latency)
        }
    }

    fn deliver(&self, batch: &[Record]) {
        // The three arrays are built from the same records so they always agree.
        let mut paths = Vec::with_capacity(batch.len());
        let mut flags = Vec::with_capacity(batch.len());
        let mut ids = Vec::with_capacity(batch.len());
        for record in batch {
            match CString::new(record.path.as_os_str().as_bytes()) {
                Ok(path) => {
                    paths.push(path);
                    flags.push(record.flags);
                    ids.push(record.id);
                }
                Err(_) => warn!(id = record.id, "undeliverable path skipped"),
            }
        }
        let pointers: Vec<*const c_char> = paths.iter().map(|path| path.as_ptr()).collect();
        let list = PathList::new(&pointers);
        (self.callback)(
            ptr::null_mut(),
            self.context.0.info,
            pointers.len(),
            &list as *const PathList as *mut c_void,
            flags.as_ptr(),
            ids.as_ptr(),
        );
    }
}

fn deliver_loop(hub: Arc<Hub>, channel: Arc<Channel>) {
    let mut state = channel.state.lock();
    while state.running {
        if state.pending.is_empty() {
            state.flush = false;
            channel.wake.wait(&mut state);
            continue;
        }
        if !state.flush {
            let due = channel.due_at(&state);
            if Instant::now() < due {
                channel.wake.wait_until(&mut state, due);
                continue;
            }
        }
        let batch: Vec<Record> = state.pending.drain(..).collect();
        state.flush = false;
        state.first_pending_at = None;
        if let Some(max) = batch.iter().map(|record| record.id).max() {
            // Updated before the callback fires.
            state.latest = max;
            state.cursor = max;
        }
        MutexGuard::unlocked(&mut state, || channel.deliver(&batch));
        hub.counters.batches.fetch_add(1, Ordering::SeqCst);
        state.last_delivery = Some(Instant::now());
        state.delivered += batch.len() as u64;
        channel.wake.notify_all();
    }
    channel.wake.notify_all();
}

struct LoopStream {
    hub: Arc<Hub>,
    channel: Arc<Channel>,
    queue: Option<Queue>,
    worker: Option<JoinHandle<()>>,
}

impl LoopStream {
    fn on_worker(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| worker.thread().id() == thread::current().id())
    }

    /// Stops delivery and waits for an in-flight batch to finish.
    fn halt(&mut self) {
        let on_worker = self.on_worker();
        let Some(worker) = self.worker.take() else {
            return;
        };
        {
            let mut state = self.channel.state.lock();
            state.running = false;
            // Dropped events will never be delivered; flush_sync must not wait for them.
            let dropped = state.pending.len() as u64;
            state.enqueued -= dropped;
            state.pending.clear();
            state.first_pending_at = None;
        }
        self.channel.wake.notify_all();
        if !on_worker {
            let _ = worker.join();
        }
    }
}

impl NativeStream for LoopStream {
    fn schedule(&mut self, queue: &Queue) {
        self.queue = Some(queue.clone());
    }

    fn unschedule(&mut self) {
        self.queue = None;
    }

    fn start(&mut self) -> bool {
        let Some(queue) = &self.queue else {
            return false;
        };
        if self.worker.is_some() {
            return true;
        }
        {
            let hub = self.hub.state.lock();
            let mut state = self.channel.state.lock();
            if state.cursor != u64::MAX {
                let cursor = state.cursor;
                if cursor < hub.evicted_through {
                    state.push(Record {
                        id: hub.evicted_through,
                        path: self.channel.roots[0].clone(),
                        flags: (EventFlags::MUST_SCAN_SUB_DIRS | EventFlags::USER_DROPPED).bits(),
                        own: false,
                    });
                }
                let replay: Vec<Record> = hub
                    .journal
                    .iter()
                    .filter(|record| record.id > cursor)
                    .filter_map(|record| self.channel.route(record, &state.exclusions))
                    .collect();
                for record in replay {
                    state.push(record);
                }
            }
            if mem::take(&mut state.history_pending) {
                state.push(Record {
                    id: hub.last_id,
                    path: self.channel.roots[0].clone(),
                    flags: EventFlags::HISTORY_DONE.bits(),
                    own: false,
                });
            }
            state.running = true;
        }
        let hub = self.hub.clone();
        let channel = self.channel.clone();
        let spawned = thread::Builder::new()
            .name(queue.label())
            .spawn(move || deliver_loop(hub, channel));
        match spawned {
            Ok(worker) => {
                self.worker = Some(worker);
                self.hub.counters.started.fetch_add(1, Ordering::SeqCst);
                debug!(queue = %queue, "loopback stream started");
                true
            }
            Err(err) => {
                debug!("loopback stream could not spawn its worker: {err}");
                self.channel.state.lock().running = false;
                false
            }
        }
    }

    fn flush_async(&mut self) -> EventId {
        let mut state = self.channel.state.lock();
        if state.running {
            state.flush = true;
            self.channel.wake.notify_all();
        }
        EventId(state.queued_max)
    }

    fn flush_sync(&mut self) {
        if self.worker.is_none() || self.on_worker() {
            return;
        }
        let mut state = self.channel.state.lock();
        let target = state.enqueued;
        state.flush = true;
        self.channel.wake.notify_all();
        while state.running && state.delivered < target {
            self.channel.wake.wait(&mut state);
        }
    }

    fn stop(&mut self) {
        if self.worker.is_some() {
            self.halt();
            self.hub.counters.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn invalidate(&mut self) {
        self.halt();
        self.queue = None;
        self.hub.counters.invalidated.fetch_add(1, Ordering::SeqCst);
    }

    fn latest_event_id(&self) -> EventId {
        EventId(self.channel.state.lock().latest)
    }

    fn paths_being_watched(&self) -> Vec<PathBuf> {
        self.channel.roots.clone()
    }

    fn set_exclusion_paths(&mut self, paths: &[PathBuf]) -> bool {
        if paths.len() > MAX_EXCLUSION_PATHS {
            return false;
        }
        self.channel.state.lock().exclusions = paths.iter().map(|path| normalize(path)).collect();
        true
    }

    fn description(&self) -> String {
        let state = self.channel.state.lock();
        format!(
            "LoopbackStream {{ paths: {:?}, flags: {}, latency: {:?}, latest: {}, queue: {}, running: {} }}",
            self.channel.roots,
            self.channel.flags,
            self.channel.latency,
            EventId(state.latest),
            self.queue.as_ref().map_or_else(|| "none".to_string(), Queue::label),
            state.running,
        )
    }
}

impl Drop for LoopStream {
    fn drop(&mut self) {
        self.halt();
        self.hub.counters.released.fetch_add(1, Ordering::SeqCst);
        let context = &self.channel.context.0;
        (context.release)(context.info);
    }
}

/// Resolves the parent directory so posted paths compare equal to canonical
/// watch roots, without following a symlink at the leaf.
fn normalize(path: &Path) -> PathBuf {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map_or_else(|_| path.to_path_buf(), |parent| parent.join(name)),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(roots: &[&str], flags: CreateFlags) -> Channel {
        extern "C" fn ignore(
            _: *mut c_void,
            _: *mut c_void,
            _: usize,
            _: *mut c_void,
            _: *const u32,
            _: *const u64,
        ) {
        }
        extern "C" fn release(_: *const c_void) {}

        Channel {
            callback: ignore,
            context: ContextPtr(NativeContext {
                info: ptr::null_mut(),
                release,
            }),
            roots: roots.iter().map(PathBuf::from).collect(),
            flags,
            latency: Duration::ZERO,
            state: Mutex::default(),
            wake: Condvar::new(),
        }
    }

    fn record(path: &str, flags: EventFlags, own: bool) -> Record {
        Record {
            id: 1,
            path: PathBuf::from(path),
            flags: flags.bits(),
            own,
        }
    }

    #[test]
    fn decodes_tagged_lists() {
        let a = CString::new("/a").unwrap();
        let b = CString::new("/b").unwrap();
        let pointers = [a.as_ptr(), b.as_ptr()];
        let mut list = PathList::new(&pointers);
        let paths = unsafe { decode_path_list(&mut list as *mut PathList as *mut c_void) }.unwrap();
        assert_eq!(paths, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(unsafe { decode_path_list(ptr::null_mut()) }.is_err());

        let a = CString::new("/a").unwrap();
        let pointers = [a.as_ptr()];
        let mut foreign = PathList::new(&pointers).with_tag(7);
        assert!(unsafe { decode_path_list(&mut foreign as *mut PathList as *mut c_void) }.is_err());

        let pointers = [a.as_ptr(), ptr::null()];
        let mut holey = PathList::new(&pointers);
        assert!(unsafe { decode_path_list(&mut holey as *mut PathList as *mut c_void) }.is_err());
    }

    #[test]
    fn file_events_keep_item_paths_and_flags() {
        let channel = channel(&["/w"], CreateFlags::FILE_EVENTS);
        let flags = EventFlags::ITEM_CREATED | EventFlags::ITEM_IS_FILE;
        let routed = channel.route(&record("/w/d/f", flags, false), &[]).unwrap();
        assert_eq!(routed.path, PathBuf::from("/w/d/f"));
        assert_eq!(routed.flags, flags.bits());
        assert!(channel.route(&record("/elsewhere/f", flags, false), &[]).is_none());
    }

    #[test]
    fn directory_level_streams_report_the_parent() {
        let channel = channel(&["/w"], CreateFlags::empty());
        let routed = channel
            .route(&record("/w/d/f", EventFlags::ITEM_MODIFIED, false), &[])
            .unwrap();
        assert_eq!(routed.path, PathBuf::from("/w/d"));
        assert_eq!(routed.flags, 0);

        let root = channel
            .route(&record("/w", EventFlags::MUST_SCAN_SUB_DIRS, false), &[])
            .unwrap();
        assert_eq!(root.path, PathBuf::from("/w"));
        assert_eq!(root.flags, EventFlags::MUST_SCAN_SUB_DIRS.bits());
    }

    #[test]
    fn exclusions_and_own_events() {
        let channel = channel(
            &["/w"],
            CreateFlags::FILE_EVENTS | CreateFlags::MARK_SELF,
        );
        let excluded = [PathBuf::from("/w/tmp")];
        assert!(channel
            .route(&record("/w/tmp/x", EventFlags::ITEM_CREATED, false), &excluded)
            .is_none());
        let own = channel
            .route(&record("/w/x", EventFlags::ITEM_CREATED, true), &excluded)
            .unwrap();
        assert!(EventFlags::from_raw(own.flags).contains(EventFlags::OWN_EVENT));

        let quiet = self::channel(&["/w"], CreateFlags::IGNORE_SELF);
        assert!(quiet
            .route(&record("/w/x", EventFlags::ITEM_CREATED, true), &[])
            .is_none());
        assert!(quiet
            .route(&record("/w/x", EventFlags::ITEM_CREATED, false), &[])
            .is_some());
    }

    #[test]
    fn deferred_latency_waits_from_the_first_pending_event() {
        let mut channel = channel(&["/w"], CreateFlags::empty());
        channel.latency = Duration::from_secs(60);
        let mut state = ChannelState::default();
        state.push(record("/w/a", EventFlags::empty(), false));
        assert!(channel.due_at(&state) > Instant::now() + Duration::from_secs(30));

        channel.flags = CreateFlags::NO_DEFER;
        assert!(channel.due_at(&state) <= Instant::now());
        state.last_delivery = Some(Instant::now());
        assert!(channel.due_at(&state) > Instant::now() + Duration::from_secs(30));
    }
}
