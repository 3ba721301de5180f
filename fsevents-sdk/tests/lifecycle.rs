use fsevents_sdk::{
    Backend, CreateFlags, Error, Event, EventFlags, EventId, EventStream, Loopback, Queue,
    StreamConfig, StreamState,
};
use parking_lot::Mutex;
use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc},
    thread,
    time::Duration,
};

struct Recorder(Arc<Mutex<Vec<Event>>>);

impl Recorder {
    fn new() -> Self {
        Self(Arc::default())
    }

    fn handler(&self) -> impl Fn(Event) + Send + Sync + 'static {
        let events = self.0.clone();
        move |event| events.lock().push(event)
    }

    fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.0.lock())
    }
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap()
}

fn file_events() -> StreamConfig {
    StreamConfig::default().with_flags(CreateFlags::FILE_EVENTS)
}

fn started(
    loopback: &Loopback,
    dir: &Path,
    config: &StreamConfig,
    recorder: &Recorder,
) -> EventStream {
    let mut stream =
        EventStream::create_with(&loopback.into(), [dir], config, recorder.handler()).unwrap();
    stream.schedule(&Queue::serial("lifecycle"));
    stream.start().unwrap();
    stream
}

#[test]
fn creation_fails_for_missing_paths() {
    let dir = tempfile::tempdir().unwrap();
    let loopback = Loopback::new();
    let err = EventStream::create_with(
        &loopback.clone().into(),
        [dir.path().join("nope")],
        &StreamConfig::default(),
        |_| {},
    )
    .unwrap_err();
    assert!(matches!(err, Error::CannotCreateStream { .. }));
    assert_eq!(loopback.stats().created, 0);
}

#[cfg(not(target_os = "macos"))]
#[test]
fn system_backend_is_unavailable_off_macos() {
    let dir = tempfile::tempdir().unwrap();
    let err = EventStream::create_with(
        &Backend::system(),
        [dir.path()],
        &StreamConfig::default(),
        |_| {},
    )
    .unwrap_err();
    assert!(matches!(err, Error::CannotCreateStream { .. }));
}

#[test]
fn events_arrive_in_posting_order() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical(dir.path());
    let loopback = Loopback::new();
    let recorder = Recorder::new();
    let mut stream = started(&loopback, dir.path(), &file_events(), &recorder);

    let created = EventFlags::ITEM_CREATED | EventFlags::ITEM_IS_FILE;
    let a = loopback.post(root.join("a"), created);
    let b = loopback.post(root.join("b"), EventFlags::ITEM_REMOVED);
    let c = loopback.post(root.join("a"), EventFlags::ITEM_MODIFIED);
    stream.flush_sync();

    assert_eq!(
        recorder.take(),
        vec![
            Event::new(root.join("a"), created, a),
            Event::new(root.join("b"), EventFlags::ITEM_REMOVED, b),
            Event::new(root.join("a"), EventFlags::ITEM_MODIFIED, c),
        ]
    );
    assert_eq!(stream.latest_event_id(), c);
    assert_eq!(stream.watched_paths(), vec![root]);
}

#[test]
fn events_outside_the_watched_roots_are_not_delivered() {
    let watched = tempfile::tempdir().unwrap();
    let other = tempfile::tempdir().unwrap();
    let loopback = Loopback::new();
    let recorder = Recorder::new();
    let mut stream = started(&loopback, watched.path(), &file_events(), &recorder);

    loopback.post(canonical(other.path()).join("x"), EventFlags::ITEM_CREATED);
    stream.flush_sync();
    assert!(recorder.take().is_empty());
}

#[test]
fn directory_level_streams_report_containing_directories() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical(dir.path());
    std::fs::create_dir(root.join("sub")).unwrap();
    let loopback = Loopback::new();
    let recorder = Recorder::new();
    let mut stream = started(&loopback, dir.path(), &StreamConfig::default(), &recorder);

    loopback.post(
        root.join("sub").join("f"),
        EventFlags::ITEM_CREATED | EventFlags::ITEM_IS_FILE,
    );
    stream.flush_sync();
    let events = recorder.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].path, root.join("sub"));
    assert!(events[0].flags.is_empty());
}

#[test]
fn flush_async_reports_the_highest_queued_id() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical(dir.path());
    let loopback = Loopback::new();
    let recorder = Recorder::new();
    let config = file_events().with_latency(Duration::from_secs(3600));
    let mut stream = started(&loopback, dir.path(), &config, &recorder);

    assert_eq!(stream.flush_async(), EventId(0));
    loopback.post(root.join("a"), EventFlags::ITEM_CREATED);
    let last = loopback.post(root.join("b"), EventFlags::ITEM_CREATED);
    assert_eq!(stream.flush_async(), last);

    // The hour-long latency is skipped by flushing.
    stream.flush_sync();
    assert_eq!(recorder.take().len(), 2);
}

#[test]
fn latency_coalesces_events_into_one_batch() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical(dir.path());
    let loopback = Loopback::new();
    let recorder = Recorder::new();
    let config = file_events().with_latency(Duration::from_millis(200));
    let _stream = started(&loopback, dir.path(), &config, &recorder);

    for name in ["a", "b", "c"] {
        loopback.post(root.join(name), EventFlags::ITEM_CREATED);
    }
    assert!(recorder.take().is_empty());
    thread::sleep(Duration::from_millis(800));
    assert_eq!(recorder.take().len(), 3);
    assert_eq!(loopback.stats().batches, 1);
}

#[test]
fn flush_sync_after_restart_does_not_wait_for_discarded_events() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical(dir.path());
    let loopback = Loopback::new();
    let recorder = Recorder::new();
    let config = file_events().with_latency(Duration::from_secs(3600));
    let mut stream = started(&loopback, dir.path(), &config, &recorder);

    // Still waiting out its latency when the stream stops, so it is discarded.
    loopback.post(root.join("a"), EventFlags::ITEM_CREATED);
    stream.stop();
    stream.start().unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    let flusher = thread::spawn(move || {
        stream.flush_sync();
        let _ = done_tx.send(());
        stream
    });
    assert!(done_rx.recv_timeout(Duration::from_secs(3)).is_ok());
    flusher.join().unwrap().invalidate();
    assert!(recorder.take().is_empty());
}

#[test]
fn restart_resumes_after_the_last_delivered_event() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical(dir.path());
    let loopback = Loopback::new();
    let recorder = Recorder::new();
    let mut stream = started(&loopback, dir.path(), &file_events(), &recorder);

    let a = loopback.post(root.join("a"), EventFlags::ITEM_CREATED);
    stream.flush_sync();
    stream.stop();
    assert_eq!(stream.state(), StreamState::Stopped);

    let b = loopback.post(root.join("b"), EventFlags::ITEM_CREATED);
    stream.flush_sync();
    let ids: Vec<EventId> = recorder.take().iter().map(|event| event.id).collect();
    assert_eq!(ids, vec![a]);

    stream.start().unwrap();
    stream.flush_sync();
    let ids: Vec<EventId> = recorder.take().iter().map(|event| event.id).collect();
    assert_eq!(ids, vec![b]);
}

#[test]
fn history_is_replayed_and_terminated() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical(dir.path());
    let loopback = Loopback::new();
    let a = loopback.post(root.join("a"), EventFlags::ITEM_CREATED);
    let b = loopback.post(root.join("b"), EventFlags::ITEM_CREATED);

    let recorder = Recorder::new();
    let config = file_events().with_since(a);
    let mut stream = started(&loopback, dir.path(), &config, &recorder);
    assert_eq!(stream.latest_event_id(), a);
    stream.flush_sync();

    let events = recorder.take();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].id, b);
    assert!(events[1].flags.contains(EventFlags::HISTORY_DONE));
    assert!(!events[1].should_rescan());
}

#[test]
fn exclusion_paths_are_limited_and_applied() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical(dir.path());
    let loopback = Loopback::new();
    let recorder = Recorder::new();
    let mut stream = EventStream::create_with(
        &(&loopback).into(),
        [dir.path()],
        &file_events(),
        recorder.handler(),
    )
    .unwrap();

    let nine: Vec<PathBuf> = (0..9).map(|i| root.join(i.to_string())).collect();
    assert!(!stream.set_exclusion_paths(&nine));
    assert!(stream.set_exclusion_paths(&[root.join("build")]));

    stream.schedule(&Queue::background());
    stream.start().unwrap();
    assert!(!stream.set_exclusion_paths(&[root.join("tmp")]));

    loopback.post(root.join("build").join("out.o"), EventFlags::ITEM_CREATED);
    let kept = loopback.post(root.join("src.c"), EventFlags::ITEM_MODIFIED);
    stream.flush_sync();
    let ids: Vec<EventId> = recorder.take().iter().map(|event| event.id).collect();
    assert_eq!(ids, vec![kept]);
}

#[test]
fn own_events_follow_the_self_flags() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical(dir.path());
    let loopback = Loopback::new();

    let ignoring = Recorder::new();
    let mut quiet = started(
        &loopback,
        dir.path(),
        &file_events().with_flags(CreateFlags::FILE_EVENTS | CreateFlags::IGNORE_SELF),
        &ignoring,
    );
    let marking = Recorder::new();
    let mut marked = started(
        &loopback,
        dir.path(),
        &file_events().with_flags(CreateFlags::FILE_EVENTS | CreateFlags::MARK_SELF),
        &marking,
    );

    loopback.post_own(root.join("mine"), EventFlags::ITEM_CREATED);
    quiet.flush_sync();
    marked.flush_sync();

    assert!(ignoring.take().is_empty());
    let events = marking.take();
    assert_eq!(events.len(), 1);
    assert!(events[0].flags.contains(EventFlags::OWN_EVENT));
}

#[test]
fn native_release_happens_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let loopback = Loopback::new();
    let recorder = Recorder::new();

    let stream = started(&loopback, dir.path(), &file_events(), &recorder);
    stream.invalidate();
    let stats = loopback.stats();
    assert_eq!(
        (stats.stopped, stats.invalidated, stats.released),
        (1, 1, 1)
    );

    // Dropping without invalidating tears down the same way.
    drop(started(&loopback, dir.path(), &file_events(), &recorder));
    let stats = loopback.stats();
    assert_eq!(
        (stats.stopped, stats.invalidated, stats.released),
        (2, 2, 2)
    );

    // Never scheduled: released, not invalidated.
    drop(
        EventStream::create_with(&(&loopback).into(), [dir.path()], &file_events(), |_| {})
            .unwrap(),
    );
    let stats = loopback.stats();
    assert_eq!((stats.invalidated, stats.released), (2, 3));
    assert_eq!(loopback.live_streams(), 0);
}

#[test]
fn streams_on_different_queues_deliver_independently() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical(dir.path());
    let loopback = Loopback::new();
    let backend: Backend = (&loopback).into();
    let recorders = [Recorder::new(), Recorder::new()];
    let mut streams: Vec<EventStream> = recorders
        .iter()
        .enumerate()
        .map(|(i, recorder)| {
            let mut stream =
                EventStream::create_with(&backend, [dir.path()], &file_events(), recorder.handler())
                    .unwrap();
            stream.schedule(&Queue::serial(format!("queue-{i}")));
            stream.start().unwrap();
            stream
        })
        .collect();

    let id = loopback.post(root.join("shared"), EventFlags::ITEM_CREATED);
    for stream in &mut streams {
        stream.flush_sync();
    }
    for recorder in &recorders {
        let ids: Vec<EventId> = recorder.take().iter().map(|event| event.id).collect();
        assert_eq!(ids, vec![id]);
    }
}

#[test]
fn description_comes_from_the_backend() {
    let dir = tempfile::tempdir().unwrap();
    let loopback = Loopback::new();
    let stream =
        EventStream::create_with(&(&loopback).into(), [dir.path()], &file_events(), |_| {})
            .unwrap();
    assert!(stream.description().starts_with("LoopbackStream"));
    assert!(format!("{stream:?}").contains("Created"));
}

#[test]
fn paths_with_nul_bytes_are_not_posted() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical(dir.path());
    let loopback = Loopback::new();
    let recorder = Recorder::new();
    let config = file_events().with_latency(Duration::from_secs(3600));
    let mut stream = started(&loopback, dir.path(), &config, &recorder);

    let good = loopback.post(root.join("good"), EventFlags::ITEM_CREATED);
    let bad = loopback.post(root.join("bad\0name"), EventFlags::ITEM_CREATED);
    assert_eq!(bad, good);
    assert_eq!(Backend::from(&loopback).current_event_id(), good);
    stream.flush_sync();

    let events = recorder.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].path, root.join("good"));
}

#[test]
fn replay_past_the_journal_starts_with_a_rescan() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical(dir.path());
    let loopback = Loopback::with_journal_capacity(2);
    let a = loopback.post(root.join("a"), EventFlags::ITEM_CREATED);
    let b = loopback.post(root.join("b"), EventFlags::ITEM_CREATED);
    let c = loopback.post(root.join("c"), EventFlags::ITEM_CREATED);

    let recorder = Recorder::new();
    let config = file_events().with_since(EventId::BEGINNING);
    let mut stream = started(&loopback, dir.path(), &config, &recorder);
    stream.flush_sync();

    let events = recorder.take();
    let ids: Vec<EventId> = events.iter().map(|event| event.id).collect();
    assert_eq!(ids, vec![a, b, c, c]);
    assert_eq!(events[0].path, root);
    assert!(events[0].should_rescan());
    assert!(events[0].flags.contains(EventFlags::USER_DROPPED));
    assert!(events[3].flags.contains(EventFlags::HISTORY_DONE));
}
