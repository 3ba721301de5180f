//! The native notification service, behind a pair of traits.
//!
//! `Native` creates streams; `NativeStream` owns one native stream resource and
//! exposes its raw lifecycle calls one-to-one. Dropping a `NativeStream` is the
//! native release and must invoke the context's `release` callback exactly once.

pub(crate) mod loopback;
#[cfg(target_os = "macos")]
mod macos;

pub use loopback::{Loopback, LoopbackStats, DEFAULT_JOURNAL_CAPACITY};
#[cfg(target_os = "macos")]
pub use macos::FsEvents;

use crate::{context::NativeContext, CreateFlags, EventId, Queue};
use std::{
    ffi::c_void,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

/// The service refuses more exclusion paths than this.
pub const MAX_EXCLUSION_PATHS: usize = 8;

/// C-ABI callback invoked once per delivered batch: stream, context info, event
/// count, path payload, flag array, ID array.
pub(crate) type RawCallback = extern "C" fn(
    stream: *mut c_void,
    info: *mut c_void,
    num_events: usize,
    event_paths: *mut c_void,
    event_flags: *const u32,
    event_ids: *const u64,
);

/// Converts a backend's path payload into paths.
///
/// # Safety
///
/// `payload` must be null or the payload pointer the backend passed to the
/// callback, still valid for the duration of the call.
pub(crate) type PathDecoder = unsafe fn(payload: *mut c_void) -> Result<Vec<PathBuf>, String>;

pub(crate) struct CreateRequest<'a> {
    pub(crate) paths: &'a [PathBuf],
    pub(crate) since: EventId,
    pub(crate) latency: Duration,
    pub(crate) flags: CreateFlags,
    pub(crate) callback: RawCallback,
    pub(crate) context: NativeContext,
}

pub(crate) trait Native: Send + Sync {
    fn name(&self) -> &'static str;

    /// Allocates one native stream, or explains why the service refused.
    fn create(&self, request: CreateRequest<'_>) -> Result<Box<dyn NativeStream>, String>;

    /// The payload contract of callbacks from streams this backend created.
    fn path_decoder(&self) -> PathDecoder;

    fn current_event_id(&self) -> EventId;
}

pub(crate) trait NativeStream: Send {
    fn schedule(&mut self, queue: &Queue);
    fn unschedule(&mut self);
    fn start(&mut self) -> bool;
    fn flush_async(&mut self) -> EventId;
    fn flush_sync(&mut self);
    fn stop(&mut self);
    fn invalidate(&mut self);
    fn latest_event_id(&self) -> EventId;
    fn paths_being_watched(&self) -> Vec<PathBuf>;
    fn set_exclusion_paths(&mut self, paths: &[PathBuf]) -> bool;
    fn description(&self) -> String;
}

/// Selects the notification service streams are created on.
#[derive(Clone)]
pub struct Backend(Arc<dyn Native>);

impl Backend {
    /// The platform's own service: FSEvents on macOS. Elsewhere every stream
    /// creation fails.
    pub fn system() -> Self {
        #[cfg(target_os = "macos")]
        {
            Self(Arc::new(FsEvents))
        }
        #[cfg(not(target_os = "macos"))]
        {
            Self(Arc::new(Unsupported))
        }
    }

    pub fn name(&self) -> &'static str {
        self.0.name()
    }

    /// The most recent event ID the service has issued system-wide.
    pub fn current_event_id(&self) -> EventId {
        self.0.current_event_id()
    }

    pub(crate) fn native(&self) -> &dyn Native {
        &*self.0
    }
}

impl Default for Backend {
    fn default() -> Self {
        Self::system()
    }
}

impl From<Loopback> for Backend {
    fn from(loopback: Loopback) -> Self {
        Self(Arc::new(loopback))
    }
}

impl From<&Loopback> for Backend {
    fn from(loopback: &Loopback) -> Self {
        loopback.clone().into()
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Backend").field(&self.name()).finish()
    }
}

/// Placeholder for targets without a native service.
#[cfg_attr(target_os = "macos", allow(dead_code))]
struct Unsupported;

impl Native for Unsupported {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn create(&self, _request: CreateRequest<'_>) -> Result<Box<dyn NativeStream>, String> {
        Err("no file system event service on this platform".to_string())
    }

    fn path_decoder(&self) -> PathDecoder {
        refuse_payload
    }

    fn current_event_id(&self) -> EventId {
        EventId::BEGINNING
    }
}

unsafe fn refuse_payload(_payload: *mut c_void) -> Result<Vec<PathBuf>, String> {
    Err("no stream can deliver on this platform".to_string())
}

/// Whether `path` lies under one of `roots` (a root counts as under itself).
pub(crate) fn is_under_any(path: &Path, roots: &[PathBuf]) -> bool {
    roots.iter().any(|root| path.starts_with(root))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_backend_is_named() {
        let backend = Backend::default();
        #[cfg(target_os = "macos")]
        assert_eq!(backend.name(), "fsevents");
        #[cfg(not(target_os = "macos"))]
        assert_eq!(backend.name(), "unsupported");
        assert_eq!(format!("{backend:?}"), format!("Backend({:?})", backend.name()));
    }

    #[test]
    fn prefix_matching_is_per_component() {
        let roots = [PathBuf::from("/a/b")];
        assert!(is_under_any(Path::new("/a/b"), &roots));
        assert!(is_under_any(Path::new("/a/b/c"), &roots));
        assert!(!is_under_any(Path::new("/a/bc"), &roots));
    }
}
