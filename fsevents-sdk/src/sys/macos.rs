//! FSEvents, scheduled on libdispatch queues.

use super::{CreateRequest, Native, NativeStream, PathDecoder};
use crate::{create_flag::USE_CF_TYPES, CreateFlags, EventFlags, EventId, QosClass, Queue};
use core_foundation::{
    array::{CFArray, CFArrayGetCount, CFArrayGetTypeID, CFArrayGetValueAtIndex, CFArrayRef},
    base::{CFGetTypeID, CFIndex, TCFType},
    string::{CFString, CFStringGetTypeID, CFStringRef},
};
use fsevent_sys::{
    FSEventStreamContext, FSEventStreamCreate, FSEventStreamFlushAsync, FSEventStreamFlushSync,
    FSEventStreamGetLatestEventId, FSEventStreamInvalidate, FSEventStreamRef,
    FSEventStreamRelease, FSEventStreamStart, FSEventStreamStop, FSEventsGetCurrentEventId,
};
use std::{
    ffi::{c_char, c_void, CString},
    path::PathBuf,
    ptr,
};
use tracing::warn;

type DispatchQueueRef = *mut c_void;

const QOS_CLASS_USER_INTERACTIVE: isize = 0x21;
const QOS_CLASS_USER_INITIATED: isize = 0x19;
const QOS_CLASS_DEFAULT: isize = 0x15;
const QOS_CLASS_UTILITY: isize = 0x11;
const QOS_CLASS_BACKGROUND: isize = 0x09;

#[link(name = "CoreServices", kind = "framework")]
extern "C" {
    fn FSEventStreamSetDispatchQueue(stream: FSEventStreamRef, queue: DispatchQueueRef);
    fn FSEventStreamSetExclusionPaths(stream: FSEventStreamRef, paths: CFArrayRef) -> u8;
    fn FSEventStreamCopyDescription(stream: FSEventStreamRef) -> CFStringRef;
    fn FSEventStreamCopyPathsBeingWatched(stream: FSEventStreamRef) -> CFArrayRef;
}

extern "C" {
    fn dispatch_get_global_queue(identifier: isize, flags: usize) -> DispatchQueueRef;
    fn dispatch_queue_create(label: *const c_char, attr: *mut c_void) -> DispatchQueueRef;
    fn dispatch_release(object: DispatchQueueRef);
}

// Our public bit values are the service's own.
const _: () = {
    assert!(USE_CF_TYPES == fsevent_sys::kFSEventStreamCreateFlagUseCFTypes);
    assert!(CreateFlags::NO_DEFER.bits() == fsevent_sys::kFSEventStreamCreateFlagNoDefer);
    assert!(CreateFlags::WATCH_ROOT.bits() == fsevent_sys::kFSEventStreamCreateFlagWatchRoot);
    assert!(CreateFlags::IGNORE_SELF.bits() == fsevent_sys::kFSEventStreamCreateFlagIgnoreSelf);
    assert!(CreateFlags::FILE_EVENTS.bits() == fsevent_sys::kFSEventStreamCreateFlagFileEvents);
    assert!(
        EventFlags::MUST_SCAN_SUB_DIRS.bits()
            == fsevent_sys::kFSEventStreamEventFlagMustScanSubDirs
    );
    assert!(EventFlags::HISTORY_DONE.bits() == fsevent_sys::kFSEventStreamEventFlagHistoryDone);
    assert!(EventFlags::ITEM_CREATED.bits() == fsevent_sys::kFSEventStreamEventFlagItemCreated);
    assert!(EventFlags::ITEM_IS_DIR.bits() == fsevent_sys::kFSEventStreamEventFlagItemIsDir);
    assert!(EventFlags::OWN_EVENT.bits() == fsevent_sys::kFSEventStreamEventFlagOwnEvent);
};

/// The system FSEvents service.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsEvents;

impl Native for FsEvents {
    fn name(&self) -> &'static str {
        "fsevents"
    }

    fn create(&self, request: CreateRequest<'_>) -> Result<Box<dyn NativeStream>, String> {
        let paths = request
            .paths
            .iter()
            .map(|path| {
                path.to_str()
                    .map(CFString::new)
                    .ok_or_else(|| format!("{} is not valid UTF-8", path.display()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let paths = CFArray::from_CFTypes(&paths);
        let context = FSEventStreamContext {
            version: 0,
            info: request.context.info,
            retain: None,
            release: Some(request.context.release),
            copy_description: None,
        };
        // SAFETY: the context is copied by the service, the path array is
        // retained for the lifetime of the stream.
        let raw = unsafe {
            FSEventStreamCreate(
                ptr::null_mut(),
                request.callback,
                &context,
                paths.as_concrete_TypeRef() as _,
                request.since.raw(),
                request.latency.as_secs_f64(),
                request.flags.bits() | USE_CF_TYPES,
            )
        };
        if raw.is_null() {
            return Err("FSEventStreamCreate returned null".to_string());
        }
        Ok(Box::new(FsEventsStream { raw, queue: None }))
    }

    fn path_decoder(&self) -> PathDecoder {
        decode_cf_paths
    }

    fn current_event_id(&self) -> EventId {
        // SAFETY: no preconditions.
        EventId(unsafe { FSEventsGetCurrentEventId() })
    }
}

/// # Safety
///
/// `payload` must be null or a valid CF object reference.
unsafe fn decode_cf_paths(payload: *mut c_void) -> Result<Vec<PathBuf>, String> {
    if payload.is_null() {
        return Err("path payload is null".to_string());
    }
    // SAFETY: a valid CF object per the contract above.
    let array = unsafe {
        if CFGetTypeID(payload as _) != CFArrayGetTypeID() {
            return Err("path payload is not a CFArray".to_string());
        }
        payload as CFArrayRef
    };
    // SAFETY: `array` is a CFArray for the duration of the callback.
    let count: CFIndex = unsafe { CFArrayGetCount(array) };
    (0..count)
        .map(|index| {
            // SAFETY: index is in bounds; items are CF objects.
            let item = unsafe { CFArrayGetValueAtIndex(array, index) };
            if item.is_null() || unsafe { CFGetTypeID(item) } != unsafe { CFStringGetTypeID() } {
                return Err(format!("path payload entry {index} is not a CFString"));
            }
            // SAFETY: checked to be a CFString; the array keeps it alive.
            let path = unsafe { CFString::wrap_under_get_rule(item as CFStringRef) };
            Ok(PathBuf::from(path.to_string()))
        })
        .collect()
}

struct DispatchQueue {
    raw: DispatchQueueRef,
    owned: bool,
}

impl DispatchQueue {
    fn new(queue: &Queue) -> Option<Self> {
        let (raw, owned) = match queue {
            Queue::Global(qos) => {
                let identifier = match qos {
                    QosClass::UserInteractive => QOS_CLASS_USER_INTERACTIVE,
                    QosClass::UserInitiated => QOS_CLASS_USER_INITIATED,
                    QosClass::Default => QOS_CLASS_DEFAULT,
                    QosClass::Utility => QOS_CLASS_UTILITY,
                    QosClass::Background => QOS_CLASS_BACKGROUND,
                };
                // SAFETY: global queues always exist.
                (unsafe { dispatch_get_global_queue(identifier, 0) }, false)
            }
            Queue::Serial(label) => {
                let label = CString::new(label.as_str()).ok()?;
                // SAFETY: a null attribute requests a serial queue.
                (unsafe { dispatch_queue_create(label.as_ptr(), ptr::null_mut()) }, true)
            }
        };
        (!raw.is_null()).then_some(Self { raw, owned })
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        if self.owned {
            // SAFETY: created by us, released once.
            unsafe { dispatch_release(self.raw) }
        }
    }
}

struct FsEventsStream {
    raw: FSEventStreamRef,
    queue: Option<DispatchQueue>,
}

// SAFETY: FSEvents stream calls may come from any thread as long as they are
// not concurrent, which `&mut self` guarantees.
unsafe impl Send for FsEventsStream {}

impl NativeStream for FsEventsStream {
    fn schedule(&mut self, queue: &Queue) {
        let Some(queue) = DispatchQueue::new(queue) else {
            warn!(%queue, "could not obtain dispatch queue");
            return;
        };
        // SAFETY: live stream and queue.
        unsafe { FSEventStreamSetDispatchQueue(self.raw, queue.raw) };
        self.queue = Some(queue);
    }

    fn unschedule(&mut self) {
        if self.queue.is_some() {
            // SAFETY: a null queue unschedules.
            unsafe { FSEventStreamSetDispatchQueue(self.raw, ptr::null_mut()) };
            self.queue = None;
        }
    }

    fn start(&mut self) -> bool {
        self.queue.is_some() && unsafe { FSEventStreamStart(self.raw) } != 0
    }

    fn flush_async(&mut self) -> EventId {
        EventId(unsafe { FSEventStreamFlushAsync(self.raw) })
    }

    fn flush_sync(&mut self) {
        unsafe { FSEventStreamFlushSync(self.raw) }
    }

    fn stop(&mut self) {
        unsafe { FSEventStreamStop(self.raw) }
    }

    fn invalidate(&mut self) {
        unsafe { FSEventStreamInvalidate(self.raw) };
        self.queue = None;
    }

    fn latest_event_id(&self) -> EventId {
        EventId(unsafe { FSEventStreamGetLatestEventId(self.raw) })
    }

    fn paths_being_watched(&self) -> Vec<PathBuf> {
        // SAFETY: copy rule, so we own the returned array.
        let paths: CFArray<CFString> =
            unsafe { CFArray::wrap_under_create_rule(FSEventStreamCopyPathsBeingWatched(self.raw)) };
        paths
            .iter()
            .map(|path| PathBuf::from(path.to_string()))
            .collect()
    }

    fn set_exclusion_paths(&mut self, paths: &[PathBuf]) -> bool {
        let Some(paths) = paths
            .iter()
            .map(|path| path.to_str().map(CFString::new))
            .collect::<Option<Vec<_>>>()
        else {
            return false;
        };
        let paths = CFArray::from_CFTypes(&paths);
        unsafe { FSEventStreamSetExclusionPaths(self.raw, paths.as_concrete_TypeRef()) != 0 }
    }

    fn description(&self) -> String {
        // SAFETY: copy rule.
        unsafe { CFString::wrap_under_create_rule(FSEventStreamCopyDescription(self.raw)) }
            .to_string()
    }
}

impl Drop for FsEventsStream {
    fn drop(&mut self) {
        // SAFETY: released exactly once; the service calls our context release.
        unsafe { FSEventStreamRelease(self.raw) };
        self.queue = None;
    }
}
