//! Correlation between the opaque `info` pointer handed to the native layer and
//! the stream state the callback needs.
//!
//! The pointer never points at anything: it carries a non-zero token that is
//! looked up here on every callback. A token is never reused, so a stale or
//! forged pointer resolves to nothing instead of to freed memory.

use crate::{sys::PathDecoder, Event};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    ffi::c_void,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tracing::trace;

pub(crate) type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;

/// What a callback needs once its context resolves.
pub(crate) struct StreamContext {
    pub(crate) handler: EventHandler,
    pub(crate) decode_paths: PathDecoder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ContextToken(usize);

/// Context as handed to the native layer at creation.
///
/// The native layer must call `release(info)` exactly once, when it frees the
/// stream.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NativeContext {
    pub(crate) info: *mut c_void,
    pub(crate) release: extern "C" fn(info: *const c_void),
}

static CONTEXTS: Lazy<RwLock<HashMap<ContextToken, Arc<StreamContext>>>> =
    Lazy::new(Default::default);
static NEXT_TOKEN: AtomicUsize = AtomicUsize::new(1);

impl ContextToken {
    pub(crate) fn from_info(info: *const c_void) -> Option<Self> {
        (!info.is_null()).then_some(Self(info as usize))
    }

    pub(crate) fn native(self) -> NativeContext {
        NativeContext {
            info: self.0 as *mut c_void,
            release: release_context,
        }
    }
}

pub(crate) fn register(context: StreamContext) -> ContextToken {
    let token = ContextToken(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed));
    CONTEXTS.write().insert(token, Arc::new(context));
    trace!(?token, "registered stream context");
    token
}

/// Resolves a callback's `info` pointer. The returned `Arc` keeps the context
/// alive for the whole batch even if the stream is torn down meanwhile.
pub(crate) fn resolve(info: *const c_void) -> Option<Arc<StreamContext>> {
    let token = ContextToken::from_info(info)?;
    CONTEXTS.read().get(&token).cloned()
}

/// Removes a context. Forgetting an unknown token is a no-op.
pub(crate) fn forget(token: ContextToken) {
    if CONTEXTS.write().remove(&token).is_some() {
        trace!(?token, "released stream context");
    }
}

pub(crate) extern "C" fn release_context(info: *const c_void) {
    if let Some(token) = ContextToken::from_info(info) {
        forget(token);
    }
}

#[cfg(test)]
pub(crate) fn is_registered(token: ContextToken) -> bool {
    CONTEXTS.read().contains_key(&token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{path::PathBuf, ptr};

    unsafe fn no_paths(_: *mut c_void) -> Result<Vec<PathBuf>, String> {
        Ok(Vec::new())
    }

    fn context() -> StreamContext {
        StreamContext {
            handler: Arc::new(|_| {}),
            decode_paths: no_paths,
        }
    }

    #[test]
    fn tokens_resolve_until_released() {
        let token = register(context());
        let native = token.native();
        assert!(resolve(native.info).is_some());

        (native.release)(native.info);
        assert!(resolve(native.info).is_none());
        // Second release is harmless.
        (native.release)(native.info);
        forget(token);
        assert!(!is_registered(token));
    }

    #[test]
    fn null_and_unknown_pointers_do_not_resolve() {
        assert!(resolve(ptr::null()).is_none());
        assert!(resolve(usize::MAX as *const c_void).is_none());
    }

    #[test]
    fn tokens_are_unique() {
        let a = register(context());
        let b = register(context());
        assert_ne!(a, b);
        forget(a);
        forget(b);
    }
}
