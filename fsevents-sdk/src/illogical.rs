//! Process-wide sink for bridging defects.
//!
//! These conditions mean the wrapper and the native layer disagree about the
//! callback contract. They are never returned to callers and never unwind
//! across the native callback: the offending batch is dropped, the stream keeps
//! running, and the report goes to the handler installed here.
//!
//! The sink is initialized lazily with [`default_handler`] and can be replaced at
//! any time from any thread. The lock is held only while reading or swapping the
//! handler, never while it runs.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::{fmt, sync::Arc};
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IllogicalErrorCode {
    /// The callback context did not resolve to a live stream.
    MissingContext,
    /// The path payload did not have the type the stream asked for.
    UnexpectedPayloadShape,
    /// The path count disagreed with the event count of the batch.
    MismatchedBatchCounts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllogicalError {
    pub code: IllogicalErrorCode,
    pub message: Option<String>,
}

pub type IllogicalErrorHandler = Arc<dyn Fn(&IllogicalError) + Send + Sync>;

static HANDLER: Lazy<Mutex<IllogicalErrorHandler>> =
    Lazy::new(|| Mutex::new(Arc::new(default_handler)));

impl IllogicalError {
    pub fn new(code: IllogicalErrorCode) -> Self {
        Self {
            code,
            message: None,
        }
    }

    pub fn with_message(code: IllogicalErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    /// Hands the report to the installed handler.
    pub(crate) fn report(self) {
        let handler = handler();
        handler(&self);
    }
}

impl fmt::Display for IllogicalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{:?}: {message}", self.code),
            None => write!(f, "{:?}", self.code),
        }
    }
}

/// The currently installed handler.
pub fn handler() -> IllogicalErrorHandler {
    HANDLER.lock().clone()
}

/// Installs `handler` and returns the previous one.
pub fn set_handler(handler: IllogicalErrorHandler) -> IllogicalErrorHandler {
    std::mem::replace(&mut *HANDLER.lock(), handler)
}

/// Logs the report. Debug builds abort afterwards, since reaching this means
/// the bridge itself is broken.
pub fn default_handler(err: &IllogicalError) {
    error!(code = ?err.code, "illogical event stream error: {err}");
    if cfg!(debug_assertions) {
        std::process::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn handler_can_be_swapped_and_restored() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let previous = set_handler(Arc::new(move |err: &IllogicalError| {
            sink.lock().push(err.clone());
        }));

        IllogicalError::with_message(IllogicalErrorCode::MismatchedBatchCounts, "3 != 2").report();
        IllogicalError::new(IllogicalErrorCode::MissingContext).report();

        set_handler(previous);
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].code, IllogicalErrorCode::MismatchedBatchCounts);
        assert_eq!(seen[0].to_string(), "MismatchedBatchCounts: 3 != 2");
        assert_eq!(seen[1].message, None);
    }

    #[test]
    #[serial]
    fn handler_may_replace_itself_while_running() {
        let previous = set_handler(Arc::new(|_: &IllogicalError| {
            set_handler(Arc::new(|_: &IllogicalError| {}));
        }));
        IllogicalError::new(IllogicalErrorCode::UnexpectedPayloadShape).report();
        set_handler(previous);
    }
}
