//! The C-ABI callback every native stream is created with.
//!
//! It turns one raw batch into ordered [`Event`]s for the stream's handler.
//! Batches that break the callback contract are dropped whole and reported to
//! the illogical-error sink. Nothing unwinds out of this function.

use crate::{
    context,
    illogical::{IllogicalError, IllogicalErrorCode},
    Event,
};
use std::{
    ffi::c_void,
    panic::{self, AssertUnwindSafe},
    slice,
};
use tracing::{error, trace};

pub(crate) extern "C" fn stream_callback(
    _stream: *mut c_void,
    info: *mut c_void,
    num_events: usize,
    event_paths: *mut c_void,
    event_flags: *const u32,
    event_ids: *const u64,
) {
    let delivered = panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: the pointers come straight from the native layer.
        unsafe { deliver(info, num_events, event_paths, event_flags, event_ids) }
    }));
    if delivered.is_err() {
        error!("event handler panicked; the rest of the batch was dropped");
    }
}

/// # Safety
///
/// `event_flags` and `event_ids` must be null or point to `num_events`
/// readable values, and `event_paths` must satisfy the decoder of the stream
/// `info` resolves to.
unsafe fn deliver(
    info: *mut c_void,
    num_events: usize,
    event_paths: *mut c_void,
    event_flags: *const u32,
    event_ids: *const u64,
) {
    let Some(context) = context::resolve(info) else {
        IllogicalError::with_message(
            IllogicalErrorCode::MissingContext,
            format!("no live stream for context {info:p}"),
        )
        .report();
        return;
    };
    // SAFETY: decoder contract forwarded from the caller.
    let paths = match unsafe { (context.decode_paths)(event_paths) } {
        Ok(paths) => paths,
        Err(reason) => {
            IllogicalError::with_message(IllogicalErrorCode::UnexpectedPayloadShape, reason)
                .report();
            return;
        }
    };
    if num_events == 0 && paths.is_empty() {
        return;
    }
    if paths.len() != num_events {
        IllogicalError::with_message(
            IllogicalErrorCode::MismatchedBatchCounts,
            format!(
                "event count is {num_events}, but path count is {}",
                paths.len()
            ),
        )
        .report();
        return;
    }
    if event_flags.is_null() || event_ids.is_null() {
        IllogicalError::with_message(
            IllogicalErrorCode::UnexpectedPayloadShape,
            format!("{num_events} events without flag or ID arrays"),
        )
        .report();
        return;
    }
    // SAFETY: non-null and `num_events` long per the contract above.
    let (flags, ids) = unsafe {
        (
            slice::from_raw_parts(event_flags, num_events),
            slice::from_raw_parts(event_ids, num_events),
        )
    };
    trace!(num_events, "delivering batch");
    for ((path, &flag), &id) in paths.into_iter().zip(flags).zip(ids) {
        (context.handler)(Event::from_raw(path, flag, id));
    }
}
