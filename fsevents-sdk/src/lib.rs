//! Typed, memory-safe event streams over the FSEvents file system
//! notification service.
//!
//! An [`EventStream`] owns one native stream and hands every delivered
//! notification to a handler as an [`Event`]. [`EventSequence`] wraps the same
//! lifecycle into a cancellable `futures::Stream`, and [`Watchers`] keeps
//! running streams under caller-chosen keys.
//!
//! Streams are created on a [`Backend`]: the system service by default, or an
//! in-process [`Loopback`] that behaves like it and runs everywhere.
#![deny(unsafe_op_in_unsafe_fn)]

mod bridge;
mod config;
mod context;
mod create_flag;
mod error;
mod event;
mod event_flag;
mod event_id;
mod event_stream;
pub mod illogical;
mod queue;
mod registry;
mod sequence;
mod sys;

pub use config::StreamConfig;
pub use create_flag::CreateFlags;
pub use error::{Error, Result};
pub use event::Event;
pub use event_flag::{EventFlags, ScanType};
pub use event_id::EventId;
pub use event_stream::{EventStream, StreamState};
pub use illogical::{IllogicalError, IllogicalErrorCode};
pub use queue::{QosClass, Queue};
pub use registry::Watchers;
pub use sequence::{CancelHandle, EventSequence, DEFAULT_CAPACITY};
#[cfg(target_os = "macos")]
pub use sys::FsEvents;
pub use sys::{
    Backend, Loopback, LoopbackStats, DEFAULT_JOURNAL_CAPACITY, MAX_EXCLUSION_PATHS,
};
