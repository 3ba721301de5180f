use bitflags::bitflags;
use std::fmt;

/// Asks the native layer for CF-typed callback payloads. Set internally by the
/// FSEvents backend; never part of the public vocabulary.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub(crate) const USE_CF_TYPES: u32 = 0x0000_0001;

bitflags! {
    /// Options fixed at stream creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    #[cfg_attr(feature = "serde", serde(transparent))]
    pub struct CreateFlags: u32 {
        /// Deliver the first event after a quiet period immediately, then
        /// coalesce for `latency`. Without it, every group waits `latency`.
        const NO_DEFER = 0x0000_0002;
        /// Report `ROOT_CHANGED` when a watched root or one of its ancestors moves.
        const WATCH_ROOT = 0x0000_0004;
        /// Drop events caused by the watching process.
        const IGNORE_SELF = 0x0000_0008;
        /// File-level events instead of directory-level ones.
        const FILE_EVENTS = 0x0000_0010;
        /// Tag events caused by the watching process with `OWN_EVENT`.
        const MARK_SELF = 0x0000_0020;
    }
}

impl Default for CreateFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for CreateFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::event_flag::render(self))
    }
}
