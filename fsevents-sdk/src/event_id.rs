use std::fmt;

/// Monotonically increasing 64-bit event identifier assigned by the native
/// service.
///
/// IDs can wrap (signalled by [`EventFlags::EVENT_IDS_WRAPPED`]); after a wrap,
/// previously observed IDs must not be used as a resume cursor.
///
/// [`EventFlags::EVENT_IDS_WRAPPED`]: crate::EventFlags::EVENT_IDS_WRAPPED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct EventId(pub u64);

impl EventId {
    /// Only future events, no historical replay.
    pub const SINCE_NOW: Self = Self(u64::MAX);
    /// Replay everything the service still has on record.
    pub const BEGINNING: Self = Self(0);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_since_now(self) -> bool {
        self.0 == Self::SINCE_NOW.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::SINCE_NOW
    }
}

impl From<u64> for EventId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<EventId> for u64 {
    fn from(id: EventId) -> Self {
        id.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_since_now() {
            f.write_str("now")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels() {
        assert_eq!(EventId::default(), EventId::SINCE_NOW);
        assert!(EventId::BEGINNING < EventId::new(1));
        assert!(EventId::new(u64::MAX - 1) < EventId::SINCE_NOW);
        assert_eq!(EventId::SINCE_NOW.to_string(), "now");
        assert_eq!(EventId::new(42).to_string(), "42");
    }
}
