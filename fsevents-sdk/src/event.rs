use crate::{EventFlags, EventId, ScanType};
use std::{fmt, path::PathBuf};

/// One decoded notification: a path, what happened there, and its ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Event {
    /// The path of this event.
    pub path: PathBuf,
    /// The event type.
    pub flags: EventFlags,
    /// The event id.
    pub id: EventId,
}

impl Event {
    pub fn new(path: impl Into<PathBuf>, flags: EventFlags, id: EventId) -> Self {
        Self {
            path: path.into(),
            flags,
            id,
        }
    }

    pub(crate) fn from_raw(path: PathBuf, flag: u32, id: u64) -> Self {
        Self {
            path,
            flags: EventFlags::from_raw(flag),
            id: EventId(id),
        }
    }

    pub fn scan_type(&self) -> ScanType {
        self.flags.scan_type()
    }

    /// Whether the consumer must rescan the whole subtree under `path`.
    pub fn should_rescan(&self) -> bool {
        self.scan_type() == ScanType::ReScan
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} {}", self.id, self.path.display(), self.flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_decoding() {
        let flag = (EventFlags::ITEM_CREATED | EventFlags::ITEM_IS_FILE).bits();
        let event = Event::from_raw(PathBuf::from("/tmp/a"), flag, 7);
        assert_eq!(
            event,
            Event::new(
                "/tmp/a",
                EventFlags::ITEM_CREATED | EventFlags::ITEM_IS_FILE,
                EventId(7)
            )
        );
        assert_eq!(event.to_string(), "[7] /tmp/a [ITEM_CREATED,ITEM_IS_FILE]");
        assert!(!event.should_rescan());
    }
}
