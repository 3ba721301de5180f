use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Flags attached to each event delivered by the notification service.
    ///
    /// Flags are hints about what happened at a path, not an authoritative
    /// change log. Several flags commonly arrive together on one event, and the
    /// stream must never be replayed to reconstruct file system state: consumers
    /// reconcile the flagged path against what is actually on disk.
    ///
    /// Bits outside the named vocabulary are kept in the raw value (see
    /// [`EventFlags::unknown_bits`]) but never show up as named flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    #[cfg_attr(feature = "serde", serde(transparent))]
    pub struct EventFlags: u32 {
        /// Rescan the directory and all its children, recursively.
        const MUST_SCAN_SUB_DIRS = 0x0000_0001;
        /// Events were dropped while buffering in this process.
        const USER_DROPPED = 0x0000_0002;
        /// Events were dropped while buffering in the kernel.
        const KERNEL_DROPPED = 0x0000_0004;
        /// The 64-bit event ID counter wrapped; older IDs are no longer valid cursors.
        const EVENT_IDS_WRAPPED = 0x0000_0008;
        /// Sentinel marking the end of historical events. Its path is meaningless.
        const HISTORY_DONE = 0x0000_0010;
        /// A watched root, or one of its ancestors, was moved or deleted.
        const ROOT_CHANGED = 0x0000_0020;
        const MOUNT = 0x0000_0040;
        const UNMOUNT = 0x0000_0080;
        const ITEM_CREATED = 0x0000_0100;
        const ITEM_REMOVED = 0x0000_0200;
        const ITEM_INODE_META_MOD = 0x0000_0400;
        const ITEM_RENAMED = 0x0000_0800;
        const ITEM_MODIFIED = 0x0000_1000;
        const ITEM_FINDER_INFO_MOD = 0x0000_2000;
        const ITEM_CHANGE_OWNER = 0x0000_4000;
        const ITEM_XATTR_MOD = 0x0000_8000;
        const ITEM_IS_FILE = 0x0001_0000;
        const ITEM_IS_DIR = 0x0002_0000;
        const ITEM_IS_SYMLINK = 0x0004_0000;
        /// The event was caused by the watching process (requires `MARK_SELF`).
        const OWN_EVENT = 0x0008_0000;
        const ITEM_IS_HARDLINK = 0x0010_0000;
        const ITEM_IS_LAST_HARDLINK = 0x0020_0000;
        const ITEM_CLONED = 0x0040_0000;
    }
}

/// How much of the tree a consumer has to look at again after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanType {
    /// Only the item at the event path changed.
    SingleNode,
    /// Something inside the directory at the event path changed.
    Folder,
    /// Events were lost or a root moved; rescan the whole subtree.
    ReScan,
    /// Nothing to do, e.g. the history-done sentinel.
    Nop,
}

impl EventFlags {
    /// Flags that still make sense for directory-level (non file-event) streams.
    pub const DIRECTORY_LEVEL: Self = Self::MUST_SCAN_SUB_DIRS
        .union(Self::USER_DROPPED)
        .union(Self::KERNEL_DROPPED)
        .union(Self::EVENT_IDS_WRAPPED)
        .union(Self::HISTORY_DONE)
        .union(Self::ROOT_CHANGED)
        .union(Self::MOUNT)
        .union(Self::UNMOUNT)
        .union(Self::OWN_EVENT);

    /// Decodes a raw native bitmask, keeping unknown bits.
    pub const fn from_raw(raw: u32) -> Self {
        Self::from_bits_retain(raw)
    }

    /// Only the flags from the named vocabulary.
    pub const fn named(&self) -> Self {
        Self::from_bits_truncate(self.bits())
    }

    /// Bits set by the native layer that this crate has no name for.
    pub const fn unknown_bits(&self) -> u32 {
        self.bits() & !Self::all().bits()
    }

    pub fn scan_type(&self) -> ScanType {
        if self.contains(Self::HISTORY_DONE) {
            ScanType::Nop
        } else if self.intersects(
            Self::MUST_SCAN_SUB_DIRS
                | Self::USER_DROPPED
                | Self::KERNEL_DROPPED
                | Self::ROOT_CHANGED
                | Self::EVENT_IDS_WRAPPED,
        ) {
            ScanType::ReScan
        } else if self.intersects(
            Self::ITEM_IS_FILE | Self::ITEM_IS_SYMLINK | Self::ITEM_IS_HARDLINK,
        ) {
            ScanType::SingleNode
        } else {
            // Directory items, mounts and plain directory-level notifications.
            ScanType::Folder
        }
    }
}

/// Renders the named flags of a set as `[NAME,NAME]`, in bit order.
pub(crate) fn render<F: bitflags::Flags>(flags: &F) -> String {
    let names: Vec<&str> = flags.iter_names().map(|(name, _)| name).collect();
    format!("[{}]", names.join(","))
}

impl fmt::Display for EventFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render(self))
    }
}
