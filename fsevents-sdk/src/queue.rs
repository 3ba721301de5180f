use std::fmt;

/// Quality-of-service class of a global queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QosClass {
    UserInteractive,
    UserInitiated,
    Default,
    Utility,
    #[default]
    Background,
}

/// Execution context that runs a stream's callbacks.
///
/// Callbacks for one stream run one at a time and in delivery order, on
/// whatever thread the native layer picks for the queue. Streams on different
/// queues may deliver concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Queue {
    /// A shared, system-managed concurrent queue of the given priority.
    Global(QosClass),
    /// A private serial queue with a debugging label.
    Serial(String),
}

impl Queue {
    pub fn background() -> Self {
        Self::Global(QosClass::Background)
    }

    pub fn serial(label: impl Into<String>) -> Self {
        Self::Serial(label.into())
    }

    pub fn label(&self) -> String {
        match self {
            Self::Global(qos) => format!("global-{qos:?}").to_lowercase(),
            Self::Serial(label) => label.clone(),
        }
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}
