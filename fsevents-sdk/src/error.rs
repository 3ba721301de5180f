use thiserror::Error;

/// Expected, caller-actionable failures.
///
/// Bridging defects are not reported through this type; see
/// [`crate::illogical`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("cannot create event stream: {reason}")]
    CannotCreateStream { reason: String },
    #[error("cannot start event stream: {reason}")]
    CannotStartStream { reason: String },
}

impl Error {
    pub(crate) fn create(reason: impl Into<String>) -> Self {
        Self::CannotCreateStream {
            reason: reason.into(),
        }
    }

    pub(crate) fn start(reason: impl Into<String>) -> Self {
        Self::CannotStartStream {
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
