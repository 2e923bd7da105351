use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    /// A listener reported a failure while handling an event.
    #[error("Listener {listener} failed: {reason}")]
    ListenerFailed { listener: String, reason: String },

    /// The name does not match any lifecycle phase.
    #[error("Unknown lifecycle event: {0}")]
    UnknownEvent(String),
}

pub type Result<T> = std::result::Result<T, EventError>;
