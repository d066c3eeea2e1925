use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the channel layers.
///
/// These errors are intentionally backend-agnostic. Concrete layer
/// implementations are responsible for mapping their internal failures into
/// one of these variants.
#[derive(Debug, Error)]
pub enum Error {
    /// A bounded channel queue rejected an enqueue.
    ///
    /// The caller may retry after draining the channel, or give up.
    #[error("channel {channel} is over capacity")]
    ChannelFull {
        /// The channel that refused the message.
        channel: String,
    },

    /// A channel or group name failed validation.
    ///
    /// This is a caller bug; retrying with the same name will never succeed.
    #[error("invalid channel or group name: {name}")]
    InvalidChannelName {
        /// The offending name.
        name: String,
    },

    /// A message failed validation (missing or malformed `type` key).
    #[error("invalid message: {reason}")]
    InvalidMessage {
        /// Why the message was rejected.
        reason: String,
    },

    /// The layer has been closed; no further operations are possible.
    #[error("channel layer is closed")]
    LayerClosed,

    /// A transient network or store failure.
    ///
    /// Layers never retry internally; callers choose the retry policy.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A message could not be encoded or decoded by the configured codec.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The layer was constructed with inconsistent or missing configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the operation that produced this error is worth retrying.
    ///
    /// `ChannelFull` and `BackendUnavailable` are transient; everything else
    /// is either a caller bug or terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ChannelFull { .. } | Error::BackendUnavailable(_)
        )
    }
}
