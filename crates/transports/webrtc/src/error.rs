//! Error types for the peer mesh

/// Result type alias using the mesh Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in mesh operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling relay error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Relay did not open within the connect window
    #[error("Connection timeout: {0}")]
    ConnectionTimeout(String),

    /// Relay stayed unreachable through every reconnect attempt
    #[error("Reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted {
        /// Number of attempts made before giving up
        attempts: u32,
    },

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// Negotiation message arrived in a state that cannot accept it
    #[error("Negotiation state violation: {0}")]
    NegotiationState(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannelError(String),

    /// Media track error
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// Local camera/microphone could not be acquired
    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// The session was stopped or its dispatch loop is gone
    #[error("Session closed")]
    SessionClosed,

    /// Internal error (should not occur in normal operation)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_)
                | Error::ConnectionTimeout(_)
                | Error::WebSocketError(_)
                | Error::IoError(_)
        )
    }

    /// Check if this error comes from offer/answer/candidate handling
    ///
    /// These are expected under network races and are logged and dropped
    /// rather than propagated.
    pub fn is_negotiation_error(&self) -> bool {
        matches!(
            self,
            Error::SdpError(_) | Error::NegotiationState(_) | Error::IceCandidateError(_)
        )
    }

    /// Check if this error should be surfaced to the user as fatal
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ReconnectExhausted { .. })
    }
}
