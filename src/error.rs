//! Error types for peer sessions

/// Result type alias using the session Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while negotiating and running a peer session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No runtime capable of hosting the transport (constructor called
    /// outside an async runtime context)
    #[error("Environment unsupported: {0}")]
    EnvironmentUnsupported(String),

    /// No peer-transport capability is available
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// The transport factory failed to build a transport
    #[error("Transport construction failed: {0}")]
    TransportConstructionFailed(String),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// SDP negotiation error (offer/answer creation or description apply)
    #[error("SDP negotiation error: {0}")]
    Sdp(String),

    /// A received ICE candidate was rejected by the transport (non-fatal)
    #[error("ICE candidate rejected: {0}")]
    CandidateRejected(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    Channel(String),

    /// Closing the data channel failed during teardown
    #[error("Data channel close failed: {0}")]
    ChannelCloseFailed(String),

    /// Closing the transport failed during teardown
    #[error("Transport close failed: {0}")]
    TransportCloseFailed(String),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error tears the session down when it surfaces.
    ///
    /// Everything except a rejected remote candidate is fatal to the
    /// session; candidate-add failures are logged and swallowed.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::CandidateRejected(_))
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this error was raised while tearing the session down
    pub fn is_teardown_error(&self) -> bool {
        matches!(
            self,
            Error::ChannelCloseFailed(_) | Error::TransportCloseFailed(_)
        )
    }

    /// Check if this error reports a missing capability at construction
    pub fn is_capability_error(&self) -> bool {
        matches!(
            self,
            Error::EnvironmentUnsupported(_) | Error::TransportUnavailable(_)
        )
    }
}
