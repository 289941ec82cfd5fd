//! Error types for the session layer.

use thiserror::Error;

/// Errors that can occur while discovering, negotiating or running a session.
///
/// Game-rule rejections (wrong set, busy, bad shuffle) are *not* errors; they
/// travel back to the requester as a [`RejectReason`](crate::reject::RejectReason).
#[derive(Debug, Error)]
pub enum SessionError {
    /// Configuration is missing or malformed (e.g. empty relay endpoint).
    /// Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// The relay endpoint could not be reached (DNS, connect, HTTP status).
    #[error("relay endpoint unreachable: {0}")]
    EndpointUnreachable(String),

    /// The relay answered with a JSON array where an object was expected.
    #[error("unsupported relay endpoint")]
    UnsupportedEndpoint,

    /// The relay answered with something that is not the expected shape.
    #[error("malformed relay response: {0}")]
    MalformedResponse(String),

    /// The relay understood the request but refused it (`ok: false`).
    #[error("relay refused request: {message}")]
    Relay {
        /// Message reported by the relay, if any.
        message: String,
    },

    /// Failed to serialize or deserialize a protocol message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A relay call did not complete within the client-side timeout.
    #[error("operation timed out")]
    Timeout,

    /// The session has been torn down; the handle can no longer be used.
    #[error("session is not running")]
    NotConnected,

    /// A host-only operation was requested on a client.
    #[error("only the host may perform this operation")]
    NotHost,

    /// The peer connection object rejected a negotiation step.
    #[error("negotiation error: {0}")]
    Negotiation(String),

    /// A data-channel send failed.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// The data channel is not open.
    #[error("data channel closed")]
    ChannelClosed,

    /// A card code outside `0..=80` was received.
    #[error("invalid card code {0}")]
    InvalidCard(u8),
}

impl SessionError {
    /// Returns `true` for failures that the polling and negotiation loops
    /// retry on their own (network hiccups, malformed or slow replies).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::EndpointUnreachable(_)
                | Self::MalformedResponse(_)
                | Self::Relay { .. }
                | Self::Timeout
        )
    }

    /// Returns `true` for configuration failures that must be surfaced once
    /// and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_) | Self::UnsupportedEndpoint)
    }
}

/// A specialized [`Result`] type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(SessionError::EndpointUnreachable("refused".into()).is_transient());
        assert!(SessionError::Timeout.is_transient());
        assert!(!SessionError::Config("empty endpoint".into()).is_transient());
        assert!(!SessionError::NotHost.is_transient());
    }

    #[test]
    fn configuration_classification() {
        assert!(SessionError::UnsupportedEndpoint.is_configuration());
        assert!(SessionError::Config(String::new()).is_configuration());
        assert!(!SessionError::Timeout.is_configuration());
    }

    #[test]
    fn serde_errors_convert() {
        let err = serde_json::from_str::<u8>("nope").unwrap_err();
        let err: SessionError = err.into();
        assert!(matches!(err, SessionError::Serialization(_)));
    }
}
