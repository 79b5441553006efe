//! Common error types for Roverlink.

use thiserror::Error;

/// Result type alias using Roverlink's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type shared by the bridge components.
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The signaling exchange could not be reached or refused a request
    #[error("signaling error: {0}")]
    Signaling(String),

    /// Protocol error
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a signaling error from any displayable type.
    pub fn signaling(msg: impl std::fmt::Display) -> Self {
        Self::Signaling(msg.to_string())
    }

    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_pick_variant_and_message() {
        let err = Error::signaling("exchange refused");
        assert!(matches!(err, Error::Signaling(_)));
        assert_eq!(err.to_string(), "signaling error: exchange refused");

        let err = Error::config(format_args!("--codec {:?}", "VP8/90000"));
        assert_eq!(err.to_string(), "configuration error: --codec \"VP8/90000\"");
        assert!(matches!(Error::protocol("x"), Error::Protocol(_)));
        assert!(matches!(Error::serialization("x"), Error::Serialization(_)));
    }
}
