use std::time::Duration;

/// Errors raised by the pairing and transfer subsystem.
///
/// Endpoint-level variants end up as the reason of `EndpointState::Failed`;
/// pairing and encoding variants are returned to the caller and leave the
/// endpoint untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PairingError {
    #[error("Local identity error: {0}")]
    LocalIdentity(String),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Permission denied error: {0}")]
    PermissionDenied(String),
    #[error("Device unavailable error: {0}")]
    DeviceUnavailable(String),
    #[error("Channel closed error: {0}")]
    ChannelClosed(String),
    #[error("Unknown message type error: {0}")]
    UnknownMessageType(String),
    #[error("Encoding error: {0}")]
    Encoding(String),
    #[error("Invalid pairing URL error: {0}")]
    InvalidPairingUrl(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PairingError {
    /// Stable snake_case name of the variant, used by the plugin surface and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PairingError::LocalIdentity(_) => "local_identity",
            PairingError::Connection(_) => "connection",
            PairingError::PermissionDenied(_) => "permission_denied",
            PairingError::DeviceUnavailable(_) => "device_unavailable",
            PairingError::ChannelClosed(_) => "channel_closed",
            PairingError::UnknownMessageType(_) => "unknown_message_type",
            PairingError::Encoding(_) => "encoding",
            PairingError::InvalidPairingUrl(_) => "invalid_pairing_url",
            PairingError::Timeout(_) => "timeout",
            PairingError::Config(_) => "config",
        }
    }

    /// Whether this error can move an endpoint into `Failed`.
    pub fn is_endpoint_error(&self) -> bool {
        matches!(
            self,
            PairingError::LocalIdentity(_)
                | PairingError::Connection(_)
                | PairingError::PermissionDenied(_)
                | PairingError::DeviceUnavailable(_)
                | PairingError::ChannelClosed(_)
                | PairingError::Timeout(_)
        )
    }
}

impl From<std::io::Error> for PairingError {
    fn from(err: std::io::Error) -> Self {
        PairingError::Connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_detail() {
        let err = PairingError::ChannelClosed("endpoint closed".to_string());
        assert_eq!(err.to_string(), "Channel closed error: endpoint closed");
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(PairingError::Timeout(Duration::from_secs(1)).kind(), "timeout");
        assert_eq!(
            PairingError::InvalidPairingUrl(String::new()).kind(),
            "invalid_pairing_url"
        );
    }

    #[test]
    fn test_pairing_errors_are_not_endpoint_errors() {
        assert!(!PairingError::Encoding("qr".into()).is_endpoint_error());
        assert!(!PairingError::InvalidPairingUrl("url".into()).is_endpoint_error());
        assert!(PairingError::Connection("reset".into()).is_endpoint_error());
    }

    #[test]
    fn test_io_error_maps_to_connection() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        let err: PairingError = io.into();
        assert!(matches!(err, PairingError::Connection(msg) if msg.contains("pipe gone")));
    }
}
