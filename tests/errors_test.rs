#[cfg(test)]
mod error_tests {
    use chartlink::errors::PairingError;
    use chartlink::EndpointState;
    use std::error::Error;
    use std::time::Duration;

    #[test]
    fn test_pairing_error_display() {
        let error = PairingError::PermissionDenied("Access denied".to_string());
        assert_eq!(error.to_string(), "Permission denied error: Access denied");

        let error = PairingError::InvalidPairingUrl("missing peer parameter".to_string());
        assert!(error.to_string().contains("missing peer parameter"));
    }

    #[test]
    fn test_pairing_error_implements_error_trait() {
        let error = PairingError::Connection("reset".to_string());
        let _error_trait: &dyn Error = &error;
        assert!(error.source().is_none());
    }

    #[test]
    fn test_all_error_variants_have_kinds() {
        let errors = vec![
            PairingError::LocalIdentity("id".to_string()),
            PairingError::Connection("conn".to_string()),
            PairingError::PermissionDenied("perm".to_string()),
            PairingError::DeviceUnavailable("dev".to_string()),
            PairingError::ChannelClosed("closed".to_string()),
            PairingError::UnknownMessageType("msg".to_string()),
            PairingError::Encoding("enc".to_string()),
            PairingError::InvalidPairingUrl("url".to_string()),
            PairingError::Timeout(Duration::from_secs(30)),
            PairingError::Config("cfg".to_string()),
        ];

        let mut kinds: Vec<_> = errors.iter().map(|e| e.kind()).collect();
        kinds.sort_unstable();
        kinds.dedup();
        assert_eq!(kinds.len(), errors.len());
        for error in &errors {
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_failed_state_carries_reason() {
        let state = EndpointState::Failed(PairingError::Timeout(Duration::from_secs(5)));
        assert!(state.is_terminal());
        assert!(state.can_retry());
        assert_eq!(state.error().map(|e| e.kind()), Some("timeout"));
        assert!(state.to_string().starts_with("failed"));
    }
}
