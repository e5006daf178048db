use crate::errors::PairingError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the pairing an endpoint plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    /// Secondary device: dials the session id it scanned
    Initiator,
    /// Primary device: listens under the session id
    Responder,
}

/// Lifecycle of an endpoint.
///
/// ```text
/// Idle -> OpeningLocal -> Ready -> Listening  (Responder) -> Open -> Sending -> Sent
///                               -> Connecting (Initiator) ->
/// ```
///
/// Any non-terminal state may move to `Failed` or `Closed`; `Closed` and
/// `Failed` never move again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointState {
    Idle,
    OpeningLocal,
    Ready,
    Listening,
    Connecting,
    Open,
    Sending,
    Sent,
    Closed,
    Failed(PairingError),
}

impl EndpointState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EndpointState::Closed | EndpointState::Failed(_))
    }

    /// Whether `next` is a legal successor of `self` for `role`
    pub fn can_transition_to(&self, next: &EndpointState, role: EndpointRole) -> bool {
        use EndpointState::*;

        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Failed(_)) | (_, Closed) => true,
            (Idle, OpeningLocal) | (OpeningLocal, Ready) => true,
            (Ready, Listening) | (Listening, Open) => role == EndpointRole::Responder,
            (Ready, Connecting) | (Connecting, Open) => role == EndpointRole::Initiator,
            (Open, Sending) | (Sending, Sent) => true,
            _ => false,
        }
    }

    /// A failed endpoint may be replaced by a fresh attempt. Nothing retries
    /// automatically.
    pub fn can_retry(&self) -> bool {
        matches!(self, EndpointState::Failed(_))
    }

    /// The payload left this endpoint and was flushed to the channel
    pub fn is_confirmed(&self) -> bool {
        matches!(self, EndpointState::Sent)
    }

    /// Failure reason, if any
    pub fn error(&self) -> Option<&PairingError> {
        match self {
            EndpointState::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Stable snake_case name, used by the plugin surface
    pub fn name(&self) -> &'static str {
        match self {
            EndpointState::Idle => "idle",
            EndpointState::OpeningLocal => "opening_local",
            EndpointState::Ready => "ready",
            EndpointState::Listening => "listening",
            EndpointState::Connecting => "connecting",
            EndpointState::Open => "open",
            EndpointState::Sending => "sending",
            EndpointState::Sent => "sent",
            EndpointState::Closed => "closed",
            EndpointState::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointState::Failed(reason) => write!(f, "failed ({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use EndpointRole::*;
    use EndpointState::*;

    fn all_states() -> Vec<EndpointState> {
        vec![
            Idle,
            OpeningLocal,
            Ready,
            Listening,
            Connecting,
            Open,
            Sending,
            Sent,
            Closed,
            Failed(PairingError::Connection("reset".into())),
        ]
    }

    #[test]
    fn test_terminal_states_never_transition() {
        for from in [Closed, Failed(PairingError::Connection("x".into()))] {
            for to in all_states() {
                assert!(!from.can_transition_to(&to, Initiator));
                assert!(!from.can_transition_to(&to, Responder));
            }
        }
    }

    #[test]
    fn test_role_specific_branches() {
        assert!(Ready.can_transition_to(&Listening, Responder));
        assert!(!Ready.can_transition_to(&Listening, Initiator));
        assert!(Ready.can_transition_to(&Connecting, Initiator));
        assert!(!Ready.can_transition_to(&Connecting, Responder));
        assert!(!Listening.can_transition_to(&Open, Initiator));
    }

    #[test]
    fn test_no_skipping_or_going_back() {
        assert!(!Idle.can_transition_to(&Open, Initiator));
        assert!(!Open.can_transition_to(&Connecting, Initiator));
        assert!(!Sent.can_transition_to(&Sending, Responder));
        assert!(Sent.can_transition_to(&Closed, Responder));
    }

    #[test]
    fn test_every_live_state_can_close_or_fail() {
        for from in all_states().into_iter().filter(|s| !s.is_terminal()) {
            assert!(from.can_transition_to(&Closed, Initiator));
            assert!(from.can_transition_to(&Failed(PairingError::Timeout(Default::default())), Responder));
        }
    }

    #[test]
    fn test_retry_and_confirmation_flags() {
        assert!(Failed(PairingError::Connection("x".into())).can_retry());
        assert!(!Closed.can_retry());
        assert!(Sent.is_confirmed());
        assert!(!Sending.is_confirmed());
    }

    #[test]
    fn test_display() {
        assert_eq!(OpeningLocal.to_string(), "opening_local");
        assert!(Failed(PairingError::ChannelClosed("gone".into()))
            .to_string()
            .starts_with("failed ("));
    }
}
