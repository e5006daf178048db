use crate::codec::Envelope;
use crate::errors::PairingError;
use crate::transport::PeerId;

/// Notifications published by an endpoint, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    /// The local identity is registered with the broker
    Opened { local: PeerId },
    /// A channel to `remote` is open
    Connection { remote: PeerId },
    /// A decoded envelope arrived
    Data(Envelope),
    /// Endpoint failure, or a non-fatal undecodable frame
    Error(PairingError),
    /// The endpoint closed
    Closed,
}

impl EndpointEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EndpointEvent::Opened { .. } => "opened",
            EndpointEvent::Connection { .. } => "connection",
            EndpointEvent::Data(_) => "data",
            EndpointEvent::Error(_) => "error",
            EndpointEvent::Closed => "closed",
        }
    }
}
