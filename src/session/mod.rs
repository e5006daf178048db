//! Pairing sessions.
//!
//! The primary device creates a [`Session`]: a fresh [`SessionId`], the
//! [`PairingUrl`] shown as a QR code, and a Responder [`Endpoint`] listening
//! under that id. The secondary device scans the URL and builds a
//! [`JoinedSession`] around an Initiator endpoint connected to it.

mod url;

pub use self::url::{parse_pairing_url, PairingUrl, SessionId, SessionRole, PEER_PARAM};

use crate::codec::Envelope;
use crate::config::ChartlinkConfig;
use crate::endpoint::{Endpoint, EndpointOptions, EndpointRole, EndpointState};
use crate::errors::PairingError;
use crate::transport::{Broker, PeerId};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Settings shared by both sides of a pairing
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Base address of the secondary's entry page
    pub base_url: String,
    /// Bound on the secondary's connect attempt
    pub connect_timeout: Option<Duration>,
    /// Bound on the primary waiting for its peer
    pub listen_timeout: Option<Duration>,
    pub endpoint: EndpointOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&ChartlinkConfig::default())
    }
}

impl From<&ChartlinkConfig> for SessionOptions {
    fn from(config: &ChartlinkConfig) -> Self {
        Self {
            base_url: config.pairing.base_url.clone(),
            connect_timeout: config.pairing.connect_timeout(),
            listen_timeout: config.pairing.listen_timeout(),
            endpoint: EndpointOptions::from(&config.transfer),
        }
    }
}

/// Run `work`, failing `endpoint` with `Timeout` if it outlives `timeout`
async fn bounded<T>(
    endpoint: &Endpoint,
    timeout: Option<Duration>,
    work: impl Future<Output = Result<T, PairingError>>,
) -> Result<T, PairingError> {
    let Some(limit) = timeout else {
        return work.await;
    };
    match tokio::time::timeout(limit, work).await {
        Ok(result) => result,
        Err(_) => {
            let reason = PairingError::Timeout(limit);
            endpoint.fail(reason.clone());
            Err(reason)
        }
    }
}

/// Primary side of a pairing
pub struct Session {
    id: SessionId,
    role: SessionRole,
    url: PairingUrl,
    endpoint: Endpoint,
    broker: Arc<dyn Broker>,
    options: SessionOptions,
}

impl Session {
    /// Generate a session id and start listening under it
    pub async fn create(
        role: SessionRole,
        broker: Arc<dyn Broker>,
        options: SessionOptions,
    ) -> Result<Self, PairingError> {
        Self::create_with_id(SessionId::generate(), role, broker, options).await
    }

    /// Start listening under a caller-chosen session id
    pub async fn create_with_id(
        id: SessionId,
        role: SessionRole,
        broker: Arc<dyn Broker>,
        options: SessionOptions,
    ) -> Result<Self, PairingError> {
        let url = PairingUrl::build(&options.base_url, role, &id)?;
        let endpoint = Endpoint::with_options(
            EndpointRole::Responder,
            id.peer_id(),
            broker.clone(),
            options.endpoint.clone(),
        );
        endpoint.open().await?;

        log::info!("Created {} session {}", role, id);
        Ok(Self {
            id,
            role,
            url,
            endpoint,
            broker,
            options,
        })
    }

    /// Close this session and create a new one with the same role. The old
    /// identity is destroyed before the new one registers.
    pub async fn regenerate(self) -> Result<Self, PairingError> {
        let Session {
            id,
            role,
            endpoint,
            broker,
            options,
            ..
        } = self;

        endpoint.close();
        drop(endpoint);
        log::info!("Regenerating {} session {}", role, id);
        Self::create(role, broker, options).await
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn url(&self) -> &PairingUrl {
        &self.url
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn state(&self) -> EndpointState {
        self.endpoint.state()
    }

    /// Wait for the secondary to connect
    pub async fn wait_for_peer(&self, timeout: Option<Duration>) -> Result<PeerId, PairingError> {
        bounded(&self.endpoint, timeout, self.endpoint.wait_for_connection()).await
    }

    /// Wait for the envelope sent by the secondary
    pub async fn next_envelope(&self, timeout: Option<Duration>) -> Result<Envelope, PairingError> {
        bounded(&self.endpoint, timeout, self.endpoint.wait_for_envelope()).await
    }

    pub async fn send(&self, envelope: &Envelope) -> Result<(), PairingError> {
        self.endpoint.send(envelope).await
    }

    pub fn close(&self) {
        self.endpoint.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("url", &self.url)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Secondary side of a pairing, built from a scanned URL
#[derive(Debug)]
pub struct JoinedSession {
    id: SessionId,
    role: SessionRole,
    endpoint: Endpoint,
}

impl JoinedSession {
    /// Parse `url`, open an Initiator endpoint and connect it to the session.
    /// The connect is bounded by `options.connect_timeout` when set.
    pub async fn join(
        url: &str,
        broker: Arc<dyn Broker>,
        options: SessionOptions,
    ) -> Result<Self, PairingError> {
        let (role, id) = parse_pairing_url(url)?;
        let local = PeerId::new(format!("guest-{}", uuid::Uuid::new_v4().simple()))?;

        let endpoint =
            Endpoint::with_options(EndpointRole::Initiator, local, broker, options.endpoint.clone());
        endpoint.open().await?;

        let remote = id.peer_id();
        match options.connect_timeout {
            Some(limit) => endpoint.connect_within(&remote, limit).await?,
            None => endpoint.connect(&remote).await?,
        }

        log::info!("Joined {} session {}", role, id);
        Ok(Self { id, role, endpoint })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> EndpointState {
        self.endpoint.state()
    }

    pub async fn send(&self, envelope: &Envelope) -> Result<(), PairingError> {
        self.endpoint.send(envelope).await
    }

    /// Wait for the envelope sent by the primary
    pub async fn next_envelope(&self, timeout: Option<Duration>) -> Result<Envelope, PairingError> {
        bounded(&self.endpoint, timeout, self.endpoint.wait_for_envelope()).await
    }

    pub fn close(&self) {
        self.endpoint.close();
    }
}
