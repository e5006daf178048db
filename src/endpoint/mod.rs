//! Endpoint lifecycle.
//!
//! An [`Endpoint`] owns one local identity at the broker and at most one
//! channel. The Responder (primary device) listens under the session id; the
//! Initiator (secondary device) dials it. State is published on a
//! `tokio::sync::watch` channel and every notable step is also pushed onto an
//! ordered event stream.
//!
//! All mutation happens under one mutex. Work that suspends (registering,
//! dialing, writing, reading) captures the generation counter first and only
//! applies its effect if the counter is unchanged when it resumes; `close()`
//! and `fail()` bump it, so a connect that resolves after cancellation is
//! discarded.

mod event;
mod state;

pub use event::EndpointEvent;
pub use state::{EndpointRole, EndpointState};

use crate::assert_invariant;
use crate::capture::SharedCapture;
use crate::codec::{self, Envelope, PayloadKind};
use crate::config::TransferConfig;
use crate::errors::PairingError;
use crate::invariant_ppt::names;
use crate::transport::{Broker, Channel, ChannelReader, ChannelWriter, LocalIdentity, PeerId};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Per-endpoint channel settings
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    /// Largest frame accepted from the remote
    pub max_frame_bytes: usize,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            max_frame_bytes: 64 * 1024 * 1024,
        }
    }
}

impl From<&TransferConfig> for EndpointOptions {
    fn from(config: &TransferConfig) -> Self {
        Self {
            max_frame_bytes: config.max_frame_bytes,
        }
    }
}

struct Core {
    generation: u64,
    identity: Option<Arc<dyn LocalIdentity>>,
    writer: Option<Arc<tokio::sync::Mutex<ChannelWriter>>>,
    remote: Option<PeerId>,
    listener: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    capture: Option<SharedCapture>,
    events: Option<mpsc::UnboundedSender<EndpointEvent>>,
    payload_seen: bool,
    /// Remote hung up while our own send was still in flight
    remote_eof: bool,
    received: usize,
    released: bool,
    releases: usize,
}

struct Shared {
    role: EndpointRole,
    local_id: PeerId,
    broker: Arc<dyn Broker>,
    options: EndpointOptions,
    state: watch::Sender<EndpointState>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<EndpointEvent>>,
    core: Mutex<Core>,
}

impl Shared {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> EndpointState {
        self.state.borrow().clone()
    }

    /// Apply `next` if legal. Callers hold the core lock.
    fn transition(&self, _core: &Core, next: EndpointState) -> bool {
        let current = self.state();
        if !current.can_transition_to(&next, self.role) {
            log::debug!(
                "Endpoint {} ignoring transition {} -> {}",
                self.local_id,
                current,
                next
            );
            return false;
        }
        log::debug!("Endpoint {}: {} -> {}", self.local_id, current, next);
        self.state.send_replace(next);
        true
    }

    /// True when `generation` was superseded by a close or failure. A
    /// superseded continuation only ever finds the endpoint terminal.
    fn is_stale(&self, core: &Core, generation: u64, site: &str) -> bool {
        if core.generation == generation {
            return false;
        }
        assert_invariant!(self.state().is_terminal(), names::TERMINAL_STATE, site);
        log::debug!("Endpoint {} discarding stale {}", self.local_id, site);
        true
    }

    fn emit(core: &Core, event: EndpointEvent) {
        if let Some(events) = &core.events {
            let _ = events.send(event);
        }
    }

    fn install_channel(self: &Arc<Self>, core: &mut Core, channel: Channel) {
        assert_invariant!(
            core.writer.is_none(),
            names::SINGLE_CHANNEL,
            "endpoint::install_channel"
        );
        if !self.transition(core, EndpointState::Open) {
            return;
        }

        let remote = channel.remote().clone();
        let (reader, writer) = channel.into_split(self.options.max_frame_bytes);
        core.writer = Some(Arc::new(tokio::sync::Mutex::new(writer)));
        core.remote = Some(remote.clone());
        Self::emit(core, EndpointEvent::Connection {
            remote: remote.clone(),
        });
        core.reader = Some(tokio::spawn(read_loop(self.clone(), reader, core.generation)));
        log::info!("Endpoint {} open with {}", self.local_id, remote);
    }

    /// The single release sequence. Later calls are no-ops.
    fn release(&self, core: &mut Core) {
        if core.released {
            return;
        }
        core.released = true;
        core.releases += 1;

        if let Some(listener) = core.listener.take() {
            listener.abort();
        }
        if let Some(reader) = core.reader.take() {
            reader.abort();
        }
        core.writer = None;
        if let Some(identity) = core.identity.take() {
            identity.destroy();
        }
        if let Some(capture) = core.capture.take() {
            release_capture(&capture);
        }
        core.events = None;
        log::info!("Endpoint {} released", self.local_id);
    }

    fn close_locked(&self, core: &mut Core) {
        core.generation += 1;
        if self.transition(core, EndpointState::Closed) {
            log::info!("Endpoint {} closed", self.local_id);
            Self::emit(core, EndpointEvent::Closed);
        }
        self.release(core);
    }

    fn fail_locked(&self, core: &mut Core, reason: PairingError) {
        if self.state().is_terminal() {
            log::debug!("Endpoint {} already terminal, dropping {}", self.local_id, reason);
            return;
        }
        core.generation += 1;
        log::warn!("Endpoint {} failed: {}", self.local_id, reason);
        if self.transition(core, EndpointState::Failed(reason.clone())) {
            Self::emit(core, EndpointEvent::Error(reason));
        }
        self.release(core);
    }

    fn terminal_error(&self) -> PairingError {
        match self.state() {
            EndpointState::Failed(reason) => reason,
            other => PairingError::ChannelClosed(format!("endpoint is {}", other)),
        }
    }
}

fn release_capture(capture: &SharedCapture) {
    let stopped = capture
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .release();
    log::debug!("Capture released with {} track(s) stopped", stopped);
}

/// Responder side: take the first inbound channel, drop the rest.
async fn listen_loop(shared: Arc<Shared>, identity: Arc<dyn LocalIdentity>, generation: u64) {
    while let Some(channel) = identity.accept().await {
        let mut core = shared.core();
        if shared.is_stale(&core, generation, "endpoint::listen_loop") {
            return;
        }
        if core.writer.is_some() || shared.state() != EndpointState::Listening {
            log::warn!(
                "Endpoint {} ignoring extra inbound connection from {}",
                shared.local_id,
                channel.remote()
            );
            continue;
        }
        shared.install_channel(&mut core, channel);
    }

    let mut core = shared.core();
    if core.generation == generation && shared.state() == EndpointState::Listening {
        shared.fail_locked(
            &mut core,
            PairingError::LocalIdentity("broker dropped the local identity".to_string()),
        );
    }
}

async fn read_loop(shared: Arc<Shared>, mut reader: ChannelReader, generation: u64) {
    loop {
        let frame = reader.next_frame().await;

        let mut core = shared.core();
        if shared.is_stale(&core, generation, "endpoint::read_loop") {
            return;
        }
        match frame {
            Ok(Some(raw)) => match codec::decode(&raw) {
                Ok(envelope) => {
                    core.payload_seen = true;
                    core.received += 1;
                    log::info!(
                        "Endpoint {} received {} envelope ({} bytes)",
                        shared.local_id,
                        envelope.kind(),
                        envelope.len()
                    );
                    Shared::emit(&core, EndpointEvent::Data(envelope));
                }
                Err(e) => {
                    log::warn!("Endpoint {} dropped a frame: {}", shared.local_id, e);
                    Shared::emit(&core, EndpointEvent::Error(e));
                }
            },
            Ok(None) if core.payload_seen => {
                log::info!("Endpoint {}: remote closed the channel", shared.local_id);
                shared.close_locked(&mut core);
                return;
            }
            Ok(None) if shared.state() == EndpointState::Sending => {
                // our write may still land; send() settles the outcome
                log::info!(
                    "Endpoint {}: remote closed the channel during send",
                    shared.local_id
                );
                core.remote_eof = true;
                return;
            }
            Ok(None) => {
                shared.fail_locked(
                    &mut core,
                    PairingError::Connection(
                        "remote closed the channel before a payload was exchanged".to_string(),
                    ),
                );
                return;
            }
            Err(e) => {
                shared.fail_locked(
                    &mut core,
                    PairingError::Connection(format!("channel read failed: {}", e)),
                );
                return;
            }
        }
    }
}

/// One side of a pairing.
pub struct Endpoint {
    shared: Arc<Shared>,
}

impl Endpoint {
    pub fn new(role: EndpointRole, local_id: PeerId, broker: Arc<dyn Broker>) -> Self {
        Self::with_options(role, local_id, broker, EndpointOptions::default())
    }

    pub fn with_options(
        role: EndpointRole,
        local_id: PeerId,
        broker: Arc<dyn Broker>,
        options: EndpointOptions,
    ) -> Self {
        let (state, _) = watch::channel(EndpointState::Idle);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                role,
                local_id,
                broker,
                options,
                state,
                events: tokio::sync::Mutex::new(events_rx),
                core: Mutex::new(Core {
                    generation: 0,
                    identity: None,
                    writer: None,
                    remote: None,
                    listener: None,
                    reader: None,
                    capture: None,
                    events: Some(events_tx),
                    payload_seen: false,
                    remote_eof: false,
                    received: 0,
                    released: false,
                    releases: 0,
                }),
            }),
        }
    }

    pub fn role(&self) -> EndpointRole {
        self.shared.role
    }

    pub fn local_id(&self) -> &PeerId {
        &self.shared.local_id
    }

    /// Peer on the other end of the channel, once open
    pub fn remote(&self) -> Option<PeerId> {
        self.shared.core().remote.clone()
    }

    pub fn state(&self) -> EndpointState {
        self.shared.state()
    }

    /// Watch state changes without blocking on the event stream
    pub fn subscribe_state(&self) -> watch::Receiver<EndpointState> {
        self.shared.state.subscribe()
    }

    /// Envelopes decoded so far
    pub fn received_count(&self) -> usize {
        self.shared.core().received
    }

    /// Release sequences run so far (0 or 1)
    pub fn release_count(&self) -> usize {
        self.shared.core().releases
    }

    /// Register the local identity. The Responder starts listening; the
    /// Initiator is left `Ready` to connect.
    pub async fn open(&self) -> Result<(), PairingError> {
        let generation = {
            let core = self.shared.core();
            let current = self.shared.state();
            if current.is_terminal() {
                return Err(PairingError::ChannelClosed(format!("endpoint is {}", current)));
            }
            if !self.shared.transition(&core, EndpointState::OpeningLocal) {
                return Err(PairingError::LocalIdentity(format!(
                    "cannot open in state {}",
                    current
                )));
            }
            core.generation
        };

        log::info!(
            "Opening {:?} endpoint {}",
            self.shared.role,
            self.shared.local_id
        );
        let registered = self.shared.broker.register(&self.shared.local_id).await;

        let mut core = self.shared.core();
        if self.shared.is_stale(&core, generation, "endpoint::open") {
            if let Ok(identity) = registered {
                identity.destroy();
            }
            return Err(PairingError::ChannelClosed(
                "endpoint closed while opening".to_string(),
            ));
        }

        let identity = match registered {
            Ok(identity) => identity,
            Err(e) => {
                self.shared.fail_locked(&mut core, e.clone());
                return Err(e);
            }
        };

        core.identity = Some(identity.clone());
        self.shared.transition(&core, EndpointState::Ready);
        Shared::emit(&core, EndpointEvent::Opened {
            local: self.shared.local_id.clone(),
        });

        if self.shared.role == EndpointRole::Responder {
            self.shared.transition(&core, EndpointState::Listening);
            core.listener = Some(tokio::spawn(listen_loop(
                self.shared.clone(),
                identity,
                generation,
            )));
            log::info!("Endpoint {} listening", self.shared.local_id);
        }
        Ok(())
    }

    /// Dial `remote`. Initiator only, and unbounded: see
    /// [`Endpoint::connect_within`] for a bounded attempt.
    pub async fn connect(&self, remote: &PeerId) -> Result<(), PairingError> {
        if self.shared.role != EndpointRole::Initiator {
            return Err(PairingError::Connection(
                "only an initiator endpoint can connect".to_string(),
            ));
        }

        let generation = {
            let core = self.shared.core();
            let current = self.shared.state();
            if current.is_terminal() {
                return Err(PairingError::ChannelClosed(format!("endpoint is {}", current)));
            }
            if !self.shared.transition(&core, EndpointState::Connecting) {
                return Err(PairingError::Connection(format!(
                    "cannot connect in state {}",
                    current
                )));
            }
            core.generation
        };

        log::info!("Endpoint {} connecting to {}", self.shared.local_id, remote);
        let dialed = self.shared.broker.dial(&self.shared.local_id, remote).await;

        let mut core = self.shared.core();
        if self.shared.is_stale(&core, generation, "endpoint::connect") {
            return Err(PairingError::ChannelClosed(
                "endpoint closed while connecting".to_string(),
            ));
        }

        match dialed {
            Ok(channel) => {
                self.shared.install_channel(&mut core, channel);
                Ok(())
            }
            Err(e) => {
                let reason = match e {
                    PairingError::Connection(_) => e,
                    other => PairingError::Connection(other.to_string()),
                };
                self.shared.fail_locked(&mut core, reason.clone());
                Err(reason)
            }
        }
    }

    /// [`Endpoint::connect`] bounded by `timeout`; expiry fails the endpoint
    /// with `Timeout`.
    pub async fn connect_within(&self, remote: &PeerId, timeout: Duration) -> Result<(), PairingError> {
        match tokio::time::timeout(timeout, self.connect(remote)).await {
            Ok(result) => result,
            Err(_) => {
                let reason = PairingError::Timeout(timeout);
                self.fail(reason.clone());
                Err(reason)
            }
        }
    }

    /// Write one envelope to the channel. Valid while `Open` or `Sending`.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), PairingError> {
        let wire = codec::to_wire(envelope)?;

        let (writer, generation) = {
            let core = self.shared.core();
            let current = self.shared.state();
            let writer = match (&current, &core.writer) {
                (EndpointState::Open | EndpointState::Sending, Some(writer)) => writer.clone(),
                _ => {
                    return Err(PairingError::ChannelClosed(format!(
                        "cannot send in state {}",
                        current
                    )))
                }
            };
            if current == EndpointState::Open {
                self.shared.transition(&core, EndpointState::Sending);
            }
            (writer, core.generation)
        };

        log::info!(
            "Endpoint {} sending {} envelope ({} bytes)",
            self.shared.local_id,
            envelope.kind(),
            envelope.len()
        );
        let written = {
            let mut writer = writer.lock().await;
            writer.send_frame(&wire).await
        };

        let mut core = self.shared.core();
        if self.shared.is_stale(&core, generation, "endpoint::send") {
            return Err(PairingError::ChannelClosed(
                "endpoint closed during send".to_string(),
            ));
        }

        match written {
            Ok(()) => {
                core.payload_seen = true;
                self.shared.transition(&core, EndpointState::Sent);
                if envelope.kind() == PayloadKind::Photo {
                    if let Some(capture) = core.capture.take() {
                        release_capture(&capture);
                    }
                }
                log::info!("Endpoint {} sent {} envelope", self.shared.local_id, envelope.kind());
                if core.remote_eof {
                    log::info!("Endpoint {}: remote already closed the channel", self.shared.local_id);
                    self.shared.close_locked(&mut core);
                }
                Ok(())
            }
            Err(e) => {
                let reason = PairingError::Connection(format!("send failed: {}", e));
                self.shared.fail_locked(&mut core, reason.clone());
                Err(reason)
            }
        }
    }

    /// Hand the endpoint the release duty for a capture controller. An
    /// endpoint that is already released releases it at once.
    pub fn attach_capture(&self, capture: SharedCapture) {
        let mut core = self.shared.core();
        if core.released {
            release_capture(&capture);
        } else {
            core.capture = Some(capture);
        }
    }

    /// Tear down. Idempotent; the release sequence runs once.
    pub fn close(&self) {
        let mut core = self.shared.core();
        self.shared.close_locked(&mut core);
    }

    /// Move a live endpoint to `Failed(reason)` and release it
    pub fn fail(&self, reason: PairingError) {
        let mut core = self.shared.core();
        self.shared.fail_locked(&mut core, reason);
    }

    /// Next event; `None` once the endpoint is released and the queue drained
    pub async fn next_event(&self) -> Option<EndpointEvent> {
        self.shared.events.lock().await.recv().await
    }

    /// Next already queued event, without waiting
    pub fn try_next_event(&self) -> Option<EndpointEvent> {
        self.shared.events.try_lock().ok()?.try_recv().ok()
    }

    /// Wait until a channel is open and return the remote peer
    pub async fn wait_for_connection(&self) -> Result<PeerId, PairingError> {
        loop {
            match self.next_event().await {
                Some(EndpointEvent::Connection { remote }) => return Ok(remote),
                Some(EndpointEvent::Error(e)) if e.is_endpoint_error() => return Err(e),
                Some(EndpointEvent::Closed) => {
                    return Err(PairingError::ChannelClosed(
                        "endpoint closed before a peer connected".to_string(),
                    ))
                }
                Some(other) => log::debug!("Skipping {} event", other.name()),
                None => return Err(self.shared.terminal_error()),
            }
        }
    }

    /// Wait for the next decoded envelope, skipping undecodable frames
    pub async fn wait_for_envelope(&self) -> Result<Envelope, PairingError> {
        loop {
            match self.next_event().await {
                Some(EndpointEvent::Data(envelope)) => return Ok(envelope),
                Some(EndpointEvent::Error(e)) if e.is_endpoint_error() => return Err(e),
                Some(EndpointEvent::Error(e)) => log::warn!("Skipping bad frame: {}", e),
                Some(EndpointEvent::Closed) => {
                    return Err(PairingError::ChannelClosed(
                        "channel closed before a payload arrived".to_string(),
                    ))
                }
                Some(other) => log::debug!("Skipping {} event", other.name()),
                None => return Err(self.shared.terminal_error()),
            }
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("role", &self.shared.role)
            .field("local_id", &self.shared.local_id)
            .field("state", &self.shared.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use crate::transport::memory::MemoryBroker;

    fn peer(id: &str) -> PeerId {
        PeerId::new(id).unwrap()
    }

    async fn paired(broker: &MemoryBroker) -> (Endpoint, Endpoint) {
        let responder = Endpoint::new(EndpointRole::Responder, peer("host"), Arc::new(broker.clone()));
        responder.open().await.unwrap();
        let initiator = Endpoint::new(EndpointRole::Initiator, peer("guest"), Arc::new(broker.clone()));
        initiator.open().await.unwrap();
        initiator.connect(&peer("host")).await.unwrap();
        responder.wait_for_connection().await.unwrap();
        (responder, initiator)
    }

    #[tokio::test]
    async fn test_open_moves_responder_to_listening() {
        let broker = MemoryBroker::new();
        let endpoint = Endpoint::new(EndpointRole::Responder, peer("host"), Arc::new(broker.clone()));
        assert_eq!(endpoint.state(), EndpointState::Idle);

        endpoint.open().await.unwrap();
        assert_eq!(endpoint.state(), EndpointState::Listening);
        assert!(broker.is_registered(&peer("host")));
        assert_eq!(
            endpoint.next_event().await,
            Some(EndpointEvent::Opened { local: peer("host") })
        );
    }

    #[tokio::test]
    async fn test_open_moves_initiator_to_ready() {
        let broker = MemoryBroker::new();
        let endpoint = Endpoint::new(EndpointRole::Initiator, peer("guest"), Arc::new(broker));
        endpoint.open().await.unwrap();
        assert_eq!(endpoint.state(), EndpointState::Ready);
    }

    #[tokio::test]
    async fn test_open_with_taken_id_fails_endpoint() {
        let broker = MemoryBroker::new();
        let _taken = broker.register(&peer("host")).await.unwrap();

        let endpoint = Endpoint::new(EndpointRole::Responder, peer("host"), Arc::new(broker));
        let err = endpoint.open().await.unwrap_err();
        assert!(matches!(err, PairingError::LocalIdentity(_)));
        assert!(matches!(endpoint.state(), EndpointState::Failed(PairingError::LocalIdentity(_))));
    }

    #[tokio::test]
    async fn test_open_twice_is_rejected() {
        let broker = MemoryBroker::new();
        let endpoint = Endpoint::new(EndpointRole::Initiator, peer("guest"), Arc::new(broker));
        endpoint.open().await.unwrap();
        assert!(endpoint.open().await.is_err());
        assert_eq!(endpoint.state(), EndpointState::Ready);
    }

    #[tokio::test]
    async fn test_connect_pairs_both_sides() {
        let broker = MemoryBroker::new();
        let (responder, initiator) = paired(&broker).await;

        assert_eq!(responder.state(), EndpointState::Open);
        assert_eq!(initiator.state(), EndpointState::Open);
        assert_eq!(responder.remote(), Some(peer("guest")));
        assert_eq!(initiator.remote(), Some(peer("host")));
    }

    #[tokio::test]
    async fn test_connect_to_unknown_peer_fails() {
        let broker = MemoryBroker::new();
        let endpoint = Endpoint::new(EndpointRole::Initiator, peer("guest"), Arc::new(broker.clone()));
        endpoint.open().await.unwrap();

        let err = endpoint.connect(&peer("nobody")).await.unwrap_err();
        assert!(matches!(err, PairingError::Connection(_)));
        assert!(endpoint.state().can_retry());
        assert_eq!(broker.live_identities(), 0);
    }

    #[tokio::test]
    async fn test_responder_cannot_connect() {
        let broker = MemoryBroker::new();
        let endpoint = Endpoint::new(EndpointRole::Responder, peer("host"), Arc::new(broker));
        endpoint.open().await.unwrap();
        assert!(endpoint.connect(&peer("other")).await.is_err());
        assert_eq!(endpoint.state(), EndpointState::Listening);
    }

    #[tokio::test]
    async fn test_envelope_reaches_peer_and_confirms() {
        let broker = MemoryBroker::new();
        let (responder, initiator) = paired(&broker).await;

        let envelope = encode(vec![1u8, 2, 3], PayloadKind::Photo, None, None);
        initiator.send(&envelope).await.unwrap();
        assert!(initiator.state().is_confirmed());

        let received = responder.wait_for_envelope().await.unwrap();
        assert_eq!(received.payload().as_ref(), &[1u8, 2, 3]);
        assert_eq!(responder.received_count(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_not_fatal() {
        let broker = MemoryBroker::new();
        let responder = Endpoint::new(EndpointRole::Responder, peer("host"), Arc::new(broker.clone()));
        responder.open().await.unwrap();

        let channel = broker.dial(&peer("raw"), &peer("host")).await.unwrap();
        let (_reader, mut writer) = channel.into_split(1024);
        responder.wait_for_connection().await.unwrap();

        writer.send_frame(br#"{"kind":"video"}"#).await.unwrap();
        match responder.next_event().await {
            Some(EndpointEvent::Error(PairingError::UnknownMessageType(_))) => {}
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(responder.state(), EndpointState::Open);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let broker = MemoryBroker::new();
        let (responder, initiator) = paired(&broker).await;

        for _ in 0..3 {
            initiator.close();
        }
        assert_eq!(initiator.state(), EndpointState::Closed);
        assert_eq!(initiator.release_count(), 1);
        drop(responder);
    }

    #[tokio::test]
    async fn test_send_after_close_is_channel_closed() {
        let broker = MemoryBroker::new();
        let (_responder, initiator) = paired(&broker).await;
        initiator.close();

        let envelope = encode(vec![0u8; 8], PayloadKind::Photo, None, None);
        let err = initiator.send(&envelope).await.unwrap_err();
        assert!(matches!(err, PairingError::ChannelClosed(_)));
        assert_eq!(initiator.state(), EndpointState::Closed);
    }

    #[tokio::test]
    async fn test_remote_close_before_payload_fails() {
        let broker = MemoryBroker::new();
        let (responder, initiator) = paired(&broker).await;
        initiator.close();

        let mut state = responder.subscribe_state();
        let reached = state.wait_for(|s| s.is_terminal()).await.unwrap().clone();
        assert!(matches!(reached, EndpointState::Failed(PairingError::Connection(_))));
    }

    #[tokio::test]
    async fn test_remote_close_after_payload_closes() {
        let broker = MemoryBroker::new();
        let (responder, initiator) = paired(&broker).await;

        let envelope = encode(b"%PDF".to_vec(), PayloadKind::Document, None, None);
        responder.send(&envelope).await.unwrap();
        initiator.wait_for_envelope().await.unwrap();
        initiator.close();

        let mut state = responder.subscribe_state();
        let reached = state.wait_for(|s| s.is_terminal()).await.unwrap().clone();
        assert_eq!(reached, EndpointState::Closed);
    }

    #[tokio::test]
    async fn test_events_end_after_release() {
        let broker = MemoryBroker::new();
        let endpoint = Endpoint::new(EndpointRole::Initiator, peer("guest"), Arc::new(broker));
        endpoint.open().await.unwrap();
        endpoint.close();

        assert!(matches!(endpoint.next_event().await, Some(EndpointEvent::Opened { .. })));
        assert_eq!(endpoint.next_event().await, Some(EndpointEvent::Closed));
        assert_eq!(endpoint.next_event().await, None);
    }

    #[tokio::test]
    async fn test_connect_within_times_out() {
        struct SilentBroker(MemoryBroker);

        #[async_trait::async_trait]
        impl Broker for SilentBroker {
            async fn register(&self, id: &PeerId) -> Result<Arc<dyn LocalIdentity>, PairingError> {
                self.0.register(id).await
            }
            async fn dial(&self, _from: &PeerId, _to: &PeerId) -> Result<Channel, PairingError> {
                std::future::pending().await
            }
        }

        let endpoint = Endpoint::new(
            EndpointRole::Initiator,
            peer("guest"),
            Arc::new(SilentBroker(MemoryBroker::new())),
        );
        endpoint.open().await.unwrap();
        let err = endpoint
            .connect_within(&peer("host"), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, PairingError::Timeout(_)));
        assert!(matches!(endpoint.state(), EndpointState::Failed(PairingError::Timeout(_))));
    }

    /// Holds every dial until the gate opens
    struct GatedBroker {
        inner: MemoryBroker,
        gate: Arc<tokio::sync::Notify>,
    }

    #[async_trait::async_trait]
    impl Broker for GatedBroker {
        async fn register(&self, id: &PeerId) -> Result<Arc<dyn LocalIdentity>, PairingError> {
            self.inner.register(id).await
        }
        async fn dial(&self, from: &PeerId, to: &PeerId) -> Result<Channel, PairingError> {
            self.gate.notified().await;
            self.inner.dial(from, to).await
        }
    }

    #[tokio::test]
    async fn test_invariants_checked() {
        crate::invariant_ppt::clear_invariant_log();
        let broker = MemoryBroker::new();
        let (responder, initiator) = paired(&broker).await;
        initiator.close();
        responder.close();

        // a dial that resolves after close takes the stale path
        let gate = Arc::new(tokio::sync::Notify::new());
        let late = Endpoint::new(
            EndpointRole::Initiator,
            peer("late"),
            Arc::new(GatedBroker {
                inner: broker.clone(),
                gate: gate.clone(),
            }),
        );
        late.open().await.unwrap();
        let cancel = async {
            tokio::task::yield_now().await;
            late.close();
            gate.notify_one();
        };
        let host_peer = peer("host");
        let (connected, ()) = tokio::join!(late.connect(&host_peer), cancel);
        assert!(connected.is_err());

        crate::invariant_ppt::contract_test(
            "endpoint lifecycle",
            &[names::SINGLE_CHANNEL, names::TERMINAL_STATE],
        );
    }
}
