//! In-process broker.
//!
//! Channels are `tokio::io::duplex` pairs, so both endpoints of a pairing can
//! live in one process (tests, the CLI demo, a desktop app pairing with its
//! own webview).

use super::{Broker, Channel, LocalIdentity, PeerId};
use crate::config::TransferConfig;
use crate::errors::PairingError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Default duplex buffer per channel direction
pub const DEFAULT_BUFFER: usize = 64 * 1024;

struct Registry {
    peers: Mutex<HashMap<PeerId, mpsc::UnboundedSender<Channel>>>,
    buffer: usize,
    destroyed: AtomicUsize,
}

impl Registry {
    fn peers(&self) -> MutexGuard<'_, HashMap<PeerId, mpsc::UnboundedSender<Channel>>> {
        self.peers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Broker keeping every identity in a process-local map
#[derive(Clone)]
pub struct MemoryBroker {
    registry: Arc<Registry>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            registry: Arc::new(Registry {
                peers: Mutex::new(HashMap::new()),
                buffer: buffer.max(1),
                destroyed: AtomicUsize::new(0),
            }),
        }
    }

    /// Duplex buffer each new channel gets per direction
    pub fn buffer(&self) -> usize {
        self.registry.buffer
    }

    /// Identities currently registered
    pub fn live_identities(&self) -> usize {
        self.registry.peers().len()
    }

    /// Identities destroyed over the broker's lifetime
    pub fn destroyed_identities(&self) -> usize {
        self.registry.destroyed.load(Ordering::SeqCst)
    }

    pub fn is_registered(&self, id: &PeerId) -> bool {
        self.registry.peers().contains_key(id)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&TransferConfig> for MemoryBroker {
    fn from(config: &TransferConfig) -> Self {
        Self::with_buffer(config.memory_channel_buffer)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn register(&self, id: &PeerId) -> Result<Arc<dyn LocalIdentity>, PairingError> {
        let mut peers = self.registry.peers();
        if peers.contains_key(id) {
            return Err(PairingError::LocalIdentity(format!(
                "peer id '{}' is already registered",
                id
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        peers.insert(id.clone(), tx);
        log::debug!("Registered in-memory identity {}", id);

        Ok(Arc::new(MemoryIdentity {
            id: id.clone(),
            incoming: tokio::sync::Mutex::new(rx),
            registry: self.registry.clone(),
            destroyed: AtomicBool::new(false),
        }))
    }

    async fn dial(&self, from: &PeerId, to: &PeerId) -> Result<Channel, PairingError> {
        let acceptor = self
            .registry
            .peers()
            .get(to)
            .cloned()
            .ok_or_else(|| PairingError::Connection(format!("no peer registered as '{}'", to)))?;

        let (local, remote) = tokio::io::duplex(self.registry.buffer);
        acceptor
            .send(Channel::new(from.clone(), remote))
            .map_err(|_| PairingError::Connection(format!("peer '{}' stopped accepting", to)))?;

        log::debug!("In-memory channel {} -> {}", from, to);
        Ok(Channel::new(to.clone(), local))
    }
}

struct MemoryIdentity {
    id: PeerId,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Channel>>,
    registry: Arc<Registry>,
    destroyed: AtomicBool,
}

#[async_trait]
impl LocalIdentity for MemoryIdentity {
    fn id(&self) -> &PeerId {
        &self.id
    }

    async fn accept(&self) -> Option<Channel> {
        if self.is_destroyed() {
            return None;
        }
        self.incoming.lock().await.recv().await
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry.peers().remove(&self.id);
        self.registry.destroyed.fetch_add(1, Ordering::SeqCst);
        log::debug!("Destroyed in-memory identity {}", self.id);
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl Drop for MemoryIdentity {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> PeerId {
        PeerId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_register_rejects_taken_id() {
        let broker = MemoryBroker::new();
        let _first = broker.register(&peer("abc")).await.unwrap();
        let err = broker.register(&peer("abc")).await.err().unwrap();
        assert!(matches!(err, PairingError::LocalIdentity(_)));
    }

    #[tokio::test]
    async fn test_dial_unknown_peer_is_connection_error() {
        let broker = MemoryBroker::new();
        let err = broker.dial(&peer("a"), &peer("nobody")).await.unwrap_err();
        assert!(matches!(err, PairingError::Connection(_)));
    }

    #[tokio::test]
    async fn test_dial_delivers_channel_to_acceptor() {
        let broker = MemoryBroker::new();
        let identity = broker.register(&peer("host")).await.unwrap();

        let outbound = broker.dial(&peer("guest"), &peer("host")).await.unwrap();
        let inbound = identity.accept().await.unwrap();

        assert_eq!(outbound.remote().as_str(), "host");
        assert_eq!(inbound.remote().as_str(), "guest");
    }

    #[tokio::test]
    async fn test_destroy_unregisters_once() {
        let broker = MemoryBroker::new();
        let identity = broker.register(&peer("host")).await.unwrap();
        assert_eq!(broker.live_identities(), 1);

        identity.destroy();
        identity.destroy();
        assert!(identity.is_destroyed());
        assert_eq!(broker.live_identities(), 0);
        assert_eq!(broker.destroyed_identities(), 1);
        assert!(identity.accept().await.is_none());

        // the id is free again
        assert!(broker.register(&peer("host")).await.is_ok());
    }

    #[tokio::test]
    async fn test_configured_buffer_carries_larger_frames() {
        let mut transfer = crate::config::ChartlinkConfig::default().transfer;
        transfer.memory_channel_buffer = 16;
        let broker = MemoryBroker::from(&transfer);
        assert_eq!(broker.buffer(), 16);

        let identity = broker.register(&peer("host")).await.unwrap();
        let outbound = broker.dial(&peer("guest"), &peer("host")).await.unwrap();
        let inbound = identity.accept().await.unwrap();

        let (_, mut writer) = outbound.into_split(transfer.max_frame_bytes);
        let (mut reader, _) = inbound.into_split(transfer.max_frame_bytes);
        let payload = vec![7u8; 4096];
        let (sent, received) = tokio::join!(writer.send_frame(&payload), reader.next_frame());
        sent.unwrap();
        assert_eq!(received.unwrap(), Some(payload));
    }

    #[tokio::test]
    async fn test_drop_destroys_identity() {
        let broker = MemoryBroker::new();
        {
            let _identity = broker.register(&peer("host")).await.unwrap();
        }
        assert!(!broker.is_registered(&peer("host")));
    }
}
