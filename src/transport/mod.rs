//! Peer identities, channels and the rendezvous seam.
//!
//! A [`Broker`] resolves a peer id to a live byte stream. The endpoint state
//! machine only ever talks to these traits; [`memory::MemoryBroker`] serves
//! in-process pairs and [`relay::RelayBroker`] talks to a
//! [`relay::RendezvousServer`] over TCP.

pub mod memory;
pub mod relay;

use crate::codec::{read_frame, write_frame};
use crate::errors::PairingError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Longest accepted peer id
pub const MAX_PEER_ID_LEN: usize = 64;

/// Whether `id` is 1..=64 characters of `[A-Za-z0-9_-]`
pub fn is_valid_peer_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_PEER_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Identity a peer is reachable under at the broker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Result<Self, PairingError> {
        let id = id.into();
        if !is_valid_peer_id(&id) {
            return Err(PairingError::LocalIdentity(format!(
                "invalid peer id '{}'",
                id
            )));
        }
        Ok(Self(id))
    }

    /// For ids already checked against the same alphabet
    pub(crate) fn new_unchecked(id: String) -> Self {
        debug_assert!(is_valid_peer_id(&id));
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PeerId {
    type Error = PairingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PeerId::new(value)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Byte stream a channel runs over
pub trait ChannelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ChannelIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Reliable, ordered, bidirectional stream to one remote peer.
pub struct Channel {
    remote: PeerId,
    io: Box<dyn ChannelIo>,
}

impl Channel {
    pub fn new(remote: PeerId, io: impl ChannelIo + 'static) -> Self {
        Self {
            remote,
            io: Box::new(io),
        }
    }

    /// Peer on the other end
    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    /// Split into a frame reader and a frame writer
    pub fn into_split(self, max_frame_bytes: usize) -> (ChannelReader, ChannelWriter) {
        let (read, write) = tokio::io::split(self.io);
        (
            ChannelReader {
                inner: read,
                max_frame_bytes,
            },
            ChannelWriter { inner: write },
        )
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("remote", &self.remote).finish()
    }
}

/// Receiving half of a channel
pub struct ChannelReader {
    inner: ReadHalf<Box<dyn ChannelIo>>,
    max_frame_bytes: usize,
}

impl ChannelReader {
    /// Next frame, `None` once the remote closed cleanly
    pub async fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        read_frame(&mut self.inner, self.max_frame_bytes).await
    }
}

/// Sending half of a channel
pub struct ChannelWriter {
    inner: WriteHalf<Box<dyn ChannelIo>>,
}

impl ChannelWriter {
    pub async fn send_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        write_frame(&mut self.inner, payload).await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// A registered identity that inbound channels arrive on.
#[async_trait]
pub trait LocalIdentity: Send + Sync {
    fn id(&self) -> &PeerId;

    /// Next inbound channel. `None` once the identity is destroyed or the
    /// broker dropped it.
    async fn accept(&self) -> Option<Channel>;

    /// Unregister from the broker. Idempotent.
    fn destroy(&self);

    fn is_destroyed(&self) -> bool;
}

/// Rendezvous service resolving peer ids to channels.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Register `id` so other peers can dial it. Fails with `LocalIdentity`
    /// when the broker is unreachable or the id is taken.
    async fn register(&self, id: &PeerId) -> Result<Arc<dyn LocalIdentity>, PairingError>;

    /// Open a channel from `from` to the identity registered as `to`.
    /// Fails with `Connection`.
    async fn dial(&self, from: &PeerId, to: &PeerId) -> Result<Channel, PairingError>;
}
