use super::protocol::{read_message, write_message, Reply, Request};
use crate::errors::PairingError;
use crate::transport::{Broker, Channel, LocalIdentity, PeerId};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Broker that reaches peers through a [`super::RendezvousServer`].
#[derive(Debug, Clone)]
pub struct RelayBroker {
    addr: String,
}

impl RelayBroker {
    /// `addr` is the relay's `host:port`
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Broker for RelayBroker {
    async fn register(&self, id: &PeerId) -> Result<Arc<dyn LocalIdentity>, PairingError> {
        let mut control = TcpStream::connect(&self.addr).await.map_err(|e| {
            PairingError::LocalIdentity(format!("relay unreachable at {}: {}", self.addr, e))
        })?;

        let request = Request::Register {
            id: id.to_string(),
        };
        write_message(&mut control, &request)
            .await
            .map_err(|e| PairingError::LocalIdentity(format!("Failed to register: {}", e)))?;

        match read_message::<_, Reply>(&mut control).await {
            Ok(Some(Reply::Ok)) => {}
            Ok(Some(Reply::Error { message })) => return Err(PairingError::LocalIdentity(message)),
            Ok(Some(other)) => {
                return Err(PairingError::LocalIdentity(format!(
                    "unexpected relay reply {:?}",
                    other
                )))
            }
            Ok(None) => {
                return Err(PairingError::LocalIdentity(
                    "relay closed during registration".to_string(),
                ))
            }
            Err(e) => return Err(PairingError::LocalIdentity(format!("Failed to register: {}", e))),
        }

        log::info!("Registered {} with relay {}", id, self.addr);
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(control_loop(control, self.addr.clone(), tx));

        Ok(Arc::new(RelayIdentity {
            id: id.clone(),
            incoming: tokio::sync::Mutex::new(rx),
            control: Mutex::new(Some(task)),
            destroyed: AtomicBool::new(false),
        }))
    }

    async fn dial(&self, from: &PeerId, to: &PeerId) -> Result<Channel, PairingError> {
        let mut stream = TcpStream::connect(&self.addr).await.map_err(|e| {
            PairingError::Connection(format!("relay unreachable at {}: {}", self.addr, e))
        })?;

        let request = Request::Dial {
            from: from.to_string(),
            to: to.to_string(),
        };
        write_message(&mut stream, &request).await?;

        match read_message::<_, Reply>(&mut stream).await? {
            Some(Reply::Ok) => {
                log::info!("Relay channel open {} -> {}", from, to);
                Ok(Channel::new(to.clone(), stream))
            }
            Some(Reply::Error { message }) => Err(PairingError::Connection(message)),
            Some(other) => Err(PairingError::Connection(format!(
                "unexpected relay reply {:?}",
                other
            ))),
            None => Err(PairingError::Connection(
                "relay closed before the dial was answered".to_string(),
            )),
        }
    }
}

/// Follow the control line and turn every `incoming` notice into an
/// accepted channel, in the order the relay announced them.
async fn control_loop(mut control: TcpStream, addr: String, channels: mpsc::UnboundedSender<Channel>) {
    loop {
        match read_message::<_, Reply>(&mut control).await {
            Ok(Some(Reply::Incoming { token, from })) => {
                let remote = match PeerId::new(from) {
                    Ok(remote) => remote,
                    Err(e) => {
                        log::warn!("Ignoring dial with bad peer id: {}", e);
                        continue;
                    }
                };
                match accept_token(&addr, token).await {
                    Ok(stream) => {
                        if channels.send(Channel::new(remote, stream)).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Failed to accept dial from {}: {}", remote, e),
                }
            }
            Ok(Some(other)) => log::debug!("Ignoring control reply {:?}", other),
            Ok(None) => {
                log::info!("Relay closed the control line");
                break;
            }
            Err(e) => {
                log::warn!("Relay control line failed: {}", e);
                break;
            }
        }
    }
}

async fn accept_token(addr: &str, token: u64) -> Result<TcpStream, PairingError> {
    let mut stream = TcpStream::connect(addr).await?;
    write_message(&mut stream, &Request::Accept { token }).await?;
    match read_message::<_, Reply>(&mut stream).await? {
        Some(Reply::Ok) => Ok(stream),
        Some(Reply::Error { message }) => Err(PairingError::Connection(message)),
        _ => Err(PairingError::Connection(format!(
            "relay did not confirm token {}",
            token
        ))),
    }
}

struct RelayIdentity {
    id: PeerId,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Channel>>,
    control: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

#[async_trait]
impl LocalIdentity for RelayIdentity {
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
        // dropping the control socket unregisters the id at the relay
        let task = self
            .control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        log::debug!("Destroyed relay identity {}", self.id);
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl Drop for RelayIdentity {
    fn drop(&mut self) {
        self.destroy();
    }
}
