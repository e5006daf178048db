use super::protocol::{read_message, write_message, Reply, Request};
use crate::errors::PairingError;
use crate::transport::is_valid_peer_id;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};

/// How long a dial waits for the registered peer to accept
pub const DEFAULT_PENDING_WINDOW: Duration = Duration::from_secs(30);

#[derive(Default)]
struct RelayState {
    registered: Mutex<HashMap<String, mpsc::UnboundedSender<Reply>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<TcpStream>>>,
    next_token: AtomicU64,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Rendezvous relay: registers identities and splices dials to them.
pub struct RendezvousServer {
    listener: TcpListener,
    state: Arc<RelayState>,
    pending_window: Duration,
}

impl RendezvousServer {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, PairingError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| PairingError::Connection(format!("Failed to bind relay: {}", e)))?;
        Ok(Self {
            listener,
            state: Arc::new(RelayState::default()),
            pending_window: DEFAULT_PENDING_WINDOW,
        })
    }

    pub fn with_pending_window(mut self, window: Duration) -> Self {
        self.pending_window = window;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, PairingError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the listener fails.
    pub async fn run(self) -> Result<(), PairingError> {
        log::info!(
            "Rendezvous relay listening on {}",
            self.listener.local_addr()?
        );
        loop {
            let (socket, addr) = self.listener.accept().await?;
            let state = self.state.clone();
            let window = self.pending_window;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(socket, state, window).await {
                    log::debug!("Relay connection {} ended: {}", addr, e);
                }
            });
        }
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    state: Arc<RelayState>,
    window: Duration,
) -> std::io::Result<()> {
    let Some(request) = read_message::<_, Request>(&mut socket).await? else {
        return Ok(());
    };

    match request {
        Request::Register { id } => serve_control(socket, state, id).await,
        Request::Dial { from, to } => serve_dial(socket, state, window, from, to).await,
        Request::Accept { token } => serve_accept(socket, state, token).await,
    }
}

async fn serve_control(
    mut socket: TcpStream,
    state: Arc<RelayState>,
    id: String,
) -> std::io::Result<()> {
    if !is_valid_peer_id(&id) {
        return write_message(&mut socket, &Reply::error(format!("invalid peer id '{}'", id))).await;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let claimed = {
        let mut registered = locked(&state.registered);
        if registered.contains_key(&id) {
            false
        } else {
            registered.insert(id.clone(), tx.clone());
            true
        }
    };
    if !claimed {
        return write_message(
            &mut socket,
            &Reply::error(format!("peer id '{}' is already registered", id)),
        )
        .await;
    }
    log::info!("Registered identity {}", id);

    let result: std::io::Result<()> = async {
        write_message(&mut socket, &Reply::Ok).await?;
        let (mut read, mut write) = socket.split();
        let mut probe = [0u8; 64];
        loop {
            tokio::select! {
                notice = rx.recv() => match notice {
                    Some(reply) => write_message(&mut write, &reply).await?,
                    None => return Ok(()),
                },
                n = read.read(&mut probe) => {
                    // control lines carry nothing after registration
                    if n? == 0 {
                        return Ok(());
                    }
                }
            }
        }
    }
    .await;

    {
        let mut registered = locked(&state.registered);
        if registered.get(&id).is_some_and(|current| current.same_channel(&tx)) {
            registered.remove(&id);
        }
    }
    log::info!("Unregistered identity {}", id);
    result
}

async fn serve_dial(
    mut socket: TcpStream,
    state: Arc<RelayState>,
    window: Duration,
    from: String,
    to: String,
) -> std::io::Result<()> {
    let control = locked(&state.registered).get(&to).cloned();
    let Some(control) = control else {
        return write_message(&mut socket, &Reply::error(format!("no peer registered as '{}'", to))).await;
    };

    let token = state.next_token.fetch_add(1, Ordering::SeqCst);
    let (tx, rx) = oneshot::channel();
    locked(&state.pending).insert(token, tx);

    if control
        .send(Reply::Incoming {
            token,
            from: from.clone(),
        })
        .is_err()
    {
        locked(&state.pending).remove(&token);
        return write_message(&mut socket, &Reply::error(format!("peer '{}' went away", to))).await;
    }

    let mut acceptor = match tokio::time::timeout(window, rx).await {
        Ok(Ok(acceptor)) => acceptor,
        _ => {
            locked(&state.pending).remove(&token);
            log::warn!("Dial {} -> {} was not accepted", from, to);
            return write_message(&mut socket, &Reply::error(format!("peer '{}' did not accept", to)))
                .await;
        }
    };

    write_message(&mut socket, &Reply::Ok).await?;
    log::info!("Spliced channel {} -> {}", from, to);
    let (up, down) = tokio::io::copy_bidirectional(&mut socket, &mut acceptor).await?;
    log::debug!("Channel {} -> {} closed ({} / {} bytes)", from, to, up, down);
    Ok(())
}

async fn serve_accept(
    mut socket: TcpStream,
    state: Arc<RelayState>,
    token: u64,
) -> std::io::Result<()> {
    let pending = locked(&state.pending).remove(&token);
    let Some(pending) = pending else {
        return write_message(&mut socket, &Reply::error(format!("unknown token {}", token))).await;
    };

    write_message(&mut socket, &Reply::Ok).await?;
    if pending.send(socket).is_err() {
        log::debug!("Dialer for token {} gave up before accept", token);
    }
    Ok(())
}
