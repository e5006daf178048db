use crate::config::ChartlinkConfig;
use crate::endpoint::EndpointState;
use crate::errors::PairingError;
use crate::flow::{self, Document};
use crate::pairing_qr::PairingQr;
use crate::session::{Session, SessionOptions, SessionRole};
use crate::transport::relay::RelayBroker;
use crate::transport::Broker;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tauri::{command, State};
use tokio::sync::Mutex;

/// Sessions owned by the plugin, keyed by session id
pub struct PairingState {
    broker: Arc<dyn Broker>,
    config: ChartlinkConfig,
    sessions: Arc<Mutex<HashMap<String, Arc<Session>>>>,
}

impl PairingState {
    pub fn new(broker: Arc<dyn Broker>, config: ChartlinkConfig) -> Self {
        Self {
            broker,
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Talk to the relay named in `config`
    pub fn from_config(config: ChartlinkConfig) -> Self {
        let broker = Arc::new(RelayBroker::new(config.pairing.broker_addr.clone()));
        Self::new(broker, config)
    }

    async fn session(&self, id: &str) -> Result<Arc<Session>, PairingError> {
        self.sessions
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PairingError::InvalidPairingUrl(format!("no session '{}'", id)))
    }

    async fn create(&self, role: SessionRole) -> Result<PairingInfo, PairingError> {
        let session = Session::create(role, self.broker.clone(), SessionOptions::from(&self.config)).await?;
        let info = PairingInfo::render(&session, &PairingQr::from(&self.config.qr))?;
        self.sessions
            .lock()
            .await
            .insert(session.id().to_string(), Arc::new(session));
        Ok(info)
    }

    async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.lock().await.remove(id);
        if let Some(session) = &removed {
            session.close();
        }
        removed
    }

    /// Drop the entry once the session's endpoint reaches a terminal state
    fn forget_when_terminal(&self, id: String, session: Arc<Session>) {
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let mut states = session.endpoint().subscribe_state();
            while !states.borrow_and_update().is_terminal() {
                if states.changed().await.is_err() {
                    break;
                }
            }
            sessions.lock().await.remove(&id);
            log::debug!("Forgot finished session {}", id);
        });
    }

    /// Send `document` over session `id`. A failed share closes the session.
    async fn share(&self, id: &str, document: &Document) -> Result<PairingStatus, PairingError> {
        let session = self.session(id).await?;
        match flow::share_document(&session, document, session.options().listen_timeout).await {
            Ok(envelope) => {
                log::info!("Shared document ({} bytes)", envelope.len());
                let status = PairingStatus::new(id, &session.state());
                self.forget_when_terminal(id.to_string(), session);
                Ok(status)
            }
            Err(e) => {
                self.remove(id).await;
                Err(e)
            }
        }
    }
}

/// What the frontend needs to show a pairing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingInfo {
    pub session_id: String,
    pub role: SessionRole,
    pub url: String,
    /// PNG QR code, base64
    pub qr_png: String,
    pub qr_svg: String,
}

impl PairingInfo {
    fn render(session: &Session, qr: &PairingQr) -> Result<Self, PairingError> {
        let image = qr.render_pairing(session)?;
        Ok(Self {
            session_id: session.id().to_string(),
            role: session.role(),
            url: session.url().to_string(),
            qr_png: STANDARD.encode(image.to_png()?),
            qr_svg: image.to_svg(256),
        })
    }
}

/// Endpoint state as reported to the frontend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingStatus {
    pub session_id: String,
    pub state: String,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub can_retry: bool,
    pub confirmed: bool,
}

impl PairingStatus {
    fn new(session_id: &str, state: &EndpointState) -> Self {
        Self {
            session_id: session_id.to_string(),
            state: state.name().to_string(),
            error: state.error().map(|e| e.to_string()),
            error_kind: state.error().map(|e| e.kind().to_string()),
            can_retry: state.can_retry(),
            confirmed: state.is_confirmed(),
        }
    }
}

/// A received payload, base64 encoded for IPC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceivedPayload {
    pub kind: String,
    pub filename: Option<String>,
    pub data: String,
    pub size: usize,
    pub created_at: String,
}

/// Create a session for `role` ("photo" or "pdf") and render its QR code
#[command]
pub async fn create_pairing_session(
    state: State<'_, PairingState>,
    role: String,
) -> Result<PairingInfo, String> {
    let role = SessionRole::from_flag(&role).ok_or_else(|| format!("Unknown session role: {}", role))?;
    match state.create(role).await {
        Ok(info) => {
            log::info!("Pairing session {} ready at {}", info.session_id, info.url);
            Ok(info)
        }
        Err(e) => {
            log::error!("Failed to create pairing session: {}", e);
            Err(format!("Failed to create pairing session: {}", e))
        }
    }
}

/// Replace a session with a fresh one of the same role
#[command]
pub async fn regenerate_pairing_session(
    state: State<'_, PairingState>,
    session_id: String,
) -> Result<PairingInfo, String> {
    let old = state
        .remove(&session_id)
        .await
        .ok_or_else(|| format!("Failed to regenerate pairing session: no session '{}'", session_id))?;

    match state.create(old.role()).await {
        Ok(info) => {
            log::info!("Regenerated session {} as {}", session_id, info.session_id);
            Ok(info)
        }
        Err(e) => {
            log::error!("Failed to regenerate pairing session: {}", e);
            Err(format!("Failed to regenerate pairing session: {}", e))
        }
    }
}

#[command]
pub async fn get_pairing_state(
    state: State<'_, PairingState>,
    session_id: String,
) -> Result<PairingStatus, String> {
    let session = state.session(&session_id).await.map_err(|e| e.to_string())?;
    Ok(PairingStatus::new(&session_id, &session.state()))
}

/// Wait for the secondary's photo. The session is closed afterwards.
#[command]
pub async fn receive_photo(
    state: State<'_, PairingState>,
    session_id: String,
) -> Result<ReceivedPayload, String> {
    let session = state.session(&session_id).await.map_err(|e| e.to_string())?;
    let timeout = session.options().listen_timeout;

    let result = flow::receive_photo(&session, timeout).await;
    state.sessions.lock().await.remove(&session_id);

    match result {
        Ok(envelope) => {
            log::info!("Received photo ({} bytes)", envelope.len());
            Ok(ReceivedPayload {
                kind: envelope.kind().to_string(),
                filename: envelope.filename().map(str::to_string),
                data: STANDARD.encode(envelope.payload()),
                size: envelope.len(),
                created_at: envelope.created_at().to_rfc3339(),
            })
        }
        Err(e) => {
            log::error!("Failed to receive photo: {}", e);
            Err(format!("Failed to receive photo: {}", e))
        }
    }
}

/// Send a finished document to the secondary once it connects. The session
/// is dropped once the secondary hangs up, or at once if the share fails.
#[command]
pub async fn share_document(
    state: State<'_, PairingState>,
    session_id: String,
    data: String,
    filename: String,
    display_name: Option<String>,
) -> Result<PairingStatus, String> {
    let bytes = STANDARD
        .decode(data.as_bytes())
        .map_err(|e| format!("Failed to decode document: {}", e))?;
    let document = Document {
        bytes,
        display_name: display_name.unwrap_or_else(|| filename.clone()),
        filename,
    };

    match state.share(&session_id, &document).await {
        Ok(status) => Ok(status),
        Err(e) => {
            log::error!("Failed to share document: {}", e);
            Err(format!("Failed to share document: {}", e))
        }
    }
}

#[command]
pub async fn close_pairing_session(
    state: State<'_, PairingState>,
    session_id: String,
) -> Result<(), String> {
    match state.remove(&session_id).await {
        Some(_) => {
            log::info!("Closed pairing session {}", session_id);
            Ok(())
        }
        None => Err(format!("Failed to close pairing session: no session '{}'", session_id)),
    }
}
