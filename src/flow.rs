//! The two exchanges a pairing exists for.
//!
//! Photo: the secondary acquires its camera, takes (and possibly retakes) a
//! shot and sends it; the primary receives exactly one JPEG. Document: the
//! primary asks its [`DocumentSource`] for the finished file once the
//! secondary is connected and sends it; the secondary receives it.

use crate::capture::{CaptureConstraints, CapturedImage, SharedCapture};
use crate::codec::{encode, Envelope, PayloadKind};
use crate::endpoint::Endpoint;
use crate::errors::PairingError;
use crate::session::{JoinedSession, Session};
use std::sync::{MutexGuard, PoisonError};
use std::time::Duration;

/// A finished document ready to share
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub display_name: String,
}

/// Produces the document on demand. The pairing layer does not know how it
/// was authored.
pub trait DocumentSource: Send + Sync {
    fn produce(&self) -> Result<Document, PairingError>;
}

impl DocumentSource for Document {
    fn produce(&self) -> Result<Document, PairingError> {
        Ok(self.clone())
    }
}

impl<F> DocumentSource for F
where
    F: Fn() -> Result<Document, PairingError> + Send + Sync,
{
    fn produce(&self) -> Result<Document, PairingError> {
        self()
    }
}

fn lock_capture(
    capture: &SharedCapture,
) -> MutexGuard<'_, crate::capture::MediaCaptureController> {
    capture.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Secondary-side photo capture bound to one endpoint.
pub struct PhotoFlow {
    capture: SharedCapture,
    constraints: CaptureConstraints,
    current: Option<CapturedImage>,
}

impl PhotoFlow {
    /// Hand `capture` to the endpoint and acquire the camera. If access is
    /// refused the endpoint fails with the same reason and its release
    /// sequence runs.
    pub fn start(
        endpoint: &Endpoint,
        capture: SharedCapture,
        constraints: CaptureConstraints,
    ) -> Result<Self, PairingError> {
        endpoint.attach_capture(capture.clone());
        let mut flow = Self {
            capture,
            constraints,
            current: None,
        };
        flow.acquire(endpoint)?;
        Ok(flow)
    }

    fn acquire(&mut self, endpoint: &Endpoint) -> Result<(), PairingError> {
        let acquired = lock_capture(&self.capture).acquire(&self.constraints);
        if let Err(e) = acquired {
            endpoint.fail(e.clone());
            return Err(e);
        }
        Ok(())
    }

    /// Take a shot, replacing any previous one
    pub fn capture(&mut self) -> Result<&CapturedImage, PairingError> {
        let image = lock_capture(&self.capture).capture_frame()?;
        log::debug!("Captured {} bytes of {}", image.bytes.len(), image.mime_type);
        Ok(self.current.insert(image))
    }

    /// The shot that `submit` would send
    pub fn current(&self) -> Option<&CapturedImage> {
        self.current.as_ref()
    }

    /// Discard the current shot and release the camera. Returns the number
    /// of tracks stopped.
    pub fn cancel(&mut self) -> usize {
        self.current = None;
        lock_capture(&self.capture).release()
    }

    /// Reacquire the camera after [`PhotoFlow::cancel`]
    pub fn resume(&mut self, endpoint: &Endpoint) -> Result<(), PairingError> {
        self.acquire(endpoint)
    }

    /// Send the current shot. A successful send releases the camera.
    pub async fn submit(self, endpoint: &Endpoint) -> Result<Envelope, PairingError> {
        let image = self.current.ok_or_else(|| {
            PairingError::DeviceUnavailable("no photo captured".to_string())
        })?;

        let filename = format!("photo-{}.jpg", chrono::Utc::now().format("%Y%m%d-%H%M%S"));
        let envelope = encode(image.bytes, PayloadKind::Photo, Some(filename), None);
        endpoint.send(&envelope).await?;
        Ok(envelope)
    }
}

/// Primary side of the photo flow: wait for the secondary, receive the one
/// photo, close.
pub async fn receive_photo(session: &Session, timeout: Option<Duration>) -> Result<Envelope, PairingError> {
    let envelope = session.next_envelope(timeout).await?;
    expect_kind(&envelope, PayloadKind::Photo)?;
    log::info!("Received photo for session {} ({} bytes)", session.id(), envelope.len());
    session.close();
    Ok(envelope)
}

/// Primary side of the document flow: once the secondary connects, produce
/// the document and send it.
pub async fn share_document(
    session: &Session,
    source: &dyn DocumentSource,
    timeout: Option<Duration>,
) -> Result<Envelope, PairingError> {
    let remote = session.wait_for_peer(timeout).await?;
    let document = source.produce()?;
    log::info!(
        "Sharing {} ({} bytes) with {}",
        document.filename,
        document.bytes.len(),
        remote
    );

    let envelope = encode(
        document.bytes,
        PayloadKind::Document,
        Some(document.filename),
        Some(document.display_name),
    );
    session.send(&envelope).await?;
    Ok(envelope)
}

/// Secondary side of the document flow
pub async fn receive_document(
    joined: &JoinedSession,
    timeout: Option<Duration>,
) -> Result<Envelope, PairingError> {
    let envelope = joined.next_envelope(timeout).await?;
    expect_kind(&envelope, PayloadKind::Document)?;
    log::info!(
        "Received document {} ({} bytes)",
        envelope.filename().unwrap_or("<unnamed>"),
        envelope.len()
    );
    joined.close();
    Ok(envelope)
}

fn expect_kind(envelope: &Envelope, kind: PayloadKind) -> Result<(), PairingError> {
    if envelope.kind() != kind {
        return Err(PairingError::UnknownMessageType(format!(
            "expected {} envelope, got {}",
            kind,
            envelope.kind()
        )));
    }
    Ok(())
}
