//! Camera capture for the photo role.
//!
//! [`MediaCaptureController`] owns at most one acquired camera handle, turns
//! the current frame into a JPEG on demand and stops every track on release.
//! Devices come from a [`CameraProvider`]: the native backend lives behind the
//! `native-camera` feature, the synthetic one in [`crate::testing`].

#[cfg(feature = "native-camera")]
pub mod native;

use crate::assert_invariant;
use crate::errors::PairingError;
use crate::invariant_ppt::names;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// MIME type of every captured image
pub const JPEG_MIME: &str = "image/jpeg";

/// Which way the requested camera faces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Front camera
    User,
    /// Rear camera, the default for documenting a patient
    Environment,
}

/// What the caller asks of the camera
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    pub facing_mode: FacingMode,
    pub width: u32,
    pub height: u32,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            facing_mode: FacingMode::Environment,
            width: 1920,
            height: 1080,
        }
    }
}

impl From<&crate::config::CaptureSettings> for CaptureConstraints {
    fn from(settings: &crate::config::CaptureSettings) -> Self {
        Self {
            facing_mode: settings.facing_mode,
            width: settings.resolution[0],
            height: settings.resolution[1],
        }
    }
}

/// Raw RGB8 frame as produced by a camera device
#[derive(Debug, Clone)]
pub struct CameraFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub device_id: String,
}

impl CameraFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, device_id: String) -> Self {
        Self {
            data,
            width,
            height,
            device_id,
        }
    }

    /// Whether the buffer length matches an RGB8 image of this size
    pub fn is_valid(&self) -> bool {
        self.data.len() == (self.width as usize) * (self.height as usize) * 3
    }
}

/// A rasterized frame ready to be put in an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedImage {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
    pub width: u32,
    pub height: u32,
}

/// An acquired camera handle.
pub trait CameraDevice: Send {
    /// Stable identifier of the device
    fn device_id(&self) -> &str;

    /// Pull the current frame
    fn read_frame(&mut self) -> Result<CameraFrame, PairingError>;

    /// Number of tracks still running
    fn active_tracks(&self) -> usize;

    /// Stop every running track and return how many were stopped
    fn stop_tracks(&mut self) -> usize;
}

/// Grants camera handles.
pub trait CameraProvider: Send + Sync {
    /// Request camera access. Fails with `PermissionDenied` or
    /// `DeviceUnavailable`.
    fn open(&self, constraints: &CaptureConstraints) -> Result<Box<dyn CameraDevice>, PairingError>;
}

/// Controller shared between a capture flow and the endpoint that must
/// release it on teardown.
pub type SharedCapture = Arc<Mutex<MediaCaptureController>>;

/// Acquires, rasterizes and releases a single camera device.
pub struct MediaCaptureController {
    provider: Arc<dyn CameraProvider>,
    device: Option<Box<dyn CameraDevice>>,
    jpeg_quality: u8,
    releases: usize,
}

impl MediaCaptureController {
    pub fn new(provider: Arc<dyn CameraProvider>, jpeg_quality: u8) -> Self {
        Self {
            provider,
            device: None,
            jpeg_quality: jpeg_quality.clamp(1, 100),
            releases: 0,
        }
    }

    /// Wrap the controller so it can be attached to an endpoint
    pub fn into_shared(self) -> SharedCapture {
        Arc::new(Mutex::new(self))
    }

    /// Request camera access with the given constraints.
    ///
    /// An already acquired handle is released first so the controller never
    /// holds two devices.
    pub fn acquire(&mut self, constraints: &CaptureConstraints) -> Result<(), PairingError> {
        if self.device.is_some() {
            log::debug!("Releasing current camera before re-acquiring");
            self.release();
        }

        log::info!(
            "Acquiring camera: facing={:?} {}x{}",
            constraints.facing_mode,
            constraints.width,
            constraints.height
        );

        let device = self.provider.open(constraints).map_err(|e| {
            log::warn!("Camera acquisition failed: {}", e);
            e
        })?;

        assert_invariant!(
            self.device.is_none(),
            names::SINGLE_CAMERA_HANDLE,
            "capture::acquire"
        );
        self.device = Some(device);
        Ok(())
    }

    pub fn is_acquired(&self) -> bool {
        self.device.is_some()
    }

    /// Tracks currently running on the acquired device
    pub fn active_tracks(&self) -> usize {
        self.device.as_ref().map_or(0, |d| d.active_tracks())
    }

    /// Number of release sequences that ran on this controller
    pub fn release_count(&self) -> usize {
        self.releases
    }

    /// Rasterize the current frame to JPEG at the configured quality.
    /// May be called repeatedly while acquired.
    pub fn capture_frame(&mut self) -> Result<CapturedImage, PairingError> {
        let device = self.device.as_mut().ok_or_else(|| {
            PairingError::DeviceUnavailable("camera not acquired".to_string())
        })?;

        let frame = device.read_frame()?;
        log::debug!(
            "Captured {}x{} frame from {}",
            frame.width,
            frame.height,
            frame.device_id
        );
        encode_jpeg(frame, self.jpeg_quality)
    }

    /// Stop all tracks and drop the handle. Safe with nothing acquired;
    /// returns the number of tracks stopped.
    pub fn release(&mut self) -> usize {
        self.releases += 1;
        match self.device.take() {
            Some(mut device) => {
                let stopped = device.stop_tracks();
                log::info!(
                    "Released camera {} ({} track(s) stopped)",
                    device.device_id(),
                    stopped
                );
                stopped
            }
            None => {
                log::debug!("Camera release with no active tracks");
                0
            }
        }
    }
}

impl Drop for MediaCaptureController {
    fn drop(&mut self) {
        if self.device.is_some() {
            self.release();
        }
    }
}

fn encode_jpeg(frame: CameraFrame, quality: u8) -> Result<CapturedImage, PairingError> {
    let (width, height) = (frame.width, frame.height);
    let img = image::RgbImage::from_vec(width, height, frame.data).ok_or_else(|| {
        PairingError::Encoding("Failed to create image from frame data".to_string())
    })?;

    let mut bytes = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut bytes, quality);
    image::DynamicImage::ImageRgb8(img)
        .write_with_encoder(encoder)
        .map_err(|e| PairingError::Encoding(format!("Failed to encode JPEG: {}", e)))?;

    Ok(CapturedImage {
        bytes,
        mime_type: JPEG_MIME,
        width,
        height,
    })
}
