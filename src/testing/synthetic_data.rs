//! Synthetic camera for offline runs
//!
//! Produces gradient frames that change every capture, and can be told to
//! refuse access the way a phone browser does when the user denies the camera
//! prompt or another app holds the device.

use crate::capture::{CameraDevice, CameraFrame, CameraProvider, CaptureConstraints};
use crate::errors::PairingError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Create a synthetic RGB8 frame with a gradient that shifts per frame number
pub fn synthetic_video_frame(frame_number: u64, width: u32, height: u32) -> CameraFrame {
    let mut data = vec![0u8; (width * height * 3) as usize];

    let base = (frame_number % 256) as u8;
    for y in 0..height {
        for x in 0..width {
            let idx = ((y * width + x) * 3) as usize;
            data[idx] = base.wrapping_add((x % 256) as u8);
            data[idx + 1] = base.wrapping_add((y % 256) as u8);
            data[idx + 2] = base.wrapping_add(((x + y) % 256) as u8);
        }
    }

    CameraFrame::new(data, width, height, "synthetic_camera".to_string())
}

/// How the synthetic provider answers `open`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticBehavior {
    Grant,
    PermissionDenied,
    Unavailable,
}

#[derive(Debug, Default)]
struct Counters {
    opened: AtomicUsize,
    open_devices: AtomicUsize,
    frames: AtomicUsize,
    tracks_stopped: AtomicUsize,
}

/// Camera provider backed by [`synthetic_video_frame`]
pub struct SyntheticCameraProvider {
    behavior: SyntheticBehavior,
    counters: Arc<Counters>,
}

impl SyntheticCameraProvider {
    pub fn new() -> Self {
        Self::with_behavior(SyntheticBehavior::Grant)
    }

    pub fn with_behavior(behavior: SyntheticBehavior) -> Self {
        Self {
            behavior,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Handles granted so far
    pub fn devices_opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    /// Handles granted and not yet stopped
    pub fn open_devices(&self) -> usize {
        self.counters.open_devices.load(Ordering::SeqCst)
    }

    pub fn frames_served(&self) -> usize {
        self.counters.frames.load(Ordering::SeqCst)
    }

    pub fn tracks_stopped(&self) -> usize {
        self.counters.tracks_stopped.load(Ordering::SeqCst)
    }
}

impl Default for SyntheticCameraProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraProvider for SyntheticCameraProvider {
    fn open(&self, constraints: &CaptureConstraints) -> Result<Box<dyn CameraDevice>, PairingError> {
        match self.behavior {
            SyntheticBehavior::PermissionDenied => {
                return Err(PairingError::PermissionDenied(
                    "user dismissed the camera prompt".to_string(),
                ))
            }
            SyntheticBehavior::Unavailable => {
                return Err(PairingError::DeviceUnavailable(
                    "no camera matches the requested constraints".to_string(),
                ))
            }
            SyntheticBehavior::Grant => {}
        }

        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        self.counters.open_devices.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SyntheticCamera {
            width: constraints.width,
            height: constraints.height,
            frame_number: 0,
            running: true,
            counters: self.counters.clone(),
        }))
    }
}

struct SyntheticCamera {
    width: u32,
    height: u32,
    frame_number: u64,
    running: bool,
    counters: Arc<Counters>,
}

impl CameraDevice for SyntheticCamera {
    fn device_id(&self) -> &str {
        "synthetic_camera"
    }

    fn read_frame(&mut self) -> Result<CameraFrame, PairingError> {
        if !self.running {
            return Err(PairingError::DeviceUnavailable("track stopped".to_string()));
        }
        let frame = synthetic_video_frame(self.frame_number, self.width, self.height);
        self.frame_number += 1;
        self.counters.frames.fetch_add(1, Ordering::SeqCst);
        Ok(frame)
    }

    fn active_tracks(&self) -> usize {
        usize::from(self.running)
    }

    fn stop_tracks(&mut self) -> usize {
        if !self.running {
            return 0;
        }
        self.running = false;
        self.counters.open_devices.fetch_sub(1, Ordering::SeqCst);
        self.counters.tracks_stopped.fetch_add(1, Ordering::SeqCst);
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_video_frame_correct_size() {
        let frame = synthetic_video_frame(0, 320, 240);
        assert_eq!(frame.width, 320);
        assert_eq!(frame.height, 240);
        assert!(frame.is_valid());
    }

    #[test]
    fn test_synthetic_video_frames_differ() {
        let frame0 = synthetic_video_frame(0, 32, 24);
        let frame1 = synthetic_video_frame(1, 32, 24);
        assert_ne!(frame0.data[0], frame1.data[0]);
    }

    #[test]
    fn test_unavailable_behavior() {
        let provider = SyntheticCameraProvider::with_behavior(SyntheticBehavior::Unavailable);
        let result = provider.open(&CaptureConstraints::default());
        assert!(matches!(result, Err(PairingError::DeviceUnavailable(_))));
        assert_eq!(provider.devices_opened(), 0);
    }

    #[test]
    fn test_stopped_track_refuses_frames() {
        let provider = SyntheticCameraProvider::new();
        let mut device = provider
            .open(&CaptureConstraints {
                width: 8,
                height: 8,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(device.stop_tracks(), 1);
        assert_eq!(device.stop_tracks(), 0);
        assert!(device.read_frame().is_err());
    }
}
