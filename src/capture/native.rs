use crate::capture::{CameraDevice, CameraFrame, CameraProvider, CaptureConstraints};
use crate::errors::PairingError;
use nokhwa::{
    pixel_format::RgbFormat,
    utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution},
    CallbackCamera,
};

/// Camera provider backed by the platform camera stack through nokhwa.
///
/// Desktop devices do not report a facing direction, so the facing mode is
/// only logged and the configured device index decides which camera opens.
pub struct NativeCameraProvider {
    device_index: u32,
}

impl NativeCameraProvider {
    pub fn new(device_index: u32) -> Self {
        Self { device_index }
    }
}

impl CameraProvider for NativeCameraProvider {
    fn open(&self, constraints: &CaptureConstraints) -> Result<Box<dyn CameraDevice>, PairingError> {
        log::info!(
            "Opening native camera {} (requested facing {:?})",
            self.device_index,
            constraints.facing_mode
        );

        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
            CameraFormat::new(
                Resolution::new(constraints.width, constraints.height),
                FrameFormat::MJPEG,
                30,
            ),
        ));

        let mut camera = CallbackCamera::new(CameraIndex::Index(self.device_index), requested, |_| {})
            .map_err(|e| classify(format!("Failed to initialize camera: {}", e)))?;

        camera
            .open_stream()
            .map_err(|e| classify(format!("Failed to start stream: {}", e)))?;

        Ok(Box::new(NativeCamera {
            camera,
            device_id: self.device_index.to_string(),
            streaming: true,
        }))
    }
}

struct NativeCamera {
    camera: CallbackCamera,
    device_id: String,
    streaming: bool,
}

impl CameraDevice for NativeCamera {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn read_frame(&mut self) -> Result<CameraFrame, PairingError> {
        let buffer = self
            .camera
            .poll_frame()
            .map_err(|e| PairingError::DeviceUnavailable(format!("Failed to capture frame: {}", e)))?;

        let decoded = buffer
            .decode_image::<RgbFormat>()
            .map_err(|e| PairingError::Encoding(format!("Failed to decode frame: {}", e)))?;

        let (width, height) = (decoded.width(), decoded.height());
        Ok(CameraFrame::new(
            decoded.into_raw(),
            width,
            height,
            self.device_id.clone(),
        ))
    }

    fn active_tracks(&self) -> usize {
        usize::from(self.streaming)
    }

    fn stop_tracks(&mut self) -> usize {
        if !self.streaming {
            return 0;
        }
        if let Err(e) = self.camera.stop_stream() {
            log::warn!("Failed to stop camera stream {}: {}", self.device_id, e);
        }
        self.streaming = false;
        1
    }
}

fn classify(message: String) -> PairingError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        PairingError::PermissionDenied(message)
    } else {
        PairingError::DeviceUnavailable(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_permission_messages() {
        assert!(matches!(
            classify("Failed to initialize camera: Permission denied (os error 13)".into()),
            PairingError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify("Failed to initialize camera: no such device".into()),
            PairingError::DeviceUnavailable(_)
        ));
    }
}
