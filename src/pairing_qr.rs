//! QR rendering of pairing URLs.
//!
//! The QR payload is the pairing URL and nothing else. Rendering is a pure
//! function of the URL; a failure is an `Encoding` error and never touches
//! the session's endpoint, so the UI can simply try again.

use crate::config::QrConfig;
use crate::errors::PairingError;
use crate::session::{PairingUrl, Session};
use image::codecs::png::PngEncoder;
use image::{DynamicImage, GrayImage, Luma};
use qrcode::render::{svg, unicode};
use qrcode::{Color, QrCode};

/// QR renderer settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingQr {
    /// Pixels per module in raster output
    pub module_px: u32,
    /// Quiet zone width in modules
    pub quiet_zone: u32,
}

impl Default for PairingQr {
    fn default() -> Self {
        Self {
            module_px: 8,
            quiet_zone: 4,
        }
    }
}

impl From<&QrConfig> for PairingQr {
    fn from(config: &QrConfig) -> Self {
        Self {
            module_px: config.module_px,
            quiet_zone: config.quiet_zone,
        }
    }
}

/// Encoded QR matrix for one pairing URL
pub struct PairingImage {
    url: String,
    code: QrCode,
    settings: PairingQr,
}

impl std::fmt::Debug for PairingImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingImage")
            .field("url", &self.url)
            .field("modules", &self.code.width())
            .field("settings", &self.settings)
            .finish()
    }
}

impl PairingQr {
    /// Encode the session's pairing URL
    pub fn render_pairing(&self, session: &Session) -> Result<PairingImage, PairingError> {
        self.render_url(session.url())
    }

    pub fn render_url(&self, url: &PairingUrl) -> Result<PairingImage, PairingError> {
        self.render_str(url.as_str())
    }

    pub fn render_str(&self, url: &str) -> Result<PairingImage, PairingError> {
        let code = QrCode::new(url.as_bytes())
            .map_err(|e| PairingError::Encoding(format!("QR generation failed: {}", e)))?;
        log::debug!("Encoded pairing URL into {}x{} QR", code.width(), code.width());
        Ok(PairingImage {
            url: url.to_string(),
            code,
            settings: *self,
        })
    }
}

/// Render a session's pairing URL with default settings
pub fn render_pairing(session: &Session) -> Result<PairingImage, PairingError> {
    PairingQr::default().render_pairing(session)
}

impl PairingImage {
    /// The encoded URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Modules per side, without quiet zone
    pub fn modules(&self) -> usize {
        self.code.width()
    }

    /// Dark/light matrix, row-major, without quiet zone
    pub fn is_dark(&self, x: usize, y: usize) -> bool {
        let width = self.code.width();
        x < width && y < width && self.code[(x, y)] == Color::Dark
    }

    /// Side length of the raster image in pixels
    pub fn pixel_size(&self) -> u32 {
        (self.code.width() as u32 + 2 * self.settings.quiet_zone) * self.settings.module_px.max(1)
    }

    /// Grayscale raster, black modules on white
    pub fn to_image(&self) -> GrayImage {
        let module = self.settings.module_px.max(1);
        let quiet = self.settings.quiet_zone;
        let width = self.code.width() as u32;
        let colors = self.code.to_colors();
        let size = self.pixel_size();

        GrayImage::from_fn(size, size, |px, py| {
            let (mx, my) = (px / module, py / module);
            if mx < quiet || my < quiet || mx >= quiet + width || my >= quiet + width {
                return Luma([255u8]);
            }
            let idx = ((my - quiet) * width + (mx - quiet)) as usize;
            match colors[idx] {
                Color::Dark => Luma([0u8]),
                Color::Light => Luma([255u8]),
            }
        })
    }

    /// PNG bytes of [`PairingImage::to_image`]
    pub fn to_png(&self) -> Result<Vec<u8>, PairingError> {
        let mut bytes = Vec::new();
        DynamicImage::ImageLuma8(self.to_image())
            .write_with_encoder(PngEncoder::new(&mut bytes))
            .map_err(|e| PairingError::Encoding(format!("Failed to encode PNG: {}", e)))?;
        Ok(bytes)
    }

    /// SVG document, at least `min_px` wide
    pub fn to_svg(&self, min_px: u32) -> String {
        self.code
            .render::<svg::Color>()
            .min_dimensions(min_px, min_px)
            .quiet_zone(self.settings.quiet_zone > 0)
            .dark_color(svg::Color("#000000"))
            .light_color(svg::Color("#ffffff"))
            .build()
    }

    /// Half-block text for printing to a terminal
    pub fn to_terminal(&self) -> String {
        self.code
            .render::<unicode::Dense1x2>()
            .quiet_zone(self.settings.quiet_zone > 0)
            .dark_color(unicode::Dense1x2::Light)
            .light_color(unicode::Dense1x2::Dark)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionId, SessionRole};

    fn url() -> PairingUrl {
        PairingUrl::build(
            "https://host/",
            SessionRole::Photo,
            &SessionId::parse("abc123").unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_render_is_deterministic() {
        let qr = PairingQr::default();
        let a = qr.render_url(&url()).unwrap();
        let b = qr.render_url(&url()).unwrap();
        assert_eq!(a.to_png().unwrap(), b.to_png().unwrap());
        assert_eq!(a.url(), "https://host/?photo=1&peer=abc123");
    }

    #[test]
    fn test_png_dimensions_include_quiet_zone() {
        let qr = PairingQr {
            module_px: 4,
            quiet_zone: 2,
        };
        let image = qr.render_url(&url()).unwrap();
        let raster = image.to_image();
        let expected = (image.modules() as u32 + 4) * 4;
        assert_eq!(raster.dimensions(), (expected, expected));
        // quiet zone is white, finder pattern corner is black
        assert_eq!(raster.get_pixel(0, 0), &Luma([255u8]));
        assert_eq!(raster.get_pixel(8, 8), &Luma([0u8]));

        let png = image.to_png().unwrap();
        assert_eq!(&png[1..4], b"PNG");
    }

    #[test]
    fn test_svg_and_terminal_output() {
        let image = PairingQr::default().render_url(&url()).unwrap();
        assert!(image.to_svg(200).contains("<svg"));
        assert!(!image.to_terminal().is_empty());
        assert!(image.is_dark(0, 0));
    }

    #[test]
    fn test_oversized_payload_is_encoding_error() {
        let huge = format!("https://host/?photo=1&peer={}", "a".repeat(8000));
        let err = PairingQr::default().render_str(&huge).unwrap_err();
        assert!(matches!(err, PairingError::Encoding(_)));
    }
}
