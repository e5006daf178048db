//! Configuration management for chartlink
//!
//! Provides configuration loading, saving, and management for pairing
//! defaults, camera capture settings, transfer limits and QR rendering.

use crate::capture::FacingMode;
use crate::errors::PairingError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartlinkConfig {
    pub pairing: PairingConfig,
    pub capture: CaptureSettings,
    pub transfer: TransferConfig,
    pub qr: QrConfig,
}

/// Pairing and rendezvous configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingConfig {
    /// Base address the secondary device opens, e.g. "https://chart.example/"
    pub base_url: String,
    /// Rendezvous relay address (host:port)
    pub broker_addr: String,
    /// Bound on the secondary's connect attempt in milliseconds (0 = wait forever)
    pub connect_timeout_ms: u64,
    /// Bound on the primary waiting for a peer in milliseconds (0 = wait forever)
    pub listen_timeout_ms: u64,
}

/// Camera capture configuration (photo role only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Preferred camera facing mode
    pub facing_mode: FacingMode,
    /// Target resolution [width, height]
    pub resolution: [u32; 2],
    /// JPEG quality (1-100)
    pub jpeg_quality: u8,
    /// Native device index used by the native backend
    pub device_index: u32,
}

/// Channel and payload limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Largest single frame accepted on a channel, in bytes
    pub max_frame_bytes: usize,
    /// Buffer size of in-process duplex channels, in bytes
    pub memory_channel_buffer: usize,
}

/// QR rendering configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QrConfig {
    /// Pixels per QR module in PNG output
    pub module_px: u32,
    /// Quiet zone width in modules
    pub quiet_zone: u32,
}

impl Default for ChartlinkConfig {
    fn default() -> Self {
        Self {
            pairing: PairingConfig {
                base_url: "https://localhost/".to_string(),
                broker_addr: "127.0.0.1:9400".to_string(),
                connect_timeout_ms: 30_000,
                listen_timeout_ms: 0,
            },
            capture: CaptureSettings {
                facing_mode: FacingMode::Environment,
                resolution: [1920, 1080],
                jpeg_quality: 92,
                device_index: 0,
            },
            transfer: TransferConfig {
                max_frame_bytes: 64 * 1024 * 1024,
                memory_channel_buffer: 64 * 1024,
            },
            qr: QrConfig {
                module_px: 8,
                quiet_zone: 4,
            },
        }
    }
}

impl PairingConfig {
    /// Connect bound, `None` when configured to wait forever
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }

    /// Listen bound, `None` when configured to wait forever
    pub fn listen_timeout(&self) -> Option<Duration> {
        (self.listen_timeout_ms > 0).then(|| Duration::from_millis(self.listen_timeout_ms))
    }
}

impl ChartlinkConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, PairingError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| PairingError::Config(format!("Failed to read config file: {}", e)))?;

        let config: ChartlinkConfig = toml::from_str(&contents)
            .map_err(|e| PairingError::Config(format!("Failed to parse config file: {}", e)))?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Load configuration from an optional TOML file layered under
    /// `CHARTLINK__<SECTION>__<KEY>` environment overrides.
    pub fn load_layered<P: AsRef<Path>>(path: P) -> Result<Self, PairingError> {
        let defaults = toml::to_string(&Self::default())
            .map_err(|e| PairingError::Config(format!("Failed to seed defaults: {}", e)))?;

        let layered = config::Config::builder()
            .add_source(config::File::from_str(&defaults, config::FileFormat::Toml))
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix("CHARTLINK")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| PairingError::Config(format!("Failed to build config: {}", e)))?;

        let config: ChartlinkConfig = layered
            .try_deserialize()
            .map_err(|e| PairingError::Config(format!("Failed to deserialize config: {}", e)))?;
        config.validate().map_err(PairingError::Config)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), PairingError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                PairingError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| PairingError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| PairingError::Config(format!("Failed to write config file: {}", e)))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("chartlink.toml")
    }

    /// Load from default location or create with defaults
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        let base = url::Url::parse(&self.pairing.base_url)
            .map_err(|e| format!("Pairing base URL is not a valid URL: {}", e))?;
        if base.host_str().is_none() {
            return Err("Pairing base URL must name a host".to_string());
        }
        if base.fragment().is_some() {
            return Err("Pairing base URL must not carry a fragment".to_string());
        }
        if self.pairing.broker_addr.is_empty() {
            return Err("Broker address must not be empty".to_string());
        }

        if self.capture.resolution[0] == 0 || self.capture.resolution[1] == 0 {
            return Err("Invalid capture resolution".to_string());
        }
        if self.capture.jpeg_quality == 0 || self.capture.jpeg_quality > 100 {
            return Err("JPEG quality must be between 1 and 100".to_string());
        }

        if self.transfer.max_frame_bytes < 1024 {
            return Err("Max frame size must be at least 1 KiB".to_string());
        }
        if self.transfer.memory_channel_buffer == 0 {
            return Err("Memory channel buffer must be non-zero".to_string());
        }

        if self.qr.module_px == 0 || self.qr.module_px > 64 {
            return Err("QR module size must be between 1 and 64 pixels".to_string());
        }
        if self.qr.quiet_zone > 16 {
            return Err("QR quiet zone must be at most 16 modules".to_string());
        }

        Ok(())
    }
}
