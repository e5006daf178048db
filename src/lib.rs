//! chartlink: QR-paired peer channel for moving one photo or one document
//! between two devices.
//!
//! The primary device creates a [`Session`], shows its pairing URL as a QR
//! code and listens. The secondary device scans the code, joins with a
//! [`JoinedSession`] and the two endpoints exchange exactly one payload
//! [`Envelope`]: a camera photo going to the primary, or a finished document
//! going to the secondary.
//!
//! # Features
//! - In-process and TCP relay rendezvous behind one [`transport::Broker`] seam
//! - Cancellable endpoint state machine with a single release sequence
//! - Camera capture with guaranteed track release
//! - PNG, SVG and terminal QR rendering
//!
//! # Usage
//! ```rust,ignore
//! use chartlink::{flow, Session, SessionOptions, SessionRole};
//! use chartlink::transport::relay::RelayBroker;
//! use std::sync::Arc;
//!
//! let broker = Arc::new(RelayBroker::new("127.0.0.1:9400"));
//! let session = Session::create(SessionRole::Photo, broker, SessionOptions::default()).await?;
//! println!("{}", chartlink::pairing_qr::render_pairing(&session)?.to_terminal());
//! let photo = flow::receive_photo(&session, None).await?;
//! ```
//!
//! With the `tauri` feature the same operations are exposed as a plugin:
//! ```rust,ignore
//! tauri::Builder::default()
//!     .plugin(chartlink::init(chartlink::ChartlinkConfig::load_or_default()))
//!     .run(tauri::generate_context!())
//!     .expect("error while running tauri application");
//! ```
pub mod capture;
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod errors;
pub mod flow;
pub mod invariant_ppt;
pub mod pairing_qr;
pub mod session;
pub mod transport;

// Testing utilities - synthetic camera for offline testing
pub mod testing;

#[cfg(feature = "tauri")]
pub mod commands;

// Re-exports for convenience
pub use codec::{decode, encode, to_wire, Envelope, PayloadKind};
pub use config::ChartlinkConfig;
pub use endpoint::{Endpoint, EndpointEvent, EndpointRole, EndpointState};
pub use errors::PairingError;
pub use session::{parse_pairing_url, JoinedSession, PairingUrl, Session, SessionId, SessionOptions, SessionRole};
pub use transport::{Broker, PeerId};

#[cfg(feature = "tauri")]
use tauri::{
    plugin::{Builder, TauriPlugin},
    Manager, Runtime,
};

/// Initialize the chartlink plugin with all commands
#[cfg(feature = "tauri")]
pub fn init<R: Runtime>(config: ChartlinkConfig) -> TauriPlugin<R> {
    Builder::new("chartlink")
        .invoke_handler(tauri::generate_handler![
            commands::pairing::create_pairing_session,
            commands::pairing::regenerate_pairing_session,
            commands::pairing::get_pairing_state,
            commands::pairing::receive_photo,
            commands::pairing::share_document,
            commands::pairing::close_pairing_session,
        ])
        .setup(move |app, _api| {
            app.manage(commands::PairingState::from_config(config.clone()));
            Ok(())
        })
        .build()
}

/// Initialize logging for the pairing system
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "chartlink=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
        native_camera: cfg!(feature = "native-camera"),
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub native_camera: bool,
}

#[cfg(test)]
mod lib_tests {
    use super::*;

    #[test]
    fn test_crate_info() {
        let info = get_info();
        assert_eq!(info.name, "chartlink");
        assert!(!info.version.is_empty());
        assert!(!info.description.is_empty());
    }
}
