//! Tauri command handlers for the pairing plugin

pub mod pairing;

pub use pairing::*;
