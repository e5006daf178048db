//! Testing utilities for chartlink
//!
//! Synthetic camera frames and a camera provider that can grant or refuse
//! access, so the photo flow runs without hardware.

pub mod synthetic_data;

pub use synthetic_data::{synthetic_video_frame, SyntheticBehavior, SyntheticCameraProvider};
