//! On-demand delivery of NVR event clips.
//!
//! Clips are served as plain MP4 relays, as byte-range reads of a short-lived
//! on-disk copy, or as HLS VOD manifests whose every reference is routed back
//! through this service.

pub mod cache;
pub mod config;
pub mod error;
pub mod hls;
pub mod metrics;
pub mod mode;
pub mod nvr;
pub mod range;
pub mod server;
pub mod stream;
pub mod upstream;
