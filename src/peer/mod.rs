//! Facade over the native peer connection. The engines only talk to
//! [`RtcEngine`]; the native callbacks arrive as [`RtcEvent`] values on the
//! channel handed out when the engine is built.

pub mod connection;
pub mod types;

use crate::error::RtcError;
use async_trait::async_trait;
use std::sync::Arc;

pub use connection::WebRtcEngine;
pub use types::{
    CaptureOptions, ConnectionState, IceCandidate, MediaConstraints, MediaKind, RemoteTrackInfo,
    RtcEvent, SdpKind, ServerConfig,
};

/// Rendering target for remote media (display surface).
pub trait MediaSink: Send + Sync {
    fn on_media(&self, kind: MediaKind, payload: &[u8]);

    /// Called once when the owning engine is disposed.
    fn release(&self) {}
}

#[async_trait]
pub trait RtcEngine: Send + Sync {
    /// Starts local capture and attaches the local tracks to the peer connection.
    async fn start_capture(&self, options: &CaptureOptions) -> Result<(), RtcError>;

    async fn stop_capture(&self) -> Result<(), RtcError>;

    async fn switch_camera(&self) -> Result<(), RtcError> {
        Ok(())
    }

    async fn create_offer(&self, constraints: &MediaConstraints) -> Result<String, RtcError>;

    async fn create_answer(&self, constraints: &MediaConstraints) -> Result<String, RtcError>;

    async fn set_local_description(&self, kind: SdpKind, sdp: &str) -> Result<(), RtcError>;

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), RtcError>;

    /// Duplicates may be rejected by the native engine; callers treat that as non-fatal.
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), RtcError>;

    async fn attach_remote_sink(
        &self,
        track_id: &str,
        sink: Arc<dyn MediaSink>,
    ) -> Result<(), RtcError>;

    fn set_video_enabled(&self, enabled: bool);

    fn set_audio_enabled(&self, enabled: bool);

    /// Replaces the native peer connection with a fresh one for a new epoch.
    /// Local tracks that were attached are attached again.
    async fn restart(&self) -> Result<(), RtcError>;

    /// Peer connection currently in use. Changes on every `restart` and `close`.
    fn generation(&self) -> u64;

    async fn close(&self);
}
