//! Local media acquisition for room sessions.
//!
//! Capture itself is an external collaborator behind [`MediaDevices`];
//! this module owns only the fallback policy: ask for video + audio,
//! drop to audio-only if the camera is unavailable, and give up if even
//! audio cannot be had.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};
use webrtc::track::track_local::TrackLocal;

/// Requested capture dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl MediaConstraints {
    pub const VIDEO_AND_AUDIO: Self = Self {
        video: true,
        audio: true,
    };
    pub const AUDIO_ONLY: Self = Self {
        video: false,
        audio: true,
    };
}

/// Local tracks attached to each room peer connection at creation.
#[derive(Clone)]
pub struct MediaTracks {
    pub audio: Option<Arc<dyn TrackLocal + Send + Sync>>,
    pub video: Option<Arc<dyn TrackLocal + Send + Sync>>,
}

impl MediaTracks {
    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    /// Tracks in attach order, audio first.
    pub fn into_track_locals(self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        self.audio.into_iter().chain(self.video).collect()
    }
}

/// Capture device seam. Production wires a platform capture pipeline;
/// tests script successes and failures per constraint set.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn capture(&self, constraints: MediaConstraints) -> Result<MediaTracks>;
}

/// Acquire local tracks with the standard fallback ladder.
///
/// Video + audio first; if that fails (no camera, permission denied) an
/// audio-only capture is attempted before giving up. Audio failure is
/// fatal since a room session without any local media is useless.
pub async fn acquire_tracks(devices: &dyn MediaDevices) -> Result<MediaTracks> {
    match devices.capture(MediaConstraints::VIDEO_AND_AUDIO).await {
        Ok(tracks) => {
            info!(event = "media_acquired", video = tracks.has_video());
            Ok(tracks)
        }
        Err(error) => {
            warn!(
                event = "media_video_unavailable",
                %error,
                "Video capture failed, falling back to audio only"
            );
            let tracks = devices
                .capture(MediaConstraints::AUDIO_ONLY)
                .await
                .context("audio capture failed after video fallback")?;
            info!(event = "media_acquired", video = false);
            Ok(tracks)
        }
    }
}
