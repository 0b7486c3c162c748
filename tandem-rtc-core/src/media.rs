//! Local media tracks and outbound track control
//!
//! A [`CaptureHandle`] holds the microphone and camera tracks opened by the
//! device layer. The handle is shared read-only by every peer session: each
//! session's sender points at the same [`LocalTrack`], and enablement is a
//! flag on the track itself, so muting never touches negotiation.
//!
//! [`MediaTrackController`] is the only component allowed to replace or stop
//! those tracks. Replacement swaps the sender's track in place on every
//! session that supports it and reports the sessions that must be recreated.

use crate::session::{PeerLink, SessionError, SessionKey, TrackSwap};
use crate::types::MediaKind;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Media-related errors
#[derive(Error, Debug)]
pub enum MediaError {
    /// No capture handle is active
    #[error("No active capture")]
    NoActiveCapture,

    /// The active capture has no track of this kind
    #[error("{0:?} is not being captured")]
    KindNotCaptured(MediaKind),

    /// Attaching a track to a session failed
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

// ============================================================================
// Tracks
// ============================================================================

/// An outbound capture track
///
/// Clones share the enabled and stopped flags.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    device_id: String,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl LocalTrack {
    /// Create a track for a device
    pub fn new(kind: MediaKind, device_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            device_id: device_id.into(),
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Track kind
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Source device
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Whether the sender transmits real media (silence/black otherwise)
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Toggle enablement for every sender sharing this track
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Release the capture resource
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!(track_id = %self.id, device_id = %self.device_id, "Local track stopped");
        }
    }

    /// Whether the capture resource was released
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// The active local capture
#[derive(Debug, Clone)]
pub struct CaptureHandle {
    id: String,
    audio: Option<LocalTrack>,
    video: Option<LocalTrack>,
}

impl CaptureHandle {
    /// Create a handle from opened tracks
    pub fn new(audio: Option<LocalTrack>, video: Option<LocalTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            audio,
            video,
        }
    }

    /// Handle identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Microphone track
    pub fn audio(&self) -> Option<&LocalTrack> {
        self.audio.as_ref()
    }

    /// Camera track
    pub fn video(&self) -> Option<&LocalTrack> {
        self.video.as_ref()
    }

    /// Track of a kind
    pub fn track(&self, kind: MediaKind) -> Option<&LocalTrack> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
    }

    fn put(&mut self, kind: MediaKind, track: Option<LocalTrack>) -> Option<LocalTrack> {
        match kind {
            MediaKind::Audio => std::mem::replace(&mut self.audio, track),
            MediaKind::Video => std::mem::replace(&mut self.video, track),
        }
    }

    /// Stop every track
    pub fn stop(&self) {
        self.audio.iter().chain(self.video.iter()).for_each(LocalTrack::stop);
    }

    /// Read-only view for the UI layer
    pub fn info(&self) -> CaptureInfo {
        CaptureInfo {
            id: self.id.clone(),
            audio_device: self.audio.as_ref().map(|t| t.device_id.clone()),
            video_device: self.video.as_ref().map(|t| t.device_id.clone()),
            audio_track: self.audio.as_ref().map(|t| t.id.clone()),
            video_track: self.video.as_ref().map(|t| t.id.clone()),
        }
    }
}

/// Capture handle as seen by the UI layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureInfo {
    /// Handle identifier
    pub id: String,
    /// Microphone in use
    pub audio_device: Option<String>,
    /// Camera in use
    pub video_device: Option<String>,
    /// Outbound audio track
    pub audio_track: Option<String>,
    /// Outbound video track
    pub video_track: Option<String>,
}

// ============================================================================
// Controller
// ============================================================================

/// Outcome of pushing a track to the live sessions
#[derive(Debug, Default)]
pub struct TrackSwapReport {
    /// New track id, when a single kind was replaced
    pub track_id: Option<String>,
    /// Senders swapped in place
    pub in_place: usize,
    /// Sessions that cannot swap in place and must be recreated
    pub needs_recreate: Vec<SessionKey>,
    /// Sessions where the swap errored
    pub failed: Vec<(SessionKey, String)>,
}

impl TrackSwapReport {
    fn merge(&mut self, other: TrackSwapReport) {
        self.in_place += other.in_place;
        for key in other.needs_recreate {
            if !self.needs_recreate.contains(&key) {
                self.needs_recreate.push(key);
            }
        }
        self.failed.extend(other.failed);
    }
}

/// Binds the local capture to peer sessions
pub struct MediaTrackController {
    capture: Option<CaptureHandle>,
    audio_enabled: bool,
    video_enabled: bool,
}

impl Default for MediaTrackController {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaTrackController {
    /// Create a controller with no capture and both kinds enabled
    #[must_use]
    pub fn new() -> Self {
        Self {
            capture: None,
            audio_enabled: true,
            video_enabled: true,
        }
    }

    /// Active capture
    #[must_use]
    pub fn capture(&self) -> Option<&CaptureHandle> {
        self.capture.as_ref()
    }

    /// Microphone enablement
    #[must_use]
    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled
    }

    /// Camera enablement
    #[must_use]
    pub fn video_enabled(&self) -> bool {
        self.video_enabled
    }

    fn enabled(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio_enabled,
            MediaKind::Video => self.video_enabled,
        }
    }

    /// Attach the current tracks to a newly created session
    ///
    /// # Errors
    ///
    /// Returns error if the link rejects a track
    pub async fn bind_session(&self, link: &Arc<dyn PeerLink>) -> Result<(), MediaError> {
        let Some(capture) = &self.capture else {
            return Ok(());
        };
        for kind in [MediaKind::Audio, MediaKind::Video] {
            if let Some(track) = capture.track(kind) {
                link.set_track(kind, Some(track.clone())).await?;
            }
        }
        Ok(())
    }

    /// Store a new capture handle and attach it to every live session
    ///
    /// Tracks of the previous handle are stopped once the new ones are in
    /// place.
    #[tracing::instrument(skip(self, handle, links), fields(handle_id = %handle.id()))]
    pub async fn set_local_capture(
        &mut self,
        handle: CaptureHandle,
        links: &[(SessionKey, Arc<dyn PeerLink>)],
    ) -> TrackSwapReport {
        for kind in [MediaKind::Audio, MediaKind::Video] {
            if let Some(track) = handle.track(kind) {
                track.set_enabled(self.enabled(kind));
            }
        }

        let mut report = TrackSwapReport::default();
        for kind in [MediaKind::Audio, MediaKind::Video] {
            let track = handle.track(kind).cloned();
            report.merge(swap_on_links(kind, track, links).await);
        }

        if let Some(old) = self.capture.replace(handle) {
            old.stop();
        }
        tracing::info!(
            sessions = links.len(),
            in_place = report.in_place,
            recreate = report.needs_recreate.len(),
            "Local capture attached"
        );
        report
    }

    /// Toggle the microphone; returns whether the flag changed
    pub fn set_audio_enabled(&mut self, enabled: bool) -> bool {
        self.set_enabled(MediaKind::Audio, enabled)
    }

    /// Toggle the camera; returns whether the flag changed
    pub fn set_video_enabled(&mut self, enabled: bool) -> bool {
        self.set_enabled(MediaKind::Video, enabled)
    }

    fn set_enabled(&mut self, kind: MediaKind, enabled: bool) -> bool {
        let slot = match kind {
            MediaKind::Audio => &mut self.audio_enabled,
            MediaKind::Video => &mut self.video_enabled,
        };
        if *slot == enabled {
            return false;
        }
        *slot = enabled;
        if let Some(track) = self.capture.as_ref().and_then(|c| c.track(kind)) {
            track.set_enabled(enabled);
        }
        tracing::info!(?kind, enabled, "Local track enablement changed");
        true
    }

    /// Swap the outbound camera track on every session
    ///
    /// # Errors
    ///
    /// Returns `NoActiveCapture` if nothing is capturing, or
    /// `KindNotCaptured` if the capture has no camera track
    pub async fn replace_video_track(
        &mut self,
        track: LocalTrack,
        links: &[(SessionKey, Arc<dyn PeerLink>)],
    ) -> Result<TrackSwapReport, MediaError> {
        self.replace_track(MediaKind::Video, track, links).await
    }

    /// Swap the outbound microphone track on every session
    ///
    /// # Errors
    ///
    /// Returns `NoActiveCapture` if nothing is capturing, or
    /// `KindNotCaptured` if the capture has no microphone track
    pub async fn replace_audio_track(
        &mut self,
        track: LocalTrack,
        links: &[(SessionKey, Arc<dyn PeerLink>)],
    ) -> Result<TrackSwapReport, MediaError> {
        self.replace_track(MediaKind::Audio, track, links).await
    }

    #[tracing::instrument(skip(self, track, links), fields(track_id = %track.id(), device_id = %track.device_id()))]
    async fn replace_track(
        &mut self,
        kind: MediaKind,
        track: LocalTrack,
        links: &[(SessionKey, Arc<dyn PeerLink>)],
    ) -> Result<TrackSwapReport, MediaError> {
        let Some(capture) = &self.capture else {
            track.stop();
            return Err(MediaError::NoActiveCapture);
        };
        if capture.track(kind).is_none() {
            track.stop();
            return Err(MediaError::KindNotCaptured(kind));
        }
        track.set_enabled(self.enabled(kind));

        let (swappable, fixed): (Vec<_>, Vec<_>) = links
            .iter()
            .cloned()
            .partition(|(_, link)| link.supports_track_replacement());
        let mut report = swap_on_links(kind, Some(track.clone()), &swappable).await;
        for (key, _) in fixed {
            tracing::debug!(remote = %key.remote, ?kind, "Session cannot replace tracks, recreating");
            report.needs_recreate.push(key);
        }
        report.track_id = Some(track.id().to_string());

        let old = self
            .capture
            .as_mut()
            .and_then(|capture| capture.put(kind, Some(track)));
        if let Some(old) = old {
            old.stop();
        }

        tracing::info!(
            ?kind,
            in_place = report.in_place,
            recreate = report.needs_recreate.len(),
            "Outbound track replaced"
        );
        Ok(report)
    }

    /// Stop the capture when leaving the room
    pub fn release(&mut self) -> Option<String> {
        let capture = self.capture.take()?;
        capture.stop();
        tracing::info!(handle_id = %capture.id(), "Local capture released");
        Some(capture.id().to_string())
    }
}

async fn swap_on_links(
    kind: MediaKind,
    track: Option<LocalTrack>,
    links: &[(SessionKey, Arc<dyn PeerLink>)],
) -> TrackSwapReport {
    let mut report = TrackSwapReport::default();
    for (key, link) in links {
        match link.set_track(kind, track.clone()).await {
            Ok(TrackSwap::InPlace) => report.in_place += 1,
            Ok(TrackSwap::NeedsRenegotiation) => {
                tracing::debug!(remote = %key.remote, ?kind, "Session cannot replace track in place");
                report.needs_recreate.push(key.clone());
            }
            Err(e) => {
                tracing::warn!(remote = %key.remote, ?kind, error = %e, "Track swap failed");
                report.failed.push((key.clone(), e.to_string()));
            }
        }
    }
    report
}
