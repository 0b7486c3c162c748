//! Local capture device management
//!
//! The host's enumeration and capture primitives sit behind [`DeviceBackend`].
//! [`DeviceManager`] keeps the enumerated list and the desired selection, and
//! decides what a selection change means for an active capture: a track
//! replacement for inputs, nothing to re-acquire for outputs.

use crate::media::{CaptureHandle, LocalTrack};
use crate::types::{MediaKind, Notice};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Device errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Capture acquisition failed
    #[error("Device unavailable ({kind:?}): {reason}")]
    DeviceUnavailable {
        /// Device kind
        kind: DeviceKind,
        /// Error description
        reason: String,
    },

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Enumeration failed
    #[error("Device enumeration failed: {0}")]
    EnumerationFailed(String),

    /// Output devices cannot be captured from
    #[error("Not a capture device kind: {0:?}")]
    NotACaptureDevice(DeviceKind),
}

/// Device category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Microphone
    AudioInput,
    /// Camera
    VideoInput,
    /// Speaker
    AudioOutput,
}

impl DeviceKind {
    /// Media kind captured by this device kind, `None` for outputs
    pub fn capture_kind(self) -> Option<MediaKind> {
        match self {
            Self::AudioInput => Some(MediaKind::Audio),
            Self::VideoInput => Some(MediaKind::Video),
            Self::AudioOutput => None,
        }
    }
}

/// A local device as reported by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Device identifier
    pub id: String,
    /// Human readable label
    pub label: String,
    /// Category
    pub kind: DeviceKind,
    /// Platform default for its kind
    pub is_default: bool,
}

impl DeviceDescriptor {
    /// Create a descriptor
    pub fn new(kind: DeviceKind, id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind,
            is_default: false,
        }
    }

    /// Mark as platform default
    #[must_use]
    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }
}

/// Categorized device list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceList {
    /// Microphones
    pub audio_inputs: Vec<DeviceDescriptor>,
    /// Cameras
    pub video_inputs: Vec<DeviceDescriptor>,
    /// Speakers
    pub audio_outputs: Vec<DeviceDescriptor>,
}

/// Desired device combination
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSelection {
    /// Selected microphone
    pub audio_input: Option<String>,
    /// Selected camera
    pub video_input: Option<String>,
    /// Selected speaker
    pub audio_output: Option<String>,
}

impl DeviceSelection {
    /// Selected device for a kind
    pub fn get(&self, kind: DeviceKind) -> Option<&String> {
        match kind {
            DeviceKind::AudioInput => self.audio_input.as_ref(),
            DeviceKind::VideoInput => self.video_input.as_ref(),
            DeviceKind::AudioOutput => self.audio_output.as_ref(),
        }
    }

    fn slot(&mut self, kind: DeviceKind) -> &mut Option<String> {
        match kind {
            DeviceKind::AudioInput => &mut self.audio_input,
            DeviceKind::VideoInput => &mut self.video_input,
            DeviceKind::AudioOutput => &mut self.audio_output,
        }
    }
}

/// What a selection change requires from the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SelectOutcome {
    /// Already selected
    Unchanged,
    /// Stored for the next acquisition; nothing of this kind is capturing
    Stored,
    /// Output routing changed; no capture re-acquire needed
    OutputChanged,
    /// An active capture must swap its outbound track
    ReplaceTrack {
        /// Device kind
        kind: DeviceKind,
        /// Device to open
        device_id: String,
    },
}

/// Host device primitives
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    /// Enumerate every local device
    async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, DeviceError>;

    /// Open a capture track on a device
    async fn open(&self, kind: DeviceKind, device_id: &str) -> Result<LocalTrack, DeviceError>;
}

/// Device list and selection
pub struct DeviceManager {
    backend: Arc<dyn DeviceBackend>,
    devices: Vec<DeviceDescriptor>,
    selection: DeviceSelection,
}

impl DeviceManager {
    /// Create a manager over a host backend
    #[must_use]
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self {
            backend,
            devices: Vec::new(),
            selection: DeviceSelection::default(),
        }
    }

    /// Host backend
    #[must_use]
    pub fn backend(&self) -> Arc<dyn DeviceBackend> {
        self.backend.clone()
    }

    /// Current selection
    #[must_use]
    pub fn selection(&self) -> &DeviceSelection {
        &self.selection
    }

    /// Categorized device list from the last enumeration
    #[must_use]
    pub fn list_devices(&self) -> DeviceList {
        let mut list = DeviceList::default();
        for device in &self.devices {
            let bucket = match device.kind {
                DeviceKind::AudioInput => &mut list.audio_inputs,
                DeviceKind::VideoInput => &mut list.video_inputs,
                DeviceKind::AudioOutput => &mut list.audio_outputs,
            };
            bucket.push(device.clone());
        }
        list
    }

    /// Re-enumerate after start-up or a hot-plug change
    ///
    /// Selected devices that disappeared fall back to the platform default
    /// (or the first remaining device of that kind) and produce a notice.
    /// Empty selections pick up the default silently.
    ///
    /// # Errors
    ///
    /// Returns error if the host enumeration fails
    #[tracing::instrument(skip(self))]
    pub async fn refresh(&mut self) -> Result<Vec<Notice>, DeviceError> {
        self.devices = self.backend.enumerate().await?;
        let mut notices = Vec::new();

        for kind in [
            DeviceKind::AudioInput,
            DeviceKind::VideoInput,
            DeviceKind::AudioOutput,
        ] {
            let present = self
                .selection
                .get(kind)
                .map(|id| self.find(kind, id).is_some());
            let fallback = self.default_for(kind);
            match present {
                Some(true) => {}
                Some(false) => {
                    let lost = self.selection.slot(kind).take().unwrap_or_default();
                    tracing::warn!(?kind, lost = %lost, fallback = ?fallback, "Selected device disappeared");
                    *self.selection.slot(kind) = fallback.clone();
                    notices.push(Notice::DeviceFallback {
                        kind,
                        lost,
                        fallback,
                    });
                }
                None => *self.selection.slot(kind) = fallback,
            }
        }

        tracing::debug!(devices = self.devices.len(), "Media devices enumerated");
        Ok(notices)
    }

    /// Update the desired device for a kind
    ///
    /// `capturing` tells whether the live capture has a track of this kind,
    /// in which case an input change becomes a track replacement. Otherwise
    /// the choice is only stored for the next capture.
    ///
    /// # Errors
    ///
    /// Returns `DeviceNotFound` if the id is not in the last enumeration
    pub fn select(
        &mut self,
        kind: DeviceKind,
        device_id: &str,
        capturing: bool,
    ) -> Result<SelectOutcome, DeviceError> {
        if self.find(kind, device_id).is_none() {
            return Err(DeviceError::DeviceNotFound(device_id.to_string()));
        }
        if self.selection.get(kind).map(String::as_str) == Some(device_id) {
            return Ok(SelectOutcome::Unchanged);
        }
        *self.selection.slot(kind) = Some(device_id.to_string());
        tracing::info!(?kind, device_id, "Device selected");

        Ok(match kind.capture_kind() {
            None => SelectOutcome::OutputChanged,
            Some(_) if capturing => SelectOutcome::ReplaceTrack {
                kind,
                device_id: device_id.to_string(),
            },
            Some(_) => SelectOutcome::Stored,
        })
    }

    /// Open the selected devices into a capture handle
    ///
    /// A kind that cannot be opened is left out of the handle and reported
    /// as a `DeviceUnavailable` notice; the capture proceeds without it.
    pub async fn acquire(
        backend: Arc<dyn DeviceBackend>,
        selection: DeviceSelection,
        audio: bool,
        video: bool,
    ) -> (CaptureHandle, Vec<Notice>) {
        let mut notices = Vec::new();
        let open = |kind: DeviceKind, wanted: bool| {
            let backend = backend.clone();
            let device = selection.get(kind).cloned();
            async move {
                if !wanted {
                    return None;
                }
                let result = match device {
                    Some(id) => backend.open(kind, &id).await,
                    None => Err(DeviceError::DeviceUnavailable {
                        kind,
                        reason: "no device selected".to_string(),
                    }),
                };
                Some((kind, result))
            }
        };

        let (audio_result, video_result) = futures::join!(
            open(DeviceKind::AudioInput, audio),
            open(DeviceKind::VideoInput, video)
        );

        let mut take = |result: Option<(DeviceKind, Result<LocalTrack, DeviceError>)>| {
            match result {
                Some((_, Ok(track))) => Some(track),
                Some((kind, Err(e))) => {
                    tracing::warn!(?kind, error = %e, "Capture acquisition failed, continuing without it");
                    notices.push(Notice::DeviceUnavailable {
                        kind,
                        reason: e.to_string(),
                    });
                    None
                }
                None => None,
            }
        };

        let audio_track = take(audio_result);
        let video_track = take(video_result);
        (CaptureHandle::new(audio_track, video_track), notices)
    }

    fn find(&self, kind: DeviceKind, id: &str) -> Option<&DeviceDescriptor> {
        self.devices.iter().find(|d| d.kind == kind && d.id == id)
    }

    fn default_for(&self, kind: DeviceKind) -> Option<String> {
        let mut of_kind = self.devices.iter().filter(|d| d.kind == kind);
        let first = of_kind.clone().next();
        of_kind
            .find(|d| d.is_default)
            .or(first)
            .map(|d| d.id.clone())
    }
}

/// In-memory device backend with hot-plug simulation
pub struct StaticDeviceBackend {
    devices: Mutex<Vec<DeviceDescriptor>>,
    failing: Mutex<HashSet<String>>,
}

impl StaticDeviceBackend {
    /// Backend with no devices
    #[must_use]
    pub fn empty() -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Backend with one default microphone, camera and speaker
    #[must_use]
    pub fn with_defaults() -> Self {
        let backend = Self::empty();
        backend.plug(
            DeviceDescriptor::new(DeviceKind::AudioInput, "default-mic", "Built-in Microphone")
                .as_default(),
        );
        backend.plug(
            DeviceDescriptor::new(DeviceKind::VideoInput, "default-camera", "Built-in Camera")
                .as_default(),
        );
        backend.plug(
            DeviceDescriptor::new(DeviceKind::AudioOutput, "default-speaker", "Built-in Speakers")
                .as_default(),
        );
        backend
    }

    /// Add a device
    pub fn plug(&self, device: DeviceDescriptor) {
        let mut devices = self.devices.lock();
        devices.retain(|d| !(d.kind == device.kind && d.id == device.id));
        devices.push(device);
    }

    /// Remove a device
    pub fn unplug(&self, device_id: &str) {
        self.devices.lock().retain(|d| d.id != device_id);
    }

    /// Make `open` fail for a device
    pub fn fail_open(&self, device_id: &str) {
        self.failing.lock().insert(device_id.to_string());
    }
}

#[async_trait]
impl DeviceBackend for StaticDeviceBackend {
    async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        Ok(self.devices.lock().clone())
    }

    async fn open(&self, kind: DeviceKind, device_id: &str) -> Result<LocalTrack, DeviceError> {
        let media_kind = kind
            .capture_kind()
            .ok_or(DeviceError::NotACaptureDevice(kind))?;
        if self.failing.lock().contains(device_id) {
            return Err(DeviceError::DeviceUnavailable {
                kind,
                reason: format!("{device_id} is busy"),
            });
        }
        let present = self
            .devices
            .lock()
            .iter()
            .any(|d| d.kind == kind && d.id == device_id);
        if !present {
            return Err(DeviceError::DeviceNotFound(device_id.to_string()));
        }
        Ok(LocalTrack::new(media_kind, device_id))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn manager() -> (Arc<StaticDeviceBackend>, DeviceManager) {
        let backend = Arc::new(StaticDeviceBackend::with_defaults());
        backend.plug(DeviceDescriptor::new(
            DeviceKind::VideoInput,
            "usb-camera",
            "USB Camera",
        ));
        let mut manager = DeviceManager::new(backend.clone());
        let notices = manager.refresh().await.unwrap();
        assert!(notices.is_empty());
        (backend, manager)
    }

    #[tokio::test]
    async fn test_list_devices_categorized() {
        let (_, manager) = manager().await;
        let list = manager.list_devices();
        assert_eq!(list.audio_inputs.len(), 1);
        assert_eq!(list.video_inputs.len(), 2);
        assert_eq!(list.audio_outputs.len(), 1);
        assert_eq!(
            manager.selection().video_input.as_deref(),
            Some("default-camera")
        );
    }

    #[tokio::test]
    async fn test_select_outcomes() {
        let (_, mut manager) = manager().await;

        assert_eq!(
            manager
                .select(DeviceKind::VideoInput, "default-camera", true)
                .unwrap(),
            SelectOutcome::Unchanged
        );
        assert_eq!(
            manager
                .select(DeviceKind::VideoInput, "usb-camera", true)
                .unwrap(),
            SelectOutcome::ReplaceTrack {
                kind: DeviceKind::VideoInput,
                device_id: "usb-camera".to_string(),
            }
        );
        assert_eq!(
            manager
                .select(DeviceKind::VideoInput, "default-camera", false)
                .unwrap(),
            SelectOutcome::Stored
        );
        assert!(matches!(
            manager.select(DeviceKind::AudioOutput, "missing", true),
            Err(DeviceError::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_output_change_needs_no_reacquire() {
        let (backend, mut manager) = manager().await;
        backend.plug(DeviceDescriptor::new(
            DeviceKind::AudioOutput,
            "headset",
            "Headset",
        ));
        manager.refresh().await.unwrap();
        assert_eq!(
            manager
                .select(DeviceKind::AudioOutput, "headset", true)
                .unwrap(),
            SelectOutcome::OutputChanged
        );
    }

    #[tokio::test]
    async fn test_unplugged_selection_falls_back_to_default() {
        let (backend, mut manager) = manager().await;
        manager
            .select(DeviceKind::VideoInput, "usb-camera", false)
            .unwrap();

        backend.unplug("usb-camera");
        let notices = manager.refresh().await.unwrap();

        assert_eq!(
            notices,
            vec![Notice::DeviceFallback {
                kind: DeviceKind::VideoInput,
                lost: "usb-camera".to_string(),
                fallback: Some("default-camera".to_string()),
            }]
        );
        assert_eq!(
            manager.selection().video_input.as_deref(),
            Some("default-camera")
        );
    }

    #[tokio::test]
    async fn test_acquire_proceeds_without_failing_kind() {
        let (backend, manager) = manager().await;
        backend.fail_open("default-camera");

        let (handle, notices) =
            DeviceManager::acquire(manager.backend(), manager.selection().clone(), true, true)
                .await;

        assert!(handle.audio().is_some());
        assert!(handle.video().is_none());
        assert_eq!(notices.len(), 1);
        assert!(matches!(
            &notices[0],
            Notice::DeviceUnavailable {
                kind: DeviceKind::VideoInput,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_open_output_is_rejected() {
        let backend = StaticDeviceBackend::with_defaults();
        let result = backend.open(DeviceKind::AudioOutput, "default-speaker").await;
        assert_eq!(
            result.err(),
            Some(DeviceError::NotACaptureDevice(DeviceKind::AudioOutput))
        );
    }
}
