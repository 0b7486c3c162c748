//! Tandem RTC - peer-session orchestration for mesh rooms and 1:1 calls
//!
//! This library turns a reliable signaling channel into a set of live media
//! sessions between the participants of a room:
//!
//! - **Signaling**: typed control messages over any [`SignalingChannel`]
//! - **Mesh sessions**: one negotiated session per remote participant, with
//!   deterministic offer glare resolution and candidate queueing
//! - **1:1 calls**: ringing, accept/decline, timeout and hang-up over the
//!   same sessions
//! - **Media**: one local capture shared by every session, with in-place
//!   track replacement on device changes
//! - **Single owner**: all state lives in one task; the UI talks to it
//!   through an [`OrchestratorHandle`] and observes [`OrchestratorEvent`]s
//!
//! # Examples
//!
//! ```rust,no_run
//! use tandem_rtc_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let relay = MemoryRelay::new();
//! let network = LoopbackNetwork::new();
//! let alice = ParticipantId::new("alice");
//!
//! let handle = Orchestrator::builder(
//!     alice.clone(),
//!     Arc::new(relay.connect(&alice)),
//!     Arc::new(network.factory(alice.clone())),
//! )
//! .with_config(OrchestratorConfig::default())
//! .build()
//! .await?;
//!
//! let mut events = handle.subscribe_events();
//! relay.join(Participant::attendee("alice", "Alice"));
//! handle.start_capture(true, true).await?;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core data types and events
pub mod types;

/// Participant identity
pub mod identity;

/// Orchestrator configuration
pub mod config;

/// Signaling messages, channel abstraction and client
pub mod signaling;

/// Peer sessions and the session registry
pub mod session;

/// Local capture and outbound tracks
pub mod media;

/// Capture and playback devices
pub mod devices;

/// 1:1 call state machine
pub mod call;

/// Presence tracking
pub mod presence;

/// Room roster
pub mod roster;

/// Single-owner orchestrator task and UI handle
pub mod orchestrator;

/// In-process peer links
pub mod loopback;

/// In-process signaling relay
pub mod relay;

/// WebRTC peer links (requires webrtc-backend feature)
#[cfg(feature = "webrtc-backend")]
pub mod rtc;

/// ant-quic signaling channel (requires quic-channel feature)
#[cfg(feature = "quic-channel")]
pub mod transport;

// Re-export main types at crate root
pub use call::{CallAction, CallError, CallStateMachine, RingKind, RingTone, TracingRingTone};
pub use config::{ConfigError, OrchestratorConfig};
pub use devices::{
    DeviceBackend, DeviceDescriptor, DeviceError, DeviceKind, DeviceList, DeviceManager,
    DeviceSelection, SelectOutcome, StaticDeviceBackend,
};
pub use identity::ParticipantId;
pub use loopback::{LoopbackLinkFactory, LoopbackNetwork};
pub use media::{CaptureHandle, CaptureInfo, LocalTrack, MediaError, MediaTrackController};
pub use orchestrator::{
    Orchestrator, OrchestratorBuilder, OrchestratorError, OrchestratorHandle, Snapshot,
};
pub use presence::PresenceTracker;
pub use relay::{MemoryRelay, RelayChannel};
#[cfg(feature = "webrtc-backend")]
pub use rtc::{RtcLink, RtcLinkFactory};
pub use roster::Roster;
pub use session::{
    PeerLink, PeerLinkFactory, PeerSessionRegistry, SessionError, SessionInfo, SessionKey,
};
pub use signaling::{
    Destination, Envelope, SignalingChannel, SignalingClient, SignalingError, SignalingMessage,
};
#[cfg(feature = "quic-channel")]
pub use transport::{QuicSignalingChannel, TransportConfig, TransportError};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::OrchestratorConfig;
    pub use crate::devices::{DeviceKind, SelectOutcome, StaticDeviceBackend};
    pub use crate::identity::ParticipantId;
    pub use crate::loopback::LoopbackNetwork;
    pub use crate::orchestrator::{Orchestrator, OrchestratorHandle, Snapshot};
    pub use crate::relay::MemoryRelay;
    #[cfg(feature = "webrtc-backend")]
    pub use crate::rtc::RtcLinkFactory;
    pub use crate::signaling::{SignalingChannel, SignalingMessage};
    #[cfg(feature = "quic-channel")]
    pub use crate::transport::{QuicSignalingChannel, TransportConfig};
    pub use crate::types::{
        CallId, CallState, EndReason, MediaKind, Notice, OrchestratorEvent, Participant,
        SessionState,
    };
}
