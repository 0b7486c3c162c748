//! WebRTC-backed peer links
//!
//! Each link is an `RTCPeerConnection` with one send/receive transceiver per
//! media kind, added at creation so that a later track change is a sender
//! `replace_track` and never a renegotiation. Local candidates are trickled
//! as serialized `RTCIceCandidateInit` JSON.

use crate::config::OrchestratorConfig;
use crate::media::LocalTrack;
use crate::session::{
    Connectivity, DescriptionKind, LinkEvent, PeerLink, PeerLinkFactory, SessionError, SessionKey,
    TrackSwap,
};
use crate::types::{MediaKind, NegotiationRole};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

fn link_error(context: &str, e: impl std::fmt::Display) -> SessionError {
    SessionError::Link(format!("{context}: {e}"))
}

fn codec(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "".to_string(),
            rtcp_feedback: vec![],
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: "".to_string(),
            rtcp_feedback: vec![],
        },
    }
}

fn connectivity(state: RTCPeerConnectionState) -> Option<Connectivity> {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting => {
            Some(Connectivity::Checking)
        }
        RTCPeerConnectionState::Connected => Some(Connectivity::Connected),
        RTCPeerConnectionState::Disconnected => Some(Connectivity::Disconnected),
        RTCPeerConnectionState::Failed => Some(Connectivity::Failed),
        RTCPeerConnectionState::Closed | RTCPeerConnectionState::Unspecified => None,
    }
}

/// Creates `RTCPeerConnection` links
pub struct RtcLinkFactory {
    ice_servers: Vec<String>,
}

impl RtcLinkFactory {
    /// Create a factory using the given STUN/TURN URLs
    #[must_use]
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    /// Create a factory from orchestrator configuration
    #[must_use]
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(config.ice_servers.clone())
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerLinkFactory for RtcLinkFactory {
    #[tracing::instrument(skip(self, events), fields(remote = %key.remote, epoch = key.epoch))]
    async fn create(
        &self,
        key: SessionKey,
        role: NegotiationRole,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, SessionError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| link_error("Failed to register codecs", e))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| link_error("Failed to register interceptors", e))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(self.rtc_configuration())
                .await
                .map_err(|e| link_error("Failed to create peer connection", e))?,
        );

        let mut senders = HashMap::new();
        for (kind, codec_type) in [
            (MediaKind::Audio, RTPCodecType::Audio),
            (MediaKind::Video, RTPCodecType::Video),
        ] {
            let init = RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Sendrecv,
                send_encodings: vec![],
            };
            let transceiver = pc
                .add_transceiver_from_kind(codec_type, Some(init))
                .await
                .map_err(|e| link_error("Failed to add transceiver", e))?;
            senders.insert(kind, transceiver.sender().await);
        }

        let candidate_key = key.clone();
        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let key = candidate_key.clone();
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to serialize local candidate");
                        return;
                    }
                };
                match serde_json::to_string(&init) {
                    Ok(candidate) => {
                        let _ = events.send(LinkEvent::LocalCandidate { key, candidate });
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to encode local candidate"),
                }
            })
        }));

        let state_key = key.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let key = state_key.clone();
            let events = events.clone();
            Box::pin(async move {
                tracing::debug!(remote = %key.remote, ?state, "Peer connection state");
                if let Some(state) = connectivity(state) {
                    let _ = events.send(LinkEvent::Connectivity { key, state });
                }
            })
        }));

        tracing::debug!(?role, "Peer connection created");
        Ok(Arc::new(RtcLink {
            pc,
            key,
            senders,
        }))
    }
}

/// A link backed by an `RTCPeerConnection`
pub struct RtcLink {
    pc: Arc<RTCPeerConnection>,
    key: SessionKey,
    senders: HashMap<MediaKind, Arc<RTCRtpSender>>,
}

impl RtcLink {
    /// Session incarnation this link belongs to
    #[must_use]
    pub fn key(&self) -> &SessionKey {
        &self.key
    }
}

#[async_trait]
impl PeerLink for RtcLink {
    async fn create_offer(&self) -> Result<String, SessionError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| SessionError::NegotiationFailed(format!("Failed to create offer: {e}")))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| {
                SessionError::NegotiationFailed(format!("Failed to set local description: {e}"))
            })?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, SessionError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| SessionError::NegotiationFailed(format!("Failed to create answer: {e}")))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| {
                SessionError::NegotiationFailed(format!("Failed to set local description: {e}"))
            })?;
        Ok(answer.sdp)
    }

    async fn set_remote_description(
        &self,
        kind: DescriptionKind,
        sdp: &str,
    ) -> Result<(), SessionError> {
        if sdp.trim().is_empty() {
            return Err(SessionError::NegotiationFailed(
                "Remote description cannot be empty".to_string(),
            ));
        }
        let description = match kind {
            DescriptionKind::Offer => RTCSessionDescription::offer(sdp.to_string()),
            DescriptionKind::Answer => RTCSessionDescription::answer(sdp.to_string()),
        }
        .map_err(|e| SessionError::NegotiationFailed(format!("Invalid SDP: {e}")))?;

        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| {
                SessionError::NegotiationFailed(format!("Failed to set remote description: {e}"))
            })
    }

    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), SessionError> {
        let init = serde_json::from_str::<RTCIceCandidateInit>(candidate).unwrap_or_else(|_| {
            RTCIceCandidateInit {
                candidate: candidate.to_string(),
                ..Default::default()
            }
        });
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| link_error("Failed to add candidate", e))
    }

    async fn set_track(
        &self,
        kind: MediaKind,
        track: Option<LocalTrack>,
    ) -> Result<TrackSwap, SessionError> {
        let Some(sender) = self.senders.get(&kind) else {
            return Err(SessionError::Link(format!("No {kind:?} sender")));
        };
        let local: Option<Arc<dyn TrackLocal + Send + Sync>> = track.map(|track| {
            Arc::new(TrackLocalStaticSample::new(
                codec(kind),
                track.id().to_string(),
                "tandem".to_string(),
            )) as Arc<dyn TrackLocal + Send + Sync>
        });
        sender
            .replace_track(local)
            .await
            .map_err(|e| link_error("Failed to replace track", e))?;
        Ok(TrackSwap::InPlace)
    }

    fn supports_track_replacement(&self) -> bool {
        true
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!(remote = %self.key.remote, error = %e, "Failed to close peer connection");
        }
    }
}
