//! In-process peer links
//!
//! [`LoopbackNetwork`] pairs the links of participants living in the same
//! process. A pair reports `Connected` on both sides once each side has a
//! local description, a remote description and at least one remote
//! candidate, and the pair is not severed. Tests drive connectivity loss with
//! [`LoopbackNetwork::sever`] and inspect what each side is sending.

use crate::identity::ParticipantId;
use crate::media::LocalTrack;
use crate::session::{
    Connectivity, DescriptionKind, LinkEvent, PeerLink, PeerLinkFactory, SessionError, SessionKey,
    TrackSwap,
};
use crate::types::{MediaKind, NegotiationRole};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

type Pair = (ParticipantId, ParticipantId);

fn unordered(a: &ParticipantId, b: &ParticipantId) -> Pair {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

struct LinkRecord {
    id: u64,
    key: SessionKey,
    events: mpsc::UnboundedSender<LinkEvent>,
    local_description: bool,
    remote_description: bool,
    remote_candidates: Vec<String>,
    tracks: HashMap<MediaKind, String>,
    track_swaps: usize,
    supports_replacement: bool,
    connected: bool,
    closed: bool,
}

impl LinkRecord {
    fn ready(&self) -> bool {
        !self.closed
            && self.local_description
            && self.remote_description
            && !self.remote_candidates.is_empty()
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    fn emit_candidate(&self) {
        self.emit(LinkEvent::LocalCandidate {
            key: self.key.clone(),
            candidate: format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                self.id,
                40_000 + self.id
            ),
        });
    }
}

#[derive(Default)]
struct NetworkState {
    links: HashMap<Pair, LinkRecord>,
    severed: HashSet<Pair>,
    no_replacement: HashSet<ParticipantId>,
    next_id: u64,
    links_created: usize,
    offers_created: usize,
}

impl NetworkState {
    fn record_mut(
        &mut self,
        local: &ParticipantId,
        remote: &ParticipantId,
        id: u64,
    ) -> Result<&mut LinkRecord, SessionError> {
        self.links
            .get_mut(&(local.clone(), remote.clone()))
            .filter(|r| r.id == id && !r.closed)
            .ok_or(SessionError::Closed)
    }

    fn evaluate(&mut self, a: &ParticipantId, b: &ParticipantId) {
        let ab = (a.clone(), b.clone());
        let ba = (b.clone(), a.clone());
        let up = !self.severed.contains(&unordered(a, b))
            && self.links.get(&ab).is_some_and(LinkRecord::ready)
            && self.links.get(&ba).is_some_and(LinkRecord::ready);

        for pair in [ab, ba] {
            let Some(record) = self.links.get_mut(&pair) else {
                continue;
            };
            if record.closed || record.connected == up {
                continue;
            }
            record.connected = up;
            let state = if up {
                Connectivity::Connected
            } else {
                Connectivity::Disconnected
            };
            tracing::trace!(local = %pair.0, remote = %pair.1, ?state, "Loopback connectivity");
            record.emit(LinkEvent::Connectivity {
                key: record.key.clone(),
                state,
            });
        }
    }
}

/// Shared in-memory network for loopback links
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    /// Create an empty network
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Link factory for one participant
    #[must_use]
    pub fn factory(&self, local: ParticipantId) -> LoopbackLinkFactory {
        LoopbackLinkFactory {
            network: self.clone(),
            local,
        }
    }

    /// Cut connectivity between two participants
    pub fn sever(&self, a: &ParticipantId, b: &ParticipantId) {
        let mut state = self.state.lock();
        state.severed.insert(unordered(a, b));
        state.evaluate(a, b);
    }

    /// Restore connectivity between two participants
    pub fn restore(&self, a: &ParticipantId, b: &ParticipantId) {
        let mut state = self.state.lock();
        state.severed.remove(&unordered(a, b));
        state.evaluate(a, b);
    }

    /// Report terminal failure on `local`'s link to `remote`
    pub fn fail_link(&self, local: &ParticipantId, remote: &ParticipantId) {
        let state = self.state.lock();
        if let Some(record) = state.links.get(&(local.clone(), remote.clone())) {
            record.emit(LinkEvent::Connectivity {
                key: record.key.clone(),
                state: Connectivity::Failed,
            });
        }
    }

    /// Enable or disable in-place track replacement for `local`'s links
    pub fn set_replacement_supported(&self, local: &ParticipantId, supported: bool) {
        let mut state = self.state.lock();
        if supported {
            state.no_replacement.remove(local);
        } else {
            state.no_replacement.insert(local.clone());
        }
        for ((owner, _), record) in &mut state.links {
            if owner == local {
                record.supports_replacement = supported;
            }
        }
    }

    /// Links created so far
    #[must_use]
    pub fn links_created(&self) -> usize {
        self.state.lock().links_created
    }

    /// Offers created so far
    #[must_use]
    pub fn offers_created(&self) -> usize {
        self.state.lock().offers_created
    }

    /// In-place track swaps on `local`'s current link to `remote`
    #[must_use]
    pub fn track_swaps(&self, local: &ParticipantId, remote: &ParticipantId) -> usize {
        self.state
            .lock()
            .links
            .get(&(local.clone(), remote.clone()))
            .map_or(0, |r| r.track_swaps)
    }

    /// Track `receiver` currently gets from `sender`
    #[must_use]
    pub fn received_track(
        &self,
        receiver: &ParticipantId,
        sender: &ParticipantId,
        kind: MediaKind,
    ) -> Option<String> {
        self.state
            .lock()
            .links
            .get(&(sender.clone(), receiver.clone()))
            .filter(|r| !r.closed)
            .and_then(|r| r.tracks.get(&kind).cloned())
    }

    /// Remote candidates applied on `local`'s link to `remote`, in order
    #[must_use]
    pub fn remote_candidates(&self, local: &ParticipantId, remote: &ParticipantId) -> Vec<String> {
        self.state
            .lock()
            .links
            .get(&(local.clone(), remote.clone()))
            .map(|r| r.remote_candidates.clone())
            .unwrap_or_default()
    }

    /// Whether `local`'s link to `remote` is connected
    #[must_use]
    pub fn is_connected(&self, local: &ParticipantId, remote: &ParticipantId) -> bool {
        self.state
            .lock()
            .links
            .get(&(local.clone(), remote.clone()))
            .is_some_and(|r| r.connected)
    }
}

/// Creates loopback links for one participant
pub struct LoopbackLinkFactory {
    network: LoopbackNetwork,
    local: ParticipantId,
}

#[async_trait]
impl PeerLinkFactory for LoopbackLinkFactory {
    async fn create(
        &self,
        key: SessionKey,
        role: NegotiationRole,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, SessionError> {
        let mut state = self.network.state.lock();
        state.next_id += 1;
        state.links_created += 1;
        let id = state.next_id;
        let remote = key.remote.clone();
        let supports_replacement = !state.no_replacement.contains(&self.local);
        state.links.insert(
            (self.local.clone(), remote.clone()),
            LinkRecord {
                id,
                key,
                events,
                local_description: false,
                remote_description: false,
                remote_candidates: Vec::new(),
                tracks: HashMap::new(),
                track_swaps: 0,
                supports_replacement,
                connected: false,
                closed: false,
            },
        );
        state.evaluate(&self.local, &remote);
        tracing::debug!(local = %self.local, remote = %remote, link_id = id, ?role, "Loopback link created");

        Ok(Arc::new(LoopbackLink {
            network: self.network.clone(),
            local: self.local.clone(),
            remote,
            id,
        }))
    }
}

/// One side of a loopback pair
pub struct LoopbackLink {
    network: LoopbackNetwork,
    local: ParticipantId,
    remote: ParticipantId,
    id: u64,
}

impl LoopbackLink {
    fn sdp(&self, kind: &str) -> String {
        format!(
            "v=0\r\no={} {} 1 IN IP4 127.0.0.1\r\ns=tandem-loopback\r\na={kind}\r\n",
            self.local, self.id
        )
    }
}

#[async_trait]
impl PeerLink for LoopbackLink {
    async fn create_offer(&self) -> Result<String, SessionError> {
        let mut state = self.network.state.lock();
        let record = state.record_mut(&self.local, &self.remote, self.id)?;
        record.local_description = true;
        record.emit_candidate();
        state.offers_created += 1;
        state.evaluate(&self.local, &self.remote);
        Ok(self.sdp("offer"))
    }

    async fn create_answer(&self) -> Result<String, SessionError> {
        let mut state = self.network.state.lock();
        let record = state.record_mut(&self.local, &self.remote, self.id)?;
        if !record.remote_description {
            return Err(SessionError::NoRemoteDescription);
        }
        record.local_description = true;
        record.emit_candidate();
        state.evaluate(&self.local, &self.remote);
        Ok(self.sdp("answer"))
    }

    async fn set_remote_description(
        &self,
        _kind: DescriptionKind,
        sdp: &str,
    ) -> Result<(), SessionError> {
        if sdp.trim().is_empty() {
            return Err(SessionError::NegotiationFailed(
                "empty remote description".to_string(),
            ));
        }
        let mut state = self.network.state.lock();
        state
            .record_mut(&self.local, &self.remote, self.id)?
            .remote_description = true;
        state.evaluate(&self.local, &self.remote);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), SessionError> {
        let mut state = self.network.state.lock();
        let record = state.record_mut(&self.local, &self.remote, self.id)?;
        if !record.remote_description {
            return Err(SessionError::NoRemoteDescription);
        }
        record.remote_candidates.push(candidate.to_string());
        state.evaluate(&self.local, &self.remote);
        Ok(())
    }

    async fn set_track(
        &self,
        kind: MediaKind,
        track: Option<LocalTrack>,
    ) -> Result<TrackSwap, SessionError> {
        let mut state = self.network.state.lock();
        let record = state.record_mut(&self.local, &self.remote, self.id)?;
        if !record.supports_replacement && record.local_description {
            return Ok(TrackSwap::NeedsRenegotiation);
        }
        let previous = match track {
            Some(track) => record.tracks.insert(kind, track.id().to_string()),
            None => record.tracks.remove(&kind),
        };
        if previous.is_some() && previous.as_ref() != record.tracks.get(&kind) {
            record.track_swaps += 1;
        }
        Ok(TrackSwap::InPlace)
    }

    fn supports_track_replacement(&self) -> bool {
        self.network
            .state
            .lock()
            .links
            .get(&(self.local.clone(), self.remote.clone()))
            .is_some_and(|r| r.id == self.id && r.supports_replacement)
    }

    async fn close(&self) {
        let mut state = self.network.state.lock();
        if let Ok(record) = state.record_mut(&self.local, &self.remote, self.id) {
            record.closed = true;
            record.connected = false;
            state.evaluate(&self.local, &self.remote);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct Side {
        link: Arc<dyn PeerLink>,
        events: mpsc::UnboundedReceiver<LinkEvent>,
    }

    async fn side(network: &LoopbackNetwork, local: &str, remote: &str) -> Side {
        let (tx, events) = mpsc::unbounded_channel();
        let key = SessionKey {
            remote: ParticipantId::new(remote),
            epoch: 0,
        };
        let link = network
            .factory(ParticipantId::new(local))
            .create(key, NegotiationRole::Initiator, tx)
            .await
            .unwrap();
        Side { link, events }
    }

    fn drain(side: &mut Side) -> Vec<LinkEvent> {
        let mut out = Vec::new();
        while let Ok(event) = side.events.try_recv() {
            out.push(event);
        }
        out
    }

    fn candidate_of(events: &[LinkEvent]) -> String {
        events
            .iter()
            .find_map(|e| match e {
                LinkEvent::LocalCandidate { candidate, .. } => Some(candidate.clone()),
                LinkEvent::Connectivity { .. } => None,
            })
            .unwrap()
    }

    fn connectivity(events: &[LinkEvent]) -> Vec<Connectivity> {
        events
            .iter()
            .filter_map(|e| match e {
                LinkEvent::Connectivity { state, .. } => Some(*state),
                LinkEvent::LocalCandidate { .. } => None,
            })
            .collect()
    }

    async fn connect_pair(network: &LoopbackNetwork) -> (Side, Side) {
        let mut alice = side(network, "alice", "bob").await;
        let mut bob = side(network, "bob", "alice").await;

        let offer = alice.link.create_offer().await.unwrap();
        bob.link
            .set_remote_description(DescriptionKind::Offer, &offer)
            .await
            .unwrap();
        let answer = bob.link.create_answer().await.unwrap();
        alice
            .link
            .set_remote_description(DescriptionKind::Answer, &answer)
            .await
            .unwrap();

        let alice_candidate = candidate_of(&drain(&mut alice));
        let bob_candidate = candidate_of(&drain(&mut bob));
        bob.link.add_remote_candidate(&alice_candidate).await.unwrap();
        alice.link.add_remote_candidate(&bob_candidate).await.unwrap();
        (alice, bob)
    }

    #[tokio::test]
    async fn test_pair_connects_after_full_exchange() {
        let network = LoopbackNetwork::new();
        let (mut alice, mut bob) = connect_pair(&network).await;

        assert_eq!(connectivity(&drain(&mut alice)), vec![Connectivity::Connected]);
        assert_eq!(connectivity(&drain(&mut bob)), vec![Connectivity::Connected]);
        assert_eq!(network.offers_created(), 1);
    }

    #[tokio::test]
    async fn test_candidate_before_description_is_rejected() {
        let network = LoopbackNetwork::new();
        let bob = side(&network, "bob", "alice").await;
        assert_eq!(
            bob.link.add_remote_candidate("candidate:1").await,
            Err(SessionError::NoRemoteDescription)
        );
    }

    #[tokio::test]
    async fn test_sever_and_restore() {
        let network = LoopbackNetwork::new();
        let (mut alice, mut bob) = connect_pair(&network).await;
        drain(&mut alice);
        drain(&mut bob);

        let a = ParticipantId::new("alice");
        let b = ParticipantId::new("bob");
        network.sever(&a, &b);
        assert_eq!(connectivity(&drain(&mut alice)), vec![Connectivity::Disconnected]);
        network.restore(&a, &b);
        assert_eq!(connectivity(&drain(&mut bob)), vec![Connectivity::Disconnected, Connectivity::Connected]);
    }

    #[tokio::test]
    async fn test_track_swap_in_place_and_disabled() {
        let network = LoopbackNetwork::new();
        let (alice, _bob) = connect_pair(&network).await;
        let a = ParticipantId::new("alice");
        let b = ParticipantId::new("bob");

        let first = LocalTrack::new(MediaKind::Video, "cam-1");
        let second = LocalTrack::new(MediaKind::Video, "cam-2");
        assert_eq!(
            alice.link.set_track(MediaKind::Video, Some(first)).await.unwrap(),
            TrackSwap::InPlace
        );
        assert_eq!(
            alice.link.set_track(MediaKind::Video, Some(second.clone())).await.unwrap(),
            TrackSwap::InPlace
        );
        assert_eq!(network.track_swaps(&a, &b), 1);
        assert_eq!(
            network.received_track(&b, &a, MediaKind::Video),
            Some(second.id().to_string())
        );

        network.set_replacement_supported(&a, false);
        assert!(!alice.link.supports_track_replacement());
        let third = LocalTrack::new(MediaKind::Video, "cam-3");
        assert_eq!(
            alice.link.set_track(MediaKind::Video, Some(third)).await.unwrap(),
            TrackSwap::NeedsRenegotiation
        );
    }

    #[tokio::test]
    async fn test_closing_one_side_disconnects_the_other() {
        let network = LoopbackNetwork::new();
        let (alice, mut bob) = connect_pair(&network).await;
        drain(&mut bob);

        alice.link.close().await;
        assert_eq!(connectivity(&drain(&mut bob)), vec![Connectivity::Disconnected]);
        assert_eq!(alice.link.create_offer().await, Err(SessionError::Closed));
    }
}
