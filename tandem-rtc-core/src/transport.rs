//! ant-quic signaling channel
//!
//! Carries [`Envelope`]s as JSON datagrams over an ant-quic connection to the
//! room relay. The relay is the only peer this channel talks to; routing to
//! participants and room broadcast happen on the relay side.

use crate::signaling::{Envelope, SignalingChannel, SignalingError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Maximum signaling envelope size (64KB) to prevent DoS attacks
const MAX_ENVELOPE_SIZE: usize = 64 * 1024;

/// Receive poll interval; shutdown is checked between polls
const RECV_POLL: Duration = Duration::from_secs(30);

/// Transport configuration
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    /// Local endpoint address
    pub local_addr: Option<SocketAddr>,
}

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection error
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Send error
    #[error("Send error: {0}")]
    SendError(String),

    /// Receive error
    #[error("Receive error: {0}")]
    ReceiveError(String),
}

impl From<TransportError> for SignalingError {
    fn from(e: TransportError) -> Self {
        SignalingError::TransportError(e.to_string())
    }
}

/// Signaling channel over ant-quic
///
/// Call [`QuicSignalingChannel::start`] and
/// [`QuicSignalingChannel::connect_to_relay`] before handing the channel to
/// the orchestrator.
pub struct QuicSignalingChannel {
    config: TransportConfig,
    node: Option<Arc<ant_quic::Node>>,
    relay: Arc<RwLock<Option<ant_quic::PeerId>>>,
    shutdown: Arc<tokio::sync::watch::Sender<bool>>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

impl QuicSignalingChannel {
    /// Create a channel; nothing is bound until `start`
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        Self {
            config,
            node: None,
            relay: Arc::new(RwLock::new(None)),
            shutdown: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    /// Get transport configuration
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Bind the QUIC node
    ///
    /// An inbound connection becomes the relay if none is set yet.
    ///
    /// # Errors
    ///
    /// Returns error if node creation fails
    pub async fn start(&mut self) -> Result<(), TransportError> {
        use ant_quic::{Node, NodeConfigBuilder};

        let config_builder = NodeConfigBuilder::default();
        let node_config = if let Some(addr) = self.config.local_addr {
            config_builder.bind_addr(addr).build()
        } else {
            config_builder.build()
        };

        let node = Node::with_config(node_config).await.map_err(|e| {
            TransportError::ConnectionError(format!("Failed to create QUIC node: {}", e))
        })?;
        let node = Arc::new(node);

        let accept_node = node.clone();
        let relay = self.relay.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("Shutting down accept loop");
                            break;
                        }
                    }
                    result = accept_node.accept() => {
                        if let Some(conn) = result {
                            tracing::debug!(peer = ?conn.peer_id, addr = ?conn.remote_addr, "Accepted relay connection");
                            relay.write().get_or_insert(conn.peer_id);
                        }
                    }
                }
            }
        });

        self.node = Some(node);
        Ok(())
    }

    /// Stop receiving and shut down the accept loop
    ///
    /// # Errors
    ///
    /// Returns error if shutdown signal fails to send
    pub fn stop(&self) -> Result<(), TransportError> {
        if self.shutdown.send(true).is_err() {
            return Err(TransportError::ConnectionError(
                "Failed to send shutdown signal".to_string(),
            ));
        }
        *self.relay.write() = None;
        tracing::info!("Transport shutdown signal sent");
        Ok(())
    }

    /// Get local address
    ///
    /// # Errors
    ///
    /// Returns error if transport is not started
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        let node = self.node()?;
        let mut addr = node.local_addr().ok_or_else(|| {
            TransportError::ConnectionError("No local address available".to_string())
        })?;

        // Bound to 0.0.0.0; advertise localhost
        if addr.ip().is_unspecified() {
            addr.set_ip(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
        }
        Ok(addr)
    }

    /// Connect to the room relay
    ///
    /// # Errors
    ///
    /// Returns error if the transport is not started or the connection fails
    pub async fn connect_to_relay(&self, addr: SocketAddr) -> Result<(), TransportError> {
        let node = self.node()?;
        let conn = node
            .connect_addr(addr)
            .await
            .map_err(|e| TransportError::ConnectionError(format!("Failed to connect: {}", e)))?;
        *self.relay.write() = Some(conn.peer_id);
        tracing::info!(%addr, peer = ?conn.peer_id, "Connected to signaling relay");
        Ok(())
    }

    fn node(&self) -> Result<&Arc<ant_quic::Node>, TransportError> {
        self.node
            .as_ref()
            .ok_or_else(|| TransportError::ConnectionError("Transport not started".to_string()))
    }

    async fn receive_envelope(&self) -> Result<Envelope, TransportError> {
        let node = self
            .node
            .as_ref()
            .ok_or_else(|| TransportError::ReceiveError("Transport not started".to_string()))?;

        let (_peer_id, data) = node
            .recv(RECV_POLL)
            .await
            .map_err(|e| TransportError::ReceiveError(format!("Failed to receive: {}", e)))?;
        decode_envelope(&data)
    }
}

/// Serialize an envelope, enforcing the size limit
fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, TransportError> {
    let data = serde_json::to_vec(envelope).map_err(|e| {
        TransportError::SendError(format!("Failed to serialize envelope: {}", e))
    })?;
    if data.len() > MAX_ENVELOPE_SIZE {
        return Err(TransportError::SendError(format!(
            "Envelope size {} exceeds maximum of {} bytes",
            data.len(),
            MAX_ENVELOPE_SIZE
        )));
    }
    Ok(data)
}

/// Deserialize and validate an inbound envelope
fn decode_envelope(data: &[u8]) -> Result<Envelope, TransportError> {
    if data.len() > MAX_ENVELOPE_SIZE {
        return Err(TransportError::ReceiveError(format!(
            "Envelope size {} exceeds maximum of {} bytes",
            data.len(),
            MAX_ENVELOPE_SIZE
        )));
    }
    let envelope: Envelope = serde_json::from_slice(data).map_err(|e| {
        TransportError::ReceiveError(format!("Failed to deserialize envelope: {}", e))
    })?;
    envelope
        .message
        .validate()
        .map_err(|e| TransportError::ReceiveError(e.to_string()))?;
    Ok(envelope)
}

#[async_trait]
impl SignalingChannel for QuicSignalingChannel {
    fn is_open(&self) -> bool {
        self.node.is_some() && self.relay.read().is_some()
    }

    async fn send(&self, envelope: Envelope) -> Result<(), SignalingError> {
        let node = self.node()?;
        let Some(relay) = *self.relay.read() else {
            return Err(SignalingError::ChannelUnavailable);
        };
        let data = encode_envelope(&envelope)?;

        node.send(&relay, &data)
            .await
            .map_err(|e| TransportError::SendError(format!("Failed to send: {}", e)))?;
        tracing::trace!(bytes = data.len(), message_type = envelope.message.message_type(), "Sent envelope");
        Ok(())
    }

    async fn recv(&self) -> Option<Envelope> {
        self.node.as_ref()?;
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            if *shutdown_rx.borrow() {
                return None;
            }
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                result = self.receive_envelope() => match result {
                    Ok(envelope) => return Some(envelope),
                    Err(e) => tracing::debug!(error = %e, "No envelope received"),
                },
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::ParticipantId;
    use crate::signaling::{Destination, SignalingMessage};

    fn offer(sdp: String) -> Envelope {
        Envelope {
            from: ParticipantId::new("alice"),
            to: Destination::Participant(ParticipantId::new("bob")),
            message: SignalingMessage::SessionOffer {
                to_id: ParticipantId::new("bob"),
                sdp,
            },
        }
    }

    #[test]
    fn test_envelope_codec() {
        let envelope = offer("v=0".to_string());
        let data = encode_envelope(&envelope).unwrap();
        assert_eq!(decode_envelope(&data).unwrap(), envelope);
    }

    #[test]
    fn test_oversized_envelope_rejected() {
        let envelope = offer("x".repeat(MAX_ENVELOPE_SIZE));
        assert!(matches!(
            encode_envelope(&envelope),
            Err(TransportError::SendError(_))
        ));
        assert!(matches!(
            decode_envelope(&vec![b' '; MAX_ENVELOPE_SIZE + 1]),
            Err(TransportError::ReceiveError(_))
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            decode_envelope(b"not json"),
            Err(TransportError::ReceiveError(_))
        ));
    }

    #[tokio::test]
    async fn test_unstarted_channel_is_closed() {
        let channel = QuicSignalingChannel::new(TransportConfig::default());
        assert!(!channel.is_open());
        assert!(channel.recv().await.is_none());

        let result = channel.send(offer("v=0".to_string())).await;
        assert!(matches!(result, Err(SignalingError::TransportError(_))));
    }

    #[test]
    fn test_transport_config() {
        let config = TransportConfig {
            local_addr: Some("127.0.0.1:8080".parse().unwrap()),
        };
        let channel = QuicSignalingChannel::new(config.clone());
        assert_eq!(channel.config().local_addr, config.local_addr);
        assert!(TransportConfig::default().local_addr.is_none());
    }

    #[tokio::test]
    async fn test_start_without_relay() {
        let mut channel = QuicSignalingChannel::new(TransportConfig::default());
        channel.start().await.unwrap();
        assert!(!channel.is_open());
        assert!(matches!(
            channel.send(offer("v=0".to_string())).await,
            Err(SignalingError::ChannelUnavailable)
        ));
        channel.stop().unwrap();
        assert!(channel.recv().await.is_none());
    }
}
