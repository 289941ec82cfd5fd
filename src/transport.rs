//! Peer-connection abstraction.
//!
//! The [`PeerTransport`] trait is the slice of a WebRTC `RTCPeerConnection`
//! (plus its single reliable, ordered data channel) that the negotiator
//! drives. Construction is done by a [`PeerConnector`], which is handed a
//! [`PeerEventSink`] for the asynchronous half: gathered ICE candidates,
//! channel open/close, and inbound messages.
//!
//! # Implementing a Custom Transport
//!
//! A browser build wraps `web-sys` peer connections; a native build might
//! wrap a WebRTC stack. The in-process
//! [`LoopbackConnector`](crate::transports::LoopbackConnector) is the
//! reference implementation.
//!
//! # Events
//!
//! Every transport built by a connector emits through the sink it was given.
//! Each sink carries a generation number; events from a transport that the
//! negotiator has already discarded are recognized by their stale generation
//! and dropped.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::{IceCandidate, SessionDescription};

/// Offer/answer state of the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingState {
    Stable,
    /// A local offer is set and no answer has been applied yet.
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// ICE/DTLS progress of the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    New,
    Checking,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    /// `true` while the transport is actively trying to connect.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Checking | Self::Connecting)
    }
}

/// Asynchronous notifications from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A local ICE candidate was gathered and should be sent to the remote.
    LocalCandidate(IceCandidate),
    /// Candidate gathering finished.
    GatheringComplete,
    /// The data channel is open.
    ChannelOpen,
    /// A text message arrived on the data channel.
    Message(String),
    /// The data channel closed.
    ChannelClosed,
    /// The link state changed.
    LinkStateChanged(LinkState),
}

/// A [`PeerEvent`] tagged with the remote nickname and transport generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSignal {
    pub remote: String,
    pub generation: u64,
    pub event: PeerEvent,
}

/// Where a transport sends its [`PeerEvent`]s.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    remote: String,
    generation: u64,
    tx: mpsc::UnboundedSender<PeerSignal>,
}

impl PeerEventSink {
    pub fn new(
        remote: impl Into<String>,
        generation: u64,
        tx: mpsc::UnboundedSender<PeerSignal>,
    ) -> Self {
        Self {
            remote: remote.into(),
            generation,
            tx,
        }
    }

    /// The remote nickname this transport talks to.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Emit an event. Silently dropped once the session loop is gone.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.tx.send(PeerSignal {
            remote: self.remote.clone(),
            generation: self.generation,
            event,
        });
    }
}

/// One peer connection with its data channel.
///
/// # Object Safety
///
/// The negotiator stores transports as `Box<dyn PeerTransport>`.
#[async_trait]
pub trait PeerTransport: Send + 'static {
    /// Create an offer (the host side calls this).
    async fn create_offer(&mut self) -> Result<SessionDescription>;

    /// Create an answer to the applied remote offer.
    async fn create_answer(&mut self) -> Result<SessionDescription>;

    /// Apply a locally created description. Starts candidate gathering.
    async fn set_local_description(&mut self, description: SessionDescription) -> Result<()>;

    /// Apply the remote side's description.
    async fn set_remote_description(&mut self, description: SessionDescription) -> Result<()>;

    /// Add a remote ICE candidate. Only valid once a remote description is set.
    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;

    fn link_state(&self) -> LinkState;

    fn has_remote_description(&self) -> bool;

    fn is_channel_open(&self) -> bool;

    /// Send one text message over the data channel.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ChannelClosed`](crate::SessionError::ChannelClosed)
    /// if the channel is not open.
    fn send(&mut self, text: &str) -> Result<()>;

    /// Close the connection. Must be idempotent.
    async fn close(&mut self);
}

/// Factory for [`PeerTransport`]s.
pub trait PeerConnector: Send + Sync + 'static {
    /// Create a fresh transport towards `sink.remote()`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Negotiation`](crate::SessionError::Negotiation)
    /// if the underlying connection object cannot be created.
    fn connect(&self, sink: PeerEventSink) -> Result<Box<dyn PeerTransport>>;
}
