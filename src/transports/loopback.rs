//! In-process peer transport.
//!
//! [`LoopbackNetwork`] pairs transports through their session descriptions:
//! every description's SDP names the endpoint that produced it, and applying
//! an answer on the offering side links the two endpoints and opens the data
//! channel on both. Candidates are gathered (one fake host candidate) so the
//! negotiator's batching path is exercised, but they carry no meaning.
//!
//! This is useful for:
//!
//! - **Testing**: run host and client sessions inside one process
//! - **Demos**: show a complete match without a browser
//!
//! ```rust
//! use setlink::transports::LoopbackNetwork;
//!
//! let network = LoopbackNetwork::new();
//! let connector = network.connector();
//! # let _ = connector;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Result, SessionError};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};
use crate::transport::{
    LinkState, PeerConnector, PeerEvent, PeerEventSink, PeerTransport, SignalingState,
};

const SDP_PREFIX: &str = "loopback ";

#[derive(Debug)]
struct Endpoint {
    sink: PeerEventSink,
    partner: Option<u64>,
    open: bool,
}

#[derive(Debug, Default)]
struct NetworkInner {
    next_id: u64,
    endpoints: HashMap<u64, Endpoint>,
    blocked: bool,
}

/// The shared "network" every loopback transport registers with.
#[derive(Debug, Default)]
pub struct LoopbackNetwork {
    inner: Mutex<NetworkInner>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A connector creating transports on this network.
    pub fn connector(self: &Arc<Self>) -> LoopbackConnector {
        LoopbackConnector {
            network: Arc::clone(self),
        }
    }

    /// While blocked, applying an answer leaves the link stuck in
    /// `Checking` instead of opening the channel.
    pub fn set_blocked(&self, blocked: bool) {
        if let Ok(mut inner) = self.lock() {
            inner.blocked = blocked;
        }
    }

    /// Number of endpoints with an open channel.
    pub fn open_endpoints(&self) -> usize {
        self.lock()
            .map(|inner| inner.endpoints.values().filter(|e| e.open).count())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, NetworkInner>> {
        self.inner
            .lock()
            .map_err(|_| SessionError::Negotiation("loopback network poisoned".to_owned()))
    }

    fn register(&self, sink: PeerEventSink) -> Result<u64> {
        let mut inner = self.lock()?;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.endpoints.insert(
            id,
            Endpoint {
                sink,
                partner: None,
                open: false,
            },
        );
        Ok(id)
    }

    /// Link two endpoints and open both channels. Returns `false` when blocked.
    fn link(&self, a: u64, b: u64) -> Result<bool> {
        let mut inner = self.lock()?;
        if inner.blocked {
            debug!(a, b, "loopback: link blocked");
            return Ok(false);
        }
        if !inner.endpoints.contains_key(&a) || !inner.endpoints.contains_key(&b) {
            return Err(SessionError::Negotiation(format!(
                "loopback endpoint {b} is gone"
            )));
        }
        for (this, other) in [(a, b), (b, a)] {
            if let Some(endpoint) = inner.endpoints.get_mut(&this) {
                endpoint.partner = Some(other);
                endpoint.open = true;
                endpoint
                    .sink
                    .emit(PeerEvent::LinkStateChanged(LinkState::Connected));
                endpoint.sink.emit(PeerEvent::ChannelOpen);
            }
        }
        Ok(true)
    }

    fn is_open(&self, id: u64) -> bool {
        self.lock()
            .map(|inner| inner.endpoints.get(&id).is_some_and(|e| e.open))
            .unwrap_or_default()
    }

    fn deliver(&self, from: u64, text: &str) -> Result<()> {
        let inner = self.lock()?;
        let partner = inner
            .endpoints
            .get(&from)
            .filter(|e| e.open)
            .and_then(|e| e.partner)
            .ok_or(SessionError::ChannelClosed)?;
        let target = inner
            .endpoints
            .get(&partner)
            .filter(|e| e.open)
            .ok_or(SessionError::ChannelClosed)?;
        target.sink.emit(PeerEvent::Message(text.to_owned()));
        Ok(())
    }

    fn unregister(&self, id: u64) {
        let Ok(mut inner) = self.lock() else {
            return;
        };
        let Some(endpoint) = inner.endpoints.remove(&id) else {
            return;
        };
        if let Some(partner) = endpoint.partner {
            if let Some(other) = inner.endpoints.get_mut(&partner) {
                let was_open = other.open;
                other.open = false;
                other.partner = None;
                if was_open {
                    other
                        .sink
                        .emit(PeerEvent::LinkStateChanged(LinkState::Disconnected));
                    other.sink.emit(PeerEvent::ChannelClosed);
                }
            }
        }
    }
}

/// [`PeerConnector`] for a [`LoopbackNetwork`].
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    network: Arc<LoopbackNetwork>,
}

impl PeerConnector for LoopbackConnector {
    fn connect(&self, sink: PeerEventSink) -> Result<Box<dyn PeerTransport>> {
        let id = self.network.register(sink.clone())?;
        debug!(id, remote = %sink.remote(), "loopback: transport created");
        Ok(Box::new(LoopbackPeer {
            id,
            network: Arc::clone(&self.network),
            sink,
            signaling: SignalingState::Stable,
            link: LinkState::New,
            remote: None,
            remote_candidates: Vec::new(),
            closed: false,
        }))
    }
}

#[derive(Debug)]
struct LoopbackPeer {
    id: u64,
    network: Arc<LoopbackNetwork>,
    sink: PeerEventSink,
    signaling: SignalingState,
    link: LinkState,
    remote: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
    closed: bool,
}

impl LoopbackPeer {
    fn sdp(&self) -> String {
        format!("{SDP_PREFIX}{}", self.id)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(SessionError::Negotiation("transport closed".to_owned()))
        } else {
            Ok(())
        }
    }

    fn gather(&self) {
        self.sink.emit(PeerEvent::LocalCandidate(IceCandidate::new(format!(
            "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
            self.id,
            40000 + self.id % 20000
        ))));
        self.sink.emit(PeerEvent::GatheringComplete);
    }

    fn set_link(&mut self, link: LinkState) {
        self.link = link;
        self.sink.emit(PeerEvent::LinkStateChanged(link));
    }
}

fn endpoint_of(description: &SessionDescription) -> Result<u64> {
    description
        .sdp
        .strip_prefix(SDP_PREFIX)
        .and_then(|id| id.trim().parse().ok())
        .ok_or_else(|| SessionError::Negotiation(format!("not a loopback sdp: {}", description.sdp)))
}

#[async_trait]
impl PeerTransport for LoopbackPeer {
    async fn create_offer(&mut self) -> Result<SessionDescription> {
        self.ensure_open()?;
        Ok(SessionDescription::offer(self.sdp()))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription> {
        self.ensure_open()?;
        if self.signaling != SignalingState::HaveRemoteOffer {
            return Err(SessionError::Negotiation(
                "create_answer without a remote offer".to_owned(),
            ));
        }
        Ok(SessionDescription::answer(self.sdp()))
    }

    async fn set_local_description(&mut self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        match description.kind {
            SdpKind::Offer => self.signaling = SignalingState::HaveLocalOffer,
            SdpKind::Answer => {
                if self.signaling != SignalingState::HaveRemoteOffer {
                    return Err(SessionError::Negotiation(
                        "local answer without a remote offer".to_owned(),
                    ));
                }
                self.signaling = SignalingState::Stable;
                self.set_link(LinkState::Checking);
            }
        }
        self.gather();
        Ok(())
    }

    async fn set_remote_description(&mut self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        let partner = endpoint_of(&description)?;
        match description.kind {
            SdpKind::Offer => {
                self.signaling = SignalingState::HaveRemoteOffer;
                self.remote = Some(description);
            }
            SdpKind::Answer => {
                if self.signaling != SignalingState::HaveLocalOffer {
                    return Err(SessionError::Negotiation(
                        "remote answer without a local offer".to_owned(),
                    ));
                }
                self.signaling = SignalingState::Stable;
                self.remote = Some(description);
                self.set_link(LinkState::Checking);
                if self.network.link(self.id, partner)? {
                    self.link = LinkState::Connected;
                }
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        if self.remote.is_none() {
            return Err(SessionError::Negotiation(
                "candidate before remote description".to_owned(),
            ));
        }
        self.remote_candidates.push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.signaling
    }

    fn link_state(&self) -> LinkState {
        if self.is_channel_open() {
            LinkState::Connected
        } else {
            self.link
        }
    }

    fn has_remote_description(&self) -> bool {
        self.remote.is_some()
    }

    fn is_channel_open(&self) -> bool {
        !self.closed && self.network.is_open(self.id)
    }

    fn send(&mut self, text: &str) -> Result<()> {
        if self.closed {
            return Err(SessionError::ChannelClosed);
        }
        self.network.deliver(self.id, text)
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.signaling = SignalingState::Closed;
        self.link = LinkState::Closed;
        self.network.unregister(self.id);
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::transport::PeerSignal;
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::UnboundedReceiver<PeerSignal>) -> Vec<PeerEvent> {
        let mut events = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            events.push(signal.event);
        }
        events
    }

    #[tokio::test]
    async fn offer_answer_opens_both_channels() {
        let network = LoopbackNetwork::new();
        let connector = network.connector();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut host = connector.connect(PeerEventSink::new("bob", 1, tx.clone())).unwrap();
        let mut client = connector.connect(PeerEventSink::new("ann", 1, tx)).unwrap();

        let offer = host.create_offer().await.unwrap();
        host.set_local_description(offer.clone()).await.unwrap();
        assert_eq!(host.signaling_state(), SignalingState::HaveLocalOffer);

        client.set_remote_description(offer).await.unwrap();
        let answer = client.create_answer().await.unwrap();
        client.set_local_description(answer.clone()).await.unwrap();
        host.set_remote_description(answer).await.unwrap();

        assert!(host.is_channel_open());
        assert!(client.is_channel_open());
        assert_eq!(network.open_endpoints(), 2);

        let events = drain(&mut rx);
        assert_eq!(
            events.iter().filter(|e| **e == PeerEvent::ChannelOpen).count(),
            2
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, PeerEvent::LocalCandidate(_))));

        host.send("hi").unwrap();
        assert_eq!(drain(&mut rx), vec![PeerEvent::Message("hi".into())]);

        client.close().await;
        assert!(!host.is_channel_open());
        assert!(drain(&mut rx).contains(&PeerEvent::ChannelClosed));
        assert!(matches!(host.send("late"), Err(SessionError::ChannelClosed)));
    }

    #[tokio::test]
    async fn blocked_network_stays_checking() {
        let network = LoopbackNetwork::new();
        network.set_blocked(true);
        let connector = network.connector();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut host = connector.connect(PeerEventSink::new("bob", 1, tx.clone())).unwrap();
        let mut client = connector.connect(PeerEventSink::new("ann", 1, tx)).unwrap();

        let offer = host.create_offer().await.unwrap();
        host.set_local_description(offer.clone()).await.unwrap();
        client.set_remote_description(offer).await.unwrap();
        let answer = client.create_answer().await.unwrap();
        client.set_local_description(answer.clone()).await.unwrap();
        host.set_remote_description(answer).await.unwrap();

        assert!(!host.is_channel_open());
        assert_eq!(host.link_state(), LinkState::Checking);
    }

    #[tokio::test]
    async fn candidates_require_remote_description() {
        let network = LoopbackNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut peer = network
            .connector()
            .connect(PeerEventSink::new("x", 1, tx))
            .unwrap();
        assert!(peer
            .add_ice_candidate(IceCandidate::new("candidate:0"))
            .await
            .is_err());
        assert!(peer.create_answer().await.is_err());
    }
}
