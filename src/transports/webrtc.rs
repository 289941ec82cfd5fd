//! WebRTC peer transport built on the `webrtc` crate.
//!
//! [`WebRtcConnector`] creates one [`RTCPeerConnection`] per remote peer with a
//! single reliable, ordered data channel. The offering side creates the
//! channel; the answering side adopts it from `on_data_channel`. Gathered ICE
//! candidates, ICE state changes and channel open/close/message callbacks are
//! forwarded to the [`PeerEventSink`] the connector was handed.
//!
//! # Feature gate
//!
//! This module is only available when the `transport-webrtc` feature is
//! enabled (it is enabled by default).
//!
//! # Example
//!
//! ```rust,no_run
//! # fn example() -> setlink::Result<()> {
//! use setlink::transports::{WebRtcConfig, WebRtcConnector};
//!
//! let connector = WebRtcConnector::new(
//!     WebRtcConfig::default().with_ice_servers(["stun:stun.example.org:3478"]),
//! )?;
//! # let _ = connector;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use ::webrtc::api::interceptor_registry::register_default_interceptors;
use ::webrtc::api::media_engine::MediaEngine;
use ::webrtc::api::{APIBuilder, API};
use ::webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use ::webrtc::data_channel::data_channel_message::DataChannelMessage;
use ::webrtc::data_channel::RTCDataChannel;
use ::webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use ::webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use ::webrtc::ice_transport::ice_server::RTCIceServer;
use ::webrtc::interceptor::registry::Registry;
use ::webrtc::peer_connection::configuration::RTCConfiguration;
use ::webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use ::webrtc::peer_connection::signaling_state::RTCSignalingState;
use ::webrtc::peer_connection::RTCPeerConnection;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Result, SessionError};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};
use crate::transport::{
    LinkState, PeerConnector, PeerEvent, PeerEventSink, PeerTransport, SignalingState,
};

/// Public STUN server used when none is configured.
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Label of the game data channel.
pub const DEFAULT_CHANNEL_LABEL: &str = "game";

fn rtc_error(context: &str) -> impl Fn(::webrtc::Error) -> SessionError + '_ {
    move |e| SessionError::Negotiation(format!("{context}: {e}"))
}

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`WebRtcConnector`].
///
/// # Example
///
/// ```
/// use setlink::transports::WebRtcConfig;
///
/// let config = WebRtcConfig::default().with_channel_label("cards");
/// assert_eq!(config.channel_label, "cards");
/// assert_eq!(config.ice_servers.len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebRtcConfig {
    /// STUN/TURN URLs. Defaults to one public STUN server.
    pub ice_servers: Vec<String>,
    /// Label of the data channel created by the offering side.
    pub channel_label: String,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_owned()],
            channel_label: DEFAULT_CHANNEL_LABEL.to_owned(),
        }
    }
}

impl WebRtcConfig {
    /// Replace the ICE server list. An empty list restricts gathering to
    /// host candidates.
    #[must_use]
    pub fn with_ice_servers<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ice_servers = urls.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_channel_label(mut self, label: impl Into<String>) -> Self {
        self.channel_label = label.into();
        self
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

// ── Connector ───────────────────────────────────────────────────────

/// [`PeerConnector`] creating WebRTC peer connections.
#[derive(Clone)]
pub struct WebRtcConnector {
    api: Arc<API>,
    config: WebRtcConfig,
}

impl WebRtcConnector {
    /// Build the WebRTC API with the default codecs and interceptors.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`] if the media engine cannot be set up.
    pub fn new(config: WebRtcConfig) -> Result<Self> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|e| SessionError::Config(format!("webrtc media engine: {e}")))?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(|e| SessionError::Config(format!("webrtc interceptors: {e}")))?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api: Arc::new(api),
            config,
        })
    }

    pub fn config(&self) -> &WebRtcConfig {
        &self.config
    }
}

impl std::fmt::Debug for WebRtcConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcConnector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PeerConnector for WebRtcConnector {
    fn connect(&self, sink: PeerEventSink) -> Result<Box<dyn PeerTransport>> {
        debug!(peer = %sink.remote(), "creating webrtc transport");
        Ok(Box::new(WebRtcTransport {
            api: Arc::clone(&self.api),
            config: self.config.clone(),
            sink,
            connection: None,
            shared: Arc::new(ChannelShared::default()),
            remote_set: false,
        }))
    }
}

// ── Shared callback state ───────────────────────────────────────────

/// State written from `webrtc` callbacks and read by the transport.
#[derive(Debug)]
struct ChannelShared {
    open: AtomicBool,
    link: Mutex<LinkState>,
    /// Feeds the writer task of the current data channel.
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl Default for ChannelShared {
    fn default() -> Self {
        Self {
            open: AtomicBool::new(false),
            link: Mutex::new(LinkState::New),
            outbound: Mutex::new(None),
        }
    }
}

impl ChannelShared {
    fn link(&self) -> LinkState {
        *self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_link(&self, link: LinkState) {
        *self.link.lock().unwrap_or_else(PoisonError::into_inner) = link;
    }

    fn set_outbound(&self, tx: Option<mpsc::UnboundedSender<String>>) {
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = tx;
    }

    fn queue(&self, text: &str) -> Result<()> {
        let guard = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = guard.as_ref().ok_or(SessionError::ChannelClosed)?;
        tx.send(text.to_owned())
            .map_err(|_| SessionError::TransportSend("data channel writer stopped".to_owned()))
    }

    /// Mark the channel closed. Returns `true` if it was open.
    fn close(&self) -> bool {
        self.set_outbound(None);
        self.open.swap(false, Ordering::AcqRel)
    }
}

fn link_state(state: RTCIceConnectionState) -> LinkState {
    match state {
        RTCIceConnectionState::Checking => LinkState::Checking,
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => LinkState::Connected,
        RTCIceConnectionState::Disconnected => LinkState::Disconnected,
        RTCIceConnectionState::Failed => LinkState::Failed,
        RTCIceConnectionState::Closed => LinkState::Closed,
        _ => LinkState::New,
    }
}

fn candidate_from(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
    }
}

/// Hook a data channel up to the sink and start its writer task.
fn attach_channel(channel: Arc<RTCDataChannel>, sink: PeerEventSink, shared: Arc<ChannelShared>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    shared.set_outbound(Some(tx));

    let writer = Arc::clone(&channel);
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = writer.send_text(text).await {
                debug!("data channel send failed: {e}");
            }
        }
    });

    let open_sink = sink.clone();
    let open_shared = Arc::clone(&shared);
    channel.on_open(Box::new(move || {
        if !open_shared.open.swap(true, Ordering::AcqRel) {
            open_sink.emit(PeerEvent::ChannelOpen);
        }
        Box::pin(async {})
    }));

    let message_sink = sink.clone();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        if message.is_string {
            match String::from_utf8(message.data.to_vec()) {
                Ok(text) => message_sink.emit(PeerEvent::Message(text)),
                Err(e) => debug!("non-UTF-8 text frame dropped: {e}"),
            }
        } else {
            debug!(len = message.data.len(), "binary frame dropped");
        }
        Box::pin(async {})
    }));

    channel.on_close(Box::new(move || {
        if shared.close() {
            sink.emit(PeerEvent::ChannelClosed);
        }
        Box::pin(async {})
    }));
}

// ── Transport ───────────────────────────────────────────────────────

/// One WebRTC peer connection and its data channel.
///
/// The underlying connection is created on first use, since creating it is
/// asynchronous and [`PeerConnector::connect`] is not.
pub struct WebRtcTransport {
    api: Arc<API>,
    config: WebRtcConfig,
    sink: PeerEventSink,
    connection: Option<Arc<RTCPeerConnection>>,
    shared: Arc<ChannelShared>,
    remote_set: bool,
}

impl WebRtcTransport {
    async fn connection(&mut self) -> Result<Arc<RTCPeerConnection>> {
        if let Some(connection) = &self.connection {
            return Ok(Arc::clone(connection));
        }
        let connection = Arc::new(
            self.api
                .new_peer_connection(self.config.rtc_configuration())
                .await
                .map_err(rtc_error("create peer connection"))?,
        );
        self.install_handlers(&connection);
        self.connection = Some(Arc::clone(&connection));
        Ok(connection)
    }

    fn install_handlers(&self, connection: &RTCPeerConnection) {
        let candidate_sink = self.sink.clone();
        connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            match candidate.map(|c| c.to_json()) {
                Some(Ok(init)) => {
                    candidate_sink.emit(PeerEvent::LocalCandidate(candidate_from(init)));
                }
                Some(Err(e)) => warn!("unserializable local candidate: {e}"),
                None => candidate_sink.emit(PeerEvent::GatheringComplete),
            }
            Box::pin(async {})
        }));

        let state_sink = self.sink.clone();
        let state_shared = Arc::clone(&self.shared);
        connection.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let link = link_state(state);
            state_shared.set_link(link);
            state_sink.emit(PeerEvent::LinkStateChanged(link));
            if matches!(link, LinkState::Failed | LinkState::Closed) && state_shared.close() {
                state_sink.emit(PeerEvent::ChannelClosed);
            }
            Box::pin(async {})
        }));

        let channel_sink = self.sink.clone();
        let channel_shared = Arc::clone(&self.shared);
        connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            debug!(label = %channel.label(), "remote data channel announced");
            attach_channel(channel, channel_sink.clone(), Arc::clone(&channel_shared));
            Box::pin(async {})
        }));
    }

    fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription> {
        match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(rtc_error("parse session description"))
    }
}

impl std::fmt::Debug for WebRtcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcTransport")
            .field("remote", &self.sink.remote())
            .field("created", &self.connection.is_some())
            .field("remote_set", &self.remote_set)
            .field("open", &self.is_channel_open())
            .finish()
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&mut self) -> Result<SessionDescription> {
        let connection = self.connection().await?;
        if self.shared.outbound.lock().unwrap_or_else(PoisonError::into_inner).is_none() {
            let init = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let channel = connection
                .create_data_channel(&self.config.channel_label, Some(init))
                .await
                .map_err(rtc_error("create data channel"))?;
            attach_channel(channel, self.sink.clone(), Arc::clone(&self.shared));
        }
        let offer = connection
            .create_offer(None)
            .await
            .map_err(rtc_error("create offer"))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription> {
        let connection = self.connection().await?;
        let answer = connection
            .create_answer(None)
            .await
            .map_err(rtc_error("create answer"))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&mut self, description: SessionDescription) -> Result<()> {
        let connection = self.connection().await?;
        connection
            .set_local_description(Self::to_rtc(description)?)
            .await
            .map_err(rtc_error("set local description"))
    }

    async fn set_remote_description(&mut self, description: SessionDescription) -> Result<()> {
        let connection = self.connection().await?;
        connection
            .set_remote_description(Self::to_rtc(description)?)
            .await
            .map_err(rtc_error("set remote description"))?;
        self.remote_set = true;
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        let connection = self.connection().await?;
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: None,
        };
        connection
            .add_ice_candidate(init)
            .await
            .map_err(rtc_error("add candidate"))
    }

    fn signaling_state(&self) -> SignalingState {
        let Some(connection) = &self.connection else {
            return SignalingState::Stable;
        };
        match connection.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    fn link_state(&self) -> LinkState {
        self.shared.link()
    }

    fn has_remote_description(&self) -> bool {
        self.remote_set
    }

    fn is_channel_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    fn send(&mut self, text: &str) -> Result<()> {
        if !self.is_channel_open() {
            return Err(SessionError::ChannelClosed);
        }
        self.shared.queue(text)
    }

    async fn close(&mut self) {
        self.shared.close();
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                debug!(peer = %self.sink.remote(), "peer connection close failed: {e}");
            }
        }
        self.remote_set = false;
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transport::PeerSignal;

    fn transport(remote: &str) -> (Box<dyn PeerTransport>, mpsc::UnboundedReceiver<PeerSignal>) {
        let config = WebRtcConfig::default().with_ice_servers(Vec::<String>::new());
        let connector = WebRtcConnector::new(config).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        (connector.connect(PeerEventSink::new(remote, 1, tx)).unwrap(), rx)
    }

    #[test]
    fn config_defaults() {
        let config = WebRtcConfig::default();
        assert_eq!(config.ice_servers, vec![DEFAULT_STUN_SERVER.to_owned()]);
        assert_eq!(config.channel_label, DEFAULT_CHANNEL_LABEL);
        assert_eq!(config.rtc_configuration().ice_servers.len(), 1);
        assert!(WebRtcConfig::default()
            .with_ice_servers(Vec::<String>::new())
            .rtc_configuration()
            .ice_servers
            .is_empty());
    }

    #[test]
    fn ice_states_map_to_link_states() {
        assert_eq!(link_state(RTCIceConnectionState::Checking), LinkState::Checking);
        assert_eq!(link_state(RTCIceConnectionState::Completed), LinkState::Connected);
        assert_eq!(link_state(RTCIceConnectionState::Failed), LinkState::Failed);
        assert_eq!(link_state(RTCIceConnectionState::New), LinkState::New);
    }

    #[tokio::test]
    async fn fresh_transport_is_stable_and_closed() {
        let (mut transport, _rx) = transport("bob");
        assert_eq!(transport.signaling_state(), SignalingState::Stable);
        assert_eq!(transport.link_state(), LinkState::New);
        assert!(!transport.has_remote_description());
        assert!(matches!(transport.send("hi"), Err(SessionError::ChannelClosed)));
        transport.close().await;
    }

    #[tokio::test]
    async fn offer_leaves_a_pending_local_description() {
        let (mut transport, _rx) = transport("bob");
        let offer = transport.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.starts_with("v=0"));
        transport.set_local_description(offer).await.unwrap();
        assert_eq!(transport.signaling_state(), SignalingState::HaveLocalOffer);
        transport.close().await;
    }

    /// Connects two transports over host candidates on this machine.
    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "opens UDP sockets"]
    async fn two_transports_open_a_channel() {
        let (mut host, mut host_rx) = transport("bob");
        let (mut client, mut client_rx) = transport("ann");

        let offer = host.create_offer().await.unwrap();
        host.set_local_description(offer.clone()).await.unwrap();
        client.set_remote_description(offer).await.unwrap();
        let answer = client.create_answer().await.unwrap();
        client.set_local_description(answer.clone()).await.unwrap();
        host.set_remote_description(answer).await.unwrap();

        let mut host_open = false;
        let mut client_open = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        while !(host_open && client_open) {
            tokio::select! {
                Some(signal) = host_rx.recv() => match signal.event {
                    PeerEvent::LocalCandidate(c) => client.add_ice_candidate(c).await.unwrap(),
                    PeerEvent::ChannelOpen => host_open = true,
                    _ => {}
                },
                Some(signal) = client_rx.recv() => match signal.event {
                    PeerEvent::LocalCandidate(c) => host.add_ice_candidate(c).await.unwrap(),
                    PeerEvent::ChannelOpen => client_open = true,
                    _ => {}
                },
                () = tokio::time::sleep_until(deadline) => panic!("channel never opened"),
            }
        }

        host.send("hello").unwrap();
        let text = loop {
            if let PeerEvent::Message(text) = client_rx.recv().await.unwrap().event {
                break text;
            }
        };
        assert_eq!(text, "hello");
        host.close().await;
        client.close().await;
    }
}
