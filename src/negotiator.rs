//! Connection negotiation over the polling relay.
//!
//! The [`Negotiator`] owns one [`PeerTransport`] per remote nickname and
//! drives the offer/answer/candidate exchange through the [`Relay`]:
//!
//! - the **host** offers: once it is locally ready and a remote has posted
//!   `ready`, it waits a short debounce, creates an offer and posts it
//!   addressed to that remote;
//! - the **client** answers: every new offer (by fingerprint) is applied,
//!   early candidates are replayed, and an answer is posted back.
//!
//! Local candidates are batched and posted as one `ice_batch` signal after a
//! debounce or as soon as gathering completes.
//!
//! The negotiator never sleeps. Callers pass the current instant into every
//! operation, ask [`Negotiator::next_deadline`] when to call back, and invoke
//! [`Negotiator::on_timer`] at that time.
//!
//! # Timeouts
//!
//! An attempt that has not connected within the base timeout is examined:
//! a pending local offer with no answer earns one extension, as does a link
//! that is still checking. Otherwise every unconnected transport is
//! discarded, readiness is re-announced and the attempt counter increases.
//! Past the retry cap the attempt fails for good.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::protocol::{IceCandidate, Role, SessionDescription, Signal, SignalRecord};
use crate::relay::{self, Relay};
use crate::transport::{
    PeerConnector, PeerEvent, PeerEventSink, PeerSignal, PeerTransport, SignalingState,
};

const DEFAULT_BASE_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_OFFER_EXTENSION: Duration = Duration::from_secs(30);
const DEFAULT_CHECKING_EXTENSION: Duration = Duration::from_secs(20);
const DEFAULT_MAX_RETRIES: u32 = 4;
const DEFAULT_OFFER_DEBOUNCE: Duration = Duration::from_millis(250);
const DEFAULT_ICE_FLUSH: Duration = Duration::from_millis(350);
const DEFAULT_FAST_POLL: Duration = Duration::from_millis(150);
const DEFAULT_SLOW_POLL: Duration = Duration::from_millis(500);
const DEFAULT_EARLY_CANDIDATES: usize = 32;

// ── Policy ──────────────────────────────────────────────────────────

/// Timing and retry knobs for negotiation.
///
/// # Example
///
/// ```
/// use setlink::negotiator::NegotiationPolicy;
/// use std::time::Duration;
///
/// let policy = NegotiationPolicy::default()
///     .with_base_timeout(Duration::from_secs(10))
///     .with_max_retries(2);
/// assert_eq!(policy.max_retries, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationPolicy {
    /// Time an attempt gets before it is examined. Defaults to **15s**.
    pub base_timeout: Duration,
    /// Extension granted while a local offer waits for its answer.
    /// Defaults to **30s**.
    pub offer_extension: Duration,
    /// Extension granted while the link reports checking/connecting.
    /// Defaults to **20s**.
    pub checking_extension: Duration,
    /// Retries before the attempt is abandoned. Defaults to **4**.
    pub max_retries: u32,
    /// Delay between deciding to offer and creating the offer.
    pub offer_debounce: Duration,
    /// Delay before gathered candidates are posted as one batch.
    pub ice_flush: Duration,
    /// Relay poll interval while connecting.
    pub fast_poll: Duration,
    /// Relay poll interval once connected.
    pub slow_poll: Duration,
    /// Remote candidates kept while no remote description is set; the
    /// oldest is dropped first.
    pub early_candidate_capacity: usize,
}

impl Default for NegotiationPolicy {
    fn default() -> Self {
        Self {
            base_timeout: DEFAULT_BASE_TIMEOUT,
            offer_extension: DEFAULT_OFFER_EXTENSION,
            checking_extension: DEFAULT_CHECKING_EXTENSION,
            max_retries: DEFAULT_MAX_RETRIES,
            offer_debounce: DEFAULT_OFFER_DEBOUNCE,
            ice_flush: DEFAULT_ICE_FLUSH,
            fast_poll: DEFAULT_FAST_POLL,
            slow_poll: DEFAULT_SLOW_POLL,
            early_candidate_capacity: DEFAULT_EARLY_CANDIDATES,
        }
    }
}

impl NegotiationPolicy {
    #[must_use]
    pub fn with_base_timeout(mut self, timeout: Duration) -> Self {
        self.base_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_extensions(mut self, offer: Duration, checking: Duration) -> Self {
        self.offer_extension = offer;
        self.checking_extension = checking;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    #[must_use]
    pub fn with_poll_intervals(mut self, fast: Duration, slow: Duration) -> Self {
        self.fast_poll = fast;
        self.slow_poll = slow;
        self
    }
}

// ── States and outcomes ─────────────────────────────────────────────

/// Progress of the current negotiation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    /// Locally ready, waiting for the other side.
    WaitingReady,
    Negotiating,
    /// At least one data channel is open.
    Connected,
}

/// What an expired attempt timer should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutVerdict {
    Extend(Duration),
    Retry,
    GiveUp,
}

/// Reported by [`Negotiator::on_timer`] when the attempt timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStep {
    Extended(Duration),
    Retried { attempt: u32 },
    Failed { attempts: u32 },
}

/// Data-channel level outcome of a transport event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Opened(String),
    Message { from: String, text: String },
    Closed(String),
}

// ── Peer entries ────────────────────────────────────────────────────

#[derive(Default)]
struct PeerEntry {
    transport: Option<Box<dyn PeerTransport>>,
    /// Generation of `transport`; 0 while there is none.
    generation: u64,
    remote_ready: bool,
    offer_sent: bool,
    answer_sent: bool,
    offer_due: Option<Instant>,
    outbound: Vec<IceCandidate>,
    flush_at: Option<Instant>,
    last_offer: Option<u64>,
    early: VecDeque<IceCandidate>,
    open: bool,
}

impl PeerEntry {
    /// Close the transport and forget everything but remote readiness.
    async fn discard(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        let remote_ready = self.remote_ready;
        *self = Self {
            remote_ready,
            ..Self::default()
        };
    }

    fn is_pending(&self) -> bool {
        !self.open && (self.transport.is_some() || self.offer_due.is_some() || self.answer_sent)
    }

    async fn drain_early(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        while let Some(candidate) = self.early.pop_front() {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                debug!("queued candidate rejected: {e}");
            }
        }
    }
}

fn fingerprint(description: &SessionDescription) -> u64 {
    let mut hasher = DefaultHasher::new();
    description.hash(&mut hasher);
    hasher.finish()
}

type SignalKey = (String, String, i64, String);

fn signal_key(record: &SignalRecord) -> SignalKey {
    (
        record.from.clone(),
        record.kind.clone(),
        record.at,
        record.payload.clone(),
    )
}

// ── Negotiator ──────────────────────────────────────────────────────

/// Per-peer negotiation state for one session.
pub struct Negotiator {
    role: Role,
    nickname: String,
    lobby_id: String,
    relay: Arc<dyn Relay>,
    connector: Arc<dyn PeerConnector>,
    policy: NegotiationPolicy,
    peers: BTreeMap<String, PeerEntry>,
    seen: HashSet<SignalKey>,
    state: ConnectionState,
    local_ready: bool,
    ready_pending: bool,
    retries: u32,
    deadline: Option<Instant>,
    extended: bool,
    next_generation: u64,
    peer_tx: mpsc::UnboundedSender<PeerSignal>,
}

impl Negotiator {
    /// Create a negotiator. Transport events are delivered to `peer_tx`.
    pub fn new(
        role: Role,
        nickname: impl Into<String>,
        lobby_id: impl Into<String>,
        relay: Arc<dyn Relay>,
        connector: Arc<dyn PeerConnector>,
        policy: NegotiationPolicy,
        peer_tx: mpsc::UnboundedSender<PeerSignal>,
    ) -> Self {
        Self {
            role,
            nickname: nickname.into(),
            lobby_id: lobby_id.into(),
            relay,
            connector,
            policy,
            peers: BTreeMap::new(),
            seen: HashSet::new(),
            state: ConnectionState::Idle,
            local_ready: false,
            ready_pending: false,
            retries: 0,
            deadline: None,
            extended: false,
            next_generation: 0,
            peer_tx,
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn policy(&self) -> &NegotiationPolicy {
        &self.policy
    }

    /// Retries performed in the current attempt.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Nicknames with an open data channel.
    pub fn open_peers(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|(_, entry)| entry.open)
            .map(|(nick, _)| nick.clone())
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.peers.values().filter(|entry| entry.open).count()
    }

    pub fn is_open(&self, remote: &str) -> bool {
        self.peers.get(remote).is_some_and(|entry| entry.open)
    }

    /// Signaling state of the transport towards `remote`, if one exists.
    pub fn signaling_state(&self, remote: &str) -> Option<SignalingState> {
        self.peers
            .get(remote)
            .and_then(|entry| entry.transport.as_ref())
            .map(|transport| transport.signaling_state())
    }

    /// Fast while connecting, slow once connected.
    pub fn poll_interval(&self) -> Duration {
        if self.state == ConnectionState::Connected {
            self.policy.slow_poll
        } else {
            self.policy.fast_poll
        }
    }

    /// The earliest instant at which [`Negotiator::on_timer`] has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.peers
            .values()
            .flat_map(|entry| [entry.offer_due, entry.flush_at])
            .chain([self.deadline])
            .flatten()
            .min()
    }

    pub(crate) fn open_transport(&mut self, remote: &str) -> Option<&mut Box<dyn PeerTransport>> {
        self.peers
            .get_mut(remote)
            .filter(|entry| entry.open)
            .and_then(|entry| entry.transport.as_mut())
    }

    // ── Readiness ───────────────────────────────────────────────────

    /// Mark this side ready and post a `ready` signal.
    ///
    /// A client arms the attempt timer here; the host arms it when it starts
    /// negotiating with a peer.
    ///
    /// # Errors
    ///
    /// Returns the relay error if the post fails. The post is retried on the
    /// next [`Negotiator::process_signals`] call.
    pub async fn announce_ready(&mut self, now: Instant) -> Result<()> {
        self.local_ready = true;
        if self.state == ConnectionState::Idle {
            self.state = ConnectionState::WaitingReady;
        }
        match self.role {
            Role::Client => {
                if self.deadline.is_none() {
                    self.deadline = Some(now + self.policy.base_timeout);
                }
            }
            Role::Host => {
                for remote in self.ready_remotes() {
                    self.schedule_offer(&remote, now);
                }
            }
        }
        self.ready_pending = true;
        self.post_ready().await
    }

    async fn post_ready(&mut self) -> Result<()> {
        relay::post_signal(
            self.relay.as_ref(),
            &self.lobby_id,
            &self.nickname,
            &Signal::Ready,
        )
        .await?;
        self.ready_pending = false;
        debug!(lobby = %self.lobby_id, nick = %self.nickname, "ready announced");
        Ok(())
    }

    fn ready_remotes(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|(_, entry)| entry.remote_ready && !entry.open)
            .map(|(nick, _)| nick.clone())
            .collect()
    }

    fn schedule_offer(&mut self, remote: &str, now: Instant) {
        let Some(entry) = self.peers.get_mut(remote) else {
            return;
        };
        if entry.open || entry.offer_sent || entry.offer_due.is_some() {
            return;
        }
        entry.offer_due = Some(now + self.policy.offer_debounce);
        if self.state != ConnectionState::Connected {
            self.state = ConnectionState::Negotiating;
        }
        if self.deadline.is_none() {
            self.deadline = Some(now + self.policy.base_timeout);
        }
        debug!(peer = %remote, "offer scheduled");
    }

    // ── Signal processing ───────────────────────────────────────────

    /// Process a polled signal log.
    ///
    /// Safe to call repeatedly with overlapping logs: each record is handled
    /// at most once, keyed by `(from, type, at, payload)`. Returns the number
    /// of records handled by this call.
    pub async fn process_signals(&mut self, records: &[SignalRecord], now: Instant) -> usize {
        if self.ready_pending {
            if let Err(e) = self.post_ready().await {
                debug!("ready re-post failed: {e}");
            }
        }

        let mut handled = 0;
        for record in records {
            if record.from == self.nickname {
                continue;
            }
            if !self.seen.insert(signal_key(record)) {
                continue;
            }
            let signal = match Signal::from_record(record) {
                Ok(Some(signal)) => signal,
                Ok(None) => {
                    debug!(kind = %record.kind, "ignoring unknown signal type");
                    continue;
                }
                Err(e) => {
                    warn!(peer = %record.from, kind = %record.kind, "malformed signal: {e}");
                    continue;
                }
            };
            if !signal.is_for(&self.nickname) {
                continue;
            }
            handled += 1;

            let from = record.from.as_str();
            let result = match signal {
                Signal::Ready => self.on_ready(from, now).await,
                Signal::Offer { description, .. } => self.on_offer(from, description, now).await,
                Signal::Answer { description, .. } => self.on_answer(from, description).await,
                Signal::Ice { candidate, .. } => {
                    self.on_candidates(from, vec![candidate]).await;
                    Ok(())
                }
                Signal::IceBatch { candidates, .. } => {
                    self.on_candidates(from, candidates).await;
                    Ok(())
                }
            };
            if let Err(e) = result {
                warn!(peer = %from, kind = %record.kind, "signal handling failed: {e}");
            }
        }
        handled
    }

    async fn on_ready(&mut self, from: &str, now: Instant) -> Result<()> {
        let entry = self.peers.entry(from.to_owned()).or_default();
        if self.role == Role::Client {
            entry.remote_ready = true;
            return Ok(());
        }
        if entry.open {
            debug!(peer = %from, "ready from a connected peer ignored");
            return Ok(());
        }
        if entry.remote_ready && (entry.offer_sent || entry.offer_due.is_some()) {
            info!(peer = %from, "peer re-announced ready; restarting its negotiation");
            entry.discard().await;
        }
        entry.remote_ready = true;
        if self.local_ready {
            self.schedule_offer(from, now);
        }
        Ok(())
    }

    async fn on_offer(
        &mut self,
        from: &str,
        description: SessionDescription,
        now: Instant,
    ) -> Result<()> {
        if self.role == Role::Host {
            debug!(peer = %from, "host ignores offers");
            return Ok(());
        }
        let print = fingerprint(&description);
        let entry = self.peers.entry(from.to_owned()).or_default();
        if entry.last_offer == Some(print) {
            debug!(peer = %from, "duplicate offer ignored");
            return Ok(());
        }
        if entry.last_offer.is_some() || entry.transport.is_some() {
            info!(peer = %from, "new offer replaces the previous negotiation");
            let stale_candidates = entry.last_offer.is_some();
            let early = std::mem::take(&mut entry.early);
            entry.discard().await;
            if !stale_candidates {
                entry.early = early;
            }
        }
        entry.last_offer = Some(print);
        entry.remote_ready = true;
        if self.state != ConnectionState::Connected {
            self.state = ConnectionState::Negotiating;
        }
        if self.deadline.is_none() {
            self.deadline = Some(now + self.policy.base_timeout);
        }

        self.connect(from)?;
        let Some(entry) = self.peers.get_mut(from) else {
            return Ok(());
        };
        let Some(transport) = entry.transport.as_mut() else {
            return Ok(());
        };
        transport.set_remote_description(description).await?;
        entry.drain_early().await;

        let Some(transport) = entry.transport.as_mut() else {
            return Ok(());
        };
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        entry.answer_sent = true;

        let signal = Signal::Answer {
            to: Some(from.to_owned()),
            description: answer,
        };
        relay::post_signal(self.relay.as_ref(), &self.lobby_id, &self.nickname, &signal).await?;
        debug!(peer = %from, "answer sent");
        Ok(())
    }

    async fn on_answer(&mut self, from: &str, description: SessionDescription) -> Result<()> {
        if self.role == Role::Client {
            return Ok(());
        }
        let Some(entry) = self.peers.get_mut(from) else {
            debug!(peer = %from, "answer for an unknown peer");
            return Ok(());
        };
        let Some(transport) = entry.transport.as_mut() else {
            debug!(peer = %from, "answer without a transport");
            return Ok(());
        };
        if transport.signaling_state() == SignalingState::Stable {
            debug!(peer = %from, "answer ignored; connection already stable");
            return Ok(());
        }
        transport.set_remote_description(description).await?;
        entry.drain_early().await;
        debug!(peer = %from, "answer applied");
        Ok(())
    }

    async fn on_candidates(&mut self, from: &str, candidates: Vec<IceCandidate>) {
        let capacity = self.policy.early_candidate_capacity.max(1);
        let entry = self.peers.entry(from.to_owned()).or_default();
        for candidate in candidates {
            match entry.transport.as_mut() {
                Some(transport) if transport.has_remote_description() => {
                    if let Err(e) = transport.add_ice_candidate(candidate).await {
                        debug!(peer = %from, "candidate rejected: {e}");
                    }
                }
                _ => {
                    if entry.early.len() >= capacity {
                        entry.early.pop_front();
                    }
                    entry.early.push_back(candidate);
                }
            }
        }
    }

    fn connect(&mut self, remote: &str) -> Result<()> {
        let entry = self.peers.entry(remote.to_owned()).or_default();
        if entry.transport.is_some() {
            return Ok(());
        }
        self.next_generation += 1;
        let sink = PeerEventSink::new(remote, self.next_generation, self.peer_tx.clone());
        entry.transport = Some(self.connector.connect(sink)?);
        entry.generation = self.next_generation;
        Ok(())
    }

    async fn send_offer(&mut self, remote: &str) -> Result<()> {
        self.connect(remote)?;
        let Some(entry) = self.peers.get_mut(remote) else {
            return Ok(());
        };
        let Some(transport) = entry.transport.as_mut() else {
            return Ok(());
        };
        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;
        entry.offer_sent = true;

        let signal = Signal::Offer {
            to: Some(remote.to_owned()),
            description: offer,
        };
        relay::post_signal(self.relay.as_ref(), &self.lobby_id, &self.nickname, &signal).await?;
        info!(peer = %remote, "offer sent");
        Ok(())
    }

    async fn flush(&mut self, remote: &str) {
        let Some(entry) = self.peers.get_mut(remote) else {
            return;
        };
        entry.flush_at = None;
        if entry.outbound.is_empty() {
            return;
        }
        let candidates = std::mem::take(&mut entry.outbound);
        let count = candidates.len();
        let signal = Signal::IceBatch {
            to: Some(remote.to_owned()),
            candidates,
        };
        match relay::post_signal(self.relay.as_ref(), &self.lobby_id, &self.nickname, &signal)
            .await
        {
            Ok(()) => debug!(peer = %remote, count, "candidates flushed"),
            Err(e) => warn!(peer = %remote, "candidate flush failed: {e}"),
        }
    }

    // ── Transport events ────────────────────────────────────────────

    /// Handle one transport event. Events from discarded transports are
    /// dropped.
    pub async fn handle_peer_event(&mut self, signal: PeerSignal, now: Instant) -> Option<LinkEvent> {
        let PeerSignal {
            remote,
            generation,
            event,
        } = signal;
        let entry = match self.peers.get_mut(&remote) {
            Some(entry) if entry.generation == generation && entry.transport.is_some() => entry,
            _ => {
                debug!(peer = %remote, generation, "stale transport event dropped");
                return None;
            }
        };

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                entry.outbound.push(candidate);
                if entry.flush_at.is_none() {
                    entry.flush_at = Some(now + self.policy.ice_flush);
                }
                None
            }
            PeerEvent::GatheringComplete => {
                self.flush(&remote).await;
                None
            }
            PeerEvent::ChannelOpen => {
                if entry.open {
                    return None;
                }
                entry.open = true;
                self.state = ConnectionState::Connected;
                if !self.peers.values().any(PeerEntry::is_pending) {
                    self.deadline = None;
                    self.extended = false;
                    self.retries = 0;
                }
                info!(peer = %remote, "data channel open");
                Some(LinkEvent::Opened(remote))
            }
            PeerEvent::Message(text) => entry
                .open
                .then_some(LinkEvent::Message { from: remote, text }),
            PeerEvent::ChannelClosed => {
                if !entry.open {
                    return None;
                }
                entry.open = false;
                if self.open_count() == 0 {
                    self.state = ConnectionState::WaitingReady;
                }
                info!(peer = %remote, "data channel closed");
                Some(LinkEvent::Closed(remote))
            }
            PeerEvent::LinkStateChanged(link) => {
                debug!(peer = %remote, ?link, "link state");
                None
            }
        }
    }

    // ── Timers ──────────────────────────────────────────────────────

    /// Run everything due at `now`: debounced offers, candidate flushes and
    /// the attempt timeout.
    pub async fn on_timer(&mut self, now: Instant) -> Option<NegotiationStep> {
        let due_offers: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, entry)| entry.offer_due.is_some_and(|at| at <= now))
            .map(|(nick, _)| nick.clone())
            .collect();
        for remote in due_offers {
            if let Some(entry) = self.peers.get_mut(&remote) {
                entry.offer_due = None;
            }
            if let Err(e) = self.send_offer(&remote).await {
                warn!(peer = %remote, "offer failed: {e}");
            }
        }

        let due_flushes: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, entry)| entry.flush_at.is_some_and(|at| at <= now))
            .map(|(nick, _)| nick.clone())
            .collect();
        for remote in due_flushes {
            self.flush(&remote).await;
        }

        if !self.deadline.is_some_and(|at| at <= now) {
            return None;
        }
        match self.evaluate_timeout() {
            TimeoutVerdict::Extend(window) => {
                self.extended = true;
                self.deadline = Some(now + window);
                info!(?window, "negotiation still in progress; extending");
                Some(NegotiationStep::Extended(window))
            }
            TimeoutVerdict::Retry => {
                self.retry(now).await;
                Some(NegotiationStep::Retried {
                    attempt: self.retries,
                })
            }
            TimeoutVerdict::GiveUp => {
                self.deadline = None;
                error!(retries = self.retries, "negotiation abandoned");
                Some(NegotiationStep::Failed {
                    attempts: self.retries,
                })
            }
        }
    }

    /// Decide what an expired attempt timer does.
    pub fn evaluate_timeout(&self) -> TimeoutVerdict {
        if !self.extended {
            let mut checking = false;
            let pending = self
                .peers
                .values()
                .filter(|entry| !entry.open)
                .filter_map(|entry| entry.transport.as_ref());
            for transport in pending {
                if transport.signaling_state() == SignalingState::HaveLocalOffer
                    && !transport.has_remote_description()
                {
                    return TimeoutVerdict::Extend(self.policy.offer_extension);
                }
                checking |= transport.link_state().is_in_progress();
            }
            if checking {
                return TimeoutVerdict::Extend(self.policy.checking_extension);
            }
        }
        if self.retries >= self.policy.max_retries {
            TimeoutVerdict::GiveUp
        } else {
            TimeoutVerdict::Retry
        }
    }

    async fn retry(&mut self, now: Instant) {
        self.retries += 1;
        self.extended = false;
        warn!(attempt = self.retries, "negotiation timed out; retrying");

        for entry in self.peers.values_mut().filter(|entry| !entry.open) {
            entry.discard().await;
        }
        self.deadline = Some(now + self.policy.base_timeout);
        self.state = if self.open_count() > 0 {
            ConnectionState::Connected
        } else {
            ConnectionState::WaitingReady
        };

        self.ready_pending = true;
        if let Err(e) = self.post_ready().await {
            warn!("ready re-announce failed: {e}");
        }
        if self.role == Role::Host {
            for remote in self.ready_remotes() {
                self.schedule_offer(&remote, now);
            }
        }
    }

    /// Give up on every unconnected peer and stop the attempt timer.
    /// Open channels are kept.
    pub async fn abandon_pending(&mut self) {
        let pending: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, entry)| !entry.open)
            .map(|(nick, _)| nick.clone())
            .collect();
        for remote in pending {
            self.drop_peer(&remote).await;
        }
        self.deadline = None;
        self.extended = false;
        self.retries = 0;
    }

    // ── Teardown ────────────────────────────────────────────────────

    /// Stop every timer: attempt timeout, offer debounces, candidate flushes.
    pub fn cancel_timers(&mut self) {
        self.deadline = None;
        for entry in self.peers.values_mut() {
            entry.offer_due = None;
            entry.flush_at = None;
        }
    }

    /// Close and forget the transport towards `remote`.
    pub async fn drop_peer(&mut self, remote: &str) {
        if let Some(mut entry) = self.peers.remove(remote) {
            entry.discard().await;
            debug!(peer = %remote, "peer dropped");
        }
        if self.open_count() == 0 && self.state == ConnectionState::Connected {
            self.state = ConnectionState::WaitingReady;
        }
    }

    /// Cancel timers, close every transport and return to `Idle`.
    pub async fn reset(&mut self) {
        self.cancel_timers();
        for (_, mut entry) in std::mem::take(&mut self.peers) {
            entry.discard().await;
        }
        self.seen.clear();
        self.state = ConnectionState::Idle;
        self.local_ready = false;
        self.ready_pending = false;
        self.retries = 0;
        self.extended = false;
        debug!(lobby = %self.lobby_id, "negotiator reset");
    }
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("role", &self.role)
            .field("nickname", &self.nickname)
            .field("state", &self.state)
            .field("peers", &self.peers.keys().collect::<Vec<_>>())
            .field("retries", &self.retries)
            .finish()
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
    use crate::relays::MemoryRelay;
    use crate::transports::LoopbackNetwork;

    fn host(relay: &Arc<MemoryRelay>, lobby: &str) -> (Negotiator, mpsc::UnboundedReceiver<PeerSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let negotiator = Negotiator::new(
            Role::Host,
            "ann",
            lobby,
            Arc::clone(relay) as Arc<dyn Relay>,
            Arc::new(LoopbackNetwork::new().connector()),
            NegotiationPolicy::default(),
            tx,
        );
        (negotiator, rx)
    }

    fn ready_from(nick: &str, at: i64) -> SignalRecord {
        SignalRecord {
            from: nick.to_owned(),
            kind: "ready".to_owned(),
            payload: "true".to_owned(),
            at,
        }
    }

    #[test]
    fn policy_defaults() {
        let policy = NegotiationPolicy::default();
        assert_eq!(policy.base_timeout, Duration::from_secs(15));
        assert_eq!(policy.offer_extension, Duration::from_secs(30));
        assert_eq!(policy.checking_extension, Duration::from_secs(20));
        assert_eq!(policy.max_retries, 4);
        assert_eq!(policy.ice_flush, Duration::from_millis(350));
        assert_eq!(policy.fast_poll, Duration::from_millis(150));
        assert_eq!(policy.slow_poll, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn host_waits_for_remote_ready_before_offering() {
        let relay = Arc::new(MemoryRelay::new());
        let lobby = relay.create_lobby("ann").await.unwrap();
        let (mut negotiator, _rx) = host(&relay, &lobby);
        let now = Instant::now();

        negotiator.announce_ready(now).await.unwrap();
        assert_eq!(negotiator.state(), ConnectionState::WaitingReady);
        assert_eq!(negotiator.next_deadline(), None);

        negotiator.process_signals(&[ready_from("bob", 1)], now).await;
        assert_eq!(negotiator.state(), ConnectionState::Negotiating);
        let due = negotiator.next_deadline().unwrap();
        assert_eq!(due, now + negotiator.policy().offer_debounce);

        assert_eq!(negotiator.on_timer(due).await, None);
        assert_eq!(
            negotiator.signaling_state("bob"),
            Some(SignalingState::HaveLocalOffer)
        );
        let kinds: Vec<String> = relay.signals(&lobby).await.into_iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec!["ready", "offer"]);
    }

    #[tokio::test]
    async fn own_and_misaddressed_signals_are_skipped() {
        let relay = Arc::new(MemoryRelay::new());
        let lobby = relay.create_lobby("ann").await.unwrap();
        let (mut negotiator, _rx) = host(&relay, &lobby);
        let now = Instant::now();
        let offer_to_carol = SignalRecord {
            from: "bob".into(),
            kind: "answer".into(),
            payload: r#"{"to":"carol","type":"answer","sdp":"x"}"#.into(),
            at: 2,
        };
        let handled = negotiator
            .process_signals(&[ready_from("ann", 1), offer_to_carol], now)
            .await;
        assert_eq!(handled, 0);
    }

    #[tokio::test]
    async fn stale_generation_events_are_dropped() {
        let relay = Arc::new(MemoryRelay::new());
        let lobby = relay.create_lobby("ann").await.unwrap();
        let (mut negotiator, _rx) = host(&relay, &lobby);
        let now = Instant::now();
        negotiator.announce_ready(now).await.unwrap();
        negotiator.process_signals(&[ready_from("bob", 1)], now).await;
        negotiator.on_timer(now + Duration::from_secs(1)).await;

        let stale = PeerSignal {
            remote: "bob".into(),
            generation: 99,
            event: PeerEvent::ChannelOpen,
        };
        assert_eq!(negotiator.handle_peer_event(stale, now).await, None);
        assert_eq!(negotiator.open_count(), 0);
    }

    #[tokio::test]
    async fn reset_clears_timers_and_peers() {
        let relay = Arc::new(MemoryRelay::new());
        let lobby = relay.create_lobby("ann").await.unwrap();
        let (mut negotiator, _rx) = host(&relay, &lobby);
        let now = Instant::now();
        negotiator.announce_ready(now).await.unwrap();
        negotiator.process_signals(&[ready_from("bob", 1)], now).await;
        assert!(negotiator.next_deadline().is_some());

        negotiator.reset().await;
        assert_eq!(negotiator.next_deadline(), None);
        assert_eq!(negotiator.state(), ConnectionState::Idle);
        assert_eq!(negotiator.signaling_state("bob"), None);
    }
}
