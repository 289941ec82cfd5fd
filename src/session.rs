//! A multiplayer session: lobby, negotiation and match replication behind
//! one handle.
//!
//! [`Session`] is a thin handle that talks to a background loop over an
//! unbounded command channel. The loop owns the [`Negotiator`] and the
//! [`Replicator`] and multiplexes, via `tokio::select!`:
//!
//! - UI commands,
//! - transport events from the peer connections,
//! - relay poll results (one poll in flight at most),
//! - the nearest timer (next poll, negotiation deadlines, visual transition),
//! - the shutdown signal.
//!
//! Events go out on a bounded channel returned by [`Session::host`] and
//! [`Session::join`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use setlink::relays::MemoryRelay;
//! use setlink::transports::LoopbackNetwork;
//! use setlink::rules::StandardDealer;
//! use setlink::{Session, SessionConfig, SessionEvent};
//!
//! # async fn run() -> setlink::Result<()> {
//! let relay = Arc::new(MemoryRelay::new());
//! let network = LoopbackNetwork::new();
//! let (host, mut events) = Session::host(
//!     relay,
//!     Arc::new(network.connector()),
//!     Box::new(StandardDealer::new()),
//!     SessionConfig::new("ann"),
//! )
//! .await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SessionEvent::ReadyToStart => host.start_match()?,
//!         SessionEvent::Ended { .. } => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::card::BOARD_SIZE;
use crate::channel::{self, Channels};
use crate::error::{Result, SessionError};
use crate::event::{EndCause, SessionEvent};
use crate::negotiator::{
    ConnectionState, LinkEvent, NegotiationPolicy, NegotiationStep, Negotiator,
};
use crate::protocol::{epoch_millis, LobbyInfo, Role, StateReason, WireMessage};
use crate::relay::Relay;
use crate::replicator::{ApplyOutcome, BoardTransition, HostOutcome, MatchPhase, Replicator};
use crate::rules::Dealer;
use crate::transport::{PeerConnector, PeerSignal};

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for a graceful leave.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Default pause between a board change and its follow-up state event.
const DEFAULT_TRANSITION_DELAY: Duration = Duration::from_millis(300);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`Session`].
///
/// # Example
///
/// ```
/// use setlink::SessionConfig;
/// use std::time::Duration;
///
/// let config = SessionConfig::new("ann")
///     .with_transition_delay(Duration::ZERO)
///     .with_event_channel_capacity(64);
/// assert_eq!(config.nickname, "ann");
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// This peer's nickname. Must be non-empty and unique in the lobby.
    pub nickname: String,
    /// Capacity of the bounded event channel.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// How long [`Session::leave`] waits for the loop to tear down before
    /// aborting it. Defaults to **1 second**.
    pub shutdown_timeout: Duration,
    /// Pause after a board-changing update during which claims are
    /// answered `busy`. Defaults to **300ms**.
    pub transition_delay: Duration,
    pub policy: NegotiationPolicy,
}

impl SessionConfig {
    pub fn new(nickname: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            transition_delay: DEFAULT_TRANSITION_DELAY,
            policy: NegotiationPolicy::default(),
        }
    }

    /// Defaults to **256**. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_transition_delay(mut self, delay: Duration) -> Self {
        self.transition_delay = delay;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: NegotiationPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.nickname.trim().is_empty() {
            return Err(SessionError::Config("nickname must not be empty".into()));
        }
        Ok(())
    }
}

// ── Shared state ────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SessionShared {
    /// The loop is running.
    alive: AtomicBool,
    /// At least one data channel is open.
    connected: AtomicBool,
}

#[derive(Debug)]
enum Command {
    StartMatch,
    Rematch,
    Claim([usize; 3]),
    Shuffle,
}

// ── Session handle ──────────────────────────────────────────────────

/// Handle to a running multiplayer session.
pub struct Session {
    cmd_tx: mpsc::UnboundedSender<Command>,
    shared: Arc<SessionShared>,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
    lobby_id: String,
    role: Role,
    nickname: String,
}

impl Session {
    /// Create a lobby on the relay and start hosting it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`] for an empty nickname and the relay
    /// error if the lobby cannot be created.
    pub async fn host(
        relay: Arc<dyn Relay>,
        connector: Arc<dyn PeerConnector>,
        dealer: Box<dyn Dealer>,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>)> {
        config.validate()?;
        let lobby_id = relay.create_lobby(&config.nickname).await?;
        info!(lobby = %lobby_id, nick = %config.nickname, "hosting lobby");
        let replicator = Replicator::host(config.nickname.clone(), dealer);
        Ok(Self::spawn(Role::Host, lobby_id, relay, connector, replicator, config))
    }

    /// Join an existing lobby as a client.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`] for an empty nickname and the relay
    /// error if the lobby cannot be joined.
    pub async fn join(
        lobby_id: impl Into<String>,
        relay: Arc<dyn Relay>,
        connector: Arc<dyn PeerConnector>,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>)> {
        config.validate()?;
        let lobby_id = lobby_id.into();
        relay.join_lobby(&lobby_id, &config.nickname).await?;
        info!(lobby = %lobby_id, nick = %config.nickname, "joined lobby");
        let replicator = Replicator::client(config.nickname.clone());
        Ok(Self::spawn(Role::Client, lobby_id, relay, connector, replicator, config))
    }

    fn spawn(
        role: Role,
        lobby_id: String,
        relay: Arc<dyn Relay>,
        connector: Arc<dyn PeerConnector>,
        replicator: Replicator,
        config: SessionConfig,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity.max(1));
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (poll_tx, poll_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let shared = Arc::new(SessionShared::default());
        shared.alive.store(true, Ordering::Release);

        let negotiator = Negotiator::new(
            role,
            config.nickname.clone(),
            lobby_id.clone(),
            Arc::clone(&relay),
            connector,
            config.policy.clone(),
            peer_tx,
        );
        let session_loop = SessionLoop {
            role,
            nickname: config.nickname.clone(),
            lobby_id: lobby_id.clone(),
            relay,
            negotiator,
            replicator,
            event_tx,
            shared: Arc::clone(&shared),
            transition_delay: config.transition_delay,
            next_poll_at: None,
            poll_in_flight: None,
            poll_tx,
            transition_at: None,
            players: Vec::new(),
            last_state: ConnectionState::Idle,
            was_connected: false,
            ready_to_start_sent: false,
            relay_failing: false,
        };
        let task = tokio::spawn(session_loop.run(cmd_rx, peer_rx, poll_rx, shutdown_rx));

        let session = Self {
            cmd_tx,
            shared,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout: config.shutdown_timeout,
            lobby_id,
            role,
            nickname: config.nickname,
        };
        (session, event_rx)
    }

    // ── Public API methods ──────────────────────────────────────────

    /// Start a match with everyone who has completed the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotHost`] on a client and
    /// [`SessionError::NotConnected`] once the session has ended.
    pub fn start_match(&self) -> Result<()> {
        self.host_only()?;
        self.send(Command::StartMatch)
    }

    /// Tell clients a rematch is coming and start it.
    ///
    /// # Errors
    ///
    /// See [`Session::start_match`].
    pub fn rematch(&self) -> Result<()> {
        self.host_only()?;
        self.send(Command::Rematch)
    }

    /// Claim three board slots as a set. The answer arrives as
    /// [`SessionEvent::ClaimResult`].
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotConnected`] if a client has no open
    /// channel to the host, or the session has ended.
    pub fn claim(&self, slots: [usize; 3]) -> Result<()> {
        self.require_link()?;
        self.send(Command::Claim(slots))
    }

    /// Call "no set on this board". The answer arrives as
    /// [`SessionEvent::ShuffleResult`].
    ///
    /// # Errors
    ///
    /// See [`Session::claim`].
    pub fn request_shuffle(&self) -> Result<()> {
        self.require_link()?;
        self.send(Command::Shuffle)
    }

    /// Leave the session.
    ///
    /// Stops every timer, closes every transport and emits the final
    /// [`SessionEvent::Ended`]. If the loop does not finish within the
    /// configured shutdown timeout it is aborted.
    pub async fn leave(&mut self) {
        debug!(lobby = %self.lobby_id, "leave requested");
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => warn!("session loop terminated with join error: {join_err}"),
                Err(_) => {
                    warn!("session loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("session loop aborted: {join_err}");
                    }
                }
            }
        }
        self.shared.alive.store(false, Ordering::Release);
        self.shared.connected.store(false, Ordering::Release);
    }

    // ── State accessors ─────────────────────────────────────────────

    pub fn lobby_id(&self) -> &str {
        &self.lobby_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// `true` while at least one data channel is open.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// `true` until the session has ended.
    pub fn is_active(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn host_only(&self) -> Result<()> {
        match self.role {
            Role::Host => Ok(()),
            Role::Client => Err(SessionError::NotHost),
        }
    }

    fn require_link(&self) -> Result<()> {
        if self.role == Role::Client && !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        Ok(())
    }

    fn send(&self, command: Command) -> Result<()> {
        if !self.is_active() {
            return Err(SessionError::NotConnected);
        }
        self.cmd_tx
            .send(command)
            .map_err(|_| SessionError::NotConnected)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("lobby_id", &self.lobby_id)
            .field("role", &self.role)
            .field("active", &self.is_active())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // No executor to drive a graceful teardown from here; abort the loop.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Session loop ────────────────────────────────────────────────────

struct SessionLoop {
    role: Role,
    nickname: String,
    lobby_id: String,
    relay: Arc<dyn Relay>,
    negotiator: Negotiator,
    replicator: Replicator,
    event_tx: mpsc::Sender<SessionEvent>,
    shared: Arc<SessionShared>,
    transition_delay: Duration,
    next_poll_at: Option<Instant>,
    /// The in-flight relay poll, if any.
    poll_in_flight: Option<tokio::task::JoinHandle<()>>,
    poll_tx: mpsc::UnboundedSender<Result<LobbyInfo>>,
    transition_at: Option<Instant>,
    players: Vec<String>,
    last_state: ConnectionState,
    was_connected: bool,
    ready_to_start_sent: bool,
    relay_failing: bool,
}

impl SessionLoop {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut peer_rx: mpsc::UnboundedReceiver<PeerSignal>,
        mut poll_rx: mpsc::UnboundedReceiver<Result<LobbyInfo>>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        debug!(lobby = %self.lobby_id, role = ?self.role, "session loop started");

        let now = Instant::now();
        if let Err(e) = self.negotiator.announce_ready(now).await {
            self.status(format!("could not announce readiness: {e}"));
        }
        self.next_poll_at = Some(now);
        self.sync_connection_state();

        let cause = loop {
            let deadline = self.next_deadline();
            let wake_at = deadline.unwrap_or_else(Instant::now);
            let step = tokio::select! {
                _ = &mut shutdown_rx => Some(EndCause::Left),

                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => Some(EndCause::Left),
                },

                Some(signal) = peer_rx.recv() => self.on_peer_signal(signal).await,

                Some(result) = poll_rx.recv() => {
                    self.on_poll_result(result).await;
                    None
                }

                () = tokio::time::sleep_until(wake_at), if deadline.is_some() => {
                    self.on_deadline().await
                }
            };
            self.sync_connection_state();
            if let Some(cause) = step {
                break cause;
            }
        };

        self.teardown(cause).await;
        debug!(lobby = %self.lobby_id, "session loop exited");
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.next_poll_at,
            self.transition_at,
            self.negotiator.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    // ── Timers ──────────────────────────────────────────────────────

    async fn on_deadline(&mut self) -> Option<EndCause> {
        let now = Instant::now();
        if self.next_poll_at.is_some_and(|at| at <= now) {
            self.next_poll_at = None;
            self.spawn_poll();
        }
        if self.transition_at.is_some_and(|at| at <= now) {
            self.transition_at = None;
            self.end_transition();
        }
        if !self.negotiator.next_deadline().is_some_and(|at| at <= now) {
            return None;
        }
        match self.negotiator.on_timer(now).await? {
            NegotiationStep::Extended(window) => {
                debug!(?window, "negotiation extended");
                self.emit(SessionEvent::NegotiationExtended);
                None
            }
            NegotiationStep::Retried { attempt } => {
                self.status(format!("connection attempt {attempt} timed out; retrying"));
                self.emit(SessionEvent::NegotiationRetry { attempt });
                if self.poll_in_flight.is_none() {
                    self.next_poll_at = Some(now);
                }
                None
            }
            NegotiationStep::Failed { attempts } => {
                if self.negotiator.open_count() > 0 {
                    self.negotiator.abandon_pending().await;
                    self.status("gave up connecting to a peer".to_owned());
                    None
                } else {
                    self.emit(SessionEvent::ConnectionFailed { attempts });
                    Some(EndCause::ConnectionFailed)
                }
            }
        }
    }

    fn spawn_poll(&mut self) {
        if self.poll_in_flight.is_some() {
            return;
        }
        let relay = Arc::clone(&self.relay);
        let lobby_id = self.lobby_id.clone();
        let nickname = self.nickname.clone();
        let tx = self.poll_tx.clone();
        self.poll_in_flight = Some(tokio::spawn(async move {
            let result = relay.get_lobby(&lobby_id, &nickname).await;
            let _ = tx.send(result);
        }));
    }

    async fn on_poll_result(&mut self, result: Result<LobbyInfo>) {
        self.poll_in_flight = None;
        let now = Instant::now();
        match result {
            Ok(info) => {
                if self.relay_failing {
                    self.relay_failing = false;
                    self.status("relay reachable again".to_owned());
                }
                let players = info.player_names();
                if players != self.players {
                    self.players.clone_from(&players);
                    self.emit(SessionEvent::PlayersChanged(players));
                }
                self.negotiator.process_signals(&info.signals, now).await;
            }
            Err(e) => {
                if !self.relay_failing {
                    self.relay_failing = true;
                    self.status(format!("relay unreachable: {e}"));
                }
                debug!(lobby = %self.lobby_id, "poll failed: {e}");
            }
        }
        self.next_poll_at = Some(now + self.negotiator.poll_interval());
    }

    // ── Commands ────────────────────────────────────────────────────

    async fn on_command(&mut self, command: Command) -> Option<EndCause> {
        let now_ms = epoch_millis();
        match command {
            Command::StartMatch => self.start_match(now_ms),
            Command::Rematch => {
                if self.replicator.phase() != MatchPhase::Idle {
                    self.broadcast(&WireMessage::Rematch {});
                }
                self.start_match(now_ms);
            }
            Command::Claim(slots) => match self.role {
                Role::Host => {
                    let indices = slots.map(|s| i64::try_from(s).unwrap_or(i64::MAX));
                    let nickname = self.nickname.clone();
                    let outcome = self.replicator.claim(&nickname, &indices, now_ms);
                    self.on_host_outcome(&nickname, outcome, true);
                }
                Role::Client => {
                    let message = self.replicator.claim_request(slots);
                    self.send_to_host(&message);
                }
            },
            Command::Shuffle => match self.role {
                Role::Host => {
                    let nickname = self.nickname.clone();
                    let outcome = self.replicator.shuffle(&nickname, now_ms);
                    self.on_host_outcome(&nickname, outcome, false);
                }
                Role::Client => {
                    let message = self.replicator.shuffle_request();
                    self.send_to_host(&message);
                }
            },
        }
        None
    }

    fn start_match(&mut self, now_ms: u64) {
        let start = match self.replicator.start_match(now_ms) {
            Ok(start) => start,
            Err(e) => {
                warn!("cannot start match: {e}");
                return;
            }
        };
        self.broadcast(&start);
        self.emit(SessionEvent::MatchStarted {
            view: self.replicator.view(now_ms),
        });
        self.begin_transition(BoardTransition::Shuffle, (0..BOARD_SIZE).collect());
    }

    fn send_to_host(&mut self, message: &WireMessage) {
        let Some(host) = self.negotiator.open_peers().into_iter().next() else {
            debug!(kind = message.kind(), "no host channel; request dropped");
            return;
        };
        Channels::new(&mut self.negotiator).send_to(&host, message);
    }

    fn broadcast(&mut self, message: &WireMessage) -> usize {
        Channels::new(&mut self.negotiator).broadcast(message)
    }

    // ── Host authority ──────────────────────────────────────────────

    fn on_host_outcome(&mut self, requester: &str, outcome: Result<HostOutcome>, is_claim: bool) {
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(peer = %requester, "host operation failed: {e}");
                return;
            }
        };
        let now_ms = epoch_millis();

        for message in &outcome.broadcasts {
            self.broadcast(message);
        }
        if !outcome.broadcasts.is_empty() {
            match outcome.transition.clone() {
                Some((transition, changed)) => self.begin_transition(transition, changed),
                None => self.emit(SessionEvent::StateApplied {
                    view: self.replicator.view(now_ms),
                }),
            }
        }
        if let Some(summary) = outcome.summary() {
            self.emit(SessionEvent::MatchFinished {
                summary: summary.clone(),
            });
        }

        let ok = outcome.result.is_ok();
        let reason = outcome.result.err();
        if requester == self.nickname {
            self.emit(if is_claim {
                SessionEvent::ClaimResult { ok, reason }
            } else {
                SessionEvent::ShuffleResult { ok, reason }
            });
        } else {
            let reply = if is_claim {
                WireMessage::ClaimResult { ok, reason }
            } else {
                WireMessage::ShuffleResult { ok, reason }
            };
            Channels::new(&mut self.negotiator).send_to(requester, &reply);
        }
    }

    // ── Transitions ─────────────────────────────────────────────────

    fn begin_transition(&mut self, transition: BoardTransition, changed: Vec<usize>) {
        self.emit(SessionEvent::BoardTransition {
            transition,
            changed,
        });
        self.transition_at = Some(Instant::now() + self.transition_delay);
    }

    fn end_transition(&mut self) {
        let now_ms = epoch_millis();
        let parked = self.replicator.finish_transition(now_ms);
        self.emit(SessionEvent::StateApplied {
            view: self.replicator.view(now_ms),
        });
        if let Some((reason, outcome)) = parked {
            self.on_applied(reason, outcome, now_ms);
        }
    }

    fn on_applied(&mut self, reason: StateReason, outcome: ApplyOutcome, now_ms: u64) {
        match outcome {
            ApplyOutcome::Applied {
                transition,
                changed,
            } => {
                if reason == StateReason::Start {
                    self.emit(SessionEvent::MatchStarted {
                        view: self.replicator.view(now_ms),
                    });
                }
                if transition == BoardTransition::Plain {
                    self.emit(SessionEvent::StateApplied {
                        view: self.replicator.view(now_ms),
                    });
                } else {
                    self.begin_transition(transition, changed);
                }
            }
            ApplyOutcome::Stale | ApplyOutcome::Deferred => {}
            ApplyOutcome::Rejected => {
                self.status("ignored an unreadable game update".to_owned());
            }
        }
    }

    // ── Data channels ───────────────────────────────────────────────

    async fn on_peer_signal(&mut self, signal: PeerSignal) -> Option<EndCause> {
        match self
            .negotiator
            .handle_peer_event(signal, Instant::now())
            .await?
        {
            LinkEvent::Opened(remote) => {
                self.on_channel_open(&remote);
                None
            }
            LinkEvent::Message { from, text } => {
                self.on_message(&from, &text);
                None
            }
            LinkEvent::Closed(remote) => self.on_channel_closed(&remote).await,
        }
    }

    fn on_channel_open(&mut self, remote: &str) {
        self.was_connected = true;
        self.shared.connected.store(true, Ordering::Release);
        self.emit(SessionEvent::PeerConnected {
            nickname: remote.to_owned(),
        });
        let hello = WireMessage::Hello {
            nick: self.nickname.clone(),
        };
        Channels::new(&mut self.negotiator).send_to(remote, &hello);
    }

    fn on_message(&mut self, from: &str, text: &str) {
        let Some(message) = channel::decode(from, text) else {
            return;
        };
        let now_ms = epoch_millis();
        match (self.role, message) {
            (_, WireMessage::Hello { nick }) => {
                if nick != from {
                    debug!(peer = %from, %nick, "hello nickname differs from signaling name");
                }
                if self.role == Role::Host {
                    self.replicator.add_participant(from);
                    if let Some(sync) = self.replicator.sync_message(now_ms) {
                        Channels::new(&mut self.negotiator).send_to(from, &sync);
                    }
                }
                self.emit(SessionEvent::PlayerJoined {
                    nickname: from.to_owned(),
                });
                if self.role == Role::Host && !self.ready_to_start_sent {
                    self.ready_to_start_sent = true;
                    self.emit(SessionEvent::ReadyToStart);
                }
            }
            (Role::Host, WireMessage::Claim { indices, .. }) => {
                let outcome = self.replicator.claim(from, &indices, now_ms);
                self.on_host_outcome(from, outcome, true);
            }
            (Role::Host, WireMessage::ShuffleRequest { .. }) => {
                let outcome = self.replicator.shuffle(from, now_ms);
                self.on_host_outcome(from, outcome, false);
            }
            (Role::Client, WireMessage::State { reason, state }) => {
                let outcome = self.replicator.apply_snapshot(reason, state, now_ms);
                self.on_applied(reason, outcome, now_ms);
            }
            (Role::Client, WireMessage::ClaimResult { ok, reason }) => {
                self.emit(SessionEvent::ClaimResult { ok, reason });
            }
            (Role::Client, WireMessage::ShuffleResult { ok, reason }) => {
                self.emit(SessionEvent::ShuffleResult { ok, reason });
            }
            (Role::Client, WireMessage::Finish { summary }) => {
                self.replicator.apply_finish(&summary, now_ms);
                self.emit(SessionEvent::MatchFinished { summary });
            }
            (Role::Client, WireMessage::Rematch {}) => {
                self.emit(SessionEvent::RematchStarting);
            }
            (role, message) => {
                debug!(peer = %from, ?role, kind = message.kind(), "message not meant for this role");
                if role == Role::Host && matches!(message, WireMessage::State { .. }) {
                    warn!(peer = %from, "client tried to push state; ignored");
                }
            }
        }
    }

    async fn on_channel_closed(&mut self, remote: &str) -> Option<EndCause> {
        self.emit(SessionEvent::PlayerLeft {
            nickname: remote.to_owned(),
        });
        match self.role {
            Role::Client => Some(EndCause::PeerLost),
            Role::Host => {
                self.negotiator.drop_peer(remote).await;
                self.replicator.remove_participant(remote);
                if self.negotiator.open_count() == 0 {
                    Some(EndCause::PeerLost)
                } else {
                    None
                }
            }
        }
    }

    // ── Teardown ────────────────────────────────────────────────────

    /// Stop every timer and the in-flight poll first, then close transports.
    async fn teardown(&mut self, cause: EndCause) {
        self.next_poll_at = None;
        self.transition_at = None;
        self.negotiator.cancel_timers();
        if let Some(poll) = self.poll_in_flight.take() {
            poll.abort();
        }

        self.negotiator.reset().await;
        self.replicator.reset();
        self.players.clear();
        self.ready_to_start_sent = false;
        self.shared.connected.store(false, Ordering::Release);
        self.shared.alive.store(false, Ordering::Release);

        let was_connected = self.was_connected && cause != EndCause::Left;
        info!(lobby = %self.lobby_id, ?cause, was_connected, "session ended");
        let event = SessionEvent::Ended {
            cause,
            was_connected,
        };
        if self.event_tx.send(event).await.is_err() {
            debug!("event channel closed, receiver dropped");
        }
    }

    // ── Events ──────────────────────────────────────────────────────

    fn sync_connection_state(&mut self) {
        let state = self.negotiator.state();
        if state != self.last_state {
            self.last_state = state;
            self.emit(SessionEvent::ConnectionStateChanged(state));
        }
    }

    fn status(&self, text: String) {
        debug!(lobby = %self.lobby_id, "status: {text}");
        self.emit(SessionEvent::Status(text));
    }

    /// Emit an event. If the channel is full, log a warning and drop it.
    fn emit(&self, event: SessionEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(
                    "event channel full, dropping event: {:?}",
                    std::mem::discriminant(&dropped)
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("event channel closed, receiver dropped");
            }
        }
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
    use crate::rules::StandardDealer;
    use crate::transports::LoopbackNetwork;

    #[test]
    fn config_defaults() {
        let config = SessionConfig::new("ann");
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert_eq!(config.transition_delay, Duration::from_millis(300));
        assert_eq!(config.policy, NegotiationPolicy::default());
    }

    #[test]
    fn event_channel_capacity_is_clamped_to_one() {
        let config = SessionConfig::new("ann").with_event_channel_capacity(0);
        assert_eq!(config.event_channel_capacity, 1);
    }

    #[tokio::test]
    async fn empty_nickname_fails_fast() {
        let relay = Arc::new(MemoryRelay::new());
        let result = Session::host(
            relay.clone(),
            Arc::new(LoopbackNetwork::new().connector()),
            Box::new(StandardDealer::with_seed(1)),
            SessionConfig::new("  "),
        )
        .await;
        assert!(matches!(result, Err(SessionError::Config(_))));
        assert!(relay.list_lobbies().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn client_cannot_start_matches() {
        let relay = Arc::new(MemoryRelay::new());
        let lobby = relay.create_lobby("ann").await.unwrap();
        let (session, _events) = Session::join(
            lobby,
            relay,
            Arc::new(LoopbackNetwork::new().connector()),
            SessionConfig::new("bob"),
        )
        .await
        .unwrap();
        assert!(matches!(session.start_match(), Err(SessionError::NotHost)));
        assert!(matches!(session.rematch(), Err(SessionError::NotHost)));
        assert!(matches!(
            session.claim([0, 1, 2]),
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn leave_emits_ended_and_blocks_further_commands() {
        let relay = Arc::new(MemoryRelay::new());
        let (mut session, mut events) = Session::host(
            relay,
            Arc::new(LoopbackNetwork::new().connector()),
            Box::new(StandardDealer::with_seed(1)),
            SessionConfig::new("ann"),
        )
        .await
        .unwrap();
        session.leave().await;
        assert!(!session.is_active());
        assert!(matches!(session.start_match(), Err(SessionError::NotConnected)));

        let mut last = None;
        while let Some(event) = events.recv().await {
            last = Some(event);
        }
        assert_eq!(
            last,
            Some(SessionEvent::Ended {
                cause: EndCause::Left,
                was_connected: false
            })
        );
    }

    #[tokio::test]
    async fn dropping_the_handle_closes_events_without_ended() {
        let relay = Arc::new(MemoryRelay::new());
        let (session, mut events) = Session::host(
            relay,
            Arc::new(LoopbackNetwork::new().connector()),
            Box::new(StandardDealer::with_seed(1)),
            SessionConfig::new("ann"),
        )
        .await
        .unwrap();
        drop(session);

        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            let mut seen = Vec::new();
            while let Some(event) = events.recv().await {
                seen.push(event);
            }
            seen
        })
        .await
        .unwrap();
        assert!(!drained
            .iter()
            .any(|e| matches!(e, SessionEvent::Ended { .. })));
    }

    #[tokio::test]
    async fn joining_a_missing_lobby_fails() {
        let relay = Arc::new(MemoryRelay::new());
        let result = Session::join(
            "nope",
            relay,
            Arc::new(LoopbackNetwork::new().connector()),
            SessionConfig::new("bob"),
        )
        .await;
        assert!(matches!(result, Err(SessionError::Relay { .. })));
    }
}
