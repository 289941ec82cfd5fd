#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! End-to-end session tests.
//!
//! A hosting and a joining [`Session`] run in one process over a
//! [`MemoryRelay`] and a [`LoopbackNetwork`]. Tokio time is paused, so
//! polling intervals, negotiation timeouts and transition delays advance
//! instantly whenever both loops are idle.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use setlink::card;
use setlink::negotiator::NegotiationPolicy;
use setlink::protocol::{LobbyInfo, LobbySummary};
use setlink::relays::MemoryRelay;
use setlink::replicator::MatchPhase;
use setlink::transports::LoopbackNetwork;
use setlink::{
    BoardTransition, ConnectionState, EndCause, RejectReason, Relay, Session, SessionConfig,
    SessionEvent,
};
use tokio::sync::mpsc;

use common::{drain_until_ended, wait_for, wait_for_view, ScriptedDealer};

// ════════════════════════════════════════════════════════════════════
// Helpers
// ════════════════════════════════════════════════════════════════════

struct Pair {
    relay: Arc<MemoryRelay>,
    host: Session,
    host_events: mpsc::Receiver<SessionEvent>,
    client: Session,
    client_events: mpsc::Receiver<SessionEvent>,
}

async fn open_pair(dealer: ScriptedDealer, policy: NegotiationPolicy) -> Pair {
    let relay = Arc::new(MemoryRelay::new());
    let network = LoopbackNetwork::new();
    let (host, host_events) = Session::host(
        Arc::clone(&relay) as Arc<dyn Relay>,
        Arc::new(network.connector()),
        Box::new(dealer),
        SessionConfig::new("ann").with_policy(policy.clone()),
    )
    .await
    .unwrap();
    let (client, client_events) = Session::join(
        host.lobby_id(),
        Arc::clone(&relay) as Arc<dyn Relay>,
        Arc::new(network.connector()),
        SessionConfig::new("bob").with_policy(policy),
    )
    .await
    .unwrap();
    Pair {
        relay,
        host,
        host_events,
        client,
        client_events,
    }
}

/// Counts `lobby_get` polls per nickname on top of a [`MemoryRelay`].
#[derive(Default)]
struct CountingRelay {
    inner: MemoryRelay,
    polls: Mutex<HashMap<String, usize>>,
}

impl CountingRelay {
    fn polls_by(&self, nickname: &str) -> usize {
        self.polls.lock().unwrap().get(nickname).copied().unwrap_or(0)
    }

    async fn signals_by(&self, lobby_id: &str, nickname: &str) -> usize {
        self.inner
            .signals(lobby_id)
            .await
            .iter()
            .filter(|record| record.from == nickname)
            .count()
    }
}

#[async_trait]
impl Relay for CountingRelay {
    async fn create_lobby(&self, nickname: &str) -> setlink::Result<String> {
        self.inner.create_lobby(nickname).await
    }

    async fn join_lobby(&self, lobby_id: &str, nickname: &str) -> setlink::Result<()> {
        self.inner.join_lobby(lobby_id, nickname).await
    }

    async fn get_lobby(&self, lobby_id: &str, nickname: &str) -> setlink::Result<LobbyInfo> {
        *self
            .polls
            .lock()
            .unwrap()
            .entry(nickname.to_owned())
            .or_insert(0) += 1;
        self.inner.get_lobby(lobby_id, nickname).await
    }

    async fn send_signal(
        &self,
        lobby_id: &str,
        nickname: &str,
        kind: &str,
        payload: &str,
    ) -> setlink::Result<()> {
        self.inner
            .send_signal(lobby_id, nickname, kind, payload)
            .await
    }

    async fn list_lobbies(&self) -> setlink::Result<Vec<LobbySummary>> {
        self.inner.list_lobbies().await
    }
}

/// Open a pair and wait until the host has seen the client's `hello`.
async fn connected_pair(dealer: ScriptedDealer) -> Pair {
    let mut pair = open_pair(dealer, NegotiationPolicy::default()).await;
    wait_for(&mut pair.host_events, |e| matches!(e, SessionEvent::ReadyToStart)).await;
    wait_for(&mut pair.client_events, |e| {
        matches!(e, SessionEvent::PlayerJoined { nickname } if nickname == "ann")
    })
    .await;
    pair
}

/// Start a match and wait for the client to settle on the start snapshot.
async fn started_pair(dealer: ScriptedDealer) -> Pair {
    let mut pair = connected_pair(dealer).await;
    pair.host.start_match().unwrap();
    wait_for(&mut pair.client_events, |e| {
        matches!(e, SessionEvent::MatchStarted { .. })
    })
    .await;
    wait_for_view(&mut pair.client_events, |v| v.version == 1).await;
    pair
}

// ════════════════════════════════════════════════════════════════════
// Connection
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn host_and_client_connect_and_exchange_hello() {
    let mut pair = open_pair(ScriptedDealer::standard(), NegotiationPolicy::default()).await;

    wait_for(&mut pair.host_events, |e| {
        matches!(e, SessionEvent::PeerConnected { nickname } if nickname == "bob")
    })
    .await;
    wait_for(&mut pair.host_events, |e| {
        matches!(e, SessionEvent::PlayerJoined { nickname } if nickname == "bob")
    })
    .await;
    wait_for(&mut pair.host_events, |e| matches!(e, SessionEvent::ReadyToStart)).await;
    wait_for(&mut pair.client_events, |e| {
        matches!(
            e,
            SessionEvent::ConnectionStateChanged(ConnectionState::Connected)
        )
    })
    .await;

    assert!(pair.host.is_connected());
    assert!(pair.client.is_connected());

    let signals = pair.relay.signals(pair.host.lobby_id()).await;
    let offers = signals.iter().filter(|s| s.kind == "offer").count();
    assert_eq!(offers, 1, "one offer per connected peer");
}

#[tokio::test(start_paused = true)]
async fn client_sees_the_player_list() {
    let mut pair = open_pair(ScriptedDealer::standard(), NegotiationPolicy::default()).await;
    let players = wait_for(&mut pair.client_events, |e| {
        matches!(e, SessionEvent::PlayersChanged(_))
    })
    .await;
    assert_eq!(
        players,
        SessionEvent::PlayersChanged(vec!["ann".to_owned(), "bob".to_owned()])
    );
}

// ════════════════════════════════════════════════════════════════════
// Match flow
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn start_reaches_the_client_with_a_fresh_state() {
    let mut pair = connected_pair(ScriptedDealer::standard()).await;
    pair.host.start_match().unwrap();

    let started = wait_for(&mut pair.client_events, |e| {
        matches!(e, SessionEvent::MatchStarted { .. })
    })
    .await;
    let SessionEvent::MatchStarted { view } = started else {
        unreachable!()
    };
    assert_eq!(view.version, 1);
    assert_eq!(view.phase, MatchPhase::Active);
    assert!(!view.game_over);
    assert_eq!(view.score, 0);
    assert_eq!(view.scores.keys().collect::<Vec<_>>(), vec!["ann", "bob"]);

    let transition = wait_for(&mut pair.client_events, |e| {
        matches!(e, SessionEvent::BoardTransition { .. })
    })
    .await;
    assert_eq!(
        transition,
        SessionEvent::BoardTransition {
            transition: BoardTransition::Shuffle,
            changed: (0..12).collect(),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn correct_claim_from_client_is_scored_by_the_host() {
    let mut pair = started_pair(ScriptedDealer::standard()).await;

    pair.client.claim([0, 1, 2]).unwrap();
    // The snapshot is broadcast before the requester gets its answer.
    let transition = wait_for(&mut pair.client_events, |e| {
        matches!(e, SessionEvent::BoardTransition { .. })
    })
    .await;
    assert_eq!(
        transition,
        SessionEvent::BoardTransition {
            transition: BoardTransition::Set,
            changed: vec![0, 1, 2],
        }
    );
    let result = wait_for(&mut pair.client_events, |e| {
        matches!(e, SessionEvent::ClaimResult { .. })
    })
    .await;
    assert_eq!(
        result,
        SessionEvent::ClaimResult {
            ok: true,
            reason: None
        }
    );

    let view = wait_for_view(&mut pair.client_events, |v| v.version == 2).await;
    assert_eq!(view.score, 1);
    assert_eq!(view.scores["ann"], 0);
    assert_eq!(view.finds.len(), 1);
    assert_eq!(card::encode_board(&view.board)[0..3], [Some(12), Some(13), Some(14)]);
}

#[tokio::test(start_paused = true)]
async fn wrong_claim_is_answered_without_a_state_change() {
    let mut pair = started_pair(ScriptedDealer::standard()).await;

    pair.client.claim([0, 1, 3]).unwrap();
    let result = wait_for(&mut pair.client_events, |e| {
        matches!(e, SessionEvent::ClaimResult { .. })
    })
    .await;
    assert_eq!(
        result,
        SessionEvent::ClaimResult {
            ok: false,
            reason: Some(RejectReason::Wrong)
        }
    );
}

#[tokio::test(start_paused = true)]
async fn bad_shuffle_call_costs_the_client_a_point() {
    let mut pair = started_pair(ScriptedDealer::standard()).await;

    pair.client.request_shuffle().unwrap();
    let view = wait_for_view(&mut pair.client_events, |v| v.version == 2).await;
    assert_eq!(view.score, -1);
    let result = wait_for(&mut pair.client_events, |e| {
        matches!(e, SessionEvent::ShuffleResult { .. })
    })
    .await;
    assert_eq!(
        result,
        SessionEvent::ShuffleResult {
            ok: false,
            reason: Some(RejectReason::BadShuffle)
        }
    );
}

#[tokio::test(start_paused = true)]
async fn host_claims_are_answered_locally() {
    let mut pair = started_pair(ScriptedDealer::standard()).await;

    pair.host.claim([0, 1, 2]).unwrap();
    let result = wait_for(&mut pair.host_events, |e| {
        matches!(e, SessionEvent::ClaimResult { .. })
    })
    .await;
    assert_eq!(
        result,
        SessionEvent::ClaimResult {
            ok: true,
            reason: None
        }
    );
    let view = wait_for_view(&mut pair.client_events, |v| v.version == 2).await;
    assert_eq!(view.scores["ann"], 1);
    assert_eq!(view.score, 0);
}

#[tokio::test(start_paused = true)]
async fn last_set_finishes_the_match_and_rematch_restarts_it() {
    let mut pair = started_pair(ScriptedDealer::last_set()).await;

    pair.client.claim([0, 1, 2]).unwrap();
    let finished = wait_for(&mut pair.client_events, |e| {
        matches!(e, SessionEvent::MatchFinished { .. })
    })
    .await;
    let SessionEvent::MatchFinished { summary } = finished else {
        unreachable!()
    };
    assert_eq!(summary.winner.as_deref(), Some("bob"));
    wait_for(&mut pair.host_events, |e| {
        matches!(e, SessionEvent::MatchFinished { .. })
    })
    .await;

    pair.host.rematch().unwrap();
    wait_for(&mut pair.client_events, |e| {
        matches!(e, SessionEvent::RematchStarting)
    })
    .await;
    let restarted = wait_for(&mut pair.client_events, |e| {
        matches!(e, SessionEvent::MatchStarted { .. })
    })
    .await;
    let SessionEvent::MatchStarted { view } = restarted else {
        unreachable!()
    };
    assert!(!view.game_over);
    assert_eq!(view.score, 0);
    assert!(view.version > 2);
}

// ════════════════════════════════════════════════════════════════════
// Teardown
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn host_ends_when_its_only_client_leaves() {
    let mut pair = connected_pair(ScriptedDealer::standard()).await;

    pair.client.leave().await;
    let client_events = drain_until_ended(&mut pair.client_events).await;
    assert_eq!(
        client_events.last(),
        Some(&SessionEvent::Ended {
            cause: EndCause::Left,
            was_connected: false
        })
    );

    let host_events = drain_until_ended(&mut pair.host_events).await;
    assert!(host_events.contains(&SessionEvent::PlayerLeft {
        nickname: "bob".into()
    }));
    assert_eq!(
        host_events.last(),
        Some(&SessionEvent::Ended {
            cause: EndCause::PeerLost,
            was_connected: true
        })
    );
    assert!(!pair.host.is_active());
    assert!(!pair.host.is_connected());
    assert!(matches!(
        pair.host.start_match(),
        Err(setlink::SessionError::NotConnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn client_ends_when_the_host_leaves() {
    let mut pair = connected_pair(ScriptedDealer::standard()).await;

    pair.host.leave().await;
    let events = drain_until_ended(&mut pair.client_events).await;
    assert_eq!(
        events.last(),
        Some(&SessionEvent::Ended {
            cause: EndCause::PeerLost,
            was_connected: true
        })
    );
}

#[tokio::test(start_paused = true)]
async fn blocked_network_fails_after_bounded_retries() {
    let relay = Arc::new(MemoryRelay::new());
    let network = LoopbackNetwork::new();
    network.set_blocked(true);
    let policy = NegotiationPolicy::default()
        .with_base_timeout(Duration::from_secs(2))
        .with_extensions(Duration::from_secs(1), Duration::from_secs(1))
        .with_max_retries(1);

    let (host, mut host_events) = Session::host(
        Arc::clone(&relay) as Arc<dyn Relay>,
        Arc::new(network.connector()),
        Box::new(ScriptedDealer::standard()),
        SessionConfig::new("ann").with_policy(policy.clone()),
    )
    .await
    .unwrap();
    let lobby = host.lobby_id().to_owned();
    let (_client, _client_events) = Session::join(
        lobby,
        Arc::clone(&relay) as Arc<dyn Relay>,
        Arc::new(network.connector()),
        SessionConfig::new("bob").with_policy(policy),
    )
    .await
    .unwrap();

    let events = drain_until_ended(&mut host_events).await;
    assert!(events.contains(&SessionEvent::NegotiationExtended));
    assert!(events.contains(&SessionEvent::NegotiationRetry { attempt: 1 }));
    assert!(events.contains(&SessionEvent::ConnectionFailed { attempts: 1 }));
    assert_eq!(
        events.last(),
        Some(&SessionEvent::Ended {
            cause: EndCause::ConnectionFailed,
            was_connected: false
        })
    );
    assert_eq!(network.open_endpoints(), 0);
}

#[tokio::test(start_paused = true)]
async fn leave_mid_negotiation_silences_every_timer() {
    let relay = Arc::new(CountingRelay::default());
    let network = LoopbackNetwork::new();
    network.set_blocked(true);

    let (mut host, mut host_events) = Session::host(
        Arc::clone(&relay) as Arc<dyn Relay>,
        Arc::new(network.connector()),
        Box::new(ScriptedDealer::standard()),
        SessionConfig::new("ann"),
    )
    .await
    .unwrap();
    let lobby = host.lobby_id().to_owned();
    let (_client, _client_events) = Session::join(
        lobby.clone(),
        Arc::clone(&relay) as Arc<dyn Relay>,
        Arc::new(network.connector()),
        SessionConfig::new("bob"),
    )
    .await
    .unwrap();

    // The host has seen `ready` from bob and its offer is still debouncing.
    wait_for(&mut host_events, |e| {
        matches!(
            e,
            SessionEvent::ConnectionStateChanged(ConnectionState::Negotiating)
        )
    })
    .await;
    assert!(!relay
        .inner
        .signals(&lobby)
        .await
        .iter()
        .any(|record| record.from == "ann" && record.kind == "offer"));

    host.leave().await;
    let events = drain_until_ended(&mut host_events).await;
    assert_eq!(
        events.last(),
        Some(&SessionEvent::Ended {
            cause: EndCause::Left,
            was_connected: false
        })
    );

    let signals = relay.signals_by(&lobby, "ann").await;
    let polls = relay.polls_by("ann");
    // Past the offer debounce, the candidate flush and the attempt timeout
    // with both extensions.
    tokio::time::sleep(Duration::from_secs(90)).await;

    assert_eq!(relay.signals_by(&lobby, "ann").await, signals);
    assert_eq!(relay.polls_by("ann"), polls);
    assert!(!host.is_active());
}
