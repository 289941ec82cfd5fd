#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for Setlink integration tests.
//!
//! Provides a deterministic [`ScriptedDealer`], builders for relay signal
//! records, and helpers for waiting on session events.

use std::time::Duration;

use setlink::card::{self, Card};
use setlink::protocol::{SignalRecord, StateReason, WireMessage};
use setlink::rules::{Deal, Dealer};
use setlink::{MatchView, SessionEvent};
use tokio::sync::mpsc;

/// Codes of twelve cards with no set among them.
pub const SETLESS_BOARD: [u8; 12] = [0, 1, 3, 4, 9, 10, 12, 13, 27, 28, 30, 31];

/// Generous upper bound for any single wait. Tests run on paused time, so
/// this only matters if something hangs.
const EVENT_TIMEOUT: Duration = Duration::from_secs(120);

// ── ScriptedDealer ──────────────────────────────────────────────────

/// A dealer with a fixed first deal.
///
/// Every `deal()` returns the scripted board and deck. `replace` pops from
/// the deck; `reshuffle` rotates the board under the deck and refills.
#[derive(Debug, Clone)]
pub struct ScriptedDealer {
    board: Vec<Option<u8>>,
    deck: Vec<u8>,
}

impl ScriptedDealer {
    pub fn new(board: Vec<Option<u8>>, deck: Vec<u8>) -> Self {
        Self { board, deck }
    }

    /// Board holds codes 0..12 (slots 0, 1, 2 form a set); the deck holds
    /// the rest, dealt in ascending order.
    pub fn standard() -> Self {
        let board = (0..12).map(Some).collect();
        let deck = (12..81).rev().collect();
        Self::new(board, deck)
    }

    /// A set-free board over a non-empty deck.
    pub fn setless() -> Self {
        let board = SETLESS_BOARD.iter().copied().map(Some).collect();
        let deck = (0..81u8)
            .filter(|code| !SETLESS_BOARD.contains(code))
            .rev()
            .collect();
        Self::new(board, deck)
    }

    /// Only slots 0, 1, 2 are occupied (with a set) and the deck is empty,
    /// so one correct claim ends the match.
    pub fn last_set() -> Self {
        let mut board: Vec<Option<u8>> = vec![Some(0), Some(1), Some(2)];
        board.resize(12, None);
        Self::new(board, Vec::new())
    }

    /// A set-free board with nothing left to deal.
    pub fn setless_endgame() -> Self {
        Self::new(SETLESS_BOARD.iter().copied().map(Some).collect(), Vec::new())
    }
}

impl Dealer for ScriptedDealer {
    fn deal(&mut self) -> Deal {
        Deal {
            deck: card::decode_deck(&self.deck).unwrap(),
            board: card::decode_board(&self.board).unwrap(),
        }
    }

    fn replace(&mut self, deal: &mut Deal, slots: [usize; 3]) {
        for slot in slots {
            deal.board[slot] = deal.deck.pop();
        }
    }

    fn reshuffle(&mut self, deal: &mut Deal) {
        let returned: Vec<Card> = deal.board.iter_mut().filter_map(Option::take).collect();
        deal.deck.splice(0..0, returned);
        for slot in deal.board.iter_mut() {
            *slot = deal.deck.pop();
        }
    }
}

// ── Relay records ───────────────────────────────────────────────────

pub fn record(from: &str, kind: &str, payload: &str, at: i64) -> SignalRecord {
    SignalRecord {
        from: from.to_owned(),
        kind: kind.to_owned(),
        payload: payload.to_owned(),
        at,
    }
}

pub fn ready(from: &str, at: i64) -> SignalRecord {
    record(from, "ready", "true", at)
}

// ── Snapshots ───────────────────────────────────────────────────────

/// Unwrap a `State` message.
pub fn expect_state(message: &WireMessage) -> (StateReason, setlink::protocol::MatchState) {
    match message {
        WireMessage::State { reason, state } => (*reason, state.clone()),
        other => panic!("expected a state message, got {other:?}"),
    }
}

// ── Session events ──────────────────────────────────────────────────

/// Receive events until one matches `pred`, returning it. Panics on timeout
/// or if the channel closes first.
pub async fn wait_for<F>(rx: &mut mpsc::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    loop {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event channel closed before the expected event");
        if pred(&event) {
            return event;
        }
    }
}

/// Wait for the first `StateApplied` whose view satisfies `pred`.
pub async fn wait_for_view<F>(rx: &mut mpsc::Receiver<SessionEvent>, mut pred: F) -> MatchView
where
    F: FnMut(&MatchView) -> bool,
{
    match wait_for(rx, |event| {
        matches!(event, SessionEvent::StateApplied { view } if pred(view))
    })
    .await
    {
        SessionEvent::StateApplied { view } => view,
        other => panic!("unexpected event {other:?}"),
    }
}

/// Drain every event up to and including `Ended`.
pub async fn drain_until_ended(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    loop {
        let event = wait_for(rx, |_| true).await;
        let done = event.is_terminal();
        events.push(event);
        if done {
            return events;
        }
    }
}
