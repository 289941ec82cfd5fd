//! Host-authoritative match state.
//!
//! The host's [`Replicator`] is the single writer of deck, board and scores.
//! Every accepted mutation bumps the version and yields a full
//! [`WireMessage::State`] snapshot to broadcast. Clients never mutate; they
//! request, then apply whatever snapshot the host sends, keeping only
//! strictly newer versions.
//!
//! Match lifecycle: `Idle → Active → Finished → (rematch) → Active`.
//!
//! After a board-changing snapshot the replicator is *transitioning* until
//! [`Replicator::finish_transition`] is called. Meanwhile the host answers
//! claims and shuffle calls with `busy`, and clients park the newest
//! incoming snapshot instead of applying it.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::card::{self, Board, BOARD_SIZE};
use crate::error::{Result, SessionError};
use crate::protocol::{FindRecord, MatchState, MatchSummary, Role, StateReason, WireMessage};
use crate::reject::RejectReason;
use crate::rules::{Deal, Dealer};

/// Changed slots at or above which a snapshot counts as a full reshuffle.
const SHUFFLE_CLASS_THRESHOLD: usize = 10;
/// Upper bound of changed slots for a set-class transition.
const SET_CLASS_MAX: usize = 4;

/// Where the current match is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MatchPhase {
    #[default]
    Idle,
    Active,
    Finished,
}

/// How a renderer should present a board change. Has no bearing on the
/// data applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoardTransition {
    /// Replace the whole board.
    Shuffle,
    /// Replace only the changed slots.
    Set,
    /// No transitional cue.
    Plain,
}

impl BoardTransition {
    /// Classify a snapshot by its reason and the number of changed slots.
    pub fn classify(reason: StateReason, changed: usize) -> Self {
        if reason == StateReason::Shuffle || changed >= SHUFFLE_CLASS_THRESHOLD {
            Self::Shuffle
        } else if reason == StateReason::Set && (1..=SET_CLASS_MAX).contains(&changed) {
            Self::Set
        } else {
            Self::Plain
        }
    }
}

/// Result of offering a snapshot to a receiving replicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied {
        transition: BoardTransition,
        changed: Vec<usize>,
    },
    /// Version not newer than the last applied one; nothing changed.
    Stale,
    /// A transition is in progress; the snapshot is parked until it ends.
    Deferred,
    /// The snapshot could not be decoded.
    Rejected,
}

/// Result of a host-side claim or shuffle call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOutcome {
    /// The typed answer for the requester.
    pub result: std::result::Result<(), RejectReason>,
    /// Messages to fan out to every open channel, in order.
    pub broadcasts: Vec<WireMessage>,
    /// Board change to present locally, if any.
    pub transition: Option<(BoardTransition, Vec<usize>)>,
}

impl HostOutcome {
    fn rejected(reason: RejectReason) -> Self {
        Self {
            result: Err(reason),
            broadcasts: Vec::new(),
            transition: None,
        }
    }

    /// The finish summary, if this outcome ended the match.
    pub fn summary(&self) -> Option<&MatchSummary> {
        self.broadcasts.iter().find_map(|message| match message {
            WireMessage::Finish { summary } => Some(summary),
            _ => None,
        })
    }
}

/// Read-only view handed to the renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchView {
    pub phase: MatchPhase,
    pub version: u64,
    pub board: Board,
    pub deck_remaining: usize,
    pub scores: BTreeMap<String, i32>,
    /// This peer's own score.
    pub score: i32,
    /// This peer's own finds.
    pub finds: Vec<FindRecord>,
    pub game_over: bool,
    /// Milliseconds since match start on the host's timeline.
    pub elapsed_ms: u64,
    pub possible_sets: usize,
}

/// Match state for one peer, authoritative on the host.
pub struct Replicator {
    role: Role,
    nickname: String,
    dealer: Option<Box<dyn Dealer>>,
    participants: BTreeSet<String>,
    phase: MatchPhase,
    version: u64,
    deal: Deal,
    scores: BTreeMap<String, i32>,
    finds: BTreeMap<String, Vec<FindRecord>>,
    started_at: u64,
    /// Local epoch millis corresponding to elapsed zero on the host timeline.
    clock_base: u64,
    final_elapsed: Option<u64>,
    game_over: bool,
    transitioning: bool,
    parked: Option<(StateReason, MatchState)>,
    prepared: Option<Deal>,
}

impl Replicator {
    /// The authoritative side, dealing with `dealer`.
    pub fn host(nickname: impl Into<String>, dealer: Box<dyn Dealer>) -> Self {
        let nickname = nickname.into();
        let mut replicator = Self::with_role(Role::Host, nickname.clone(), Some(dealer));
        replicator.participants.insert(nickname);
        replicator
    }

    /// A receiving side.
    pub fn client(nickname: impl Into<String>) -> Self {
        Self::with_role(Role::Client, nickname.into(), None)
    }

    fn with_role(role: Role, nickname: String, dealer: Option<Box<dyn Dealer>>) -> Self {
        Self {
            role,
            nickname,
            dealer,
            participants: BTreeSet::new(),
            phase: MatchPhase::Idle,
            version: 0,
            deal: Deal::default(),
            scores: BTreeMap::new(),
            finds: BTreeMap::new(),
            started_at: 0,
            clock_base: 0,
            final_elapsed: None,
            game_over: false,
            transitioning: false,
            parked: None,
            prepared: None,
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn phase(&self) -> MatchPhase {
        self.phase
    }

    /// Last applied (client) or broadcast (host) version.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn board(&self) -> &Board {
        &self.deal.board
    }

    pub fn scores(&self) -> &BTreeMap<String, i32> {
        &self.scores
    }

    pub fn score_of(&self, nickname: &str) -> i32 {
        self.scores.get(nickname).copied().unwrap_or_default()
    }

    pub fn game_over(&self) -> bool {
        self.game_over
    }

    pub fn is_transitioning(&self) -> bool {
        self.transitioning
    }

    /// `true` once a finished match has its next deal ready.
    pub fn has_prepared_deal(&self) -> bool {
        self.prepared.is_some()
    }

    pub fn participants(&self) -> impl Iterator<Item = &str> {
        self.participants.iter().map(String::as_str)
    }

    pub fn add_participant(&mut self, nickname: &str) {
        if self.participants.insert(nickname.to_owned()) {
            debug!(peer = %nickname, "participant added");
        }
    }

    /// Forget a participant. Scores already earned stay in the current match.
    pub fn remove_participant(&mut self, nickname: &str) {
        if self.participants.remove(nickname) {
            debug!(peer = %nickname, "participant removed");
        }
    }

    /// Snapshot of what the renderer needs.
    pub fn view(&self, now_ms: u64) -> MatchView {
        let elapsed_ms = match (self.phase, self.final_elapsed) {
            (_, Some(elapsed)) => elapsed,
            (MatchPhase::Active, None) => now_ms.saturating_sub(self.clock_base),
            _ => 0,
        };
        MatchView {
            phase: self.phase,
            version: self.version,
            board: self.deal.board,
            deck_remaining: self.deal.deck.len(),
            scores: self.scores.clone(),
            score: self.score_of(&self.nickname),
            finds: self.finds.get(&self.nickname).cloned().unwrap_or_default(),
            game_over: self.game_over,
            elapsed_ms,
            possible_sets: self.deal.possible_sets(),
        }
    }

    /// Encode the full match state.
    pub fn snapshot(&self, now_ms: u64) -> MatchState {
        MatchState {
            version: self.version,
            deck: self.deal.deck.iter().map(|c| c.code()).collect(),
            board: card::encode_board(&self.deal.board),
            scores: self.scores.clone(),
            finds: self.finds.clone(),
            started_at: self.started_at,
            elapsed_ms: self
                .final_elapsed
                .unwrap_or_else(|| now_ms.saturating_sub(self.started_at)),
            game_over: self.game_over,
        }
    }

    // ── Host operations ─────────────────────────────────────────────

    fn dealer(&mut self) -> Result<&mut Box<dyn Dealer>> {
        match self.role {
            Role::Host => self.dealer.as_mut().ok_or(SessionError::NotHost),
            Role::Client => Err(SessionError::NotHost),
        }
    }

    /// Start (or restart) a match for the current participants.
    ///
    /// Uses the deal prepared at the end of the previous match if there is
    /// one. Returns the `start` snapshot to broadcast.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotHost`] on a client.
    pub fn start_match(&mut self, now_ms: u64) -> Result<WireMessage> {
        self.dealer()?;
        let deal = match self.prepared.take() {
            Some(deal) => deal,
            None => self.dealer()?.deal(),
        };
        self.deal = deal;
        self.scores = self.participants.iter().map(|p| (p.clone(), 0)).collect();
        self.finds = self
            .participants
            .iter()
            .map(|p| (p.clone(), Vec::new()))
            .collect();
        self.started_at = now_ms;
        self.clock_base = now_ms;
        self.final_elapsed = None;
        self.game_over = false;
        self.transitioning = false;
        self.parked = None;
        self.phase = MatchPhase::Active;
        self.version += 1;
        info!(
            version = self.version,
            players = self.participants.len(),
            "match started"
        );
        Ok(WireMessage::State {
            reason: StateReason::Start,
            state: self.snapshot(now_ms),
        })
    }

    fn accepting(&self) -> bool {
        self.phase == MatchPhase::Active && !self.transitioning && !self.game_over
    }

    /// Validate and apply a claim by `nickname`.
    ///
    /// Checks, in order: the match accepts claims (`busy`), the indices are
    /// three distinct occupied slots (`invalid`), the cards form a set
    /// (`wrong`).
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotHost`] on a client. Rule rejections are
    /// reported in [`HostOutcome::result`].
    pub fn claim(&mut self, nickname: &str, indices: &[i64], now_ms: u64) -> Result<HostOutcome> {
        self.dealer()?;
        if !self.accepting() {
            return Ok(HostOutcome::rejected(RejectReason::Busy));
        }
        let Some(slots) = self.claimed_slots(indices) else {
            return Ok(HostOutcome::rejected(RejectReason::Invalid));
        };
        let cards = slots.map(|slot| self.deal.board.get(slot).copied().flatten());
        let [Some(a), Some(b), Some(c)] = cards else {
            return Ok(HostOutcome::rejected(RejectReason::Invalid));
        };
        if !self.dealer()?.is_set(a, b, c) {
            debug!(peer = %nickname, ?slots, "wrong claim");
            return Ok(HostOutcome::rejected(RejectReason::Wrong));
        }

        let possible_at_find = u32::try_from(self.deal.possible_sets()).unwrap_or(u32::MAX);
        *self.scores.entry(nickname.to_owned()).or_insert(0) += 1;
        let history = self.finds.entry(nickname.to_owned()).or_default();
        let previous = history.last().map_or(self.started_at, |f| f.at);
        history.push(FindRecord {
            at: now_ms,
            since_previous_ms: now_ms.saturating_sub(previous),
            possible_at_find,
        });

        let mut deal = std::mem::take(&mut self.deal);
        self.dealer()?.replace(&mut deal, slots);
        self.deal = deal;
        self.version += 1;
        self.transitioning = true;
        info!(peer = %nickname, version = self.version, "set accepted");

        let mut broadcasts = vec![WireMessage::State {
            reason: StateReason::Set,
            state: self.snapshot(now_ms),
        }];
        if self.deal.deck.is_empty() && self.deal.possible_sets() == 0 {
            broadcasts = self.finish(StateReason::Set, now_ms)?;
        }
        Ok(HostOutcome {
            result: Ok(()),
            broadcasts,
            transition: Some((BoardTransition::Set, slots.to_vec())),
        })
    }

    fn claimed_slots(&self, indices: &[i64]) -> Option<[usize; 3]> {
        let [a, b, c] = indices else {
            return None;
        };
        let slots = [*a, *b, *c].map(|i| usize::try_from(i).ok().filter(|i| *i < BOARD_SIZE));
        let [Some(a), Some(b), Some(c)] = slots else {
            return None;
        };
        (a != b && b != c && a != c).then_some([a, b, c])
    }

    /// Handle a "no set on this board" call by `nickname`.
    ///
    /// With zero sets the caller gains a point and the board is regenerated
    /// (or the match ends if the deck is empty). Otherwise the caller loses a
    /// point, the board stays, and the result is `bad_shuffle`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotHost`] on a client.
    pub fn shuffle(&mut self, nickname: &str, now_ms: u64) -> Result<HostOutcome> {
        self.dealer()?;
        if !self.accepting() {
            return Ok(HostOutcome::rejected(RejectReason::Busy));
        }

        if self.deal.possible_sets() > 0 {
            *self.scores.entry(nickname.to_owned()).or_insert(0) -= 1;
            self.version += 1;
            info!(peer = %nickname, version = self.version, "bad shuffle call penalised");
            return Ok(HostOutcome {
                result: Err(RejectReason::BadShuffle),
                broadcasts: vec![WireMessage::State {
                    reason: StateReason::Penalty,
                    state: self.snapshot(now_ms),
                }],
                transition: None,
            });
        }

        *self.scores.entry(nickname.to_owned()).or_insert(0) += 1;
        if self.deal.deck.is_empty() {
            self.version += 1;
            info!(peer = %nickname, "no sets and no deck left");
            return Ok(HostOutcome {
                result: Ok(()),
                broadcasts: self.finish(StateReason::Shuffle, now_ms)?,
                transition: None,
            });
        }

        let mut deal = std::mem::take(&mut self.deal);
        self.dealer()?.reshuffle(&mut deal);
        self.deal = deal;
        self.version += 1;
        self.transitioning = true;
        info!(peer = %nickname, version = self.version, "board reshuffled");

        // The last cards may all fit on the board without forming a set.
        let broadcasts = if self.deal.deck.is_empty() && self.deal.possible_sets() == 0 {
            self.finish(StateReason::Shuffle, now_ms)?
        } else {
            vec![WireMessage::State {
                reason: StateReason::Shuffle,
                state: self.snapshot(now_ms),
            }]
        };
        Ok(HostOutcome {
            result: Ok(()),
            broadcasts,
            transition: Some((BoardTransition::Shuffle, (0..BOARD_SIZE).collect())),
        })
    }

    /// Mark the match over, prepare the next deal and return the final
    /// snapshot followed by the `finish` message.
    fn finish(&mut self, reason: StateReason, now_ms: u64) -> Result<Vec<WireMessage>> {
        self.game_over = true;
        self.phase = MatchPhase::Finished;
        self.final_elapsed = Some(now_ms.saturating_sub(self.started_at));
        let state = self.snapshot(now_ms);
        let summary = MatchSummary::from_scores(self.scores.clone());
        self.prepared = Some(self.dealer()?.deal());
        info!(winner = ?summary.winner, tied = ?summary.tied, "match finished");
        Ok(vec![
            WireMessage::State { reason, state },
            WireMessage::Finish { summary },
        ])
    }

    /// The catch-up snapshot for a peer that connects mid-match.
    pub fn sync_message(&self, now_ms: u64) -> Option<WireMessage> {
        (self.role == Role::Host && self.phase != MatchPhase::Idle).then(|| WireMessage::State {
            reason: StateReason::Sync,
            state: self.snapshot(now_ms),
        })
    }

    // ── Client operations ───────────────────────────────────────────

    /// The claim message for three board slots, stamped with how many sets
    /// this peer currently sees.
    pub fn claim_request(&self, slots: [usize; 3]) -> WireMessage {
        WireMessage::Claim {
            nick: self.nickname.clone(),
            indices: slots
                .iter()
                .map(|s| i64::try_from(*s).unwrap_or(i64::MAX))
                .collect(),
            possible_at_start: u32::try_from(self.deal.possible_sets()).ok(),
        }
    }

    pub fn shuffle_request(&self) -> WireMessage {
        WireMessage::ShuffleRequest {
            nick: self.nickname.clone(),
        }
    }

    /// Offer a snapshot received from the host.
    ///
    /// Versions not strictly newer than the last applied one are discarded.
    /// A `start` snapshot is a hard cut: the game-over flag is cleared
    /// whatever the previous state.
    pub fn apply_snapshot(
        &mut self,
        reason: StateReason,
        state: MatchState,
        now_ms: u64,
    ) -> ApplyOutcome {
        if state.version <= self.version {
            debug!(
                version = state.version,
                applied = self.version,
                "stale snapshot discarded"
            );
            return ApplyOutcome::Stale;
        }
        if self.transitioning {
            if self
                .parked
                .as_ref()
                .is_none_or(|(_, parked)| parked.version < state.version)
            {
                self.parked = Some((reason, state));
            }
            return ApplyOutcome::Deferred;
        }

        let board = match card::decode_board(&state.board) {
            Ok(board) => board,
            Err(e) => {
                warn!(version = state.version, "undecodable board: {e}");
                return ApplyOutcome::Rejected;
            }
        };
        let deck = match card::decode_deck(&state.deck) {
            Ok(deck) => deck,
            Err(e) => {
                warn!(version = state.version, "undecodable deck: {e}");
                return ApplyOutcome::Rejected;
            }
        };

        let changed: Vec<usize> = board
            .iter()
            .zip(self.deal.board.iter())
            .enumerate()
            .filter(|(_, (new, old))| new != old)
            .map(|(slot, _)| slot)
            .collect();
        let transition = if reason == StateReason::Start {
            BoardTransition::Shuffle
        } else {
            BoardTransition::classify(reason, changed.len())
        };

        if reason == StateReason::Start {
            self.parked = None;
        }
        self.deal = Deal { deck, board };
        self.version = state.version;
        self.scores = state.scores;
        self.finds = state.finds;
        self.started_at = state.started_at;
        self.game_over = reason != StateReason::Start && state.game_over;
        self.clock_base = now_ms.saturating_sub(state.elapsed_ms);
        self.final_elapsed = self.game_over.then_some(state.elapsed_ms);
        self.phase = if self.game_over {
            MatchPhase::Finished
        } else {
            MatchPhase::Active
        };
        self.transitioning = transition != BoardTransition::Plain;
        debug!(
            version = self.version,
            ?reason,
            ?transition,
            changed = changed.len(),
            "snapshot applied"
        );
        ApplyOutcome::Applied {
            transition,
            changed,
        }
    }

    /// Record a `finish` received from the host.
    pub fn apply_finish(&mut self, summary: &MatchSummary, now_ms: u64) {
        self.game_over = true;
        self.phase = MatchPhase::Finished;
        self.final_elapsed
            .get_or_insert(now_ms.saturating_sub(self.clock_base));
        self.scores.clone_from(&summary.scores);
    }

    /// End the current visual transition. On a client, applies the parked
    /// snapshot if one arrived meanwhile.
    pub fn finish_transition(&mut self, now_ms: u64) -> Option<(StateReason, ApplyOutcome)> {
        self.transitioning = false;
        let (reason, state) = self.parked.take()?;
        Some((reason, self.apply_snapshot(reason, state, now_ms)))
    }

    /// Back to the initial state. Role, nickname and dealer are kept.
    pub fn reset(&mut self) {
        let role = self.role;
        let nickname = std::mem::take(&mut self.nickname);
        let dealer = self.dealer.take();
        *self = Self::with_role(role, nickname, dealer);
        if role == Role::Host {
            self.participants.insert(self.nickname.clone());
        }
    }
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("role", &self.role)
            .field("nickname", &self.nickname)
            .field("phase", &self.phase)
            .field("version", &self.version)
            .field("game_over", &self.game_over)
            .field("transitioning", &self.transitioning)
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
    use crate::rules::StandardDealer;

    #[test]
    fn classification() {
        assert_eq!(
            BoardTransition::classify(StateReason::Shuffle, 0),
            BoardTransition::Shuffle
        );
        assert_eq!(
            BoardTransition::classify(StateReason::Sync, 10),
            BoardTransition::Shuffle
        );
        assert_eq!(
            BoardTransition::classify(StateReason::Set, 3),
            BoardTransition::Set
        );
        assert_eq!(
            BoardTransition::classify(StateReason::Set, 0),
            BoardTransition::Plain
        );
        assert_eq!(
            BoardTransition::classify(StateReason::Set, 5),
            BoardTransition::Plain
        );
        assert_eq!(
            BoardTransition::classify(StateReason::Penalty, 0),
            BoardTransition::Plain
        );
    }

    #[test]
    fn host_only_operations_fail_on_client() {
        let mut client = Replicator::client("bob");
        assert!(matches!(client.start_match(0), Err(SessionError::NotHost)));
        assert!(matches!(
            client.claim("bob", &[0, 1, 2], 0),
            Err(SessionError::NotHost)
        ));
        assert!(matches!(client.shuffle("bob", 0), Err(SessionError::NotHost)));
    }

    #[test]
    fn claims_before_start_are_busy() {
        let mut host = Replicator::host("ann", Box::new(StandardDealer::with_seed(1)));
        let outcome = host.claim("ann", &[0, 1, 2], 0).unwrap();
        assert_eq!(outcome.result, Err(RejectReason::Busy));
        assert!(outcome.broadcasts.is_empty());
    }

    #[test]
    fn out_of_range_and_malformed_claims_are_invalid() {
        let mut host = Replicator::host("ann", Box::new(StandardDealer::with_seed(1)));
        host.start_match(1_000).unwrap();
        for indices in [&[0, 1][..], &[0, 1, 2, 3], &[-1, 0, 1], &[0, 1, 12]] {
            let outcome = host.claim("ann", indices, 1_000).unwrap();
            assert_eq!(outcome.result, Err(RejectReason::Invalid), "{indices:?}");
        }
    }

    #[test]
    fn start_resets_scores_for_participants() {
        let mut host = Replicator::host("ann", Box::new(StandardDealer::with_seed(3)));
        host.add_participant("bob");
        let start = host.start_match(5_000).unwrap();
        let WireMessage::State { reason, state } = start else {
            panic!("expected a state message");
        };
        assert_eq!(reason, StateReason::Start);
        assert_eq!(state.version, 1);
        assert_eq!(state.scores.len(), 2);
        assert!(state.scores.values().all(|s| *s == 0));
        assert_eq!(state.board.len(), BOARD_SIZE);
        assert_eq!(host.phase(), MatchPhase::Active);
    }

    #[test]
    fn client_parks_snapshots_during_transition() {
        let mut host = Replicator::host("ann", Box::new(StandardDealer::with_seed(9)));
        let mut client = Replicator::client("bob");
        let WireMessage::State { state: s1, .. } = host.start_match(0).unwrap() else {
            panic!("expected a state message");
        };
        let mut s2 = s1.clone();
        s2.version = 2;
        let mut s3 = s1.clone();
        s3.version = 3;

        assert!(matches!(
            client.apply_snapshot(StateReason::Start, s1, 0),
            ApplyOutcome::Applied {
                transition: BoardTransition::Shuffle,
                ..
            }
        ));
        assert!(client.is_transitioning());
        assert_eq!(
            client.apply_snapshot(StateReason::Sync, s3, 0),
            ApplyOutcome::Deferred
        );
        assert_eq!(
            client.apply_snapshot(StateReason::Sync, s2, 0),
            ApplyOutcome::Deferred
        );
        let (reason, applied) = client.finish_transition(0).unwrap();
        assert_eq!(reason, StateReason::Sync);
        assert!(matches!(applied, ApplyOutcome::Applied { .. }));
        assert_eq!(client.version(), 3);
        assert_eq!(client.finish_transition(0), None);
    }

    #[test]
    fn elapsed_time_follows_host_timeline() {
        let mut client = Replicator::client("bob");
        let state = MatchState {
            version: 1,
            board: vec![None; BOARD_SIZE],
            started_at: 10,
            elapsed_ms: 4_000,
            ..MatchState::default()
        };
        client.apply_snapshot(StateReason::Sync, state, 100_000);
        assert_eq!(client.view(101_000).elapsed_ms, 5_000);
    }

    #[test]
    fn undecodable_snapshot_is_rejected() {
        let mut client = Replicator::client("bob");
        let state = MatchState {
            version: 1,
            board: vec![Some(200)],
            ..MatchState::default()
        };
        assert_eq!(
            client.apply_snapshot(StateReason::Sync, state, 0),
            ApplyOutcome::Rejected
        );
        assert_eq!(client.version(), 0);
    }

    #[test]
    fn reset_keeps_identity() {
        let mut host = Replicator::host("ann", Box::new(StandardDealer::with_seed(2)));
        host.add_participant("bob");
        host.start_match(0).unwrap();
        host.reset();
        assert_eq!(host.phase(), MatchPhase::Idle);
        assert_eq!(host.version(), 0);
        assert_eq!(host.participants().collect::<Vec<_>>(), vec!["ann"]);
        assert!(host.start_match(0).is_ok());
    }
}
