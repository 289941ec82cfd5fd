#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Host-authoritative replication tests.
//!
//! Drives a host [`Replicator`] with a [`ScriptedDealer`] and feeds its
//! snapshots to client replicators, checking scoring rules, version
//! ordering and catch-up behaviour.

mod common;

use setlink::card::{self, Card};
use setlink::protocol::{StateReason, WireMessage};
use setlink::replicator::{ApplyOutcome, BoardTransition, MatchPhase, Replicator};
use setlink::RejectReason;

use common::{expect_state, ScriptedDealer, SETLESS_BOARD};

const T0: u64 = 1_700_000_000_000;

fn host_with(dealer: ScriptedDealer) -> Replicator {
    let mut host = Replicator::host("ann", Box::new(dealer));
    host.add_participant("bob");
    host
}

fn started(dealer: ScriptedDealer) -> (Replicator, WireMessage) {
    let mut host = host_with(dealer);
    let start = host.start_match(T0).unwrap();
    (host, start)
}

fn code(code: u8) -> Option<Card> {
    Some(Card::from_code(code).unwrap())
}

// ════════════════════════════════════════════════════════════════════
// Claims
// ════════════════════════════════════════════════════════════════════

#[test]
fn correct_claim_scores_and_replaces_claimed_slots() {
    let (mut host, _) = started(ScriptedDealer::standard());
    let before = *host.board();
    assert!(card::is_set(
        before[0].unwrap(),
        before[1].unwrap(),
        before[2].unwrap()
    ));

    let outcome = host.claim("bob", &[0, 1, 2], T0 + 4_000).unwrap();
    assert_eq!(outcome.result, Ok(()));
    assert_eq!(
        outcome.transition,
        Some((BoardTransition::Set, vec![0, 1, 2]))
    );
    assert_eq!(outcome.broadcasts.len(), 1);

    let (reason, state) = expect_state(&outcome.broadcasts[0]);
    assert_eq!(reason, StateReason::Set);
    assert_eq!(state.version, 2);
    assert_eq!(state.scores.get("bob"), Some(&1));
    assert_eq!(state.scores.get("ann"), Some(&0));
    assert_eq!(state.board[0..3], [Some(12), Some(13), Some(14)]);
    assert_eq!(state.board[3..], card::encode_board(&before)[3..]);

    let finds = &state.finds["bob"];
    assert_eq!(finds.len(), 1);
    assert_eq!(finds[0].at, T0 + 4_000);
    assert_eq!(finds[0].since_previous_ms, 4_000);
    assert_eq!(host.board()[0], code(12));
}

#[test]
fn wrong_claim_is_rejected_without_a_version_bump() {
    let (mut host, _) = started(ScriptedDealer::standard());
    let outcome = host.claim("bob", &[0, 1, 3], T0).unwrap();
    assert_eq!(outcome.result, Err(RejectReason::Wrong));
    assert!(outcome.broadcasts.is_empty());
    assert_eq!(host.version(), 1);
    assert_eq!(host.score_of("bob"), 0);
}

#[test]
fn duplicate_indices_are_invalid() {
    let (mut host, _) = started(ScriptedDealer::standard());
    for indices in [&[0, 0, 1][..], &[2, 1, 2], &[0, 1], &[0, 1, 2, 3], &[-1, 1, 2], &[0, 1, 12]] {
        let outcome = host.claim("bob", indices, T0).unwrap();
        assert_eq!(outcome.result, Err(RejectReason::Invalid), "{indices:?}");
    }
    assert_eq!(host.version(), 1);
}

#[test]
fn claims_on_empty_slots_are_invalid() {
    let (mut host, _) = started(ScriptedDealer::last_set());
    let outcome = host.claim("bob", &[0, 1, 5], T0).unwrap();
    assert_eq!(outcome.result, Err(RejectReason::Invalid));
}

#[test]
fn host_is_busy_until_the_transition_ends() {
    let (mut host, _) = started(ScriptedDealer::standard());
    host.claim("bob", &[0, 1, 2], T0).unwrap();
    assert!(host.is_transitioning());

    let outcome = host.claim("ann", &[3, 4, 5], T0).unwrap();
    assert_eq!(outcome.result, Err(RejectReason::Busy));
    let outcome = host.shuffle("ann", T0).unwrap();
    assert_eq!(outcome.result, Err(RejectReason::Busy));

    assert_eq!(host.finish_transition(T0), None);
    assert!(!host.is_transitioning());
    assert_ne!(
        host.claim("ann", &[3, 4, 5], T0).unwrap().result,
        Err(RejectReason::Busy)
    );
}

#[test]
fn final_claim_finishes_the_match() {
    let (mut host, _) = started(ScriptedDealer::last_set());
    let outcome = host.claim("bob", &[0, 1, 2], T0 + 9_000).unwrap();
    assert_eq!(outcome.result, Ok(()));
    assert_eq!(outcome.broadcasts.len(), 2);

    let (reason, state) = expect_state(&outcome.broadcasts[0]);
    assert_eq!(reason, StateReason::Set);
    assert!(state.game_over);
    assert_eq!(state.elapsed_ms, 9_000);

    let summary = outcome.summary().unwrap();
    assert_eq!(summary.winner.as_deref(), Some("bob"));
    assert!(!summary.is_tie());
    assert_eq!(host.phase(), MatchPhase::Finished);
    assert!(host.game_over());
    assert!(host.has_prepared_deal());
}

// ════════════════════════════════════════════════════════════════════
// Shuffle calls
// ════════════════════════════════════════════════════════════════════

#[test]
fn shuffle_with_sets_on_board_costs_a_point() {
    let (mut host, _) = started(ScriptedDealer::standard());
    let board = *host.board();

    let outcome = host.shuffle("bob", T0).unwrap();
    assert_eq!(outcome.result, Err(RejectReason::BadShuffle));
    assert_eq!(outcome.transition, None);
    let (reason, state) = expect_state(&outcome.broadcasts[0]);
    assert_eq!(reason, StateReason::Penalty);
    assert_eq!(state.version, 2);
    assert_eq!(state.scores["bob"], -1);
    assert_eq!(*host.board(), board);
    assert!(!host.is_transitioning());
}

#[test]
fn shuffle_without_sets_rewards_and_regenerates_the_board() {
    let (mut host, _) = started(ScriptedDealer::setless());
    assert_eq!(card::count_sets(host.board()), 0);
    let before = *host.board();

    let outcome = host.shuffle("bob", T0).unwrap();
    assert_eq!(outcome.result, Ok(()));
    assert_eq!(
        outcome.transition,
        Some((BoardTransition::Shuffle, (0..12).collect()))
    );
    let (reason, state) = expect_state(&outcome.broadcasts[0]);
    assert_eq!(reason, StateReason::Shuffle);
    assert_eq!(state.scores["bob"], 1);
    assert_ne!(*host.board(), before);
    assert_eq!(state.deck.len() + 12, 81);
}

#[test]
fn setless_board_with_empty_deck_ends_the_match() {
    let (mut host, _) = started(ScriptedDealer::setless_endgame());
    let outcome = host.shuffle("ann", T0).unwrap();
    assert_eq!(outcome.result, Ok(()));
    assert_eq!(outcome.transition, None);
    let summary = outcome.summary().unwrap();
    assert_eq!(summary.winner.as_deref(), Some("ann"));
    assert_eq!(host.phase(), MatchPhase::Finished);
}

#[test]
fn reshuffle_that_empties_a_setless_deck_ends_the_match() {
    let (on_board, in_deck) = SETLESS_BOARD.split_at(9);
    let mut board: Vec<Option<u8>> = on_board.iter().copied().map(Some).collect();
    board.resize(12, None);
    let (mut host, _) = started(ScriptedDealer::new(board, in_deck.to_vec()));

    let outcome = host.shuffle("ann", T0 + 7_000).unwrap();
    assert_eq!(outcome.result, Ok(()));
    assert_eq!(
        outcome.transition,
        Some((BoardTransition::Shuffle, (0..12).collect()))
    );
    assert_eq!(outcome.broadcasts.len(), 2);

    let (reason, state) = expect_state(&outcome.broadcasts[0]);
    assert_eq!(reason, StateReason::Shuffle);
    assert!(state.game_over);
    assert!(state.deck.is_empty());
    assert_eq!(state.board.iter().flatten().count(), 12);
    assert_eq!(host.score_of("ann"), 1);

    let summary = outcome.summary().unwrap();
    assert_eq!(summary.winner.as_deref(), Some("ann"));
    assert_eq!(host.phase(), MatchPhase::Finished);
    assert!(host.game_over());
}

// ════════════════════════════════════════════════════════════════════
// Clients
// ════════════════════════════════════════════════════════════════════

#[test]
fn late_joiner_catches_up_from_one_snapshot() {
    let (mut host, _) = started(ScriptedDealer::standard());
    host.claim("bob", &[0, 1, 2], T0 + 1_000).unwrap();
    host.finish_transition(T0 + 1_300);
    host.shuffle("ann", T0 + 2_000).unwrap();
    host.add_participant("cat");

    let sync = host.sync_message(T0 + 3_000).unwrap();
    let (reason, state) = expect_state(&sync);
    assert_eq!(reason, StateReason::Sync);

    let mut late = Replicator::client("cat");
    let outcome = late.apply_snapshot(reason, state, T0 + 3_000);
    assert!(matches!(outcome, ApplyOutcome::Applied { .. }));

    let host_view = host.view(T0 + 3_000);
    let late_view = late.view(T0 + 3_000);
    assert_eq!(late_view.version, host_view.version);
    assert_eq!(late_view.board, host_view.board);
    assert_eq!(late_view.scores, host_view.scores);
    assert_eq!(late_view.deck_remaining, host_view.deck_remaining);
    assert_eq!(late_view.possible_sets, host_view.possible_sets);
    assert_eq!(late_view.elapsed_ms, 3_000);
}

#[test]
fn newer_snapshot_alone_matches_applying_both() {
    let (mut host, start) = started(ScriptedDealer::standard());
    let (_, first) = expect_state(&start);
    let claim = host.claim("bob", &[0, 1, 2], T0 + 2_000).unwrap();
    let (_, second) = expect_state(&claim.broadcasts[0]);

    let mut stepwise = Replicator::client("bob");
    stepwise.apply_snapshot(StateReason::Start, first, T0 + 2_000);
    stepwise.finish_transition(T0 + 2_000);
    stepwise.apply_snapshot(StateReason::Set, second.clone(), T0 + 2_000);
    stepwise.finish_transition(T0 + 2_000);

    let mut direct = Replicator::client("bob");
    direct.apply_snapshot(StateReason::Set, second, T0 + 2_000);
    direct.finish_transition(T0 + 2_000);

    assert_eq!(direct.view(T0 + 5_000), stepwise.view(T0 + 5_000));
}

#[test]
fn stale_snapshots_leave_state_untouched() {
    let (mut host, start) = started(ScriptedDealer::standard());
    let (_, first) = expect_state(&start);
    let claim = host.claim("bob", &[0, 1, 2], T0).unwrap();
    let (_, second) = expect_state(&claim.broadcasts[0]);

    let mut client = Replicator::client("bob");
    client.apply_snapshot(StateReason::Start, first.clone(), T0);
    client.finish_transition(T0);
    client.apply_snapshot(StateReason::Set, second.clone(), T0);
    client.finish_transition(T0);
    let view = client.view(T0);

    assert_eq!(
        client.apply_snapshot(StateReason::Start, first, T0),
        ApplyOutcome::Stale
    );
    assert_eq!(
        client.apply_snapshot(StateReason::Set, second, T0),
        ApplyOutcome::Stale
    );
    assert_eq!(client.view(T0), view);
}

#[test]
fn start_snapshot_clears_game_over() {
    let (mut host, _) = started(ScriptedDealer::last_set());
    let outcome = host.claim("bob", &[0, 1, 2], T0).unwrap();

    let mut client = Replicator::client("bob");
    let (reason, state) = expect_state(&outcome.broadcasts[0]);
    client.apply_snapshot(reason, state, T0);
    client.apply_finish(outcome.summary().unwrap(), T0);
    client.finish_transition(T0);
    assert!(client.game_over());

    let rematch = host.start_match(T0 + 60_000).unwrap();
    let (reason, state) = expect_state(&rematch);
    assert_eq!(reason, StateReason::Start);
    assert_eq!(state.scores.values().sum::<i32>(), 0);

    let outcome = client.apply_snapshot(reason, state, T0 + 60_000);
    assert!(matches!(
        outcome,
        ApplyOutcome::Applied {
            transition: BoardTransition::Shuffle,
            ..
        }
    ));
    assert!(!client.game_over());
    assert_eq!(client.phase(), MatchPhase::Active);
    assert_eq!(client.score_of("bob"), 0);
}

#[test]
fn claim_request_carries_local_set_count() {
    let (_, start) = started(ScriptedDealer::standard());
    let (reason, state) = expect_state(&start);
    let mut client = Replicator::client("bob");
    client.apply_snapshot(reason, state, T0);

    match client.claim_request([0, 1, 2]) {
        WireMessage::Claim {
            nick,
            indices,
            possible_at_start,
        } => {
            assert_eq!(nick, "bob");
            assert_eq!(indices, vec![0, 1, 2]);
            assert_eq!(
                possible_at_start,
                u32::try_from(card::count_sets(client.board())).ok()
            );
        }
        other => panic!("expected a claim, got {other:?}"),
    }
}
