#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Wire format tests for Setlink.
//!
//! Checks relay signal payloads and data-channel messages against JSON
//! fixtures in the shape browser peers produce.

use setlink::card::{self, Card};
use setlink::protocol::{
    IceCandidate, LobbyInfo, MatchSummary, SessionDescription, Signal, SignalRecord, StateReason,
    WireMessage,
};
use setlink::RejectReason;

// ════════════════════════════════════════════════════════════════════
// Relay signals
// ════════════════════════════════════════════════════════════════════

#[test]
fn browser_offer_fixture_parses() {
    let record: SignalRecord = serde_json::from_str(
        r#"{"from":"ann","type":"offer","at":1700000000123,
            "payload":"{\"to\":\"bob\",\"type\":\"offer\",\"sdp\":\"v=0\\r\\no=- 1 2 IN IP4 127.0.0.1\"}"}"#,
    )
    .unwrap();
    let signal = Signal::from_record(&record).unwrap().unwrap();
    assert_eq!(signal.kind(), "offer");
    assert_eq!(signal.target(), Some("bob"));
    match signal {
        Signal::Offer { description, .. } => {
            assert!(description.sdp.starts_with("v=0\r\n"));
            assert_eq!(description, SessionDescription::offer(description.sdp.clone()));
        }
        other => panic!("expected an offer, got {other:?}"),
    }
}

#[test]
fn legacy_single_candidate_fixture_parses() {
    let payload = r#"{"candidate":"candidate:0 1 UDP 2122252543 10.0.0.2 50000 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
    let signal = Signal::parse("ice", payload).unwrap().unwrap();
    assert_eq!(signal.target(), None);
    assert!(signal.is_for("anyone"));
    match signal {
        Signal::Ice { candidate, .. } => {
            assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
            assert_eq!(candidate.sdp_m_line_index, Some(0));
        }
        other => panic!("expected a candidate, got {other:?}"),
    }
}

#[test]
fn batched_candidates_keep_their_order() {
    let signal = Signal::IceBatch {
        to: Some("ann".into()),
        candidates: vec![IceCandidate::new("c1"), IceCandidate::new("c2")],
    };
    let payload = signal.payload().unwrap();
    match Signal::parse("ice_batch", &payload).unwrap().unwrap() {
        Signal::IceBatch { to, candidates } => {
            assert_eq!(to.as_deref(), Some("ann"));
            let names: Vec<&str> = candidates.iter().map(|c| c.candidate.as_str()).collect();
            assert_eq!(names, vec!["c1", "c2"]);
        }
        other => panic!("expected a batch, got {other:?}"),
    }
}

#[test]
fn ready_payload_is_literal_true() {
    assert_eq!(Signal::Ready.payload().unwrap(), "true");
    assert_eq!(Signal::parse("ready", "true").unwrap(), Some(Signal::Ready));
}

#[test]
fn lobby_get_fixture_parses() {
    let info: LobbyInfo = serde_json::from_str(
        r#"{"players":[{"nick":"ann"},{"nickname":"bob"},{}],
            "signals":[
              {"from":"ann","type":"ready","payload":"true","at":1700000000},
              {"from":"bob","type":"ready","payload":"true","at":"1700000001.5"},
              {"from":"bob","type":"future_kind","payload":{"x":1},"at":null}
            ]}"#,
    )
    .unwrap();
    assert_eq!(info.player_names(), vec!["ann", "bob"]);
    assert_eq!(info.signals.len(), 3);
    assert_eq!(info.signals[1].at, 1_700_000_001);
    assert_eq!(info.signals[2].at, 0);
    assert_eq!(Signal::from_record(&info.signals[2]).unwrap(), None);
}

// ════════════════════════════════════════════════════════════════════
// Data-channel messages
// ════════════════════════════════════════════════════════════════════

#[test]
fn state_fixture_decodes_to_a_board() {
    let message = WireMessage::from_json(
        r#"{"type":"state","reason":"set","state":{
            "version":7,"deck":[80,79],"board":[0,1,2,null,4,5,6,7,8,9,10,11],
            "scores":{"ann":2,"bob":1},
            "finds":{"bob":[{"at":1700000005000,"sincePreviousMs":5000,"possibleAtFind":3}]},
            "startedAt":1700000000000,"elapsedMs":5000,"gameOver":false}}"#,
    )
    .unwrap();
    let WireMessage::State { reason, state } = message else {
        panic!("expected a state message");
    };
    assert_eq!(reason, StateReason::Set);
    assert_eq!(state.version, 7);
    assert_eq!(state.finds["bob"][0].possible_at_find, 3);

    let board = card::decode_board(&state.board).unwrap();
    assert_eq!(board[0], Some(Card::from_code(0).unwrap()));
    assert_eq!(board[3], None);
    assert_eq!(card::decode_deck(&state.deck).unwrap().len(), 2);
}

#[test]
fn state_with_missing_fields_uses_defaults() {
    let message = WireMessage::from_json(r#"{"type":"state","reason":"sync","state":{"version":2}}"#)
        .unwrap();
    let WireMessage::State { state, .. } = message else {
        panic!("expected a state message");
    };
    assert_eq!(state.version, 2);
    assert!(state.board.is_empty());
    assert!(!state.game_over);
}

#[test]
fn every_reject_reason_round_trips_on_the_wire() {
    for reason in [
        RejectReason::Busy,
        RejectReason::Invalid,
        RejectReason::Wrong,
        RejectReason::BadShuffle,
    ] {
        let json = WireMessage::ShuffleResult {
            ok: false,
            reason: Some(reason),
        }
        .to_json()
        .unwrap();
        assert!(json.contains(&format!(r#""reason":"{}""#, reason.as_str())));
        assert_eq!(
            WireMessage::from_json(&json).unwrap(),
            WireMessage::ShuffleResult {
                ok: false,
                reason: Some(reason)
            }
        );
    }
}

#[test]
fn finish_fixture_parses_ties() {
    let message = WireMessage::from_json(
        r#"{"type":"finish","summary":{"tied":["ann","bob"],"scores":{"ann":4,"bob":4}}}"#,
    )
    .unwrap();
    let WireMessage::Finish { summary } = message else {
        panic!("expected a finish message");
    };
    assert!(summary.is_tie());
    assert_eq!(summary.winner, None);

    let encoded = WireMessage::Finish {
        summary: MatchSummary::from_scores([("ann".to_owned(), 1)].into()),
    }
    .to_json()
    .unwrap();
    let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
    assert_eq!(value["summary"]["winner"], "ann");
    assert!(value["summary"].get("tied").is_none());
}

#[test]
fn unknown_or_malformed_messages_are_errors() {
    assert!(WireMessage::from_json(r#"{"type":"teleport"}"#).is_err());
    assert!(WireMessage::from_json(r#"{"type":"claim","nick":"bob"}"#).is_err());
    assert!(WireMessage::from_json("[]").is_err());
}

#[test]
fn message_kinds_match_the_type_tag() {
    let messages = [
        WireMessage::Hello { nick: "a".into() },
        WireMessage::ShuffleRequest { nick: "a".into() },
        WireMessage::ClaimResult {
            ok: true,
            reason: None,
        },
        WireMessage::Rematch {},
    ];
    for message in messages {
        let value: serde_json::Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], message.kind());
    }
}
