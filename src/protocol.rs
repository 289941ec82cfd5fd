//! Wire-compatible protocol types.
//!
//! Three families of messages live here:
//!
//! - relay records returned by the HTTP relay (`lobby_get`, `lobby_list`),
//! - [`Signal`]s, the typed view of a relay signal's `type` + `payload`,
//! - [`WireMessage`]s, the tagged records exchanged over an open data channel.
//!
//! Field names follow the browser peers' JSON exactly (camelCase, with the
//! relay's historical aliases accepted on input).

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, SessionError};
use crate::reject::RejectReason;

/// Wall-clock time in epoch milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

// ── Roles ───────────────────────────────────────────────────────────

/// Which side of a session this peer plays. Fixed for the session lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The single authoritative peer; offers connections and owns the deck.
    Host,
    /// Reacts to offers and requests mutations from the host.
    Client,
}

// ── Relay records ───────────────────────────────────────────────────

/// Accepts integer, float, numeric-string or null timestamps.
fn de_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or_default(),
        serde_json::Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(|f| f as i64)
            .unwrap_or_default(),
        _ => 0,
    })
}

/// Signal payloads are strings; anything else is kept as its JSON text.
fn de_payload<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// One signal as stored by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalRecord {
    pub from: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, deserialize_with = "de_payload")]
    pub payload: String,
    /// Server timestamp.
    #[serde(default, deserialize_with = "de_timestamp")]
    pub at: i64,
}

/// A player entry in `lobby_get`. Older relays only send `nick`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nick: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
}

impl PlayerRecord {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            nick: Some(name.into()),
            nickname: None,
        }
    }

    /// The display name, preferring `nickname` over `nick`.
    pub fn name(&self) -> Option<&str> {
        self.nickname.as_deref().or(self.nick.as_deref())
    }
}

/// The `lobby` object returned by `lobby_get`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbyInfo {
    #[serde(default)]
    pub players: Vec<PlayerRecord>,
    #[serde(default)]
    pub signals: Vec<SignalRecord>,
}

impl LobbyInfo {
    /// Player names in relay order, skipping nameless entries.
    pub fn player_names(&self) -> Vec<String> {
        self.players
            .iter()
            .filter_map(|p| p.name().map(str::to_owned))
            .collect()
    }
}

/// One entry of `lobby_list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbySummary {
    #[serde(rename = "lobbyId", alias = "id")]
    pub lobby_id: String,
    #[serde(
        rename = "hostNick",
        alias = "nickname",
        alias = "nick",
        alias = "host",
        default
    )]
    pub host_nickname: String,
    /// Seconds or milliseconds depending on the relay; see
    /// [`normalize_timestamp`](crate::lobby::normalize_timestamp).
    #[serde(rename = "createdAt", alias = "at", default, deserialize_with = "de_timestamp")]
    pub created_at: i64,
}

// ── Signals ─────────────────────────────────────────────────────────

/// Whether a session description is an offer or an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description as produced by the peer connection object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One ICE candidate, in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct DescriptionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<String>,
    #[serde(flatten)]
    description: SessionDescription,
}

#[derive(Serialize, Deserialize)]
struct CandidatePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<String>,
    #[serde(flatten)]
    candidate: IceCandidate,
}

#[derive(Serialize, Deserialize)]
struct BatchPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<String>,
    #[serde(default)]
    candidates: Vec<IceCandidate>,
}

/// A typed signal. `to` is the addressed nickname; `None` means broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Local readiness announcement (payload `"true"`).
    Ready,
    Offer {
        to: Option<String>,
        description: SessionDescription,
    },
    Answer {
        to: Option<String>,
        description: SessionDescription,
    },
    /// A single candidate (older peers).
    Ice {
        to: Option<String>,
        candidate: IceCandidate,
    },
    /// A debounced batch of candidates.
    IceBatch {
        to: Option<String>,
        candidates: Vec<IceCandidate>,
    },
}

impl Signal {
    /// Parse a relay signal. Unknown types yield `Ok(None)` so newer peers
    /// do not break older ones.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Serialization`] if a known type carries a
    /// payload of the wrong shape.
    pub fn parse(kind: &str, payload: &str) -> Result<Option<Self>> {
        let signal = match kind {
            "ready" => Self::Ready,
            "offer" | "answer" => {
                let p: DescriptionPayload = serde_json::from_str(payload)?;
                if kind == "offer" {
                    Self::Offer {
                        to: p.to,
                        description: p.description,
                    }
                } else {
                    Self::Answer {
                        to: p.to,
                        description: p.description,
                    }
                }
            }
            "ice" => {
                let p: CandidatePayload = serde_json::from_str(payload)?;
                Self::Ice {
                    to: p.to,
                    candidate: p.candidate,
                }
            }
            "ice_batch" => {
                let p: BatchPayload = serde_json::from_str(payload)?;
                Self::IceBatch {
                    to: p.to,
                    candidates: p.candidates,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(signal))
    }

    /// Parse the `type`/`payload` pair of a relay record.
    ///
    /// # Errors
    ///
    /// See [`Signal::parse`].
    pub fn from_record(record: &SignalRecord) -> Result<Option<Self>> {
        Self::parse(&record.kind, &record.payload)
    }

    /// Wire `type` string.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Ice { .. } => "ice",
            Self::IceBatch { .. } => "ice_batch",
        }
    }

    /// Wire payload string.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Serialization`] if the payload cannot be encoded.
    pub fn payload(&self) -> Result<String> {
        let json = match self {
            Self::Ready => return Ok("true".to_owned()),
            Self::Offer { to, description } | Self::Answer { to, description } => {
                serde_json::to_string(&DescriptionPayload {
                    to: to.clone(),
                    description: description.clone(),
                })?
            }
            Self::Ice { to, candidate } => serde_json::to_string(&CandidatePayload {
                to: to.clone(),
                candidate: candidate.clone(),
            })?,
            Self::IceBatch { to, candidates } => serde_json::to_string(&BatchPayload {
                to: to.clone(),
                candidates: candidates.clone(),
            })?,
        };
        Ok(json)
    }

    /// The nickname this signal is addressed to, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Ready => None,
            Self::Offer { to, .. }
            | Self::Answer { to, .. }
            | Self::Ice { to, .. }
            | Self::IceBatch { to, .. } => to.as_deref(),
        }
    }

    /// `true` if `nickname` should process this signal.
    pub fn is_for(&self, nickname: &str) -> bool {
        self.target().is_none_or(|to| to == nickname)
    }
}

// ── Match state ─────────────────────────────────────────────────────

/// One successful find.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindRecord {
    /// Epoch milliseconds (host clock).
    pub at: u64,
    /// Milliseconds since this player's previous find, or since match start.
    pub since_previous_ms: u64,
    /// Sets on the board when the find was made.
    pub possible_at_find: u32,
}

/// The replicated snapshot. Only the host writes it; clients replace their
/// copy wholesale when a newer version arrives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MatchState {
    /// Strictly increasing per broadcast.
    pub version: u64,
    /// Remaining deck as card codes.
    pub deck: Vec<u8>,
    /// Board as card codes, `null` for empty slots.
    pub board: Vec<Option<u8>>,
    pub scores: BTreeMap<String, i32>,
    pub finds: BTreeMap<String, Vec<FindRecord>>,
    /// Epoch milliseconds at match start (host clock).
    pub started_at: u64,
    /// Milliseconds since match start at broadcast time.
    pub elapsed_ms: u64,
    pub game_over: bool,
}

/// Why a snapshot was broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateReason {
    /// A new match (or rematch). Receivers treat it as a hard cut.
    Start,
    /// A set was claimed.
    Set,
    /// The board was regenerated.
    Shuffle,
    /// A bad shuffle call cost a point; the board is unchanged.
    Penalty,
    /// Catch-up for a peer that joined mid-match.
    Sync,
}

/// End-of-match summary. `winner` is set only for a clear win; a tie lists
/// every nickname sharing the top score in `tied`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tied: Vec<String>,
    #[serde(default)]
    pub scores: BTreeMap<String, i32>,
}

impl MatchSummary {
    /// Build a summary from a final score map.
    pub fn from_scores(scores: BTreeMap<String, i32>) -> Self {
        let best = scores.values().copied().max();
        let leaders: Vec<String> = scores
            .iter()
            .filter(|(_, score)| Some(**score) == best)
            .map(|(nick, _)| nick.clone())
            .collect();
        match leaders.as_slice() {
            [single] => Self {
                winner: Some(single.clone()),
                tied: Vec::new(),
                scores,
            },
            _ => Self {
                winner: None,
                tied: leaders,
                scores,
            },
        }
    }

    pub fn is_tie(&self) -> bool {
        self.winner.is_none() && self.tied.len() > 1
    }
}

// ── Data-channel messages ───────────────────────────────────────────

/// Messages exchanged over an open data channel, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Handshake sent by both sides once the channel opens.
    Hello { nick: String },
    /// A full snapshot from the host.
    State {
        reason: StateReason,
        state: MatchState,
    },
    /// Client → host: three board indices believed to form a set.
    Claim {
        nick: String,
        indices: Vec<i64>,
        #[serde(
            rename = "possibleAtStart",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        possible_at_start: Option<u32>,
    },
    ClaimResult {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<RejectReason>,
    },
    /// Client → host: "there is no set on this board".
    ShuffleRequest { nick: String },
    ShuffleResult {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<RejectReason>,
    },
    Finish { summary: MatchSummary },
    /// Host → clients: a rematch is starting.
    Rematch {},
}

impl WireMessage {
    /// Serialize to the JSON text sent over the channel.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Serialization`] on encoding failure.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse JSON text received over the channel.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Serialization`] for unknown types or bad fields.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(SessionError::from)
    }

    /// Wire `type` string, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::State { .. } => "state",
            Self::Claim { .. } => "claim",
            Self::ClaimResult { .. } => "claim_result",
            Self::ShuffleRequest { .. } => "shuffle_request",
            Self::ShuffleResult { .. } => "shuffle_result",
            Self::Finish { .. } => "finish",
            Self::Rematch {} => "rematch",
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

    #[test]
    fn lobby_summary_accepts_legacy_field_names() {
        let modern: LobbySummary =
            serde_json::from_str(r#"{"lobbyId":"a","hostNick":"ann","createdAt":1700000000000}"#)
                .unwrap();
        assert_eq!(modern.lobby_id, "a");
        assert_eq!(modern.host_nickname, "ann");

        let legacy: LobbySummary =
            serde_json::from_str(r#"{"id":"b","host":"bo","at":1700000000.5}"#).unwrap();
        assert_eq!(legacy.lobby_id, "b");
        assert_eq!(legacy.host_nickname, "bo");
        assert_eq!(legacy.created_at, 1_700_000_000);
    }

    #[test]
    fn player_record_prefers_nickname() {
        let p: PlayerRecord = serde_json::from_str(r#"{"nick":"n","nickname":"full"}"#).unwrap();
        assert_eq!(p.name(), Some("full"));
        let p: PlayerRecord = serde_json::from_str(r#"{"nick":"n"}"#).unwrap();
        assert_eq!(p.name(), Some("n"));
    }

    #[test]
    fn signal_record_keeps_non_string_payload_as_json() {
        let r: SignalRecord =
            serde_json::from_str(r#"{"from":"a","type":"ready","payload":true,"at":"12"}"#)
                .unwrap();
        assert_eq!(r.payload, "true");
        assert_eq!(r.at, 12);
    }

    #[test]
    fn offer_payload_is_flat_description_with_target() {
        let signal = Signal::Offer {
            to: Some("bob".into()),
            description: SessionDescription::offer("v=0"),
        };
        let payload = signal.payload().unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["sdp"], "v=0");
        assert_eq!(value["to"], "bob");
        assert_eq!(Signal::parse("offer", &payload).unwrap(), Some(signal));
    }

    #[test]
    fn ice_batch_payload_shape() {
        let signal = Signal::IceBatch {
            to: Some("host".into()),
            candidates: vec![IceCandidate::new("candidate:1")],
        };
        let value: serde_json::Value = serde_json::from_str(&signal.payload().unwrap()).unwrap();
        assert_eq!(value["to"], "host");
        assert_eq!(value["candidates"][0]["candidate"], "candidate:1");
        assert_eq!(value["candidates"][0]["sdpMLineIndex"], 0);
    }

    #[test]
    fn unknown_signal_type_is_ignored() {
        assert_eq!(Signal::parse("chat", "{}").unwrap(), None);
        assert!(Signal::parse("offer", "not json").is_err());
    }

    #[test]
    fn addressing() {
        let to_bob = Signal::Answer {
            to: Some("bob".into()),
            description: SessionDescription::answer("x"),
        };
        assert!(to_bob.is_for("bob"));
        assert!(!to_bob.is_for("carol"));
        assert!(Signal::Ready.is_for("anyone"));
    }

    #[test]
    fn wire_message_tags() {
        let json = WireMessage::Claim {
            nick: "bob".into(),
            indices: vec![0, 1, 2],
            possible_at_start: Some(3),
        }
        .to_json()
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "claim");
        assert_eq!(value["possibleAtStart"], 3);

        let rematch = WireMessage::Rematch {}.to_json().unwrap();
        assert_eq!(rematch, r#"{"type":"rematch"}"#);
        assert_eq!(WireMessage::from_json(&rematch).unwrap(), WireMessage::Rematch {});
    }

    #[test]
    fn claim_result_reason_is_optional() {
        let ok = WireMessage::from_json(r#"{"type":"claim_result","ok":true}"#).unwrap();
        assert_eq!(
            ok,
            WireMessage::ClaimResult {
                ok: true,
                reason: None
            }
        );
        let wrong =
            WireMessage::from_json(r#"{"type":"claim_result","ok":false,"reason":"wrong"}"#)
                .unwrap();
        assert!(matches!(
            wrong,
            WireMessage::ClaimResult {
                reason: Some(RejectReason::Wrong),
                ..
            }
        ));
    }

    #[test]
    fn match_state_uses_camel_case() {
        let state = MatchState {
            version: 4,
            board: vec![Some(1), None],
            game_over: true,
            elapsed_ms: 10,
            ..MatchState::default()
        };
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["gameOver"], true);
        assert_eq!(value["elapsedMs"], 10);
        assert_eq!(value["board"][1], serde_json::Value::Null);
    }

    #[test]
    fn summary_distinguishes_ties() {
        let mut scores = BTreeMap::new();
        scores.insert("ann".to_owned(), 3);
        scores.insert("bob".to_owned(), 5);
        let win = MatchSummary::from_scores(scores.clone());
        assert_eq!(win.winner.as_deref(), Some("bob"));
        assert!(!win.is_tie());

        scores.insert("ann".to_owned(), 5);
        let tie = MatchSummary::from_scores(scores);
        assert!(tie.is_tie());
        assert_eq!(tie.tied, vec!["ann".to_owned(), "bob".to_owned()]);
    }
}
