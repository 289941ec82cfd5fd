//! Notifications from a running [`Session`](crate::Session) to the UI.

use crate::negotiator::ConnectionState;
use crate::protocol::MatchSummary;
use crate::reject::RejectReason;
use crate::replicator::{BoardTransition, MatchView};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndCause {
    /// [`Session::leave`](crate::Session::leave) was called.
    ///
    /// Dropping the handle aborts the loop instead: the event channel closes
    /// without an `Ended` event.
    Left,
    /// The last data channel closed.
    PeerLost,
    /// Negotiation retries were exhausted.
    ConnectionFailed,
}

/// Events emitted by a session's background loop.
///
/// Delivered on a bounded channel. When the consumer falls behind, events
/// are dropped with a warning, except [`SessionEvent::Ended`], which is
/// always the last event and is always delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A transient condition worth showing as a status line or toast.
    Status(String),

    /// Player list as last reported by the relay.
    PlayersChanged(Vec<String>),

    ConnectionStateChanged(ConnectionState),

    /// A data channel to `nickname` opened.
    PeerConnected { nickname: String },

    /// `nickname` completed the `hello` handshake.
    PlayerJoined { nickname: String },

    /// `nickname`'s channel closed.
    PlayerLeft { nickname: String },

    /// Host only: the first peer completed the `hello` handshake and a match
    /// can start.
    ReadyToStart,

    /// Negotiation is still progressing; the attempt was extended.
    NegotiationExtended,

    /// Negotiation timed out and restarted.
    NegotiationRetry { attempt: u32 },

    /// A match (or rematch) started. Local state was reset.
    MatchStarted { view: MatchView },

    /// The board changed in a way worth animating. Followed by
    /// [`SessionEvent::StateApplied`] once the transition delay has passed.
    BoardTransition {
        transition: BoardTransition,
        changed: Vec<usize>,
    },

    /// The current state after a snapshot or mutation was applied.
    StateApplied { view: MatchView },

    /// Answer to this peer's claim.
    ClaimResult {
        ok: bool,
        reason: Option<RejectReason>,
    },

    /// Answer to this peer's shuffle call.
    ShuffleResult {
        ok: bool,
        reason: Option<RejectReason>,
    },

    MatchFinished { summary: MatchSummary },

    /// The host is about to start a rematch.
    RematchStarting,

    /// Negotiation failed for good; the user must re-host or re-join.
    ConnectionFailed { attempts: u32 },

    /// The session is over. `was_connected` is `true` when a live link was
    /// lost, so the UI should leave multiplayer mode and tell the user.
    Ended { cause: EndCause, was_connected: bool },
}

impl SessionEvent {
    /// `true` for the final event of a session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }
}
