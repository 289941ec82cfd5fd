//! Rejection codes carried by `claim_result` and `shuffle_result`.
//!
//! These are wire-compatible with the browser peers and serialize as
//! `snake_case` strings (e.g. `"bad_shuffle"`).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why the host refused a claim or a shuffle request.
///
/// Use [`description()`](RejectReason::description) for a human-readable
/// explanation suitable for a toast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The board is mid-transition or the match is not running.
    Busy,
    /// The claim did not name three distinct, in-range, occupied slots.
    Invalid,
    /// The three cards do not form a set.
    Wrong,
    /// A shuffle was requested while a set was still on the board.
    BadShuffle,
}

impl RejectReason {
    /// Returns a human-readable description of this rejection.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Busy => "The board is changing right now. Try again in a moment.",
            Self::Invalid => "Select three different cards on the board.",
            Self::Wrong => "Those three cards are not a set.",
            Self::BadShuffle => "There is still a set on the board. Shuffle penalty applied.",
        }
    }

    /// Wire string for this reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Busy => "busy",
            Self::Invalid => "invalid",
            Self::Wrong => "wrong",
            Self::BadShuffle => "bad_shuffle",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_snake_case() {
        for reason in [
            RejectReason::Busy,
            RejectReason::Invalid,
            RejectReason::Wrong,
            RejectReason::BadShuffle,
        ] {
            let json = serde_json::to_string(&reason).unwrap();
            assert_eq!(json, format!("\"{}\"", reason.as_str()));
        }
    }

    #[test]
    fn unknown_reason_is_rejected() {
        assert!(serde_json::from_str::<RejectReason>("\"nope\"").is_err());
    }
}
