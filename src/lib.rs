//! # Setlink
//!
//! Peer-to-peer session layer for a real-time card matching game.
//!
//! Players find each other through a small HTTP lobby relay, negotiate
//! direct data channels by exchanging offers, answers and candidates
//! through it, and then play a match in which the host is the single
//! authority over the board, the deck and the scores.
//!
//! ## Layers
//!
//! - **Signaling** ([`relay`], [`relays`]): the [`Relay`] trait over the
//!   lobby endpoint, with [`relays::HttpRelay`] (feature `relay-http`) and
//!   the in-process [`relays::MemoryRelay`].
//! - **Lobby directory** ([`lobby`]): recency-filtered lobby listings with
//!   change detection.
//! - **Negotiation** ([`negotiator`]): the ready/offer/answer/ice
//!   exchange, with timeouts, extensions and retries.
//! - **Transport** ([`transport`], [`transports`], [`channel`]): the
//!   [`PeerTransport`] seam with the WebRTC connector (feature
//!   `transport-webrtc`) and the in-process loopback, plus JSON messaging
//!   over open channels.
//! - **Replication** ([`replicator`]): host-authoritative match state with
//!   versioned full snapshots.
//!
//! [`Session`] ties them together behind one handle and reports what
//! happens as [`SessionEvent`]s.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use setlink::relays::{HttpRelay, RelayConfig};
//! use setlink::transports::{WebRtcConfig, WebRtcConnector};
//! use setlink::{Session, SessionConfig, SessionEvent};
//!
//! # async fn run() -> setlink::Result<()> {
//! let relay = Arc::new(HttpRelay::new(RelayConfig::new("https://relay.example.com/lobby"))?);
//! let connector = WebRtcConnector::new(WebRtcConfig::default())?;
//! let (mut session, mut events) = Session::join(
//!     "a1b2c3",
//!     relay,
//!     Arc::new(connector),
//!     SessionConfig::new("bob"),
//! )
//! .await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SessionEvent::StateApplied { view } => println!("{} cards left", view.deck_remaining),
//!         SessionEvent::Ended { .. } => break,
//!         _ => {}
//!     }
//! }
//! session.leave().await;
//! # Ok(())
//! # }
//! ```

pub mod card;
pub mod channel;
pub mod error;
pub mod event;
pub mod lobby;
pub mod negotiator;
pub mod protocol;
pub mod reject;
pub mod relay;
pub mod relays;
pub mod replicator;
pub mod rules;
pub mod session;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use card::{Board, Card};
pub use error::{Result, SessionError};
pub use event::{EndCause, SessionEvent};
pub use lobby::{DirectoryConfig, DirectoryEvent, LobbyBrowser, LobbyEntry};
pub use negotiator::{ConnectionState, NegotiationPolicy};
pub use protocol::{MatchSummary, Role, WireMessage};
pub use reject::RejectReason;
pub use relay::Relay;
pub use replicator::{BoardTransition, MatchView};
pub use rules::{Dealer, StandardDealer};
pub use session::{Session, SessionConfig};
pub use transport::{PeerConnector, PeerTransport};
