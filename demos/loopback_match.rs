//! # Loopback Match Example
//!
//! Runs a host and a joining peer in one process and lets the joining
//! peer play a full match against the host:
//!
//! 1. Host a lobby on an in-process relay
//! 2. Join it and negotiate a loopback data channel
//! 3. Start the match once the `hello` handshake completes
//! 4. Claim the first set on every settled board, calling shuffle when there is none
//! 5. Print the summary and leave
//!
//! ## Running
//!
//! ```sh
//! cargo run --example loopback_match
//!
//! # Watch negotiation and replication in detail:
//! RUST_LOG=setlink=debug cargo run --example loopback_match
//! ```

use std::sync::Arc;

use setlink::card;
use setlink::relays::MemoryRelay;
use setlink::transports::LoopbackNetwork;
use setlink::{MatchView, Relay, Session, SessionConfig, SessionEvent, StandardDealer};

/// Play the first set on the board, or call shuffle if there is none.
fn play(session: &Session, view: &MatchView) -> setlink::Result<()> {
    if view.game_over {
        return Ok(());
    }
    match card::find_sets(&view.board).first() {
        Some(slots) => session.claim(*slots),
        None => session.request_shuffle(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Wiring ──────────────────────────────────────────────────────
    let relay: Arc<dyn Relay> = Arc::new(MemoryRelay::new());
    let network = LoopbackNetwork::new();

    let (mut host, mut host_events) = Session::host(
        Arc::clone(&relay),
        Arc::new(network.connector()),
        Box::new(StandardDealer::new()),
        SessionConfig::new("host"),
    )
    .await?;
    tracing::info!("Hosting lobby {}", host.lobby_id());

    let (mut guest, mut guest_events) = Session::join(
        host.lobby_id(),
        Arc::clone(&relay),
        Arc::new(network.connector()),
        SessionConfig::new("guest"),
    )
    .await?;

    // ── Event loop ──────────────────────────────────────────────────
    loop {
        tokio::select! {
            event = host_events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::ReadyToStart => {
                        tracing::info!("Guest arrived, starting the match");
                        host.start_match()?;
                    }
                    SessionEvent::Ended { cause, .. } => {
                        tracing::info!("Host session ended: {cause:?}");
                        break;
                    }
                    other => tracing::debug!("host: {other:?}"),
                }
            }

            event = guest_events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::MatchStarted { view } => {
                        // Moves wait for the opening deal animation to settle.
                        tracing::info!("Match started with {} sets on the board", view.possible_sets);
                    }
                    SessionEvent::StateApplied { view } => {
                        tracing::info!(
                            "v{}: score {} with {} cards left",
                            view.version,
                            view.score,
                            view.deck_remaining
                        );
                        play(&guest, &view)?;
                    }
                    SessionEvent::ClaimResult { ok: false, reason } => {
                        tracing::warn!("Claim rejected: {reason:?}");
                    }
                    SessionEvent::MatchFinished { summary } => {
                        match summary.winner {
                            Some(winner) => tracing::info!("{winner} wins: {:?}", summary.scores),
                            None => tracing::info!("Tie between {:?}", summary.tied),
                        }
                        guest.leave().await;
                    }
                    SessionEvent::Ended { cause, .. } => {
                        tracing::info!("Guest session ended: {cause:?}");
                    }
                    other => tracing::debug!("guest: {other:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, leaving");
                guest.leave().await;
                break;
            }
        }
    }

    host.leave().await;
    Ok(())
}
