//! # Lobby Browser Example
//!
//! Polls a relay over HTTP and prints the recent lobbies whenever the
//! listing changes.
//!
//! ## Running
//!
//! ```sh
//! cargo run --example lobby_browser
//!
//! # Point at another relay:
//! SETLINK_RELAY_URL=https://relay.example.com/setlink cargo run --example lobby_browser
//! ```

use std::sync::Arc;
use std::time::Duration;

use setlink::relays::{HttpRelay, RelayConfig};
use setlink::{DirectoryConfig, DirectoryEvent, LobbyBrowser, Relay};

/// Default relay when `SETLINK_RELAY_URL` is not set.
const DEFAULT_URL: &str = "http://localhost:8787/relay";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let url = std::env::var("SETLINK_RELAY_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
    tracing::info!("Browsing lobbies on {url}");

    let relay: Arc<dyn Relay> = Arc::new(HttpRelay::new(RelayConfig::new(url))?);
    let config = DirectoryConfig::default().with_poll_interval(Duration::from_secs(2));
    let (mut browser, mut events) = LobbyBrowser::start(relay, config);

    // ── Event loop ──────────────────────────────────────────────────
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    DirectoryEvent::Updated(entries) if entries.is_empty() => {
                        tracing::info!("No open lobbies");
                    }
                    DirectoryEvent::Updated(entries) => {
                        for entry in entries {
                            tracing::info!("{} hosted by {}", entry.lobby_id, entry.host_nickname);
                        }
                    }
                    DirectoryEvent::Unavailable { reason } => {
                        tracing::warn!("Relay unavailable: {reason}");
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, stopping");
                break;
            }
        }
    }

    browser.stop();
    Ok(())
}
