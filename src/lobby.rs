//! Lobby discovery.
//!
//! [`LobbyDirectory`] turns raw `lobby_list` results into the short list a
//! lobby browser shows, and only reports a new list when its signature
//! changes. [`LobbyBrowser`] polls the relay on a fixed interval and feeds
//! the directory until it is stopped or dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::Result;
use crate::protocol::{epoch_millis, LobbySummary};
use crate::relay::Relay;

/// Timestamps below this are seconds, not milliseconds.
pub const SECONDS_THRESHOLD: i64 = 1_000_000_000_000;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
const DEFAULT_RECENCY_WINDOW: Duration = Duration::from_secs(180);
const DEFAULT_ALWAYS_SHOWN: usize = 2;
const DEFAULT_MAX_SHOWN: usize = 8;
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 16;

/// Scale second-resolution timestamps to milliseconds.
pub fn normalize_timestamp(timestamp: i64) -> i64 {
    if timestamp < SECONDS_THRESHOLD {
        timestamp.saturating_mul(1000)
    } else {
        timestamp
    }
}

/// Directory tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryConfig {
    /// Defaults to **3s**.
    pub poll_interval: Duration,
    /// Lobbies younger than this are always listed. Defaults to **3 minutes**.
    pub recency_window: Duration,
    /// The most recent lobbies listed regardless of age. Defaults to **2**.
    pub always_shown: usize,
    /// Defaults to **8**.
    pub max_shown: usize,
    /// Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            recency_window: DEFAULT_RECENCY_WINDOW,
            always_shown: DEFAULT_ALWAYS_SHOWN,
            max_shown: DEFAULT_MAX_SHOWN,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl DirectoryConfig {
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_recency_window(mut self, window: Duration) -> Self {
        self.recency_window = window;
        self
    }
}

/// One displayed lobby.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobbyEntry {
    pub lobby_id: String,
    pub host_nickname: String,
    /// Epoch milliseconds.
    pub created_at_ms: i64,
}

/// Pick what to display: newest first, the `always_shown` most recent plus
/// anything inside the recency window, capped at `max_shown`.
pub fn select_display(
    lobbies: Vec<LobbySummary>,
    now_ms: i64,
    config: &DirectoryConfig,
) -> Vec<LobbyEntry> {
    let mut entries: Vec<LobbyEntry> = lobbies
        .into_iter()
        .map(|lobby| LobbyEntry {
            created_at_ms: normalize_timestamp(lobby.created_at),
            lobby_id: lobby.lobby_id,
            host_nickname: lobby.host_nickname,
        })
        .collect();
    entries.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));

    let window = i64::try_from(config.recency_window.as_millis()).unwrap_or(i64::MAX);
    let cutoff = now_ms.saturating_sub(window);
    entries
        .into_iter()
        .enumerate()
        .filter(|(rank, entry)| *rank < config.always_shown || entry.created_at_ms >= cutoff)
        .map(|(_, entry)| entry)
        .take(config.max_shown)
        .collect()
}

/// Ordered `id:host:timestamp` concatenation used to detect changes.
pub fn signature(entries: &[LobbyEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("{}:{}:{}", e.lobby_id, e.host_nickname, e.created_at_ms))
        .collect::<Vec<_>>()
        .join("|")
}

/// What the lobby browser UI is told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    /// The displayed list changed.
    Updated(Vec<LobbyEntry>),
    /// Listing failed; the UI should clear its list. Reported once per outage.
    Unavailable { reason: String },
}

/// Change detection over successive listings.
#[derive(Debug, Clone)]
pub struct LobbyDirectory {
    config: DirectoryConfig,
    signature: Option<String>,
    failing: bool,
}

impl LobbyDirectory {
    pub fn new(config: DirectoryConfig) -> Self {
        Self {
            config,
            signature: None,
            failing: false,
        }
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    /// Feed one `lobby_list` result. Returns an event only when the UI needs
    /// to change.
    pub fn on_listing(
        &mut self,
        listing: Result<Vec<LobbySummary>>,
        now_ms: i64,
    ) -> Option<DirectoryEvent> {
        match listing {
            Ok(lobbies) => {
                self.failing = false;
                let entries = select_display(lobbies, now_ms, &self.config);
                let signature = signature(&entries);
                if self.signature.as_deref() == Some(signature.as_str()) {
                    return None;
                }
                self.signature = Some(signature);
                Some(DirectoryEvent::Updated(entries))
            }
            Err(e) => {
                self.signature = None;
                if self.failing {
                    return None;
                }
                self.failing = true;
                Some(DirectoryEvent::Unavailable {
                    reason: e.to_string(),
                })
            }
        }
    }
}

/// Background poller for the lobby browser surface.
///
/// Polling starts immediately and stops the instant [`LobbyBrowser::stop`]
/// is called or the handle is dropped. A configuration error ends polling
/// after it has been reported.
pub struct LobbyBrowser {
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl LobbyBrowser {
    #[must_use = "the event receiver must be used to receive lobby lists"]
    pub fn start(
        relay: Arc<dyn Relay>,
        config: DirectoryConfig,
    ) -> (Self, mpsc::Receiver<DirectoryEvent>) {
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(browse_loop(
            relay,
            LobbyDirectory::new(config),
            event_tx,
            shutdown_rx,
        ));
        (
            Self {
                task: Some(task),
                shutdown_tx: Some(shutdown_tx),
            },
            event_rx,
        )
    }

    /// Stop polling. Idempotent.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl std::fmt::Debug for LobbyBrowser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LobbyBrowser")
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for LobbyBrowser {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn browse_loop(
    relay: Arc<dyn Relay>,
    mut directory: LobbyDirectory,
    event_tx: mpsc::Sender<DirectoryEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(directory.config().poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!("lobby browser started");

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            _ = ticker.tick() => {
                let listing = relay.list_lobbies().await;
                let fatal = listing.as_ref().err().is_some_and(|e| e.is_configuration());
                let now_ms = i64::try_from(epoch_millis()).unwrap_or(i64::MAX);
                if let Some(event) = directory.on_listing(listing, now_ms) {
                    match event_tx.try_send(event) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!("lobby event channel full, dropping update");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
                if fatal {
                    warn!("lobby browser stopped: relay misconfigured");
                    break;
                }
            }
        }
    }
    debug!("lobby browser exited");
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
    use crate::error::SessionError;

    const NOW: i64 = 1_700_000_000_000;

    fn summary(id: &str, created_at: i64) -> LobbySummary {
        LobbySummary {
            lobby_id: id.to_owned(),
            host_nickname: format!("host-{id}"),
            created_at,
        }
    }

    #[test]
    fn seconds_are_scaled() {
        assert_eq!(normalize_timestamp(1_700_000_000), 1_700_000_000_000);
        assert_eq!(normalize_timestamp(NOW), NOW);
        assert_eq!(normalize_timestamp(0), 0);
    }

    #[test]
    fn old_lobbies_beyond_the_two_newest_are_hidden() {
        let hour = 3_600_000;
        let lobbies = vec![
            summary("a", NOW - 3 * hour),
            summary("b", NOW - hour),
            summary("c", (NOW - 2 * hour) / 1000),
            summary("d", NOW - 4 * hour),
        ];
        let shown = select_display(lobbies, NOW, &DirectoryConfig::default());
        let ids: Vec<&str> = shown.iter().map(|e| e.lobby_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn recent_lobbies_are_capped() {
        let lobbies = (0..12).map(|i| summary(&format!("l{i}"), NOW - i * 1000)).collect();
        let shown = select_display(lobbies, NOW, &DirectoryConfig::default());
        assert_eq!(shown.len(), 8);
        assert_eq!(shown[0].lobby_id, "l0");
        assert_eq!(shown[7].lobby_id, "l7");
    }

    #[test]
    fn unchanged_listing_is_not_reported_twice() {
        let mut directory = LobbyDirectory::new(DirectoryConfig::default());
        let listing = || Ok(vec![summary("a", NOW)]);
        assert!(matches!(
            directory.on_listing(listing(), NOW),
            Some(DirectoryEvent::Updated(_))
        ));
        assert_eq!(directory.on_listing(listing(), NOW), None);
    }

    #[test]
    fn failures_are_reported_once_and_clear_the_signature() {
        let mut directory = LobbyDirectory::new(DirectoryConfig::default());
        let down = || Err(SessionError::EndpointUnreachable("down".into()));
        directory.on_listing(Ok(vec![summary("a", NOW)]), NOW);

        assert!(matches!(
            directory.on_listing(down(), NOW),
            Some(DirectoryEvent::Unavailable { .. })
        ));
        assert_eq!(directory.on_listing(down(), NOW), None);
        assert!(matches!(
            directory.on_listing(Ok(vec![summary("a", NOW)]), NOW),
            Some(DirectoryEvent::Updated(_))
        ));
    }

    #[test]
    fn signature_is_ordered_concatenation() {
        let entries = select_display(vec![summary("a", NOW), summary("b", NOW - 5)], NOW, &DirectoryConfig::default());
        assert_eq!(
            signature(&entries),
            format!("a:host-a:{NOW}|b:host-b:{}", NOW - 5)
        );
    }
}
