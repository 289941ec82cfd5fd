#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Lobby browser tests against the in-process relay.

use std::sync::Arc;
use std::time::Duration;

use setlink::lobby::{DirectoryConfig, DirectoryEvent, LobbyBrowser};
use setlink::protocol::epoch_millis;
use setlink::relays::MemoryRelay;
use setlink::Relay;
use tokio::sync::mpsc;

const MINUTE_MS: i64 = 60_000;

fn now_ms() -> i64 {
    i64::try_from(epoch_millis()).unwrap()
}

fn start(relay: &Arc<MemoryRelay>) -> (LobbyBrowser, mpsc::Receiver<DirectoryEvent>) {
    LobbyBrowser::start(
        Arc::clone(relay) as Arc<dyn Relay>,
        DirectoryConfig::default().with_poll_interval(Duration::from_secs(1)),
    )
}

async fn next(rx: &mut mpsc::Receiver<DirectoryEvent>) -> DirectoryEvent {
    tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("timed out waiting for a directory event")
        .expect("directory channel closed")
}

fn ids(event: &DirectoryEvent) -> Vec<&str> {
    match event {
        DirectoryEvent::Updated(entries) => entries.iter().map(|e| e.lobby_id.as_str()).collect(),
        other => panic!("expected an update, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn browser_lists_recent_lobbies_newest_first() {
    let relay = Arc::new(MemoryRelay::new());
    let now = now_ms();
    relay.insert_lobby("old", "ann", now - 90 * MINUTE_MS).await;
    relay.insert_lobby("older", "bob", now - 120 * MINUTE_MS).await;
    relay.insert_lobby("ancient", "cat", (now - 240 * MINUTE_MS) / 1000).await;
    relay.insert_lobby("fresh", "dan", now - MINUTE_MS).await;

    let (mut browser, mut events) = start(&relay);
    let first = next(&mut events).await;
    assert_eq!(ids(&first), vec!["fresh", "old"]);
    assert!(browser.is_running());
    browser.stop();
    assert!(!browser.is_running());
}

#[tokio::test(start_paused = true)]
async fn browser_reports_only_changes() {
    let relay = Arc::new(MemoryRelay::new());
    relay.insert_lobby("a", "ann", now_ms()).await;
    let (_browser, mut events) = start(&relay);

    assert_eq!(ids(&next(&mut events).await), vec!["a"]);

    // Several unchanged polls produce nothing.
    let quiet = tokio::time::timeout(Duration::from_secs(5), events.recv()).await;
    assert!(quiet.is_err(), "unchanged listing must not be re-sent");

    let lobby = relay.create_lobby("bob").await.unwrap();
    let update = next(&mut events).await;
    assert!(ids(&update).contains(&lobby.as_str()));

    relay.remove_lobby("a").await;
    relay.remove_lobby(&lobby).await;
    assert!(ids(&next(&mut events).await).is_empty());
}

#[tokio::test(start_paused = true)]
async fn outage_is_reported_once_until_recovery() {
    let relay = Arc::new(MemoryRelay::new());
    relay.insert_lobby("a", "ann", now_ms()).await;
    let (_browser, mut events) = start(&relay);
    assert_eq!(ids(&next(&mut events).await), vec!["a"]);

    relay.set_unreachable(true);
    assert!(matches!(
        next(&mut events).await,
        DirectoryEvent::Unavailable { .. }
    ));
    let quiet = tokio::time::timeout(Duration::from_secs(5), events.recv()).await;
    assert!(quiet.is_err(), "an outage is reported once");

    relay.set_unreachable(false);
    assert_eq!(ids(&next(&mut events).await), vec!["a"]);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_browser_stops_polling() {
    let relay = Arc::new(MemoryRelay::new());
    let (browser, mut events) = start(&relay);
    assert!(ids(&next(&mut events).await).is_empty());
    drop(browser);
    let closed = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("channel should close once the task is aborted");
    assert!(closed.is_none());
}
