//! An in-process relay with the same semantics as the HTTP relay.
//!
//! Useful for:
//!
//! - **Testing**: drive host and client sessions inside one process
//! - **Demos**: run a full match without deploying a relay
//!
//! Like the real relay it keeps every signal forever (until the lobby is
//! removed), so pollers see the whole log on every `lobby_get` and must
//! deduplicate.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, SessionError};
use crate::protocol::{epoch_millis, LobbyInfo, LobbySummary, PlayerRecord, SignalRecord};
use crate::relay::Relay;

#[derive(Debug, Clone)]
struct LobbyRecord {
    host: String,
    created_at: i64,
    players: Vec<String>,
    signals: Vec<SignalRecord>,
}

#[derive(Debug, Default)]
struct MemoryState {
    lobbies: BTreeMap<String, LobbyRecord>,
    last_at: i64,
}

impl MemoryState {
    /// Server timestamps are strictly increasing so two identical posts stay distinct.
    fn next_at(&mut self) -> i64 {
        let now = i64::try_from(epoch_millis()).unwrap_or(i64::MAX);
        self.last_at = now.max(self.last_at + 1);
        self.last_at
    }
}


/// In-process [`Relay`].
#[derive(Debug, Default)]
pub struct MemoryRelay {
    state: Mutex<MemoryState>,
    unreachable: AtomicBool,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`SessionError::EndpointUnreachable`] until reset.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Release);
    }

    /// Insert a lobby with an explicit creation timestamp (seconds or millis).
    pub async fn insert_lobby(&self, lobby_id: &str, host: &str, created_at: i64) {
        self.state.lock().await.lobbies.insert(
            lobby_id.to_owned(),
            LobbyRecord {
                host: host.to_owned(),
                created_at,
                players: vec![host.to_owned()],
                signals: Vec::new(),
            },
        );
    }

    /// Remove a lobby, as the relay's age-based garbage collection would.
    pub async fn remove_lobby(&self, lobby_id: &str) {
        self.state.lock().await.lobbies.remove(lobby_id);
    }

    /// Every signal posted to a lobby, in order.
    pub async fn signals(&self, lobby_id: &str) -> Vec<SignalRecord> {
        self.state
            .lock()
            .await
            .lobbies
            .get(lobby_id)
            .map(|l| l.signals.clone())
            .unwrap_or_default()
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::Acquire) {
            Err(SessionError::EndpointUnreachable(
                "memory relay offline".to_owned(),
            ))
        } else {
            Ok(())
        }
    }
}

fn not_found(lobby_id: &str) -> SessionError {
    SessionError::Relay {
        message: format!("lobby {lobby_id} not found"),
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn create_lobby(&self, nickname: &str) -> Result<String> {
        self.check_reachable()?;
        let lobby_id = uuid::Uuid::new_v4().simple().to_string();
        let mut state = self.state.lock().await;
        let created_at = state.next_at();
        state.lobbies.insert(
            lobby_id.clone(),
            LobbyRecord {
                host: nickname.to_owned(),
                created_at,
                players: vec![nickname.to_owned()],
                signals: Vec::new(),
            },
        );
        debug!(lobby = %lobby_id, host = %nickname, "memory relay: lobby created");
        Ok(lobby_id)
    }

    async fn join_lobby(&self, lobby_id: &str, nickname: &str) -> Result<()> {
        self.check_reachable()?;
        let mut state = self.state.lock().await;
        let lobby = state
            .lobbies
            .get_mut(lobby_id)
            .ok_or_else(|| not_found(lobby_id))?;
        if !lobby.players.iter().any(|p| p == nickname) {
            lobby.players.push(nickname.to_owned());
        }
        Ok(())
    }

    async fn get_lobby(&self, lobby_id: &str, _nickname: &str) -> Result<LobbyInfo> {
        self.check_reachable()?;
        let state = self.state.lock().await;
        let lobby = state.lobbies.get(lobby_id).ok_or_else(|| not_found(lobby_id))?;
        Ok(LobbyInfo {
            players: lobby.players.iter().map(PlayerRecord::named).collect(),
            signals: lobby.signals.clone(),
        })
    }

    async fn send_signal(
        &self,
        lobby_id: &str,
        nickname: &str,
        kind: &str,
        payload: &str,
    ) -> Result<()> {
        self.check_reachable()?;
        let mut state = self.state.lock().await;
        let at = state.next_at();
        let lobby = state
            .lobbies
            .get_mut(lobby_id)
            .ok_or_else(|| not_found(lobby_id))?;
        lobby.signals.push(SignalRecord {
            from: nickname.to_owned(),
            kind: kind.to_owned(),
            payload: payload.to_owned(),
            at,
        });
        Ok(())
    }

    async fn list_lobbies(&self) -> Result<Vec<LobbySummary>> {
        self.check_reachable()?;
        let state = self.state.lock().await;
        Ok(state
            .lobbies
            .iter()
            .map(|(id, lobby)| LobbySummary {
                lobby_id: id.clone(),
                host_nickname: lobby.host.clone(),
                created_at: lobby.created_at,
            })
            .collect())
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

    #[tokio::test]
    async fn create_join_get_round() {
        let relay = MemoryRelay::new();
        let id = relay.create_lobby("ann").await.unwrap();
        relay.join_lobby(&id, "bob").await.unwrap();
        relay.join_lobby(&id, "bob").await.unwrap();

        let info = relay.get_lobby(&id, "bob").await.unwrap();
        assert_eq!(info.player_names(), vec!["ann", "bob"]);
        assert!(info.signals.is_empty());
    }

    #[tokio::test]
    async fn identical_signals_get_distinct_timestamps() {
        let relay = MemoryRelay::new();
        let id = relay.create_lobby("ann").await.unwrap();
        relay.send_signal(&id, "ann", "ready", "true").await.unwrap();
        relay.send_signal(&id, "ann", "ready", "true").await.unwrap();
        let signals = relay.signals(&id).await;
        assert_eq!(signals.len(), 2);
        assert!(signals[1].at > signals[0].at);
    }

    #[tokio::test]
    async fn unknown_lobby_is_refused() {
        let relay = MemoryRelay::new();
        let err = relay.join_lobby("missing", "bob").await.unwrap_err();
        assert!(matches!(err, SessionError::Relay { .. }));
    }

    #[tokio::test]
    async fn offline_relay_is_unreachable() {
        let relay = MemoryRelay::new();
        relay.set_unreachable(true);
        let err = relay.list_lobbies().await.unwrap_err();
        assert!(matches!(err, SessionError::EndpointUnreachable(_)));
        relay.set_unreachable(false);
        assert!(relay.list_lobbies().await.unwrap().is_empty());
    }
}
