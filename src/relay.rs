//! The signaling relay contract.
//!
//! The [`Relay`] trait is the Signaling Client: five request/response calls
//! against a lobby relay, with no protocol state of its own. The stock
//! implementation is [`HttpRelay`](crate::relays::HttpRelay); tests and demos
//! use the in-process [`MemoryRelay`](crate::relays::MemoryRelay).
//!
//! # Implementing a Custom Relay
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use setlink::error::Result;
//! use setlink::protocol::{LobbyInfo, LobbySummary};
//! use setlink::relay::Relay;
//!
//! struct MyRelay;
//!
//! #[async_trait]
//! impl Relay for MyRelay {
//!     async fn create_lobby(&self, nickname: &str) -> Result<String> { unimplemented!() }
//!     async fn join_lobby(&self, lobby_id: &str, nickname: &str) -> Result<()> { unimplemented!() }
//!     async fn get_lobby(&self, lobby_id: &str, nickname: &str) -> Result<LobbyInfo> { unimplemented!() }
//!     async fn send_signal(&self, lobby_id: &str, nickname: &str, kind: &str, payload: &str) -> Result<()> { unimplemented!() }
//!     async fn list_lobbies(&self) -> Result<Vec<LobbySummary>> { unimplemented!() }
//! }
//! ```

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{Result, SessionError};
use crate::protocol::{LobbyInfo, LobbySummary, Signal};

/// Request/response access to the lobby relay.
///
/// Every call is bounded by a client-side timeout in the implementation.
/// Transport failures surface as [`SessionError::EndpointUnreachable`] or
/// [`SessionError::Timeout`]; callers surface a status and retry on their
/// next poll rather than failing the session.
#[async_trait]
pub trait Relay: Send + Sync + 'static {
    /// `lobby_create`: create a lobby hosted by `nickname`; returns its id.
    async fn create_lobby(&self, nickname: &str) -> Result<String>;

    /// `lobby_join`: add `nickname` to an existing lobby.
    async fn join_lobby(&self, lobby_id: &str, nickname: &str) -> Result<()>;

    /// `lobby_get`: current players and the full signal log.
    async fn get_lobby(&self, lobby_id: &str, nickname: &str) -> Result<LobbyInfo>;

    /// `lobby_signal`: append one signal to the lobby log.
    async fn send_signal(
        &self,
        lobby_id: &str,
        nickname: &str,
        kind: &str,
        payload: &str,
    ) -> Result<()>;

    /// `lobby_list`: every lobby the relay still knows about.
    async fn list_lobbies(&self) -> Result<Vec<LobbySummary>>;
}

/// Encode and post a typed [`Signal`].
///
/// # Errors
///
/// Propagates encoding and relay errors.
pub async fn post_signal(
    relay: &dyn Relay,
    lobby_id: &str,
    nickname: &str,
    signal: &Signal,
) -> Result<()> {
    let payload = signal.payload()?;
    relay
        .send_signal(lobby_id, nickname, signal.kind(), &payload)
        .await
}

// ── Response bodies ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct CreateResponse {
    #[serde(rename = "lobbyId", alias = "id")]
    pub lobby_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GetResponse {
    #[serde(default)]
    pub lobby: LobbyInfo,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListResponse {
    #[serde(default)]
    pub lobbies: Vec<LobbySummary>,
}

/// Parse a relay response body.
///
/// - a JSON array means the endpoint is not a lobby relay
///   ([`SessionError::UnsupportedEndpoint`]),
/// - `"ok": false` is a refusal ([`SessionError::Relay`]),
/// - anything else that does not match `T` is
///   [`SessionError::MalformedResponse`].
///
/// # Errors
///
/// As listed above.
pub fn parse_response<T: DeserializeOwned>(body: &str) -> Result<T> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| SessionError::MalformedResponse(e.to_string()))?;
    match &value {
        serde_json::Value::Array(_) => return Err(SessionError::UnsupportedEndpoint),
        serde_json::Value::Object(map) => {
            if map.get("ok").and_then(serde_json::Value::as_bool) == Some(false) {
                let message = map
                    .get("error")
                    .or_else(|| map.get("message"))
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("request refused")
                    .to_owned();
                return Err(SessionError::Relay { message });
            }
        }
        _ => {
            return Err(SessionError::MalformedResponse(
                "expected a JSON object".to_owned(),
            ))
        }
    }
    serde_json::from_value(value).map_err(|e| SessionError::MalformedResponse(e.to_string()))
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
    fn array_body_is_unsupported_endpoint() {
        let err = parse_response::<ListResponse>("[]").unwrap_err();
        assert!(matches!(err, SessionError::UnsupportedEndpoint));
    }

    #[test]
    fn ok_false_is_relay_refusal() {
        let err = parse_response::<GetResponse>(r#"{"ok":false,"error":"no such lobby"}"#)
            .unwrap_err();
        match err {
            SessionError::Relay { message } => assert_eq!(message, "no such lobby"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_json_is_malformed() {
        let err = parse_response::<GetResponse>("<html>").unwrap_err();
        assert!(matches!(err, SessionError::MalformedResponse(_)));
        let err = parse_response::<GetResponse>("42").unwrap_err();
        assert!(matches!(err, SessionError::MalformedResponse(_)));
    }

    #[test]
    fn lobby_get_body_parses() {
        let body = r#"{"ok":true,"lobby":{"players":[{"nick":"ann"},{"nick":"b","nickname":"bob"}],
            "signals":[{"from":"ann","type":"ready","payload":"true","at":5}]}}"#;
        let parsed: GetResponse = parse_response(body).unwrap();
        assert_eq!(parsed.lobby.player_names(), vec!["ann", "bob"]);
        assert_eq!(parsed.lobby.signals[0].kind, "ready");
    }

    #[test]
    fn lobby_create_accepts_id_alias() {
        let parsed: CreateResponse = parse_response(r#"{"ok":true,"id":"xyz"}"#).unwrap();
        assert_eq!(parsed.lobby_id, "xyz");
    }

    #[test]
    fn lobby_list_defaults_to_empty() {
        let parsed: ListResponse = parse_response("{}").unwrap();
        assert!(parsed.lobbies.is_empty());
    }
}
