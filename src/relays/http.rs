//! HTTP relay client using `reqwest`.
//!
//! Every operation is a GET against one base endpoint with an `action` query
//! parameter selecting the operation:
//!
//! | Action         | Parameters                                   |
//! |----------------|----------------------------------------------|
//! | `lobby_create` | `nickname`                                   |
//! | `lobby_join`   | `lobbyId`, `nickname`                        |
//! | `lobby_get`    | `lobbyId`, `nickname`                        |
//! | `lobby_signal` | `lobbyId`, `nickname`, `signalType`, `payload` |
//! | `lobby_list`   | (none)                                       |
//!
//! # Feature gate
//!
//! This module is only available when the `relay-http` feature is enabled
//! (it is enabled by default).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> setlink::error::Result<()> {
//! use setlink::relay::Relay;
//! use setlink::relays::{HttpRelay, RelayConfig};
//!
//! let relay = HttpRelay::new(RelayConfig::new("https://relay.example.com/api"))?;
//! for lobby in relay.list_lobbies().await? {
//!     println!("{} hosted by {}", lobby.lobby_id, lobby.host_nickname);
//! }
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Result, SessionError};
use crate::protocol::{LobbyInfo, LobbySummary};
use crate::relay::{parse_response, CreateResponse, GetResponse, ListResponse, Relay};

/// Default client-side bound on every relay request.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(8);

/// Configuration for an [`HttpRelay`].
///
/// # Example
///
/// ```
/// use setlink::relays::RelayConfig;
/// use std::time::Duration;
///
/// let config = RelayConfig::new("https://relay.example.com/api")
///     .with_request_timeout(Duration::from_secs(3));
/// assert_eq!(config.request_timeout, Duration::from_secs(3));
/// ```
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Base endpoint every action is sent to.
    pub endpoint: String,
    /// Upper bound on a single request, connect included.
    ///
    /// Defaults to **8 seconds**.
    pub request_timeout: Duration,
}

impl RelayConfig {
    /// Create a configuration for the given endpoint with default values.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set the per-request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// A [`Relay`] backed by the HTTP polling relay.
#[derive(Debug, Clone)]
pub struct HttpRelay {
    http: reqwest::Client,
    endpoint: reqwest::Url,
    request_timeout: Duration,
}

impl HttpRelay {
    /// Build a relay client.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`] immediately if the endpoint is empty
    /// or not an absolute URL, or the HTTP client cannot be built. No request
    /// is attempted in that case.
    pub fn new(config: RelayConfig) -> Result<Self> {
        let trimmed = config.endpoint.trim();
        if trimmed.is_empty() {
            return Err(SessionError::Config("relay endpoint is not set".to_owned()));
        }
        let endpoint = reqwest::Url::parse(trimmed)
            .map_err(|e| SessionError::Config(format!("invalid relay endpoint {trimmed:?}: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SessionError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint,
            request_timeout: config.request_timeout,
        })
    }

    /// The configured endpoint.
    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    /// Issue one `action` request and return the response body.
    async fn call(&self, action: &str, params: &[(&str, &str)]) -> Result<String> {
        debug!(action, endpoint = %self.endpoint, "relay request");
        let mut query: Vec<(&str, &str)> = Vec::with_capacity(params.len() + 1);
        query.push(("action", action));
        query.extend_from_slice(params);

        let request = async {
            let response = self
                .http
                .get(self.endpoint.clone())
                .query(&query)
                .send()
                .await
                .map_err(map_reqwest_error)?;
            let status = response.status();
            if !status.is_success() {
                return Err(SessionError::EndpointUnreachable(format!(
                    "relay returned HTTP {status}"
                )));
            }
            response.text().await.map_err(map_reqwest_error)
        };

        tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| SessionError::Timeout)?
    }
}

fn map_reqwest_error(e: reqwest::Error) -> SessionError {
    if e.is_timeout() {
        SessionError::Timeout
    } else {
        SessionError::EndpointUnreachable(e.to_string())
    }
}

#[async_trait]
impl Relay for HttpRelay {
    async fn create_lobby(&self, nickname: &str) -> Result<String> {
        let body = self.call("lobby_create", &[("nickname", nickname)]).await?;
        let parsed: CreateResponse = parse_response(&body)?;
        Ok(parsed.lobby_id)
    }

    async fn join_lobby(&self, lobby_id: &str, nickname: &str) -> Result<()> {
        let body = self
            .call("lobby_join", &[("lobbyId", lobby_id), ("nickname", nickname)])
            .await?;
        parse_response::<serde_json::Value>(&body)?;
        Ok(())
    }

    async fn get_lobby(&self, lobby_id: &str, nickname: &str) -> Result<LobbyInfo> {
        let body = self
            .call("lobby_get", &[("lobbyId", lobby_id), ("nickname", nickname)])
            .await?;
        let parsed: GetResponse = parse_response(&body)?;
        Ok(parsed.lobby)
    }

    async fn send_signal(
        &self,
        lobby_id: &str,
        nickname: &str,
        kind: &str,
        payload: &str,
    ) -> Result<()> {
        let body = self
            .call(
                "lobby_signal",
                &[
                    ("lobbyId", lobby_id),
                    ("nickname", nickname),
                    ("signalType", kind),
                    ("payload", payload),
                ],
            )
            .await?;
        parse_response::<serde_json::Value>(&body)?;
        Ok(())
    }

    async fn list_lobbies(&self) -> Result<Vec<LobbySummary>> {
        let body = self.call("lobby_list", &[]).await?;
        let parsed: ListResponse = parse_response(&body)?;
        Ok(parsed.lobbies)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn empty_endpoint_fails_fast() {
        let err = HttpRelay::new(RelayConfig::new("   ")).unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
        let err = HttpRelay::new(RelayConfig::new("not a url")).unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
    }

    // ── Mock-server helpers ──────────────────────────────────────────────

    /// Start a one-shot HTTP server that answers every request with `body`
    /// and records the request lines it saw.
    async fn start_mock_server(body: &'static str) -> (String, Arc<StdMutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_task = Arc::clone(&seen);

        tokio::spawn(async move {
            while let Ok((mut tcp, _)) = listener.accept().await {
                let mut buf = vec![0u8; 8192];
                let n = tcp.read(&mut buf).await.unwrap();
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let line = request.lines().next().unwrap_or_default().to_owned();
                seen_task.lock().unwrap().push(line);
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                tcp.write_all(response.as_bytes()).await.unwrap();
                let _ = tcp.shutdown().await;
            }
        });

        (format!("http://{addr}/relay"), seen)
    }

    #[tokio::test]
    async fn create_lobby_sends_action_and_nickname() {
        let (url, seen) = start_mock_server(r#"{"ok":true,"lobbyId":"L1"}"#).await;
        let relay = HttpRelay::new(RelayConfig::new(url)).unwrap();

        let id = relay.create_lobby("ann").await.unwrap();
        assert_eq!(id, "L1");

        let line = seen.lock().unwrap()[0].clone();
        assert!(line.starts_with("GET /relay?action=lobby_create&nickname=ann"), "{line}");
    }

    #[tokio::test]
    async fn array_response_is_unsupported_endpoint() {
        let (url, _seen) = start_mock_server("[1,2,3]").await;
        let relay = HttpRelay::new(RelayConfig::new(url)).unwrap();
        let err = relay.list_lobbies().await.unwrap_err();
        assert!(matches!(err, SessionError::UnsupportedEndpoint));
    }

    #[tokio::test]
    async fn signal_payload_is_query_encoded() {
        let (url, seen) = start_mock_server(r#"{"ok":true}"#).await;
        let relay = HttpRelay::new(RelayConfig::new(url)).unwrap();
        relay
            .send_signal("L1", "ann", "offer", r#"{"type":"offer","sdp":"v=0"}"#)
            .await
            .unwrap();
        let line = seen.lock().unwrap()[0].clone();
        assert!(line.contains("signalType=offer"), "{line}");
        assert!(line.contains("payload=%7B"), "{line}");
    }

    #[tokio::test]
    async fn unreachable_host_is_distinguishable() {
        let relay = HttpRelay::new(RelayConfig::new("http://127.0.0.1:1/relay")).unwrap();
        let err = relay.get_lobby("L1", "ann").await.unwrap_err();
        assert!(matches!(err, SessionError::EndpointUnreachable(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and hold the connection without answering.
            let (_tcp, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let config = RelayConfig::new(format!("http://{addr}/"))
            .with_request_timeout(Duration::from_millis(50));
        let relay = HttpRelay::new(config).unwrap();
        let err = relay.list_lobbies().await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout));
    }
}
