//! Message pipe over open data channels.
//!
//! [`Channels`] borrows the negotiator's open transports. Sends to a peer
//! whose channel is not open are dropped: the replicator recovers from lost
//! messages with full snapshots, never with retransmission.

use tracing::{debug, warn};

use crate::negotiator::Negotiator;
use crate::protocol::WireMessage;

/// Targeted and fan-out sends over the currently open channels.
#[derive(Debug)]
pub struct Channels<'a> {
    negotiator: &'a mut Negotiator,
}

impl<'a> Channels<'a> {
    pub fn new(negotiator: &'a mut Negotiator) -> Self {
        Self { negotiator }
    }

    /// Nicknames with an open channel.
    pub fn open_peers(&self) -> Vec<String> {
        self.negotiator.open_peers()
    }

    /// Send to one peer. Returns `false` if the message was dropped.
    pub fn send_to(&mut self, remote: &str, message: &WireMessage) -> bool {
        match message.to_json() {
            Ok(text) => self.send_text(remote, message.kind(), &text),
            Err(e) => {
                warn!(kind = message.kind(), "failed to encode message: {e}");
                false
            }
        }
    }

    /// Send to every open channel. Returns how many peers it reached.
    pub fn broadcast(&mut self, message: &WireMessage) -> usize {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(kind = message.kind(), "failed to encode message: {e}");
                return 0;
            }
        };
        self.open_peers()
            .iter()
            .filter(|remote| self.send_text(remote, message.kind(), &text))
            .count()
    }

    fn send_text(&mut self, remote: &str, kind: &str, text: &str) -> bool {
        let Some(transport) = self.negotiator.open_transport(remote) else {
            debug!(peer = %remote, kind, "channel not open; message dropped");
            return false;
        };
        match transport.send(text) {
            Ok(()) => true,
            Err(e) => {
                debug!(peer = %remote, kind, "send failed; message dropped: {e}");
                false
            }
        }
    }
}

/// Decode one inbound channel message. Malformed messages are logged and
/// skipped.
pub fn decode(from: &str, text: &str) -> Option<WireMessage> {
    match WireMessage::from_json(text) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(peer = %from, "undecodable channel message: {e}");
            None
        }
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
    use crate::protocol::Role;
    use crate::relays::MemoryRelay;
    use crate::transports::LoopbackNetwork;
    use crate::negotiator::NegotiationPolicy;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[test]
    fn decode_skips_garbage() {
        assert!(decode("bob", "{not json").is_none());
        assert!(decode("bob", r#"{"type":"teleport"}"#).is_none());
        assert_eq!(
            decode("bob", r#"{"type":"hello","nick":"bob"}"#),
            Some(WireMessage::Hello { nick: "bob".into() })
        );
    }

    #[tokio::test]
    async fn sends_without_open_channels_are_dropped() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut negotiator = Negotiator::new(
            Role::Host,
            "ann",
            "lobby",
            Arc::new(MemoryRelay::new()),
            Arc::new(LoopbackNetwork::new().connector()),
            NegotiationPolicy::default(),
            tx,
        );
        let mut channels = Channels::new(&mut negotiator);
        let hello = WireMessage::Hello { nick: "ann".into() };
        assert!(!channels.send_to("bob", &hello));
        assert_eq!(channels.broadcast(&hello), 0);
        assert!(channels.open_peers().is_empty());
    }
}
