//! Peer transport implementations.
//!
//! | Feature            | Connector           |
//! |--------------------|---------------------|
//! | `transport-webrtc` | [`WebRtcConnector`] |
//! | (always)           | [`LoopbackNetwork`] |
//!
//! [`WebRtcConnector`] opens real peer connections across NAT. The in-process
//! [`LoopbackNetwork`] pairs transports without any networking, for tests and
//! demos. Browser builds supply their own [`PeerConnector`](crate::PeerConnector)
//! around the platform's peer connection.
//!
//! # Example
//!
//! ```rust
//! use setlink::transports::LoopbackNetwork;
//!
//! let network = LoopbackNetwork::new();
//! let host_side = network.connector();
//! let client_side = network.connector();
//! # let _ = (host_side, client_side);
//! ```

pub mod loopback;
#[cfg(feature = "transport-webrtc")]
pub mod webrtc;

pub use loopback::{LoopbackConnector, LoopbackNetwork};
#[cfg(feature = "transport-webrtc")]
pub use self::webrtc::{WebRtcConfig, WebRtcConnector, WebRtcTransport};
