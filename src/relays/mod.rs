//! Relay implementations.
//!
//! | Feature      | Relay            |
//! |--------------|------------------|
//! | `relay-http` | [`HttpRelay`]    |
//! | (always)     | [`MemoryRelay`]  |

#[cfg(feature = "relay-http")]
pub mod http;
pub mod memory;

#[cfg(feature = "relay-http")]
pub use http::{HttpRelay, RelayConfig};
pub use memory::MemoryRelay;
