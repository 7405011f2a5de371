//! WebSocket-to-TCP bridge for the gateway.
//!
//! Browsers cannot open raw TCP sockets, so they connect here with a
//! WebSocket whose path names the peer node (`/host[:port]`). Each request
//! is admitted, the peer is dialed (through Tor for `.onion` hosts), and the
//! upgraded WebSocket is paired with the TCP connection in a relay session.
//!
//! # Architecture
//!
//! ```text
//! Browser  <--WS-->  Gateway  <--TCP / SOCKS5-->  Peer node
//!                       |
//!             [AdmissionController]
//!          origin -> destination -> rate limit
//! ```
//!
//! A rejected request gets a plain HTTP status (400, 429, or 404 for a
//! failed dial) and never becomes a WebSocket. An admitted one runs two
//! forwarding loops until either side closes, at which point both are
//! closed.

pub mod admission;
pub mod listener;
pub mod origin;
pub mod relay;

// Re-export the primary public types at the crate root for convenience.
pub use admission::{AdmissionController, AdmissionError, Admitted, ConnectionAttempt};
pub use listener::{Gateway, GatewayConfig};
pub use origin::{OriginAllowlist, OriginRejection};
pub use relay::{RelayConfig, RelayError, RelaySession, SessionState, SessionSummary, Side};
