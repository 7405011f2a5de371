//! # upstream
//!
//! Opens the TCP side of a gateway session. A [`Destination`] is parsed from
//! the `host[:port]` path segment of an upgrade request; the [`Connector`]
//! then dials it either directly or, for `.onion` hosts, through the local
//! Tor SOCKS5 proxy. Both paths yield the same [`UpstreamStream`], so the
//! relay never needs to know which one was taken.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use upstream::{Connector, ConnectorConfig, Destination};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let connector = Connector::new(ConnectorConfig::default()); // Tor at localhost:9050
//! let destination = Destination::parse("abc123xyz.onion")?; // port 9735
//! let connection = connector.connect(&destination).await?;
//! println!("connected via {}", connection.path());
//! # Ok(())
//! # }
//! ```

mod connector;
mod destination;
mod stream;

pub use connector::{Connector, ConnectorConfig, DialError, DialPath, TorProxy, UpstreamConnection};
pub use destination::{Destination, DestinationError, DEFAULT_PORT, ONION_SUFFIX};
pub use stream::UpstreamStream;
