use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, warn};

use crate::destination::Destination;
use crate::stream::UpstreamStream;

/// Local Tor SOCKS5 endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorProxy {
    pub host: String,
    pub port: u16,
}

impl Default for TorProxy {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9050,
        }
    }
}

impl fmt::Display for TorProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Configuration for the [`Connector`].
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Proxy used for `.onion` destinations.
    pub tor_proxy: TorProxy,
    /// Upper bound on a single dial, including the SOCKS5 handshake.
    pub connect_timeout: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            tor_proxy: TorProxy::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Which route a connection took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialPath {
    Direct,
    Tor,
}

impl fmt::Display for DialPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Tor => write!(f, "tor"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DialError {
    /// Refused, unreachable, unresolvable, or timed out.
    #[error("failed to connect to {destination}: {reason}")]
    DirectConnectFailed {
        destination: Destination,
        reason: String,
    },

    /// The proxy was unreachable or could not open the circuit.
    #[error("failed to reach {destination} through Tor proxy {proxy}: {reason}")]
    TorTunnelFailed {
        destination: Destination,
        proxy: TorProxy,
        reason: String,
    },
}

impl DialError {
    pub fn path(&self) -> DialPath {
        match self {
            Self::DirectConnectFailed { .. } => DialPath::Direct,
            Self::TorTunnelFailed { .. } => DialPath::Tor,
        }
    }
}

/// A freshly dialed peer connection.
#[derive(Debug)]
pub struct UpstreamConnection {
    stream: UpstreamStream,
    destination: Destination,
    path: DialPath,
}

impl UpstreamConnection {
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn path(&self) -> DialPath {
        self.path
    }

    pub fn into_stream(self) -> UpstreamStream {
        self.stream
    }
}

/// Dials peer nodes.
///
/// The route is chosen from the destination alone: `.onion` hosts go
/// through the Tor proxy, everything else is dialed directly. A failed dial
/// is final; the connector never retries and never tries the other route.
#[derive(Debug, Clone)]
pub struct Connector {
    config: ConnectorConfig,
}

impl Connector {
    pub fn new(config: ConnectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Route that [`connect`](Self::connect) will use for `destination`.
    pub fn path_for(destination: &Destination) -> DialPath {
        if destination.is_tor() {
            DialPath::Tor
        } else {
            DialPath::Direct
        }
    }

    /// Open exactly one connection to `destination`.
    pub async fn connect(&self, destination: &Destination) -> Result<UpstreamConnection, DialError> {
        let path = Self::path_for(destination);
        debug!(%destination, %path, "dialing upstream");

        let stream = match path {
            DialPath::Tor => self.dial_tor(destination).await?,
            DialPath::Direct => self.dial_direct(destination).await?,
        };

        if let Err(err) = stream.set_nodelay(true) {
            warn!(%destination, %err, "failed to set TCP_NODELAY on upstream socket");
        }

        Ok(UpstreamConnection {
            stream,
            destination: destination.clone(),
            path,
        })
    }

    async fn dial_direct(&self, destination: &Destination) -> Result<UpstreamStream, DialError> {
        let connect = TcpStream::connect((destination.host(), destination.port()));

        match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(stream)) => Ok(UpstreamStream::Direct(stream)),
            Ok(Err(err)) => Err(DialError::DirectConnectFailed {
                destination: destination.clone(),
                reason: err.to_string(),
            }),
            Err(_) => Err(DialError::DirectConnectFailed {
                destination: destination.clone(),
                reason: format!("timed out after {:?}", self.config.connect_timeout),
            }),
        }
    }

    async fn dial_tor(&self, destination: &Destination) -> Result<UpstreamStream, DialError> {
        let proxy = &self.config.tor_proxy;
        let connect = Socks5Stream::connect(
            (proxy.host.as_str(), proxy.port),
            (destination.host(), destination.port()),
        );

        match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(stream)) => Ok(UpstreamStream::Tor(stream)),
            Ok(Err(err)) => Err(DialError::TorTunnelFailed {
                destination: destination.clone(),
                proxy: proxy.clone(),
                reason: err.to_string(),
            }),
            Err(_) => Err(DialError::TorTunnelFailed {
                destination: destination.clone(),
                proxy: proxy.clone(),
                reason: format!("timed out after {:?}", self.config.connect_timeout),
            }),
        }
    }
}
