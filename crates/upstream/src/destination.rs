use std::fmt;

use thiserror::Error;

/// Standard peer-protocol port, used when the destination names none.
pub const DEFAULT_PORT: u16 = 9735;

/// Hosts with this suffix are Tor hidden services.
pub const ONION_SUFFIX: &str = ".onion";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DestinationError {
    #[error("no destination host given")]
    Missing,
    #[error("invalid destination port '{port}'")]
    InvalidPort { port: String },
    #[error("malformed destination '{target}'")]
    Malformed { target: String },
}

/// A peer node to dial.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    host: String,
    port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host[:port]` target.
    ///
    /// IPv6 literals must be bracketed (`[2001:db8::1]:9735`). A missing port
    /// means [`DEFAULT_PORT`]; an empty, zero, or non-numeric one is an error.
    pub fn parse(target: &str) -> Result<Self, DestinationError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(DestinationError::Missing);
        }

        let (host, port) = if let Some(rest) = target.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(|| DestinationError::Malformed {
                target: target.to_string(),
            })?;
            let port = match after {
                "" => None,
                _ => Some(after.strip_prefix(':').ok_or_else(|| {
                    DestinationError::Malformed {
                        target: target.to_string(),
                    }
                })?),
            };
            (host, port)
        } else {
            match target.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (target, None),
            }
        };

        if host.is_empty() {
            return Err(DestinationError::Missing);
        }

        let port = match port {
            None => DEFAULT_PORT,
            Some(raw) => match raw.parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => {
                    return Err(DestinationError::InvalidPort {
                        port: raw.to_string(),
                    })
                }
            },
        };

        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `true` when the host is a hidden-service name and must be reached
    /// through Tor.
    pub fn is_tor(&self) -> bool {
        self.host.ends_with(ONION_SUFFIX)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
