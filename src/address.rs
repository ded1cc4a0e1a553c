//! `host:port` addresses and WebSocket URLs.
//!
//! Configuration files written for the tunnel use a loose address syntax:
//! `"host:port"`, or just `"host"`, or just `"port"`. The same convention is
//! used when printing an address, so a value survives a round trip through
//! the configuration unchanged.

use std::{fmt, str::FromStr};

use url::Url;

use crate::error::{Result, TunnelError};

/// A host/port pair where either half may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl Address {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
        }
    }

    /// Returns a copy with `host` filled in when it was absent.
    #[must_use]
    pub fn or_host(&self, host: &str) -> Self {
        Self {
            host: Some(self.host.clone().unwrap_or_else(|| host.to_string())),
            port: self.port,
        }
    }

    /// Returns a copy with `port` filled in when it was absent.
    #[must_use]
    pub fn or_port(&self, port: u16) -> Self {
        Self {
            host: self.host.clone(),
            port: Some(self.port.unwrap_or(port)),
        }
    }

    /// String suitable for `TcpStream::connect` / `TcpListener::bind`.
    ///
    /// Both halves must be present.
    pub fn to_socket_string(&self) -> Result<String> {
        match (&self.host, self.port) {
            (Some(_), Some(_)) => Ok(self.to_string()),
            _ => Err(TunnelError::InvalidAddress(format!(
                "'{self}' needs both a host and a port"
            ))),
        }
    }
}

impl FromStr for Address {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TunnelError::InvalidAddress("empty address".to_string()));
        }

        if s.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(Self {
                host: None,
                port: Some(parse_port(s)?),
            });
        }

        // "[v6]" or "[v6]:port"
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| TunnelError::InvalidAddress(s.to_string()))?;
            let port = match tail {
                "" => None,
                tail => Some(parse_port(
                    tail.strip_prefix(':')
                        .ok_or_else(|| TunnelError::InvalidAddress(s.to_string()))?,
                )?),
            };
            return Ok(Self {
                host: Some(host.to_string()),
                port,
            });
        }

        match s.split_once(':') {
            // A bare IPv6 literal has more than one colon and no port.
            Some((_, tail)) if tail.contains(':') => Ok(Self {
                host: Some(s.to_string()),
                port: None,
            }),
            Some((host, port)) => Ok(Self {
                host: (!host.is_empty()).then(|| host.to_string()),
                port: Some(parse_port(port)?),
            }),
            None => Ok(Self {
                host: Some(s.to_string()),
                port: None,
            }),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.host, self.port) {
            (Some(host), Some(port)) if host.contains(':') => write!(f, "[{host}]:{port}"),
            (Some(host), Some(port)) => write!(f, "{host}:{port}"),
            (Some(host), None) => f.write_str(host),
            (None, Some(port)) => write!(f, "{port}"),
            (None, None) => Ok(()),
        }
    }
}

impl From<std::net::SocketAddr> for Address {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

fn parse_port(s: &str) -> Result<u16> {
    s.parse::<u16>()
        .map_err(|_| TunnelError::InvalidAddress(format!("invalid port '{s}'")))
}

/// Parses a URL and checks that it uses the `ws` or `wss` scheme.
pub fn parse_ws_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| TunnelError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(TunnelError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme '{other}', expected ws or wss"),
        }),
    }
}

/// Resolves `resource` against the WebSocket base URL `base`.
///
/// Follows the usual relative reference rules: `"ws://h/tunnel/"` joined with
/// `"ssh"` gives `"ws://h/tunnel/ssh"`, while `"/ssh"` replaces the whole path.
pub fn join_url(base: &str, resource: &str) -> Result<Url> {
    let base = parse_ws_url(base)?;
    base.join(resource).map_err(|e| TunnelError::InvalidUrl {
        url: format!("{base}{resource}"),
        reason: e.to_string(),
    })
}
