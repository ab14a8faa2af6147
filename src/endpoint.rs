//! Remote endpoint of an echo connection.

use crate::error::EndpointError;
use std::fmt;
use std::str::FromStr;

/// Well-known port of the echo protocol.
pub const DEFAULT_ECHO_PORT: u16 = 7;

/// A validated host and port pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Build an endpoint from user-supplied host text and an optional port.
    ///
    /// A missing or zero port maps to [`DEFAULT_ECHO_PORT`]. Surrounding
    /// whitespace is stripped from the host before the emptiness check.
    pub fn new(host: &str, port: Option<i64>) -> Result<Self, EndpointError> {
        let host = host.trim();
        if host.is_empty() {
            return Err(EndpointError::EmptyHost);
        }

        let port = match port {
            None | Some(0) => DEFAULT_ECHO_PORT,
            Some(p) => u16::try_from(p).map_err(|_| EndpointError::PortOutOfRange(p))?,
        };

        Ok(Endpoint {
            host: host.to_string(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parses `host`, `host:port`, `[v6]` or `[v6]:port`.
impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            match rest.split_once(']') {
                Some((host, "")) => (host, None),
                Some((host, tail)) => match tail.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => return Err(EndpointError::InvalidPort(tail.to_string())),
                },
                None => (s, None),
            }
        } else if s.matches(':').count() == 1 {
            match s.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        } else {
            // bare IPv6 literal or plain host
            (s, None)
        };

        let port = match port {
            Some(p) => Some(
                p.parse::<i64>()
                    .map_err(|_| EndpointError::InvalidPort(p.to_string()))?,
            ),
            None => None,
        };

        Endpoint::new(host, port)
    }
}
