use std::{
    fmt::{self, Display, Formatter},
    net::SocketAddr,
    str::FromStr,
};
use thiserror::Error as ThisError;

/// An address and port identifying a communication peer.
///
/// Endpoints travel inside envelopes in their canonical `address:port` text
/// form and are compared structurally, so `localhost:8080` and
/// `127.0.0.1:8080` are different endpoints even though they name the same
/// socket.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Returns a copy of this endpoint with a different port.
    pub fn with_port(&self, port: u16) -> Self {
        Self::new(self.address.clone(), port)
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Split on the last colon so bracketed IPv6 literals keep theirs
        let (address, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| EndpointError::MissingPort(s.to_string()))?;
        if address.is_empty() {
            return Err(EndpointError::MissingAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| EndpointError::InvalidPort(port.to_string()))?;
        Ok(Self::new(address, port))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum EndpointError {
    #[error("Endpoint `{0}` has no port")]
    MissingPort(String),
    #[error("Endpoint `{0}` has no address")]
    MissingAddress(String),
    #[error("Invalid port `{0}`")]
    InvalidPort(String),
}
