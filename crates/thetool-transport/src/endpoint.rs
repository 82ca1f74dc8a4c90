//! Debugging endpoint address.

use std::{fmt, str::FromStr, sync::LazyLock};

use regex::Regex;
use thiserror::Error;

static ENDPOINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ws://(?P<host>\[[^\]]+\]|[^:/\s]+):(?P<port>\d+)(?P<path>/\S*)?$")
        .expect("constant regex pattern is valid")
});

/// Malformed endpoint URL.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid debugging endpoint: {0}")]
pub struct EndpointError(pub String);

/// A `ws://host:port/path` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Endpoint {
    /// `host:port`, as used for the TCP connect and the `Host` header.
    #[must_use]
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = ENDPOINT_RE
            .captures(s.trim())
            .ok_or_else(|| EndpointError(s.to_string()))?;
        let port = caps["port"]
            .parse()
            .map_err(|_| EndpointError(s.to_string()))?;
        let path = caps
            .name("path")
            .map_or_else(|| "/".to_string(), |m| m.as_str().to_string());
        Ok(Self {
            host: caps["host"].to_string(),
            port,
            path,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ws://{}:{}{}", self.host, self.port, self.path)
    }
}
