use std::fmt;

use crate::error::{Error, Result};

/// A coordinator address, parsed from a single `host:port` string.
///
/// The port is split off at the *last* `:` so that IPv6 literals
/// (`2001:db8::1:9042`) are handled without a separate bracket syntax (§3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
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

    pub fn parse(s: &str) -> Result<Self> {
        let idx = s
            .rfind(':')
            .ok_or_else(|| Error::BadConfigError(format!("endpoint '{s}' is missing a port")))?;
        let (address, port_str) = s.split_at(idx);
        let port_str = &port_str[1..];
        let port: u16 = port_str
            .parse()
            .map_err(|_| Error::BadConfigError(format!("endpoint '{s}' has an invalid port")))?;
        if address.is_empty() {
            return Err(Error::BadConfigError(format!(
                "endpoint '{s}' is missing an address"
            )));
        }
        Ok(Self {
            address: address.to_string(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}
