//! Syntactic validation of the address the workload binds to.
//!
//! The check is purely textual: a host is accepted when it is four dot-separated decimal
//! octets in `0..=255`, and a port when it is a decimal integer that fits a TCP port. No name
//! resolution or socket probing happens here.
use std::fmt;

use crate::error::AddressError;

/// A host/port pair that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindAddress {
    host: String,
    port: u16,
}

impl BindAddress {
    /// Validates `host` and `port` and returns the accepted pair.
    pub fn parse(host: &str, port: &str) -> Result<Self, AddressError> {
        let parts: Vec<&str> = host.split('.').collect();
        if parts.len() != 4 {
            return Err(AddressError::SegmentCount {
                host: host.to_string(),
                parts: parts.len(),
            });
        }

        if let Some(bad) = parts.iter().find(|part| parse_octet(part).is_none()) {
            return Err(AddressError::Octet {
                host: host.to_string(),
                octet: (*bad).to_string(),
            });
        }

        let port = parse_decimal(port)
            .and_then(|value| u16::try_from(value).ok())
            .ok_or_else(|| AddressError::Port {
                port: port.to_string(),
            })?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// The validated host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The validated port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for BindAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Returns whether `host` and `port` form a valid bind address.
pub fn is_valid(host: &str, port: &str) -> bool {
    BindAddress::parse(host, port).is_ok()
}

fn parse_octet(part: &str) -> Option<u8> {
    parse_decimal(part).and_then(|value| u8::try_from(value).ok())
}

/// Parses a non-empty run of ASCII digits. Signs and whitespace are rejected.
fn parse_decimal(text: &str) -> Option<u64> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}
