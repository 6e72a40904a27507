//! Visitor key derivation from client addresses.
//!
//! Keys are read and written on every request, so they are kept short: the
//! address is packed into a single integer and rendered as fixed-width hex.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{GliderError, Result};

/// A compact key that uniquely identifies a client address.
///
/// IPv4 addresses render as `0x` plus 8 hex digits, IPv6 addresses as `0x`
/// plus 32, so the two families never share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VisitorKey(String);

impl VisitorKey {
    /// Encode a textual address such as `"1.2.3.4"`.
    pub fn encode(address: &str) -> Result<Self> {
        let address = address.trim();
        let address = address.strip_prefix("::ffff:").unwrap_or(address);

        if address.contains(':') {
            return address
                .parse::<Ipv6Addr>()
                .map(|ip| Self::from_ip(IpAddr::V6(ip)))
                .map_err(|_| GliderError::InvalidAddress(address.to_string()));
        }

        let mut packed: u32 = 0;
        let mut components = 0;
        for part in address.split('.') {
            if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(GliderError::InvalidAddress(address.to_string()));
            }
            let value: u32 = part
                .parse()
                .map_err(|_| GliderError::InvalidAddress(address.to_string()))?;
            if value > 255 {
                return Err(GliderError::InvalidAddress(format!(
                    "{} (component {} out of range)",
                    address, value
                )));
            }
            packed = (packed << 8) | value;
            components += 1;
        }

        if components != 4 {
            return Err(GliderError::InvalidAddress(address.to_string()));
        }

        Ok(Self::from_v4(Ipv4Addr::from(packed)))
    }

    /// Encode an already parsed address.
    pub fn from_ip(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Self::from_v4(v4),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => Self::from_v4(v4),
                None => Self(format!("0x{:032x}", u128::from(v6))),
            },
        }
    }

    fn from_v4(ip: Ipv4Addr) -> Self {
        Self(format!("0x{:08x}", u32::from(ip)))
    }

    /// Wrap a key that was already encoded, e.g. one read back from the store.
    pub fn from_encoded(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VisitorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for VisitorKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
