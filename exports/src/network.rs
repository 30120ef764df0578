// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Trusted-network entries, in the notations operators actually write them: `10.0.0.0/8`,
//! `10.0.0.0/255.0.0.0`, a bare `10.0.0.7`, or a token such as `ALL` or a hostname.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr};

use cidr::IpInet;

use crate::Error;

/// A single client-trust entry.
///
/// Equality and hashing are defined on the canonical form, so `1.3.1.1` and `1.3.1.1/32` are the
/// same entry even though each one displays the way it was written.
#[derive(Debug, Clone)]
pub enum NetworkSpec {
    /// A single address written without a prefix length.
    Host(IpAddr),
    /// An address together with a prefix length. Host bits may be set.
    Network(IpInet),
    /// Anything without a `/`, which is passed through as written.
    Token(String),
}

/// Normalize every entry of `specs` into CIDR notation, preserving order and duplicates.
pub fn normalize<S: AsRef<str>>(specs: &[S]) -> Result<Vec<NetworkSpec>, Error> {
    specs.iter().map(|spec| NetworkSpec::parse(spec.as_ref())).collect()
}

impl NetworkSpec {
    pub fn parse(spec: &str) -> Result<Self, Error> {
        let spec = spec.trim();

        let Some((address, mask)) = spec.split_once('/') else {
            return Ok(match spec.parse::<IpAddr>() {
                Ok(addr) => Self::Host(addr),
                Err(_) => Self::Token(spec.to_string()),
            });
        };

        let address: IpAddr = address
            .parse()
            .map_err(|_| Error::InvalidNetwork(spec.to_string()))?;

        let length = if mask.contains('.') {
            let mask: Ipv4Addr = mask
                .parse()
                .map_err(|_| Error::InvalidNetmask(spec.to_string()))?;
            if !address.is_ipv4() {
                return Err(Error::InvalidNetmask(spec.to_string()));
            }
            prefix_length(mask).ok_or_else(|| Error::InvalidNetmask(spec.to_string()))?
        } else {
            mask.parse::<u8>()
                .map_err(|_| Error::InvalidNetwork(spec.to_string()))?
        };

        let inet =
            IpInet::new(address, length).map_err(|_| Error::InvalidNetwork(spec.to_string()))?;

        Ok(Self::Network(inet))
    }

    /// The address and prefix length this entry covers, or `None` for a token.
    pub fn network(&self) -> Option<(IpAddr, u8)> {
        match self {
            Self::Host(addr @ IpAddr::V4(_)) => Some((*addr, 32)),
            Self::Host(addr @ IpAddr::V6(_)) => Some((*addr, 128)),
            Self::Network(inet) => Some((inet.address(), inet.network_length())),
            Self::Token(_) => None,
        }
    }
}

/// Count the set bits of a netmask. Only masks made of a single run of high bits have a prefix
/// length; `255.0.255.0` does not.
fn prefix_length(mask: Ipv4Addr) -> Option<u8> {
    let bits = u32::from(mask);
    let ones = bits.count_ones();
    if bits.leading_ones() != ones {
        return None;
    }
    u8::try_from(ones).ok()
}

impl PartialEq for NetworkSpec {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Token(a), Self::Token(b)) => a == b,
            (Self::Token(_), _) | (_, Self::Token(_)) => false,
            _ => self.network() == other.network(),
        }
    }
}

impl Eq for NetworkSpec {}

impl Hash for NetworkSpec {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Token(token) => token.hash(state),
            _ => self.network().hash(state),
        }
    }
}

impl fmt::Display for NetworkSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Host(addr) => write!(f, "{addr}"),
            Self::Network(inet) => write!(f, "{}/{}", inet.address(), inet.network_length()),
            Self::Token(token) => write!(f, "{token}"),
        }
    }
}
