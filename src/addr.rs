//! Address, CIDR and port-range primitives (spec §4.1).

use crate::error::{Result, TunnelError};
use std::fmt;
use std::net::IpAddr;

/// A parsed IPv4/IPv6 literal, optionally with a CIDR prefix.
///
/// For a bare IP, `prefix_len` is the address family's full width (32/128).
/// For a CIDR, `ip` is masked to the network boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    ip: IpAddr,
    prefix_len: u8,
}

impl Address {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn is_cidr(&self) -> bool {
        self.prefix_len != family_width(self.ip)
    }

    /// `true` iff the first `prefix_len` bits of `candidate` equal this
    /// entry's masked bits (spec invariant #2).
    ///
    /// IPv6 CIDR containment is not implemented (spec Non-goals); bare IPv6
    /// literals still compare whole.
    pub fn contains(&self, candidate: IpAddr) -> bool {
        match (self.ip, candidate) {
            (IpAddr::V4(net), IpAddr::V4(cand)) => {
                let mask = v4_mask(self.prefix_len);
                u32::from(net) & mask == u32::from(cand) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(cand)) => {
                if self.is_cidr() {
                    false
                } else {
                    net == cand
                }
            }
            _ => false,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_cidr() {
            write!(f, "{}/{}", self.ip, self.prefix_len)
        } else {
            write!(f, "{}", self.ip)
        }
    }
}

fn family_width(ip: IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn v4_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len)
    }
}

/// Parse a bare IP or CIDR literal. Rejects hostnames (spec §4.1).
pub fn parse_address(text: &str) -> Result<Address> {
    let (ip_part, prefix_part) = match text.split_once('/') {
        Some((ip, prefix)) => (ip, Some(prefix)),
        None => (text, None),
    };

    let ip: IpAddr = ip_part
        .parse()
        .map_err(|_| TunnelError::Parse(text.to_string()))?;

    let full_width = family_width(ip);

    let prefix_len = match prefix_part {
        Some(p) => {
            let n: u8 = p.parse().map_err(|_| TunnelError::Parse(text.to_string()))?;
            if n > full_width {
                return Err(TunnelError::Parse(text.to_string()));
            }
            n
        }
        None => full_width,
    };

    let masked_ip = match ip {
        IpAddr::V4(v4) if prefix_part.is_some() => {
            IpAddr::V4(std::net::Ipv4Addr::from(u32::from(v4) & v4_mask(prefix_len)))
        }
        other => other,
    };

    Ok(Address {
        ip: masked_ip,
        prefix_len,
    })
}

/// `true` iff `ip` is contained by any entry in `addresses` (spec invariant #2).
pub fn address_match(ip: IpAddr, addresses: &[Address]) -> bool {
    addresses.iter().any(|a| a.contains(ip))
}

/// An inclusive port range, normalized so `low <= high`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.low && port <= self.high
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.low == self.high {
            write!(f, "{}", self.low)
        } else {
            write!(f, "[{}-{}]", self.low, self.high)
        }
    }
}

/// Build a [`PortRange`], swapping the bounds if given in the wrong order
/// (spec invariant #3: `parse_port_range(a, b) == parse_port_range(b, a)`).
pub fn parse_port_range(a: u16, b: u16) -> PortRange {
    if a <= b {
        PortRange { low: a, high: b }
    } else {
        PortRange { low: b, high: a }
    }
}

pub fn port_in_any(port: u16, ranges: &[PortRange]) -> bool {
    ranges.iter().any(|r| r.contains(port))
}

/// Transport protocols an intercept can match. Anything else is rejected at
/// registration time (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn bare_ip_has_full_prefix() {
        let a = parse_address("10.0.0.7").unwrap();
        assert_eq!(a.prefix_len(), 32);
        assert!(!a.is_cidr());
    }

    #[test]
    fn cidr_masks_host_bits() {
        let a = parse_address("10.0.0.3/30").unwrap();
        assert_eq!(a.ip(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)));
        assert_eq!(a.to_string(), "10.0.0.0/30");
    }

    #[test]
    fn hostnames_are_rejected() {
        assert!(parse_address("example.com").is_err());
    }

    #[test]
    fn cidr_boundary_s3() {
        // S3: intercept {tcp, 10.0.0.0/30, [1-65535]}
        let net = parse_address("10.0.0.0/30").unwrap();
        assert!(address_match("10.0.0.3".parse().unwrap(), &[net]));
        assert!(!address_match("10.0.0.4".parse().unwrap(), &[net]));
    }

    #[test]
    fn port_range_normalizes_swapped_bounds() {
        assert_eq!(parse_port_range(80, 8080), parse_port_range(8080, 80));
    }

    #[test]
    fn port_range_display() {
        assert_eq!(parse_port_range(80, 80).to_string(), "80");
        assert_eq!(parse_port_range(1, 65535).to_string(), "[1-65535]");
    }

    #[test]
    fn ipv6_cidr_parses_but_does_not_match() {
        let net = parse_address("fe80::/64").unwrap();
        assert!(net.is_cidr());
        assert!(!address_match("fe80::1".parse().unwrap(), &[net]));
    }
}
