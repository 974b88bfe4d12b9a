//! Data channel addresses
//!
//! Explicit parse/format pairs for the address arguments carried by
//! `PORT`, `EPRT` and the `227`/`229` passive replies.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use crate::error::AddressError;

/// IPv4 address and port written as `h1,h2,h3,h4,p1,p2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPort {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl HostPort {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl FromStr for HostPort {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = s.trim().split(',').map(str::trim).collect();
        if tokens.len() != 6 {
            return Err(AddressError::WrongTokenCount(tokens.len()));
        }

        let mut octets = [0u8; 6];
        for (slot, token) in octets.iter_mut().zip(&tokens) {
            *slot = token
                .parse::<u8>()
                .map_err(|_| AddressError::InvalidNumber((*token).to_string()))?;
        }

        let port = (octets[4] as u16) << 8 | octets[5] as u16;
        if port == 0 {
            return Err(AddressError::InvalidPort(0));
        }

        Ok(Self {
            ip: Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]),
            port,
        })
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.ip.octets();
        write!(f, "{},{},{},{},{},{}", a, b, c, d, self.port >> 8, self.port & 0xff)
    }
}

/// Address written as `|proto|ip|port|` (RFC 2428), any delimiter allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedAddress(pub SocketAddr);

impl FromStr for ExtendedAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let delimiter = s
            .chars()
            .next()
            .ok_or_else(|| AddressError::MalformedExtended(s.to_string()))?;
        let fields: Vec<&str> = s.split(delimiter).collect();
        if fields.len() != 5 || !fields[0].is_empty() || !fields[4].is_empty() {
            return Err(AddressError::MalformedExtended(s.to_string()));
        }

        let ip = match fields[1] {
            "1" => IpAddr::V4(
                fields[2]
                    .parse::<Ipv4Addr>()
                    .map_err(|_| AddressError::MalformedExtended(s.to_string()))?,
            ),
            "2" => IpAddr::V6(
                fields[2]
                    .parse::<Ipv6Addr>()
                    .map_err(|_| AddressError::MalformedExtended(s.to_string()))?,
            ),
            other => return Err(AddressError::UnsupportedProtocol(other.to_string())),
        };
        let port = parse_port(fields[3])?;

        Ok(Self(SocketAddr::new(ip, port)))
    }
}

impl fmt::Display for ExtendedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.ip() {
            IpAddr::V4(ip) => write!(f, "|1|{}|{}|", ip, self.0.port()),
            IpAddr::V6(ip) => write!(f, "|2|{}|{}|", ip, self.0.port()),
        }
    }
}

fn parse_port(token: &str) -> Result<u16, AddressError> {
    let value = token
        .trim()
        .parse::<i64>()
        .map_err(|_| AddressError::InvalidNumber(token.to_string()))?;
    if value <= 0 || value > u16::MAX as i64 {
        return Err(AddressError::InvalidPort(value));
    }
    Ok(value as u16)
}

/// Text between the first `(` and the following `)` of a reply.
fn parenthesised(reply: &str) -> Result<&str, AddressError> {
    let start = reply
        .find('(')
        .ok_or_else(|| AddressError::MissingParens(reply.to_string()))?;
    let end = reply[start..]
        .find(')')
        .ok_or_else(|| AddressError::MissingParens(reply.to_string()))?;
    Ok(&reply[start + 1..start + end])
}

/// Extracts host and port from a `227 Entering Passive Mode. (h1,h2,h3,h4,p1,p2)` reply.
pub fn parse_pasv_reply(reply: &str) -> Result<HostPort, AddressError> {
    parenthesised(reply)?.parse()
}

/// Extracts the port from a `229 Entering Extended Passive Mode. (|||port|)` reply.
pub fn parse_epsv_reply(reply: &str) -> Result<u16, AddressError> {
    let inner = parenthesised(reply)?;
    let mut chars = inner.chars();
    let delimiter = chars
        .next()
        .ok_or_else(|| AddressError::MalformedExtended(inner.to_string()))?;
    let prefix = delimiter.to_string().repeat(3);
    if inner.len() < 4 || !inner.starts_with(&prefix) || !inner.ends_with(delimiter) {
        return Err(AddressError::MalformedExtended(inner.to_string()));
    }
    parse_port(&inner[3..inner.len() - 1])
}

pub fn format_pasv_reply(address: HostPort) -> String {
    format!("Entering Passive Mode. ({})", address)
}

pub fn format_epsv_reply(port: u16) -> String {
    format!("Entering Extended Passive Mode. (|||{}|)", port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pasv_reply_yields_host_and_port() {
        let parsed = parse_pasv_reply("227 Entering Passive Mode. (10,0,0,1,4,1)").unwrap();
        assert_eq!(parsed.ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(parsed.port, 1025);
    }

    #[test]
    fn pasv_reply_with_wrong_token_count_is_rejected() {
        assert_eq!(
            parse_pasv_reply("227 Entering Passive Mode. (10,0,0,1,4)"),
            Err(AddressError::WrongTokenCount(5))
        );
        assert!(matches!(
            parse_pasv_reply("227 Entering Passive Mode. (10,0,0,1,x,1)"),
            Err(AddressError::InvalidNumber(_))
        ));
        assert!(matches!(
            parse_pasv_reply("227 Entering Passive Mode"),
            Err(AddressError::MissingParens(_))
        ));
    }

    #[test]
    fn epsv_reply_yields_port() {
        assert_eq!(
            parse_epsv_reply("229 Entering Extended Passive Mode. (|||50021|)"),
            Ok(50021)
        );
        assert_eq!(
            parse_epsv_reply("229 Entering Extended Passive Mode. (|||0|)"),
            Err(AddressError::InvalidPort(0))
        );
    }

    #[test]
    fn port_argument_formats_back_to_wire_form() {
        let hp: HostPort = "127,0,0,1,195,80".parse().unwrap();
        assert_eq!(hp.port, 50000);
        assert_eq!(hp.to_string(), "127,0,0,1,195,80");
        assert_eq!(
            format_pasv_reply(hp),
            "Entering Passive Mode. (127,0,0,1,195,80)"
        );
    }

    #[test]
    fn eprt_accepts_both_address_families() {
        let v4: ExtendedAddress = "|1|132.235.1.2|6275|".parse().unwrap();
        assert_eq!(v4.0, "132.235.1.2:6275".parse().unwrap());
        let v6: ExtendedAddress = "|2|::1|5282|".parse().unwrap();
        assert_eq!(v6.to_string(), "|2|::1|5282|");
        assert!(matches!(
            "|3|1.2.3.4|21|".parse::<ExtendedAddress>(),
            Err(AddressError::UnsupportedProtocol(_))
        ));
    }
}
