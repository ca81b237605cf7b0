use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use crate::error::{DnsError, Result};

/// One configured upstream name server. A port of 0 means "use the channel's
/// default port for that protocol".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSpec {
    pub addr: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl ServerSpec {
    pub fn new(addr: IpAddr, port: u16) -> ServerSpec {
        ServerSpec { addr, udp_port: port, tcp_port: port }
    }

    /// Socket address for UDP traffic, resolving a 0 port to `default_port`.
    pub fn udp_addr(&self, default_port: u16) -> SocketAddr {
        let port = if self.udp_port != 0 { self.udp_port } else { default_port };
        SocketAddr::new(self.addr, port)
    }

    /// Socket address for TCP traffic, resolving a 0 port to `default_port`.
    pub fn tcp_addr(&self, default_port: u16) -> SocketAddr {
        let port = if self.tcp_port != 0 { self.tcp_port } else { default_port };
        SocketAddr::new(self.addr, port)
    }
}

impl fmt::Display for ServerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.addr, self.udp_port) {
            (IpAddr::V4(v4), 0) => write!(f, "{}", v4),
            (IpAddr::V6(v6), 0) => write!(f, "[{}]", v6),
            (addr, port) => write!(f, "[{}]:{}", addr, port),
        }
    }
}

impl FromStr for ServerSpec {
    type Err = DnsError;

    /// Parse a single server in one of the accepted forms:
    /// `addr`, `[addr]`, or `[addr]:port`.
    fn from_str(s: &str) -> Result<ServerSpec> {
        let (addr_part, port_part) = if let Some(rest) = s.strip_prefix('[') {
            let close = rest.find(']').ok_or(DnsError::BadConfig(s.to_string()))?;
            let addr = &rest[..close];
            let tail = &rest[close + 1..];
            let port = if tail.is_empty() {
                None
            } else {
                Some(tail.strip_prefix(':').ok_or(DnsError::BadConfig(s.to_string()))?)
            };
            (addr, port)
        } else {
            (s, None)
        };

        let addr: IpAddr = addr_part
            .parse()
            .map_err(|_| DnsError::BadConfig(s.to_string()))?;
        if let IpAddr::V6(v6) = addr {
            if is_blacklisted_v6(&v6) {
                return Err(DnsError::BadConfig(s.to_string()));
            }
        }

        let port = match port_part {
            Some(p) if !p.is_empty() => {
                p.parse::<u16>().map_err(|_| DnsError::BadConfig(s.to_string()))?
            }
            Some(_) => return Err(DnsError::BadConfig(s.to_string())),
            None => 0,
        };
        Ok(ServerSpec::new(addr, port))
    }
}

/// Parse a comma- or whitespace-separated server list, silently skipping
/// entries that do not parse or that are blacklisted.
pub fn parse_server_list(s: &str) -> Vec<ServerSpec> {
    s.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|tok| !tok.is_empty())
        .filter_map(|tok| tok.parse().ok())
        .collect()
}

/// fec0::/10 (deprecated site-local) is known to leak out of some platform
/// resolver configurations and is never a valid DNS server.
pub fn is_blacklisted_v6(addr: &Ipv6Addr) -> bool {
    addr.segments()[0] & 0xffc0 == 0xfec0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_parse_bare_ipv4() {
        let spec: ServerSpec = "1.2.3.4".parse().unwrap();
        assert_eq!(spec.addr, IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(spec.udp_port, 0);
        assert_eq!(spec.tcp_port, 0);
    }

    #[test]
    fn test_parse_bracketed_with_port() {
        let spec: ServerSpec = "[127.0.0.1]:59591".parse().unwrap();
        assert_eq!(spec.addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(spec.udp_port, 59591);

        let spec: ServerSpec = "[2001:db8::1]:5353".parse().unwrap();
        assert_eq!(spec.addr, "2001:db8::1".parse::<IpAddr>().unwrap());
        assert_eq!(spec.tcp_port, 5353);
    }

    #[test]
    fn test_parse_bare_ipv6() {
        let spec: ServerSpec = "2001:db8::53".parse().unwrap();
        assert_eq!(spec.addr, "2001:db8::53".parse::<IpAddr>().unwrap());
        assert_eq!(spec.udp_port, 0);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!("".parse::<ServerSpec>().is_err());
        assert!("not-an-ip".parse::<ServerSpec>().is_err());
        assert!("[1.2.3.4".parse::<ServerSpec>().is_err());
        assert!("[1.2.3.4]x".parse::<ServerSpec>().is_err());
        assert!("[1.2.3.4]:".parse::<ServerSpec>().is_err());
        assert!("[1.2.3.4]:99999".parse::<ServerSpec>().is_err());
    }

    #[test]
    fn test_site_local_v6_is_dropped() {
        assert!("fec0::1".parse::<ServerSpec>().is_err());
        assert!("[fec0::1]:53".parse::<ServerSpec>().is_err());
        // fe80:: is link-local, not in the blacklisted range.
        assert!(!is_blacklisted_v6(&"fe80::1".parse().unwrap()));
    }

    #[test]
    fn test_parse_server_list_skips_bad_entries() {
        let specs = parse_server_list("1.1.1.1, junk [8.8.8.8]:53\tfec0::2 9.9.9.9");
        let addrs: Vec<String> = specs.iter().map(|s| s.to_string()).collect();
        assert_eq!(addrs, vec!["1.1.1.1", "[8.8.8.8]:53", "9.9.9.9"]);
    }

    #[test]
    fn test_display_round_trip() {
        for s in ["1.2.3.4", "[1.2.3.4]:5353", "[2001:db8::1]", "[2001:db8::1]:53"] {
            let spec: ServerSpec = s.parse().unwrap();
            let emitted = spec.to_string();
            let reparsed: ServerSpec = emitted.parse().unwrap();
            assert_eq!(spec, reparsed);
        }
    }
}
