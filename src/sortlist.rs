use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// One address pattern from a `sortlist` configuration entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortPattern {
    /// `addr/prefix` in CIDR form, IPv4 or IPv6.
    Cidr { addr: IpAddr, bits: u8 },
    /// IPv4 `addr/mask` form, or a bare address with its classful mask.
    Mask { addr: Ipv4Addr, mask: Ipv4Addr },
}

impl SortPattern {
    pub fn matches(&self, ip: &IpAddr) -> bool {
        match (self, ip) {
            (SortPattern::Cidr { addr: IpAddr::V4(net), bits }, IpAddr::V4(ip)) => {
                let mask = v4_prefix_mask(*bits);
                ip.to_bits() & mask == net.to_bits() & mask
            }
            (SortPattern::Cidr { addr: IpAddr::V6(net), bits }, IpAddr::V6(ip)) => {
                v6_prefix_matches(net, *bits, ip)
            }
            (SortPattern::Mask { addr, mask }, IpAddr::V4(ip)) => {
                ip.to_bits() & mask.to_bits() == addr.to_bits() & mask.to_bits()
            }
            _ => false,
        }
    }
}

/// Ordered list of patterns used to rank the addresses handed back to the
/// embedder: an address matching an earlier pattern sorts before one matching
/// a later pattern, which sorts before one matching none.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sortlist {
    patterns: Vec<SortPattern>,
}

impl Sortlist {
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Index of the first matching pattern, if any.
    pub fn rank(&self, ip: &IpAddr) -> Option<usize> {
        self.patterns.iter().position(|p| p.matches(ip))
    }

    /// Stable-sort addresses by pattern rank; unmatched addresses keep their
    /// relative order after all matched ones.
    pub fn sort(&self, addrs: &mut [IpAddr]) {
        if self.patterns.is_empty() {
            return;
        }
        addrs.sort_by_key(|a| self.rank(a).unwrap_or(usize::MAX));
    }

    /// Parse the `sortlist` grammar: whitespace-separated `ip`, `ip/prefix`,
    /// or `ip/mask` items, terminated by `;` or end of string. Items that do
    /// not parse are skipped.
    pub fn parse(s: &str) -> Sortlist {
        let body = s.split(';').next().unwrap_or("");
        let patterns = body
            .split_whitespace()
            .filter_map(parse_pattern)
            .collect();
        Sortlist { patterns }
    }
}

fn parse_pattern(token: &str) -> Option<SortPattern> {
    if let Some((ip_s, pfx_s)) = token.split_once('/') {
        if let Ok(v6) = ip_s.parse::<Ipv6Addr>() {
            let bits: u8 = pfx_s.parse().ok().filter(|b| *b <= 128)?;
            return Some(SortPattern::Cidr { addr: IpAddr::V6(v6), bits });
        }
        let v4 = ip_s.parse::<Ipv4Addr>().ok()?;
        if let Ok(bits) = pfx_s.parse::<u8>() {
            if bits <= 32 {
                return Some(SortPattern::Cidr { addr: IpAddr::V4(v4), bits });
            }
            return None;
        }
        let mask = pfx_s.parse::<Ipv4Addr>().ok()?;
        return Some(SortPattern::Mask { addr: v4, mask });
    }

    match token.parse::<IpAddr>().ok()? {
        IpAddr::V6(v6) => Some(SortPattern::Cidr { addr: IpAddr::V6(v6), bits: 128 }),
        IpAddr::V4(v4) => Some(SortPattern::Mask { addr: v4, mask: natural_mask(v4) }),
    }
}

/// Classful default mask for an IPv4 address without an explicit prefix.
/// Out of date in the CIDR world, but some configurations still rely on it.
fn natural_mask(addr: Ipv4Addr) -> Ipv4Addr {
    let bits = addr.to_bits();
    if bits & 0x8000_0000 == 0 {
        Ipv4Addr::new(255, 0, 0, 0)
    } else if bits & 0xc000_0000 == 0x8000_0000 {
        Ipv4Addr::new(255, 255, 0, 0)
    } else {
        Ipv4Addr::new(255, 255, 255, 0)
    }
}

fn v4_prefix_mask(bits: u8) -> u32 {
    if bits == 0 {
        0
    } else {
        u32::MAX << (32 - bits.min(32) as u32)
    }
}

fn v6_prefix_matches(net: &Ipv6Addr, bits: u8, ip: &Ipv6Addr) -> bool {
    let bits = bits.min(128) as u32;
    let net = u128::from_be_bytes(net.octets());
    let ip = u128::from_be_bytes(ip.octets());
    if bits == 0 {
        return true;
    }
    let mask = u128::MAX << (128 - bits);
    net & mask == ip & mask
}
