//! IP-mask based access control: parses `ADDR[/BITS]` rule specifications and matches
//! accepted peers against an ordered allow-list, exactly as distccd's `--allow` flag did.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AclError {
    #[error("cannot resolve hostspec {0:?}: {1}")]
    Unresolvable(String, std::io::Error),

    #[error("hostspec {0:?} resolved to no addresses")]
    NoAddress(String),

    #[error("mask bits {bits} out of range for address family (max {max})")]
    BitsOutOfRange { bits: u32, max: u32 },

    #[error("invalid bits field {0:?} in hostspec")]
    BadBits(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

/// An `ADDR[/BITS]` rule: an address and mask of a single family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressMask {
    family: Family,
    value: u128,
    mask: u128,
    bits: u32,
}

impl AddressMask {
    /// Parse a hostspec of the form `ADDR` or `ADDR/BITS`. `ADDR` is resolved through the
    /// system's dual-stack resolver; the first address returned is used. `BITS` defaults to
    /// the full width of the resolved family (32 for v4, 128 for v6).
    pub fn parse(spec: &str) -> Result<AddressMask, AclError> {
        let (addr_part, bits_part) = match spec.rsplit_once('/') {
            Some((a, b)) => (a, Some(b)),
            None => (spec, None),
        };

        let ip = resolve_one(addr_part)?;

        let (family, max_bits, value) = match ip {
            IpAddr::V4(v4) => (Family::V4, 32u32, u32::from(v4) as u128),
            IpAddr::V6(v6) => (Family::V6, 128u32, u128::from(v6)),
        };

        let bits = match bits_part {
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|_| AclError::BadBits(raw.to_owned()))?,
            None => max_bits,
        };

        if bits > max_bits {
            return Err(AclError::BitsOutOfRange { bits, max: max_bits });
        }

        let mask = top_bits_mask(bits, max_bits);

        Ok(AddressMask {
            family,
            value,
            mask,
            bits,
        })
    }

    /// True if `peer` matches this rule under the dual-stack matching semantics: same-family
    /// comparison, or a v4-mapped/v4-compatible v6 peer compared against a v4 rule.
    pub fn matches(&self, peer: IpAddr) -> bool {
        match (self.family, peer) {
            (Family::V4, IpAddr::V4(v4)) => self.matches_raw(u32::from(v4) as u128),
            (Family::V6, IpAddr::V6(v6)) => self.matches_raw(u128::from(v6)),
            (Family::V4, IpAddr::V6(v6)) => match embedded_v4(&v6) {
                Some(v4) => self.matches_raw(u32::from(v4) as u128),
                None => false,
            },
            (Family::V6, IpAddr::V4(_)) => false,
        }
    }

    fn matches_raw(&self, peer_bits: u128) -> bool {
        (peer_bits & self.mask) == (self.value & self.mask)
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }
}

fn top_bits_mask(bits: u32, width: u32) -> u128 {
    if bits == 0 {
        0
    } else if bits >= width {
        (!0u128) >> (128 - width)
    } else {
        let full = (!0u128) >> (128 - width);
        full & !((1u128 << (width - bits)) - 1)
    }
}

/// Extracts the embedded IPv4 address from a v4-mapped (`::ffff:a.b.c.d`) or v4-compatible
/// (`::a.b.c.d`) IPv6 address, per RFC 4291 §2.5.5. Returns `None` for any other address.
fn embedded_v4(v6: &Ipv6Addr) -> Option<Ipv4Addr> {
    let seg = v6.segments();
    if seg[0..5] != [0, 0, 0, 0, 0] {
        return None;
    }
    match seg[5] {
        0xffff => Some(Ipv4Addr::new(
            (seg[6] >> 8) as u8,
            (seg[6] & 0xff) as u8,
            (seg[7] >> 8) as u8,
            (seg[7] & 0xff) as u8,
        )),
        0 if seg[6] != 0 || seg[7] > 1 => Some(Ipv4Addr::new(
            (seg[6] >> 8) as u8,
            (seg[6] & 0xff) as u8,
            (seg[7] >> 8) as u8,
            (seg[7] & 0xff) as u8,
        )),
        _ => None,
    }
}

fn resolve_one(host: &str) -> Result<IpAddr, AclError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let candidate = format!("{host}:0");
    let mut addrs = candidate
        .to_socket_addrs()
        .map_err(|e| AclError::Unresolvable(host.to_owned(), e))?;
    addrs
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| AclError::NoAddress(host.to_owned()))
}

/// An ordered sequence of `AddressMask` rules, consulted in insertion order. Immutable once
/// built: every worker shares the same instance.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    rules: Vec<AddressMask>,
}

impl AllowList {
    pub fn new(rules: Vec<AddressMask>) -> AllowList {
        AllowList { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The canonical private-network set installed by daemon mode when no `--allow` is given:
    /// `{192.168/16, 10/8, 172.16/12, 127/8, fe80::/10, fc00::/7, ::1/128}`.
    pub fn canonical_private_networks() -> AllowList {
        let specs = [
            "192.168.0.0/16",
            "10.0.0.0/8",
            "172.16.0.0/12",
            "127.0.0.0/8",
            "fe80::/10",
            "fc00::/7",
            "::1/128",
        ];
        AllowList::new(
            specs
                .iter()
                .map(|s| AddressMask::parse(s).expect("canonical mask literal must parse"))
                .collect(),
        )
    }

    /// Evaluate the list against a peer address. An empty list permits everyone — it is the
    /// caller's job to decide when that's appropriate (inetd mode, tests) versus installing
    /// `canonical_private_networks()`.
    pub fn permits(&self, peer: IpAddr) -> bool {
        self.rules.is_empty() || self.rules.iter().any(|rule| rule.matches(peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn v4_bits_produce_leading_ones_mask() {
        for bits in 0..=32u32 {
            let mask = AddressMask::parse(&format!("0.0.0.0/{bits}")).unwrap();
            let expected = top_bits_mask(bits, 32);
            assert_eq!(mask.mask, expected, "bits={bits}");
        }
    }

    #[test]
    fn v6_bits_produce_leading_ones_mask() {
        for bits in 0..=128u32 {
            let mask = AddressMask::parse(&format!("::/{bits}")).unwrap();
            let expected = top_bits_mask(bits, 128);
            assert_eq!(mask.mask, expected, "bits={bits}");
        }
    }

    #[test]
    fn missing_bits_defaults_to_full_width() {
        assert_eq!(AddressMask::parse("10.0.0.1").unwrap().bits(), 32);
        assert_eq!(AddressMask::parse("::1").unwrap().bits(), 128);
    }

    #[test]
    fn out_of_range_bits_rejected() {
        assert!(AddressMask::parse("10.0.0.0/33").is_err());
        assert!(AddressMask::parse("::/129").is_err());
    }

    #[test]
    fn v4_mapped_peer_matches_like_plain_v4() {
        let rule = AddressMask::parse("10.0.0.0/8").unwrap();
        let mapped: IpAddr = "::ffff:10.1.2.3".parse().unwrap();
        let plain: IpAddr = "10.1.2.3".parse().unwrap();
        assert_eq!(rule.matches(mapped), rule.matches(plain));
        assert!(rule.matches(mapped));
    }

    #[test]
    fn v4_compatible_peer_matches_embedded_address() {
        let rule = AddressMask::parse("10.0.0.0/8").unwrap();
        let compatible: IpAddr = "::10.1.2.3".parse().unwrap();
        assert!(rule.matches(compatible));
    }

    #[test]
    fn mismatched_family_denies() {
        let v6_rule = AddressMask::parse("fc00::/7").unwrap();
        let v4_peer: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(!v6_rule.matches(v4_peer));

        let v4_rule = AddressMask::parse("10.0.0.0/8").unwrap();
        let v6_peer: IpAddr = "2001:db8::1".parse().unwrap();
        assert!(!v4_rule.matches(v6_peer));
    }

    #[test]
    fn allow_list_evaluates_in_order_first_match_wins() {
        let list = AllowList::new(vec![
            AddressMask::parse("10.0.0.0/8").unwrap(),
            AddressMask::parse("0.0.0.0/0").unwrap(),
        ]);
        assert!(list.permits(IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1))));
        assert!(list.permits(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
    }

    #[test]
    fn empty_allow_list_permits_everyone() {
        let list = AllowList::default();
        assert!(list.permits(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))));
    }

    #[test]
    fn scenario_s2_access_denied() {
        let list = AllowList::new(vec![AddressMask::parse("10.0.0.0/8").unwrap()]);
        let peer: IpAddr = "192.168.1.5".parse().unwrap();
        assert!(!list.permits(peer));
    }

    #[test]
    fn canonical_private_networks_cover_loopback_and_rfc1918() {
        let list = AllowList::canonical_private_networks();
        assert!(list.permits("127.0.0.1".parse().unwrap()));
        assert!(list.permits("192.168.1.1".parse().unwrap()));
        assert!(list.permits("10.1.1.1".parse().unwrap()));
        assert!(list.permits("172.16.0.1".parse().unwrap()));
        assert!(list.permits("::1".parse().unwrap()));
        assert!(!list.permits("8.8.8.8".parse().unwrap()));
    }
}
